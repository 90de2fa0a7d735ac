//! Duplex byte stream over a tunnel session's channel pair.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use super::connection::{AgentConnection, SessionChannels};

/// A tunnel session presented as `AsyncRead + AsyncWrite`.
///
/// Reads return chunks from the receive channel; a closed channel reads as
/// end-of-stream. Writes enqueue chunks on the send channel. Shutting down
/// (or dropping) the stream closes the send channel, which makes the
/// connection emit the session's single `close` message.
pub struct TunnelStream {
    conn: Arc<AgentConnection>,
    id: String,
    rx: mpsc::Receiver<Vec<u8>>,
    tx: PollSender<Vec<u8>>,
    read_buf: Vec<u8>,
    read_offset: usize,
    closed: bool,
}

impl TunnelStream {
    pub fn new(conn: Arc<AgentConnection>, channels: SessionChannels) -> Self {
        Self {
            conn,
            id: channels.id,
            rx: channels.rx,
            tx: PollSender::new(channels.tx),
            read_buf: Vec::new(),
            read_offset: 0,
            closed: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.id
    }

    pub fn agent_id(&self) -> &str {
        self.conn.agent_id()
    }

    /// Close the write side. Idempotent; any write parked on a full channel
    /// fails instead of waiting.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.tx.close();
        }
    }

    fn drain_buffered(&mut self, buf: &mut ReadBuf<'_>) -> bool {
        if self.read_offset >= self.read_buf.len() {
            return false;
        }
        let available = &self.read_buf[self.read_offset..];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        self.read_offset += n;
        if self.read_offset >= self.read_buf.len() {
            self.read_buf.clear();
            self.read_offset = 0;
        }
        true
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "tunnel session closed")
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.drain_buffered(buf) {
            return Poll::Ready(Ok(()));
        }
        match ready!(this.rx.poll_recv(cx)) {
            Some(chunk) => {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    this.read_buf = chunk;
                    this.read_offset = n;
                }
                Poll::Ready(Ok(()))
            }
            // Channel closed = EOF
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.closed {
            return Poll::Ready(Err(broken_pipe()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(this.tx.poll_reserve(cx)).map_err(|_| broken_pipe())?;
        this.tx.send_item(buf.to_vec()).map_err(|_| broken_pipe())?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        self.close();
        self.conn.close_session(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::super::connection::tests::transport;
    use super::super::connection::{SessionState, TunnelOptions};
    use super::*;
    use bastion_core::{ControlMessage, WireMessage};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn options() -> TunnelOptions {
        TunnelOptions {
            channel_capacity: 4,
            ack_timeout: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn reads_and_writes_through_the_tunnel() {
        let (transport, mut agent) = transport();
        let (conn, _loop) = AgentConnection::start("agentA", 1, transport, options());
        let opening = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.open_stream("10.0.0.5:22").await })
        };
        let id = agent.accept_forward().await;
        let mut stream = opening.await.unwrap().unwrap();
        assert_eq!(stream.session_id(), id);
        assert_eq!(stream.agent_id(), "agentA");

        stream.write_all(b"uname\n").await.unwrap();
        assert_eq!(
            agent.next_frame().await,
            WireMessage::Binary(format!("{id}|uname\n").into_bytes())
        );

        agent.data(&id, b"Linux\n");
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Linux\n");
    }

    #[tokio::test]
    async fn partial_reads_keep_the_remainder() {
        let (transport, mut agent) = transport();
        let (conn, _loop) = AgentConnection::start("agentA", 1, transport, options());
        let opening = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.open_stream("10.0.0.5:22").await })
        };
        let id = agent.accept_forward().await;
        let mut stream = opening.await.unwrap().unwrap();

        agent.data(&id, b"abcdef");
        let mut small = [0u8; 4];
        let n = stream.read(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"abcd");
        let n = stream.read(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"ef");
    }

    #[tokio::test]
    async fn closed_receive_channel_reads_as_eof() {
        let (transport, mut agent) = transport();
        let (conn, _loop) = AgentConnection::start("agentA", 1, transport, options());
        let opening = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.open_stream("10.0.0.5:22").await })
        };
        let id = agent.accept_forward().await;
        let mut stream = opening.await.unwrap().unwrap();

        agent.data(&id, b"bye");
        agent.reply(ControlMessage::forward_close(&id));
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"bye");
    }

    #[tokio::test]
    async fn write_after_shutdown_is_broken_pipe() {
        let (transport, mut agent) = transport();
        let (conn, _loop) = AgentConnection::start("agentA", 1, transport, options());
        let opening = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.open_stream("10.0.0.5:22").await })
        };
        let id = agent.accept_forward().await;
        let mut stream = opening.await.unwrap().unwrap();

        stream.shutdown().await.unwrap();
        stream.shutdown().await.unwrap();
        let err = stream.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(agent.next_control().await, ControlMessage::close(&id));
    }

    #[tokio::test]
    async fn drop_closes_session_once() {
        let (transport, mut agent) = transport();
        let (conn, _loop) = AgentConnection::start("agentA", 1, transport, options());
        let opening = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.open_stream("10.0.0.5:22").await })
        };
        let id = agent.accept_forward().await;
        let stream = opening.await.unwrap().unwrap();
        assert_eq!(conn.session_state(&id), Some(SessionState::Active));

        drop(stream);
        assert_eq!(agent.next_control().await, ControlMessage::close(&id));
        assert_eq!(conn.session_state(&id), None);
    }
}
