//! Bidirectional splice between the inbound channel and the backend.
//!
//! Both copy loops run until either one finishes; the other is dropped and
//! both write halves are shut down, so no half-open session survives.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::recording::SessionRecorder;

const COPY_BUF_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Inbound client to backend.
    Upstream,
    /// Backend to inbound client.
    Downstream,
}

#[derive(Debug)]
pub struct BridgeSummary {
    /// Direction that ended first.
    pub ended_by: Direction,
    /// Error that ended it, if it did not end with EOF.
    pub error: Option<io::Error>,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    direction: Direction,
    recorder: Option<&SessionRecorder>,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let chunk = &buf[..n];
        if let Some(rec) = recorder {
            match direction {
                Direction::Upstream => rec.stdin(chunk).await,
                Direction::Downstream => rec.stdout(chunk).await,
            }
        }
        writer.write_all(chunk).await?;
        writer.flush().await?;
        *total += n as u64;
    }
}

/// Copy bytes both ways until either side ends, then shut down both.
pub async fn splice<A, B>(inbound: A, backend: B, recorder: Option<&SessionRecorder>) -> BridgeSummary
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut in_read, mut in_write) = tokio::io::split(inbound);
    let (mut be_read, mut be_write) = tokio::io::split(backend);
    let mut bytes_up = 0u64;
    let mut bytes_down = 0u64;

    let (ended_by, result) = {
        let upstream = pump(&mut in_read, &mut be_write, Direction::Upstream, recorder, &mut bytes_up);
        let downstream = pump(
            &mut be_read,
            &mut in_write,
            Direction::Downstream,
            recorder,
            &mut bytes_down,
        );
        tokio::pin!(upstream, downstream);
        tokio::select! {
            r = &mut upstream => (Direction::Upstream, r),
            r = &mut downstream => (Direction::Downstream, r),
        }
    };

    if let Err(e) = be_write.shutdown().await {
        debug!(error = %e, "backend shutdown failed");
    }
    if let Err(e) = in_write.shutdown().await {
        debug!(error = %e, "inbound shutdown failed");
    }

    BridgeSummary {
        ended_by,
        error: result.err(),
        bytes_up,
        bytes_down,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_core::audit::{AuditKind, AuditRecord};
    use tokio::io::duplex;

    #[tokio::test]
    async fn copies_both_ways_until_backend_closes() {
        let (mut client, inbound) = duplex(1024);
        let (backend, mut target) = duplex(1024);
        let bridge = tokio::spawn(async move { splice(inbound, backend, None).await });

        client.write_all(b"whoami\n").await.unwrap();
        let mut buf = [0u8; 7];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"whoami\n");

        target.write_all(b"root\n").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"root\n");

        drop(target);
        let summary = bridge.await.unwrap();
        assert_eq!(summary.ended_by, Direction::Downstream);
        assert!(summary.error.is_none());
        assert_eq!(summary.bytes_up, 7);
        assert_eq!(summary.bytes_down, 5);

        // Inbound side was torn down too.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn client_eof_tears_down_backend() {
        let (client, inbound) = duplex(1024);
        let (backend, mut target) = duplex(1024);
        let bridge = tokio::spawn(async move { splice(inbound, backend, None).await });

        drop(client);
        let summary = bridge.await.unwrap();
        assert_eq!(summary.ended_by, Direction::Upstream);

        let mut rest = Vec::new();
        target.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn records_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::start(dir.path(), "7", serde_json::json!({})).await;
        let (mut client, inbound) = duplex(1024);
        let (backend, mut target) = duplex(1024);

        let run = async {
            splice(inbound, backend, Some(&recorder)).await;
        };
        let drive = async {
            client.write_all(b"id\n").await.unwrap();
            let mut buf = [0u8; 3];
            target.read_exact(&mut buf).await.unwrap();
            target.write_all(b"uid=0\n").await.unwrap();
            let mut buf = [0u8; 6];
            client.read_exact(&mut buf).await.unwrap();
            drop(target);
        };
        tokio::join!(run, drive);
        recorder.finish().await;

        let content = tokio::fs::read_to_string(recorder.path()).await.unwrap();
        let records: Vec<AuditRecord> = content
            .lines()
            .map(|l| AuditRecord::parse_line(l).unwrap())
            .collect();
        let stdin: Vec<&AuditRecord> =
            records.iter().filter(|r| r.kind == AuditKind::Stdin).collect();
        let stdout: Vec<&AuditRecord> =
            records.iter().filter(|r| r.kind == AuditKind::Stdout).collect();
        assert_eq!(stdin[0].decode_bytes().unwrap(), b"id\n");
        assert_eq!(stdout[0].decode_bytes().unwrap(), b"uid=0\n");
    }
}
