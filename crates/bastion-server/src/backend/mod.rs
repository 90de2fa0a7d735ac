//! Outbound leg: reaching the target host.
//!
//! A [`BackendDialer`] turns an authorized, credentialed request into a byte
//! stream attached to an interactive shell on the target. How the target is
//! reached (direct TCP or an agent tunnel) is decided by the [`RouteTable`].

mod route;
mod ssh;

pub use route::{Route, RouteTable};
pub use ssh::SshDialer;

use async_trait::async_trait;
use bastion_core::BastionResult;
use russh_keys::key::KeyPair;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Terminal parameters requested on the backend channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            cols: 80,
            rows: 40,
        }
    }
}

/// Everything needed to open the backend session.
pub struct DialRequest {
    /// `host:port` of the target.
    pub target: String,
    /// Backend OS account to log in as.
    pub account: String,
    /// Single-use keypair; dropped with the request.
    pub key: Arc<KeyPair>,
    /// CA-signed certificate for `key`.
    pub certificate: ssh_key::Certificate,
    pub pty: PtyRequest,
}

#[async_trait]
pub trait BackendDialer: Send + Sync {
    async fn dial(&self, request: DialRequest) -> BastionResult<BackendStream>;
}

/// Any duplex byte stream usable as a backend leg.
pub trait BackendIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> BackendIo for T {}

/// A connected backend shell.
pub struct BackendStream {
    io: Box<dyn BackendIo>,
    route: Route,
    // Resources that must outlive `io`, such as the SSH client handle.
    _keepalive: Option<Box<dyn Send>>,
}

impl BackendStream {
    pub fn new(io: impl BackendIo + 'static, route: Route) -> Self {
        Self {
            io: Box::new(io),
            route,
            _keepalive: None,
        }
    }

    pub fn with_keepalive(mut self, keepalive: impl Send + 'static) -> Self {
        self._keepalive = Some(Box::new(keepalive));
        self
    }

    pub fn route(&self) -> &Route {
        &self.route
    }
}

impl AsyncRead for BackendStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for BackendStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_shutdown(cx)
    }
}
