//! Loopback listener the runner dials back into.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use plugtest_core::ListenerAddress;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("no connection within {0:?}")]
    Timeout(Duration, #[source] tokio::time::error::Elapsed),
    #[error("accept failed")]
    Io(#[source] std::io::Error),
    #[error("accept cancelled")]
    Cancelled,
    #[error("listener already used")]
    Consumed,
}

/// A listener that accepts exactly one connection.
#[derive(Debug)]
pub struct Listener {
    inner: Option<TcpListener>,
    local_addr: SocketAddr,
    address: ListenerAddress,
}

impl Listener {
    /// Bind `127.0.0.1` on a free port.
    pub async fn bind() -> std::io::Result<Self> {
        let inner = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let local_addr = inner.local_addr()?;
        tracing::debug!(%local_addr, "listener bound");
        Ok(Self {
            inner: Some(inner),
            local_addr,
            address: ListenerAddress::tcp(local_addr),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// What the runner needs to dial back.
    pub fn address(&self) -> &ListenerAddress {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }

    /// Accept the single connection, giving up after `timeout` or when `cancel` fires.
    ///
    /// The listening socket is closed when this returns, whatever the outcome.
    pub async fn accept(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TcpStream, ConnectError> {
        let listener = self.inner.take().ok_or(ConnectError::Consumed)?;
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            accepted = tokio::time::timeout(timeout, listener.accept()) => match accepted {
                Ok(Ok((stream, peer))) => {
                    tracing::debug!(%peer, "runner connected");
                    Ok(stream)
                }
                Ok(Err(e)) => Err(ConnectError::Io(e)),
                Err(elapsed) => Err(ConnectError::Timeout(timeout, elapsed)),
            },
        };
        drop(listener);
        result
    }

    /// Close without accepting.
    pub fn close(&mut self) {
        self.inner.take();
    }
}
