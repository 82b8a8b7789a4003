#![forbid(unsafe_code)]
//! The harness end inside the editor.
//!
//! A plugin process loaded by the runner calls [`run_with_session`]: it reads
//! the listener address from the environment, dials it, answers the harness's
//! `invoke` calls against a local [`Host`], and forwards dispatches the editor
//! makes to the harness through a [`PluginProxy`].

use std::net::SocketAddr;
use std::sync::Arc;

use plugtest_core::{
    AddressError, DISPATCH_METHOD, INVOKE_METHOD, Invoke, ListenerAddress, RpcError, RpcMessage,
    RpcSession, SessionHooks, StreamTransport, Transport, Value,
};

pub use plugtest_core::Host;

pub mod tracing_setup;

/// The session a bridge runs over.
pub type CellSession = RpcSession<StreamTransport>;

#[derive(Debug, thiserror::Error)]
pub enum CellError {
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("failed to connect to the harness at {addr}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// The harness's dispatcher as seen from inside the editor.
///
/// Read-only: entries are looked up on the harness side, so there is nothing
/// here to register or remove.
#[derive(Debug, Clone)]
pub struct PluginProxy<T: Transport = StreamTransport> {
    session: Arc<RpcSession<T>>,
}

impl<T: Transport> PluginProxy<T> {
    pub fn new(session: Arc<RpcSession<T>>) -> Self {
        Self { session }
    }

    /// Call `func` on the harness dispatcher and wait for its result.
    pub async fn dispatch(&self, func: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.session
            .call(DISPATCH_METHOD, vec![Value::from(func), Value::Array(args)])
            .await
    }

    /// Like [`dispatch`](Self::dispatch), without waiting for a result.
    pub async fn notify(&self, func: &str, args: Vec<Value>) -> Result<(), RpcError> {
        self.session
            .notify(DISPATCH_METHOD, vec![Value::from(func), Value::Array(args)])
            .await
    }
}

/// Answer the harness's `invoke` calls with `host`.
///
/// Register before [`RpcSession::start`] so no early call finds the table empty.
pub fn attach<T, H>(session: &RpcSession<T>, host: Arc<H>)
where
    T: Transport,
    H: Host,
{
    session.register(INVOKE_METHOD, move |params| {
        let host = host.clone();
        async move {
            let invoke = Invoke::from_params(params)?;
            tracing::debug!(name = invoke.name(), "invoke");
            invoke.apply(&*host).await
        }
    });
}

/// Dial the harness at `address`.
pub async fn connect(address: &ListenerAddress) -> Result<Arc<CellSession>, CellError> {
    let addr = address.socket_addr()?;
    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .map_err(|source| CellError::Connect { addr, source })?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "set_nodelay failed");
    }
    tracing::debug!(%addr, "connected to harness");
    Ok(Arc::new(
        RpcSession::new(StreamTransport::new(stream)).with_hooks(hooks()),
    ))
}

fn hooks() -> SessionHooks {
    SessionHooks {
        on_invalid_message: Arc::new(|message: &Value| {
            tracing::error!(%message, "[plugtest-cell] Unexpected message");
        }),
        on_message_error: Arc::new(|error: &RpcError, message: &RpcMessage| {
            tracing::error!(%error, ?message, "[plugtest-cell] Failed to handle message");
        }),
    }
}

/// Serve the harness until it hangs up.
///
/// `factory` receives the proxy for the harness dispatcher and returns the
/// host that executes `invoke` requests.
pub async fn run_with_session<F, H>(factory: F) -> Result<(), CellError>
where
    F: FnOnce(PluginProxy) -> Arc<H>,
    H: Host,
{
    let address = ListenerAddress::from_env()?;
    let session = connect(&address).await?;
    let host = factory(PluginProxy::new(session.clone()));

    // dispatcher first, then the read loop
    attach(&session, host);
    session.start();

    session.closed().await;
    tracing::debug!("harness session closed");
    Ok(())
}
