//! RpcSession: a duplex msgpack-rpc session that owns the transport.
//!
//! Both peers are symmetric: either side may issue calls and notifies, and either
//! side answers inbound calls from its [`DispatchTable`].
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────┐
//!                 │              RpcSession              │
//!                 ├──────────────────────────────────────┤
//!                 │  transport: T                        │
//!                 │  pending: HashMap<id, oneshot::Tx>   │
//!                 │  dispatcher: DispatchTable           │
//!                 └──────────────────┬───────────────────┘
//!                                    │
//!                              read loop
//!                                    │
//!          ┌─────────────────────────┼──────────────────────────┐
//!          │                         │                          │
//!      response                    call                       notify
//!          │                         │                          │
//!  ┌───────▼────────┐   ┌────────────▼────────────┐   ┌─────────▼─────────┐
//!  │ resolve the    │   │ run handler, send back  │   │ run handler,      │
//!  │ pending waiter │   │ a response with same id │   │ drop the result   │
//!  └────────────────┘   └─────────────────────────┘   └───────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let session = Arc::new(RpcSession::new(transport));
//! session.register("dispatch", |args| async move { Ok(Value::Nil) });
//! session.start();
//!
//! let meta = session.call("invoke", params).await?;
//! session.shutdown().await;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use rmpv::Value;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    DispatchTable, RemoteError, RpcError, RpcMessage, Transport, TransportError, start_handler,
};

/// How long [`RpcSession::shutdown`] waits for in-flight calls before failing them.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Running,
    ShuttingDown,
    Closed,
}

/// Called with a frame that decoded but is not a msgpack-rpc message.
pub type InvalidMessageHook = Arc<dyn Fn(&Value) + Send + Sync>;

/// Called when a well-formed message could not be handled.
pub type MessageErrorHook = Arc<dyn Fn(&RpcError, &RpcMessage) + Send + Sync>;

/// Observers for non-fatal protocol problems. The read loop keeps going after either.
#[derive(Clone)]
pub struct SessionHooks {
    pub on_invalid_message: InvalidMessageHook,
    pub on_message_error: MessageErrorHook,
}

impl Default for SessionHooks {
    fn default() -> Self {
        Self {
            on_invalid_message: Arc::new(|message: &Value| {
                tracing::error!(%message, "unexpected message");
            }),
            on_message_error: Arc::new(|error: &RpcError, message: &RpcMessage| {
                tracing::error!(%error, ?message, "failed to handle message");
            }),
        }
    }
}

impl std::fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHooks").finish_non_exhaustive()
    }
}

type PendingTx = oneshot::Sender<Result<Value, RpcError>>;

/// A duplex RPC session over one transport.
///
/// # Key invariant
///
/// Only the read loop spawned by [`start`](Self::start) calls `transport.recv_frame()`.
pub struct RpcSession<T: Transport> {
    transport: T,
    state: Mutex<SessionState>,
    /// Waiters for outbound calls, keyed by request id.
    pending: Mutex<HashMap<u32, PendingTx>>,
    /// Signalled whenever `pending` becomes empty.
    drained: Notify,
    dispatcher: Mutex<DispatchTable>,
    hooks: SessionHooks,
    next_id: AtomicU32,
    /// Stops the read loop.
    cancel: CancellationToken,
    /// Fired once the session reaches [`SessionState::Closed`].
    closed: CancellationToken,
    shutdown_grace: Duration,
}

impl<T: Transport> std::fmt::Debug for RpcSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("state", &self.state())
            .field("pending", &self.pending_ids())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> RpcSession<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: Mutex::new(SessionState::Created),
            pending: Mutex::new(HashMap::new()),
            drained: Notify::new(),
            dispatcher: Mutex::new(DispatchTable::new()),
            hooks: SessionHooks::default(),
            next_id: AtomicU32::new(1),
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_hooks(mut self, hooks: SessionHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.state(),
            SessionState::ShuttingDown | SessionState::Closed
        )
    }

    /// Ids of outbound calls still waiting for a response, sorted (for diagnostics).
    pub fn pending_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.pending.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Replace the whole dispatch table.
    pub fn set_dispatcher(&self, table: DispatchTable) {
        *self.dispatcher.lock() = table;
    }

    /// Add or replace one handler.
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.dispatcher.lock().register(name, handler);
    }

    /// Begin reading inbound messages on a background task.
    ///
    /// Only the first call has an effect.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Created {
                tracing::warn!(state = ?*state, "RpcSession::start: already started");
                return;
            }
            *state = SessionState::Started;
        }
        tokio::spawn(self.clone().run());
    }

    /// Resolves once the session is closed, whether by EOF, error or [`shutdown`](Self::shutdown).
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Issue a call and wait for its response.
    ///
    /// Fails with [`RpcError::SessionClosed`] if the session closes first.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        struct PendingGuard<'a, T: Transport> {
            session: &'a RpcSession<T>,
            id: u32,
            active: bool,
        }

        impl<T: Transport> Drop for PendingGuard<'_, T> {
            fn drop(&mut self) {
                if !self.active {
                    return;
                }
                if self.session.pending.lock().remove(&self.id).is_some() {
                    tracing::debug!(id = self.id, "call dropped: removed pending waiter");
                    self.session.notify_if_drained();
                }
            }
        }

        let (id, rx) = self.register_pending()?;
        let mut guard = PendingGuard {
            session: self,
            id,
            active: true,
        };

        let frame = RpcMessage::Call {
            id,
            method: method.to_owned(),
            params,
        };
        self.send(frame).await?;
        tracing::debug!(id, method, "call: request sent");

        let result = rx.await.unwrap_or(Err(RpcError::SessionClosed));
        // the read loop removed the entry before resolving it
        guard.active = false;
        result
    }

    /// Send a notify without waiting for anything.
    pub async fn notify(&self, method: &str, params: Vec<Value>) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::SessionClosed);
        }
        self.send(RpcMessage::Notify {
            method: method.to_owned(),
            params,
        })
        .await
    }

    /// Wait for in-flight calls (up to the grace period), then close the transport.
    ///
    /// Calls still pending after the grace period fail with [`RpcError::SessionClosed`].
    /// A second call waits for the first to finish and has no further effect.
    pub async fn shutdown(&self) {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            if !matches!(previous, SessionState::ShuttingDown | SessionState::Closed) {
                *state = SessionState::ShuttingDown;
            }
            previous
        };
        match previous {
            SessionState::ShuttingDown => return self.closed().await,
            SessionState::Closed => return,
            _ => {}
        }
        tracing::debug!("RpcSession::shutdown: draining pending calls");

        let drain = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.pending.lock().is_empty() {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            tracing::warn!(
                pending = ?self.pending_ids(),
                grace = ?self.shutdown_grace,
                "RpcSession::shutdown: calls still pending after grace period"
            );
        }

        self.cancel.cancel();
        self.transport.close().await;
        self.finish("shutdown");
    }

    fn register_pending(&self) -> Result<(u32, oneshot::Receiver<Result<Value, RpcError>>), RpcError> {
        let mut pending = self.pending.lock();
        // checked under the pending lock so `finish` cannot miss this entry
        if self.is_closed() {
            return Err(RpcError::SessionClosed);
        }
        let id = loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !pending.contains_key(&id) {
                break id;
            }
        };
        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        Ok((id, rx))
    }

    fn notify_if_drained(&self) {
        if self.pending.lock().is_empty() {
            self.drained.notify_waiters();
        }
    }

    async fn send(&self, message: RpcMessage) -> Result<(), RpcError> {
        self.transport
            .send_frame(message.into_value())
            .await
            .map_err(|e| match e {
                TransportError::Closed => RpcError::SessionClosed,
                other => RpcError::Transport(other),
            })
    }

    /// Mark closed and fail every pending call. Idempotent.
    fn finish(&self, reason: &'static str) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.cancel.cancel();

        let pending: Vec<(u32, PendingTx)> = self.pending.lock().drain().collect();
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), reason, "failing pending calls");
        }
        for (_, tx) in pending {
            let _ = tx.send(Err(RpcError::SessionClosed));
        }
        self.drained.notify_waiters();
        self.closed.cancel();
        tracing::debug!(reason, "RpcSession closed");
    }

    async fn run(self: Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Started {
                *state = SessionState::Running;
            }
        }
        tracing::debug!("RpcSession::run: starting read loop");

        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                frame = self.transport.recv_frame() => frame,
            };
            let value = match frame {
                Ok(value) => value,
                Err(TransportError::Closed) => {
                    tracing::debug!("RpcSession::run: transport closed");
                    break;
                }
                Err(TransportError::Decode(e)) => {
                    tracing::warn!(error = %e, "RpcSession::run: undecodable bytes dropped");
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "RpcSession::run: transport error");
                    break;
                }
            };
            match RpcMessage::from_value(value) {
                Ok(message) => self.handle_message(message),
                Err(raw) => (self.hooks.on_invalid_message)(&raw),
            }
        }

        self.transport.close().await;
        self.finish("read loop ended");
    }

    /// Route one inbound message. Handlers are started here, in arrival order; their
    /// futures run on spawned tasks so a handler may itself call the peer.
    fn handle_message(self: &Arc<Self>, message: RpcMessage) {
        match message {
            RpcMessage::Response { id, result } => {
                let waiter = self.pending.lock().remove(&id);
                let Some(tx) = waiter else {
                    let err = RpcError::UnexpectedResponse(id);
                    (self.hooks.on_message_error)(&err, &RpcMessage::Response { id, result });
                    return;
                };
                let result = result.map_err(|e| RpcError::Remote(RemoteError::from_value(&e)));
                let _ = tx.send(result);
                self.notify_if_drained();
            }
            RpcMessage::Call { id, method, params } => {
                tracing::debug!(id, %method, "dispatching call");
                let handler = self.dispatcher.lock().get(&method);
                let future = start_handler(handler, &method, params);
                let session = self.clone();
                tokio::spawn(async move {
                    let result = run_handler(future).await;
                    if let Err(e) = &result {
                        tracing::debug!(id, %method, error = %e, "handler failed");
                    }
                    let response = RpcMessage::Response {
                        id,
                        result: result.map_err(|e| e.to_remote().to_value()),
                    };
                    if let Err(e) = session.send(response).await {
                        tracing::warn!(id, error = %e, "failed to send response");
                    }
                });
            }
            RpcMessage::Notify { method, params } => {
                let Some(handler) = self.dispatcher.lock().get(&method) else {
                    tracing::debug!(%method, "dropping notify for unknown method");
                    return;
                };
                let future = handler(params.clone());
                let hooks = self.hooks.clone();
                tokio::spawn(async move {
                    if let Err(e) = run_handler(future).await {
                        (hooks.on_message_error)(&e, &RpcMessage::Notify { method, params });
                    }
                });
            }
        }
    }
}

/// Await a handler, turning a panic into an error so the peer is never left waiting.
async fn run_handler(
    future: impl Future<Output = Result<Value, RpcError>>,
) -> Result<Value, RpcError> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                format!("panic in handler: {s}")
            } else if let Some(s) = panic.downcast_ref::<String>() {
                format!("panic in handler: {s}")
            } else {
                "panic in handler".to_string()
            };
            Err(RpcError::Remote(RemoteError::new("Panic", message)))
        }
    }
}

// Note: RpcSession conformance tests live in `rust/plugtest-core/tests/`.
