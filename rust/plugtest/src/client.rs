//! The capability facade test bodies talk to.

use std::sync::Arc;

use parking_lot::Mutex;
use plugtest_core::{
    BatchCall, Context, DISPATCH_METHOD, DispatchTable, Host, INVOKE_METHOD, Invoke,
    META_FUNCTION, Meta, RpcError, RpcSession, StreamTransport, Transport, Value, start_handler,
};
use serde::de::DeserializeOwned;

/// [`Host`] over an RPC session with the bridge running inside the editor.
///
/// Every operation is one `invoke` call. Inbound `dispatch` calls from the
/// editor are answered from a dispatcher owned by this client.
pub struct HostClient<T: Transport = StreamTransport> {
    name: String,
    meta: Meta,
    session: Arc<RpcSession<T>>,
    dispatcher: Arc<Mutex<DispatchTable>>,
}

impl<T: Transport> std::fmt::Debug for HostClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostClient")
            .field("name", &self.name)
            .field("meta", &self.meta)
            .field("dispatcher", &*self.dispatcher.lock())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> HostClient<T> {
    /// Install the `dispatch` handler on a started session, then fetch [`Meta`].
    pub async fn connect(session: Arc<RpcSession<T>>, name: impl Into<String>) -> Result<Self, RpcError> {
        let dispatcher = Arc::new(Mutex::new(DispatchTable::new()));
        let table = dispatcher.clone();
        session.register(DISPATCH_METHOD, move |params| {
            let call = split_dispatch(params).map(|(func, args)| {
                let handler = table.lock().get(&func);
                start_handler(handler, &func, args)
            });
            async move { call?.await }
        });

        let invoke = Invoke::Call {
            func: META_FUNCTION.to_owned(),
            args: Vec::new(),
        };
        let meta = session.call(INVOKE_METHOD, invoke.into_params()).await?;
        let meta = Meta::from_value(&meta)?;
        let name = name.into();
        tracing::debug!(%name, ?meta, "host client connected");

        Ok(Self {
            name,
            meta,
            session,
            dispatcher,
        })
    }

    pub fn session(&self) -> &Arc<RpcSession<T>> {
        &self.session
    }

    /// Replace the dispatcher wholesale.
    pub fn set_dispatcher(&self, table: DispatchTable) {
        *self.dispatcher.lock() = table;
    }

    /// Add or replace one dispatcher entry.
    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.dispatcher.lock().register(name, handler);
    }

    /// A snapshot of the current dispatcher.
    pub fn dispatcher(&self) -> DispatchTable {
        self.dispatcher.lock().clone()
    }

    /// [`call`](Host::call) and deserialize the result.
    pub async fn call_as<R: DeserializeOwned>(&self, func: &str, args: Vec<Value>) -> Result<R, RpcError> {
        let value = self.call(func, args).await?;
        rmpv::ext::from_value(value).map_err(|e| RpcError::Deserialize(e.to_string()))
    }

    async fn invoke(&self, invoke: Invoke) -> Result<Value, RpcError> {
        self.session.call(INVOKE_METHOD, invoke.into_params()).await
    }
}

/// `[func: string, args: array]`
fn split_dispatch(params: Vec<Value>) -> Result<(String, Vec<Value>), RpcError> {
    let mut params = params.into_iter();
    match (params.next(), params.next(), params.next()) {
        (Some(Value::String(func)), Some(Value::Array(args)), None) => match func.into_str() {
            Some(func) => Ok((func, args)),
            None => Err(RpcError::InvalidArgument("dispatch name is not valid UTF-8".into())),
        },
        _ => Err(RpcError::InvalidArgument(
            "dispatch expects [name: string, args: array]".into(),
        )),
    }
}

impl<T: Transport> Host for HostClient<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    async fn redraw(&self, force: Option<bool>) -> Result<(), RpcError> {
        self.invoke(Invoke::Redraw { force }).await.map(drop)
    }

    async fn call(&self, func: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.invoke(Invoke::Call {
            func: func.to_owned(),
            args,
        })
        .await
    }

    async fn batch(&self, calls: Vec<BatchCall>) -> Result<Vec<Value>, RpcError> {
        match self.invoke(Invoke::Batch { calls }).await? {
            Value::Array(results) => Ok(results),
            other => Err(RpcError::Deserialize(format!(
                "batch returned {other}, expected an array"
            ))),
        }
    }

    async fn cmd(&self, cmd: &str, ctx: Context) -> Result<(), RpcError> {
        self.invoke(Invoke::Cmd {
            cmd: cmd.to_owned(),
            ctx,
        })
        .await
        .map(drop)
    }

    async fn eval(&self, expr: &str, ctx: Context) -> Result<Value, RpcError> {
        self.invoke(Invoke::Eval {
            expr: expr.to_owned(),
            ctx,
        })
        .await
    }

    async fn dispatch(&self, plugin: &str, func: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        self.invoke(Invoke::Dispatch {
            plugin: plugin.to_owned(),
            func: func.to_owned(),
            args,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_params_need_name_and_array() {
        let (func, args) =
            split_dispatch(vec![Value::from("hello"), Value::Array(vec![Value::from(1)])]).unwrap();
        assert_eq!(func, "hello");
        assert_eq!(args, vec![Value::from(1)]);

        for bad in [
            vec![],
            vec![Value::from("hello")],
            vec![Value::from(1), Value::Array(vec![])],
            vec![Value::from("hello"), Value::from(1)],
            vec![Value::from("hello"), Value::Array(vec![]), Value::Nil],
        ] {
            assert!(matches!(split_dispatch(bad), Err(RpcError::InvalidArgument(_))));
        }
    }
}
