//! An in-process [`Host`] for testing plugin code without spawning an editor.

use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, try_join_all};
use parking_lot::Mutex;
use plugtest_core::host::context_to_value;
use plugtest_core::{BatchCall, Context, DispatchTable, Host, Meta, RpcError, Value};

pub const DEFAULT_STUB_NAME: &str = "plugtest-stub";

type Override<A, R> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<R, RpcError>> + Send + Sync>;

/// A [`Host`] whose every operation is a replaceable closure.
///
/// Without an override, operations succeed with nil (`batch` with one nil per
/// call). `call` and `batch` overrides see arguments cut at the first nil,
/// the way an editor drops absent trailing arguments.
pub struct HostStub {
    name: String,
    meta: Meta,
    context: Mutex<Context>,
    dispatcher: Mutex<DispatchTable>,
    redraw: Option<Override<Option<bool>, ()>>,
    call: Option<Override<(String, Vec<Value>), Value>>,
    batch: Option<Override<Vec<BatchCall>, Vec<Value>>>,
    cmd: Option<Override<(String, Context), ()>>,
    eval: Option<Override<(String, Context), Value>>,
    dispatch: Option<Override<(String, String, Vec<Value>), Value>>,
    use_call_in_batch: bool,
    use_call_in_cmd: bool,
    use_call_in_eval: bool,
}

impl Default for HostStub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HostStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStub")
            .field("name", &self.name)
            .field("meta", &self.meta)
            .field("use_call_in_batch", &self.use_call_in_batch)
            .field("use_call_in_cmd", &self.use_call_in_cmd)
            .field("use_call_in_eval", &self.use_call_in_eval)
            .finish_non_exhaustive()
    }
}

impl HostStub {
    pub fn new() -> Self {
        Self {
            name: DEFAULT_STUB_NAME.to_owned(),
            meta: Meta::default(),
            context: Mutex::new(Context::new()),
            dispatcher: Mutex::new(DispatchTable::new()),
            redraw: None,
            call: None,
            batch: None,
            cmd: None,
            eval: None,
            dispatch: None,
            use_call_in_batch: false,
            use_call_in_cmd: false,
            use_call_in_eval: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_redraw<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Option<bool>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        self.redraw = Some(Arc::new(move |force| f(force).boxed()));
        self
    }

    pub fn with_call<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.call = Some(Arc::new(move |(func, args)| f(func, args).boxed()));
        self
    }

    pub fn with_batch<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<BatchCall>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Value>, RpcError>> + Send + 'static,
    {
        self.batch = Some(Arc::new(move |calls| f(calls).boxed()));
        self
    }

    pub fn with_cmd<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
    {
        self.cmd = Some(Arc::new(move |(cmd, ctx)| f(cmd, ctx).boxed()));
        self
    }

    pub fn with_eval<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.eval = Some(Arc::new(move |(expr, ctx)| f(expr, ctx).boxed()));
        self
    }

    pub fn with_dispatch<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String, String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.dispatch = Some(Arc::new(move |(plugin, func, args)| {
            f(plugin, func, args).boxed()
        }));
        self
    }

    /// Without a `batch` override, run each call through the `call` override.
    pub fn use_call_in_batch(mut self, enabled: bool) -> Self {
        self.use_call_in_batch = enabled;
        self
    }

    /// Without a `cmd` override, send `denops#api#cmd` through the `call` override.
    pub fn use_call_in_cmd(mut self, enabled: bool) -> Self {
        self.use_call_in_cmd = enabled;
        self
    }

    /// Without an `eval` override, send `denops#api#eval` through the `call` override.
    pub fn use_call_in_eval(mut self, enabled: bool) -> Self {
        self.use_call_in_eval = enabled;
        self
    }

    pub fn context(&self) -> Context {
        self.context.lock().clone()
    }

    pub fn set_context(&self, context: Context) {
        *self.context.lock() = context;
    }

    pub fn set_dispatcher(&self, table: DispatchTable) {
        *self.dispatcher.lock() = table;
    }

    pub fn register<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.dispatcher.lock().register(name, handler);
    }

    pub fn dispatcher(&self) -> DispatchTable {
        self.dispatcher.lock().clone()
    }
}

/// Drop everything from the first nil on.
fn norm_args(mut args: Vec<Value>) -> Vec<Value> {
    if let Some(end) = args.iter().position(Value::is_nil) {
        args.truncate(end);
    }
    args
}

impl Host for HostStub {
    fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> &Meta {
        &self.meta
    }

    async fn redraw(&self, force: Option<bool>) -> Result<(), RpcError> {
        match &self.redraw {
            Some(f) => f(force).await,
            None => Ok(()),
        }
    }

    async fn call(&self, func: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        match &self.call {
            Some(f) => f((func.to_owned(), norm_args(args))).await,
            None => Ok(Value::Nil),
        }
    }

    async fn batch(&self, calls: Vec<BatchCall>) -> Result<Vec<Value>, RpcError> {
        let calls: Vec<BatchCall> = calls
            .into_iter()
            .map(|c| BatchCall::new(c.func, norm_args(c.args)))
            .collect();
        match (&self.batch, &self.call) {
            (Some(f), _) => f(calls).await,
            (None, Some(call)) if self.use_call_in_batch => {
                try_join_all(calls.into_iter().map(|c| call((c.func, c.args)))).await
            }
            _ => Ok(vec![Value::Nil; calls.len()]),
        }
    }

    async fn cmd(&self, cmd: &str, ctx: Context) -> Result<(), RpcError> {
        match &self.cmd {
            Some(f) => f((cmd.to_owned(), ctx)).await,
            None if self.use_call_in_cmd && self.call.is_some() => self
                .call("denops#api#cmd", vec![Value::from(cmd), context_to_value(ctx)])
                .await
                .map(drop),
            None => Ok(()),
        }
    }

    async fn eval(&self, expr: &str, ctx: Context) -> Result<Value, RpcError> {
        match &self.eval {
            Some(f) => f((expr.to_owned(), ctx)).await,
            None if self.use_call_in_eval && self.call.is_some() => {
                self.call("denops#api#eval", vec![Value::from(expr), context_to_value(ctx)])
                    .await
            }
            None => Ok(Value::Nil),
        }
    }

    async fn dispatch(&self, plugin: &str, func: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        match &self.dispatch {
            Some(f) => f((plugin.to_owned(), func.to_owned(), args)).await,
            None => Ok(Value::Nil),
        }
    }
}
