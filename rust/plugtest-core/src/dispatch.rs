//! Name-keyed handler table consulted for inbound calls and notifies.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use rmpv::Value;

use crate::RpcError;

pub type HandlerFuture = BoxFuture<'static, Result<Value, RpcError>>;

/// A type-erased async handler taking positional arguments.
pub type Handler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;

/// Mapping from method name to handler.
///
/// Cloning is cheap; handlers are shared.
#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: HashMap<String, Handler>,
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("methods", &self.names())
            .finish()
    }
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous handler.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| handler(args).boxed());
        self.handlers.insert(name.into(), handler);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.register(name, handler);
        self
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Start the handler for `name`. Unknown names resolve to [`RpcError::UnknownMethod`].
    ///
    /// The handler closure runs synchronously here; only the returned future is deferred.
    /// A table shared behind a lock should go through [`get`](Self::get) and
    /// [`start_handler`] instead, so the closure never runs with the lock held.
    pub fn dispatch(&self, name: &str, args: Vec<Value>) -> HandlerFuture {
        start_handler(self.handlers.get(name).cloned(), name, args)
    }
}

/// Start a handler taken out of a table, or fail with [`RpcError::UnknownMethod`].
pub fn start_handler(handler: Option<Handler>, name: &str, args: Vec<Value>) -> HandlerFuture {
    match handler {
        Some(handler) => handler(args),
        None => {
            let err = RpcError::UnknownMethod(name.to_owned());
            async move { Err(err) }.boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatches_by_name() {
        let table = DispatchTable::new()
            .with("sum", |args: Vec<Value>| async move {
                let total: i64 = args.iter().filter_map(Value::as_i64).sum();
                Ok(Value::from(total))
            })
            .with("echo", |args: Vec<Value>| async move { Ok(Value::Array(args)) });

        assert_eq!(table.names(), vec!["echo", "sum"]);
        let sum = table
            .dispatch("sum", vec![Value::from(1), Value::from(2)])
            .await
            .unwrap();
        assert_eq!(sum, Value::from(3));
    }

    #[tokio::test]
    async fn unknown_name_is_an_error_naming_the_method() {
        let table = DispatchTable::new();
        let err = table.dispatch("missing", vec![]).await.unwrap_err();
        assert!(matches!(&err, RpcError::UnknownMethod(name) if name == "missing"));
        assert_eq!(err.to_string(), "unknown method 'missing'");
    }

    #[test]
    fn register_replaces_and_remove_forgets() {
        let mut table = DispatchTable::new();
        table.register("a", |_| async { Ok(Value::from(1)) });
        table.register("a", |_| async { Ok(Value::from(2)) });
        assert_eq!(table.len(), 1);
        assert!(table.remove("a"));
        assert!(!table.remove("a"));
        assert!(table.is_empty());
    }
}
