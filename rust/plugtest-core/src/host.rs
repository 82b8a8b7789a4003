//! The capability surface a plugin sees: talk to the editor hosting it.
//!
//! Implemented by the harness-side client (forwarding over RPC), by in-process
//! stubs, and by whatever runs inside the editor and actually executes requests.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use rmpv::Value;

use crate::RpcError;

/// Editor function answering the handshake with a [`Meta`] record.
pub const META_FUNCTION: &str = "denops#_internal#meta#get";

/// Local variables made visible to `cmd`/`eval` as `l:` variables.
pub type Context = BTreeMap<String, Value>;

/// Operations every host offers.
pub trait Host: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn meta(&self) -> &Meta;

    /// Redraw the screen. `None` leaves the choice of a full redraw to the editor.
    fn redraw(&self, force: Option<bool>) -> impl Future<Output = Result<(), RpcError>> + Send;

    /// Call an editor function.
    fn call(
        &self,
        func: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send;

    /// Call several editor functions in order, returning each result.
    fn batch(
        &self,
        calls: Vec<BatchCall>,
    ) -> impl Future<Output = Result<Vec<Value>, RpcError>> + Send;

    /// Execute an ex command.
    fn cmd(&self, cmd: &str, ctx: Context) -> impl Future<Output = Result<(), RpcError>> + Send;

    /// Evaluate an expression.
    fn eval(
        &self,
        expr: &str,
        ctx: Context,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send;

    /// Call `func` on the dispatcher of the plugin registered as `plugin`.
    fn dispatch(
        &self,
        plugin: &str,
        func: &str,
        args: Vec<Value>,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send;
}

/// One entry of a batch: `[func, ...args]` on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCall {
    pub func: String,
    pub args: Vec<Value>,
}

impl BatchCall {
    pub fn new(func: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            func: func.into(),
            args,
        }
    }

    pub fn into_value(self) -> Value {
        let mut items = Vec::with_capacity(self.args.len() + 1);
        items.push(Value::from(self.func));
        items.extend(self.args);
        Value::Array(items)
    }

    pub fn from_value(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Array(items) => {
                let mut items = items.into_iter();
                match items.next() {
                    Some(Value::String(func)) => match func.into_str() {
                        Some(func) => Ok(Self::new(func, items.collect())),
                        None => Err(RpcError::InvalidArgument(
                            "batch function name is not valid UTF-8".into(),
                        )),
                    },
                    _ => Err(RpcError::InvalidArgument(
                        "batch entry must be [func: string, ...args]".into(),
                    )),
                }
            }
            _ => Err(RpcError::InvalidArgument(
                "batch entry must be [func: string, ...args]".into(),
            )),
        }
    }
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = RpcError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(RpcError::Deserialize(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(
    /// Build flavour of the editor-side plugin host.
    HostMode {
        Release => "release",
        Debug => "debug",
        Test => "test",
    }
);

string_enum!(
    /// Which editor is running.
    HostKind {
        Vim => "vim",
        Nvim => "nvim",
    }
);

string_enum!(Platform {
    Windows => "windows",
    Mac => "mac",
    Linux => "linux",
});

/// Environment metadata returned by the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub mode: HostMode,
    pub host: HostKind,
    pub version: String,
    pub platform: Platform,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            mode: HostMode::Release,
            host: HostKind::Vim,
            version: "0.0.0".into(),
            platform: Platform::Linux,
        }
    }
}

impl Meta {
    pub fn to_value(&self) -> Value {
        Value::Map(vec![
            (Value::from("mode"), Value::from(self.mode.as_str())),
            (Value::from("host"), Value::from(self.host.as_str())),
            (Value::from("version"), Value::from(self.version.as_str())),
            (Value::from("platform"), Value::from(self.platform.as_str())),
        ])
    }

    pub fn from_value(value: &Value) -> Result<Self, RpcError> {
        let entries = value
            .as_map()
            .ok_or_else(|| RpcError::Deserialize(format!("meta must be a map, got {value}")))?;
        let field = |name: &str| -> Result<&str, RpcError> {
            entries
                .iter()
                .find(|(k, _)| k.as_str() == Some(name))
                .and_then(|(_, v)| v.as_str())
                .ok_or_else(|| RpcError::Deserialize(format!("meta.{name} is missing")))
        };
        Ok(Self {
            mode: field("mode")?.parse()?,
            host: field("host")?.parse()?,
            version: field("version")?.to_owned(),
            platform: field("platform")?.parse()?,
        })
    }
}

/// Encode a context as a msgpack map.
pub fn context_to_value(ctx: Context) -> Value {
    Value::Map(
        ctx.into_iter()
            .map(|(k, v)| (Value::from(k), v))
            .collect(),
    )
}

/// Decode a context; `nil` means empty. Keys must be strings.
pub fn context_from_value(value: Value) -> Result<Context, RpcError> {
    match value {
        Value::Nil => Ok(Context::new()),
        Value::Map(entries) => entries
            .into_iter()
            .map(|(k, v)| match k {
                Value::String(key) => key
                    .into_str()
                    .map(|key| (key, v))
                    .ok_or_else(|| RpcError::InvalidArgument("context key is not UTF-8".into())),
                other => Err(RpcError::InvalidArgument(format!(
                    "context key must be a string, got {other}"
                ))),
            })
            .collect(),
        other => Err(RpcError::InvalidArgument(format!(
            "context must be a map, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_reads_handshake_record() {
        let value = Value::Map(vec![
            (Value::from("mode"), Value::from("debug")),
            (Value::from("host"), Value::from("nvim")),
            (Value::from("version"), Value::from("0.10.0")),
            (Value::from("platform"), Value::from("mac")),
            (Value::from("extra"), Value::from(true)),
        ]);
        let meta = Meta::from_value(&value).unwrap();
        assert_eq!(meta.host, HostKind::Nvim);
        assert_eq!(meta.mode, HostMode::Debug);
        assert_eq!(meta.platform, Platform::Mac);
        assert_eq!(meta.version, "0.10.0");
    }

    #[test]
    fn meta_rejects_unknown_host() {
        let mut meta = Meta::default().to_value();
        if let Value::Map(entries) = &mut meta {
            entries[1].1 = Value::from("emacs");
        }
        let err = Meta::from_value(&meta).unwrap_err();
        assert!(err.to_string().contains("unknown HostKind 'emacs'"));
    }

    #[test]
    fn batch_call_wire_shape() {
        let call = BatchCall::new("execute", vec![Value::from("let x = 1")]);
        let value = call.clone().into_value();
        assert_eq!(
            value,
            Value::Array(vec![Value::from("execute"), Value::from("let x = 1")])
        );
        assert_eq!(BatchCall::from_value(value).unwrap(), call);
        assert!(BatchCall::from_value(Value::Array(vec![Value::from(1)])).is_err());
    }

    #[test]
    fn context_rejects_non_string_keys() {
        assert!(context_from_value(Value::Nil).unwrap().is_empty());
        assert!(context_from_value(Value::Map(vec![(Value::from(1), Value::Nil)])).is_err());
    }
}
