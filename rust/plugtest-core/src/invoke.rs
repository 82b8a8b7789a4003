//! The `invoke` envelope: one RPC method carrying every [`Host`] operation.
//!
//! Params are always `[name, args]`. The argument shapes accepted here are the
//! contract between the harness client and the in-editor bridge:
//!
//! | name       | args                                   |
//! |------------|----------------------------------------|
//! | `redraw`   | `[]` or `[force: bool \| nil]`         |
//! | `call`     | `[func: string, ...args]`              |
//! | `batch`    | `[[func: string, ...args], ...]`       |
//! | `cmd`      | `[cmd: string, ctx?: map \| nil]`      |
//! | `eval`     | `[expr: string, ctx?: map \| nil]`     |
//! | `dispatch` | `[plugin: string, func: string, ...args]` |

use rmpv::Value;

use crate::host::{context_from_value, context_to_value};
use crate::{BatchCall, Context, Host, RpcError};

/// RPC method the harness calls on the bridge.
pub const INVOKE_METHOD: &str = "invoke";

/// RPC method the bridge calls on the harness: params `[func, args]`.
pub const DISPATCH_METHOD: &str = "dispatch";

#[derive(Debug, Clone, PartialEq)]
pub enum Invoke {
    Redraw { force: Option<bool> },
    Call { func: String, args: Vec<Value> },
    Batch { calls: Vec<BatchCall> },
    Cmd { cmd: String, ctx: Context },
    Eval { expr: String, ctx: Context },
    Dispatch {
        plugin: String,
        func: String,
        args: Vec<Value>,
    },
}

impl Invoke {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Redraw { .. } => "redraw",
            Self::Call { .. } => "call",
            Self::Batch { .. } => "batch",
            Self::Cmd { .. } => "cmd",
            Self::Eval { .. } => "eval",
            Self::Dispatch { .. } => "dispatch",
        }
    }

    /// Params for an `invoke` call.
    pub fn into_params(self) -> Vec<Value> {
        let name = Value::from(self.name());
        let args = match self {
            Self::Redraw { force } => vec![force.map(Value::from).unwrap_or(Value::Nil)],
            Self::Call { func, args } => prepend(vec![Value::from(func)], args),
            Self::Batch { calls } => calls.into_iter().map(BatchCall::into_value).collect(),
            Self::Cmd { cmd, ctx } => vec![Value::from(cmd), context_to_value(ctx)],
            Self::Eval { expr, ctx } => vec![Value::from(expr), context_to_value(ctx)],
            Self::Dispatch { plugin, func, args } => {
                prepend(vec![Value::from(plugin), Value::from(func)], args)
            }
        };
        vec![name, Value::Array(args)]
    }

    /// Decode `invoke` params: `[name: string, args: array]`.
    pub fn from_params(params: Vec<Value>) -> Result<Self, RpcError> {
        let mut params = params.into_iter();
        match (params.next(), params.next(), params.next()) {
            (Some(Value::String(name)), Some(Value::Array(args)), None) => match name.as_str() {
                Some(name) => Self::parse(name, args),
                None => Err(RpcError::InvalidArgument(
                    "invoke name is not valid UTF-8".into(),
                )),
            },
            _ => Err(RpcError::InvalidArgument(
                "invoke expects [name: string, args: array]".into(),
            )),
        }
    }

    /// Validate `args` against the shape `name` expects.
    pub fn parse(name: &str, args: Vec<Value>) -> Result<Self, RpcError> {
        match name {
            "redraw" => {
                let force = match args.as_slice() {
                    [] | [Value::Nil] => None,
                    [Value::Boolean(force)] => Some(*force),
                    _ => return Err(invalid(name, "[force?: boolean]", &args)),
                };
                Ok(Self::Redraw { force })
            }
            "call" => {
                let (func, args) =
                    split_string(args).map_err(|args| invalid(name, "[func: string, ...args]", &args))?;
                Ok(Self::Call { func, args })
            }
            "batch" => {
                let calls = args
                    .into_iter()
                    .map(BatchCall::from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Self::Batch { calls })
            }
            "cmd" | "eval" => {
                let expected = if name == "cmd" {
                    "[cmd: string, ctx?: map]"
                } else {
                    "[expr: string, ctx?: map]"
                };
                let (text, ctx) = split_text_context(args)
                    .map_err(|args| invalid(name, expected, &args))?;
                let ctx = context_from_value(ctx)?;
                Ok(if name == "cmd" {
                    Self::Cmd { cmd: text, ctx }
                } else {
                    Self::Eval { expr: text, ctx }
                })
            }
            "dispatch" => {
                let expected = "[plugin: string, func: string, ...args]";
                let (plugin, rest) =
                    split_string(args).map_err(|args| invalid(name, expected, &args))?;
                let (func, args) = split_string(rest).map_err(|rest| {
                    invalid(name, expected, &prepend(vec![Value::from(plugin.as_str())], rest))
                })?;
                Ok(Self::Dispatch { plugin, func, args })
            }
            other => Err(RpcError::UnknownMethod(other.to_owned())),
        }
    }

    /// Perform this request against `host`.
    pub async fn apply<H: Host>(self, host: &H) -> Result<Value, RpcError> {
        match self {
            Self::Redraw { force } => host.redraw(force).await.map(|()| Value::Nil),
            Self::Call { func, args } => host.call(&func, args).await,
            Self::Batch { calls } => host.batch(calls).await.map(Value::Array),
            Self::Cmd { cmd, ctx } => host.cmd(&cmd, ctx).await.map(|()| Value::Nil),
            Self::Eval { expr, ctx } => host.eval(&expr, ctx).await,
            Self::Dispatch { plugin, func, args } => host.dispatch(&plugin, &func, args).await,
        }
    }
}

fn prepend(mut head: Vec<Value>, tail: Vec<Value>) -> Vec<Value> {
    head.extend(tail);
    head
}

/// Split `[string, ...rest]`; hands the args back untouched on mismatch.
fn split_string(args: Vec<Value>) -> Result<(String, Vec<Value>), Vec<Value>> {
    if !matches!(args.first(), Some(v) if v.as_str().is_some()) {
        return Err(args);
    }
    let mut args = args.into_iter();
    let head = args
        .next()
        .and_then(|v| match v {
            Value::String(s) => s.into_str(),
            _ => None,
        })
        .unwrap_or_default();
    Ok((head, args.collect()))
}

/// Split `[string]` or `[string, map | nil]`.
fn split_text_context(args: Vec<Value>) -> Result<(String, Value), Vec<Value>> {
    let well_formed = match args.as_slice() {
        [text] => text.as_str().is_some(),
        [text, Value::Nil | Value::Map(_)] => text.as_str().is_some(),
        _ => false,
    };
    if !well_formed {
        return Err(args);
    }
    let (text, rest) = split_string(args)?;
    Ok((text, rest.into_iter().next().unwrap_or(Value::Nil)))
}

fn invalid(name: &str, expected: &str, args: &[Value]) -> RpcError {
    RpcError::InvalidArgument(format!(
        "'{name}' expects {expected}, got {}",
        Value::Array(args.to_vec())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(text: &str) -> Value {
        Value::from(text)
    }

    #[test]
    fn params_decode_back_to_the_same_request() {
        let mut ctx = Context::new();
        ctx.insert("x".into(), Value::from(1));
        for invoke in [
            Invoke::Redraw { force: None },
            Invoke::Redraw { force: Some(true) },
            Invoke::Call {
                func: "range".into(),
                args: vec![Value::from(10)],
            },
            Invoke::Batch {
                calls: vec![
                    BatchCall::new("execute", vec![s("let x = 1")]),
                    BatchCall::new("execute", vec![s("let y = 2")]),
                ],
            },
            Invoke::Cmd {
                cmd: "echo l:x".into(),
                ctx: ctx.clone(),
            },
            Invoke::Eval {
                expr: "l:x".into(),
                ctx,
            },
            Invoke::Dispatch {
                plugin: "p".into(),
                func: "f".into(),
                args: vec![Value::Array(vec![Value::from(123), s("bar")])],
            },
        ] {
            let params = invoke.clone().into_params();
            assert_eq!(Invoke::from_params(params).unwrap(), invoke);
        }
    }

    #[test]
    fn call_requires_a_function_name() {
        for args in [vec![], vec![Value::from(1)], vec![Value::Nil, s("x")]] {
            let err = Invoke::parse("call", args).unwrap_err();
            assert!(matches!(err, RpcError::InvalidArgument(_)), "{err}");
        }
    }

    #[test]
    fn dispatch_requires_plugin_and_function_names() {
        assert!(Invoke::parse("dispatch", vec![s("plugin")]).is_err());
        assert!(Invoke::parse("dispatch", vec![s("plugin"), Value::from(1)]).is_err());
        let ok = Invoke::parse("dispatch", vec![s("plugin"), s("fn")]).unwrap();
        assert_eq!(
            ok,
            Invoke::Dispatch {
                plugin: "plugin".into(),
                func: "fn".into(),
                args: vec![],
            }
        );
    }

    #[test]
    fn cmd_and_eval_accept_optional_context() {
        assert!(Invoke::parse("cmd", vec![s("echo 1")]).is_ok());
        assert!(Invoke::parse("eval", vec![s("1"), Value::Nil]).is_ok());
        assert!(Invoke::parse("cmd", vec![s("echo 1"), Value::from(1)]).is_err());
        assert!(Invoke::parse("eval", vec![s("1"), Value::Nil, Value::Nil]).is_err());
        assert!(Invoke::parse("eval", vec![]).is_err());
    }

    #[test]
    fn redraw_accepts_only_an_optional_boolean() {
        assert_eq!(
            Invoke::parse("redraw", vec![]).unwrap(),
            Invoke::Redraw { force: None }
        );
        assert!(Invoke::parse("redraw", vec![s("yes")]).is_err());
        assert!(Invoke::parse("redraw", vec![Value::Boolean(true), Value::Nil]).is_err());
    }

    #[test]
    fn batch_entries_are_validated() {
        let err = Invoke::parse("batch", vec![Value::Array(vec![Value::from(1)])]).unwrap_err();
        assert!(matches!(err, RpcError::InvalidArgument(_)));
    }

    #[test]
    fn unknown_name_is_reported() {
        let err = Invoke::parse("frobnicate", vec![]).unwrap_err();
        assert_eq!(err.to_string(), "unknown method 'frobnicate'");
    }

    #[test]
    fn envelope_must_be_name_and_array() {
        assert!(Invoke::from_params(vec![s("call")]).is_err());
        assert!(Invoke::from_params(vec![s("call"), s("range")]).is_err());
    }
}
