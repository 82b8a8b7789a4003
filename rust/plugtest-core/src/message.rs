//! msgpack-rpc message model.
//!
//! Every frame on the wire is one msgpack array:
//!
//! ```text
//! [0, id, method, params]   call
//! [1, id, error,  result]   response
//! [2, method, params]       notify
//! ```

use rmpv::Value;

const KIND_CALL: u64 = 0;
const KIND_RESPONSE: u64 = 1;
const KIND_NOTIFY: u64 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Call {
        id: u32,
        method: String,
        params: Vec<Value>,
    },
    /// `Err` carries the raw error slot; it is never `Nil`.
    Response {
        id: u32,
        result: Result<Value, Value>,
    },
    Notify {
        method: String,
        params: Vec<Value>,
    },
}

impl RpcMessage {
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Call { method, .. } | Self::Notify { method, .. } => Some(method),
            Self::Response { .. } => None,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Call { id, method, params } => Value::Array(vec![
                Value::from(KIND_CALL),
                Value::from(id),
                Value::from(method),
                Value::Array(params),
            ]),
            Self::Response { id, result } => {
                let (error, result) = match result {
                    Ok(value) => (Value::Nil, value),
                    Err(error) => (error, Value::Nil),
                };
                Value::Array(vec![
                    Value::from(KIND_RESPONSE),
                    Value::from(id),
                    error,
                    result,
                ])
            }
            Self::Notify { method, params } => Value::Array(vec![
                Value::from(KIND_NOTIFY),
                Value::from(method),
                Value::Array(params),
            ]),
        }
    }

    /// Parse a decoded frame. A frame that is not a valid message is handed back unchanged.
    pub fn from_value(value: Value) -> Result<Self, Value> {
        match parse(&value) {
            Some(message) => Ok(message),
            None => Err(value),
        }
    }
}

fn parse(value: &Value) -> Option<RpcMessage> {
    let items = value.as_array()?;
    let kind = items.first()?.as_u64()?;
    match (kind, items.len()) {
        (KIND_CALL, 4) => Some(RpcMessage::Call {
            id: parse_id(&items[1])?,
            method: items[2].as_str()?.to_owned(),
            params: items[3].as_array()?.clone(),
        }),
        (KIND_RESPONSE, 4) => {
            let id = parse_id(&items[1])?;
            let result = if items[2].is_nil() {
                Ok(items[3].clone())
            } else {
                Err(items[2].clone())
            };
            Some(RpcMessage::Response { id, result })
        }
        (KIND_NOTIFY, 3) => Some(RpcMessage::Notify {
            method: items[1].as_str()?.to_owned(),
            params: items[2].as_array()?.clone(),
        }),
        _ => None,
    }
}

fn parse_id(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|id| u32::try_from(id).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_layout_matches_msgpack_rpc() {
        let value = RpcMessage::Call {
            id: 7,
            method: "invoke".into(),
            params: vec![Value::from("call")],
        }
        .into_value();
        assert_eq!(
            value,
            Value::Array(vec![
                Value::from(0),
                Value::from(7),
                Value::from("invoke"),
                Value::Array(vec![Value::from("call")]),
            ])
        );
    }

    #[test]
    fn error_response_puts_payload_in_error_slot() {
        let value = RpcMessage::Response {
            id: 3,
            result: Err(Value::from("boom")),
        }
        .into_value();
        let items = value.as_array().unwrap();
        assert_eq!(items[2], Value::from("boom"));
        assert!(items[3].is_nil());
        assert_eq!(
            RpcMessage::from_value(value),
            Ok(RpcMessage::Response {
                id: 3,
                result: Err(Value::from("boom")),
            })
        );
    }

    #[test]
    fn rejects_malformed_frames() {
        for frame in [
            Value::from("hello"),
            Value::Array(vec![]),
            Value::Array(vec![Value::from(9), Value::from(1)]),
            // params must be an array
            Value::Array(vec![Value::from(2), Value::from("m"), Value::from(1)]),
            // negative id
            Value::Array(vec![
                Value::from(0),
                Value::from(-1),
                Value::from("m"),
                Value::Array(vec![]),
            ]),
        ] {
            assert_eq!(RpcMessage::from_value(frame.clone()), Err(frame));
        }
    }
}
