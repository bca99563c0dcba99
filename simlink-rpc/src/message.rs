//! RPC envelopes.
//!
//! Messages are JSON arrays tagged by their first element:
//!
//! - request: `[0, msgid, method, params]`
//! - response: `[1, msgid, error, result]` (`error` is null on success)
//! - notification: `[2, method, params]`

use bytes::Bytes;
use serde_json::Value;

use crate::error::{TransportError, TransportResult};

const REQUEST: u64 = 0;
const RESPONSE: u64 = 1;
const NOTIFICATION: u64 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        msgid: u32,
        method: String,
        params: Vec<Value>,
    },
    Response {
        msgid: u32,
        error: Value,
        result: Value,
    },
    Notification {
        method: String,
        params: Vec<Value>,
    },
}

impl Message {
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Request {
                msgid,
                method,
                params,
            } => Value::Array(vec![
                REQUEST.into(),
                (*msgid).into(),
                method.as_str().into(),
                Value::Array(params.clone()),
            ]),
            Self::Response {
                msgid,
                error,
                result,
            } => Value::Array(vec![
                RESPONSE.into(),
                (*msgid).into(),
                error.clone(),
                result.clone(),
            ]),
            Self::Notification { method, params } => Value::Array(vec![
                NOTIFICATION.into(),
                method.as_str().into(),
                Value::Array(params.clone()),
            ]),
        }
    }

    pub fn from_value(value: Value) -> TransportResult<Self> {
        let Value::Array(fields) = value else {
            return Err(protocol("message is not an array"));
        };
        let mut fields = fields.into_iter();
        let kind = fields.next().and_then(|kind| kind.as_u64());

        match (kind, fields.len()) {
            (Some(REQUEST), 3) => Ok(Self::Request {
                msgid: msgid(fields.next())?,
                method: method(fields.next())?,
                params: params(fields.next())?,
            }),
            (Some(RESPONSE), 3) => Ok(Self::Response {
                msgid: msgid(fields.next())?,
                error: fields.next().unwrap_or(Value::Null),
                result: fields.next().unwrap_or(Value::Null),
            }),
            (Some(NOTIFICATION), 2) => Ok(Self::Notification {
                method: method(fields.next())?,
                params: params(fields.next())?,
            }),
            (Some(kind), len) => Err(protocol(&format!(
                "unexpected message type {kind} with {len} fields"
            ))),
            (None, _) => Err(protocol("missing message type")),
        }
    }

    pub fn encode(&self) -> TransportResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.to_value())?))
    }

    pub fn decode(frame: &[u8]) -> TransportResult<Self> {
        Self::from_value(serde_json::from_slice(frame)?)
    }
}

fn protocol(reason: &str) -> TransportError {
    TransportError::Protocol(reason.to_string())
}

fn msgid(field: Option<Value>) -> TransportResult<u32> {
    field
        .as_ref()
        .and_then(Value::as_u64)
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| protocol("invalid msgid"))
}

fn method(field: Option<Value>) -> TransportResult<String> {
    match field {
        Some(Value::String(method)) => Ok(method),
        _ => Err(protocol("invalid method name")),
    }
}

fn params(field: Option<Value>) -> TransportResult<Vec<Value>> {
    match field {
        Some(Value::Array(params)) => Ok(params),
        _ => Err(protocol("params must be an array")),
    }
}
