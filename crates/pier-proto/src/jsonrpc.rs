use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

pub const ERROR_PARSE: i64 = -32700;
pub const ERROR_INVALID_REQUEST: i64 = -32600;
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERROR_INVALID_PARAMS: i64 = -32602;
pub const ERROR_INTERNAL: i64 = -32603;

/// Request identifier. Peers may use either integers or strings; this side
/// only ever allocates integers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl RequestId {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RequestId::Number(value) => u64::try_from(*value).ok(),
            RequestId::Text(text) => text.parse().ok(),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            RequestId::Number(value) => Value::from(*value),
            RequestId::Text(text) => Value::String(text.clone()),
        }
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        RequestId::Number(value as i64)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::Text(value.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(value) => write!(f, "{value}"),
            RequestId::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(RpcErrorObject),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// `None` when the peer could not attribute the error to a request
    /// (for example a parse error on its side).
    pub id: Option<RequestId>,
    pub outcome: ResponseOutcome,
}

/// One JSON-RPC 2.0 envelope. Exactly one of the three shapes; the
/// classifier in [`WireMessage::from_value`] refuses anything ambiguous.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("json-rpc message must be an object")]
    NotAnObject,
    #[error("unsupported jsonrpc version {0}")]
    Version(String),
    #[error("invalid request id {0}")]
    InvalidId(String),
    #[error("method must be a string")]
    InvalidMethod,
    #[error("message is both a request and a response")]
    Ambiguous,
    #[error("response carries both result and error")]
    ConflictingOutcome,
    #[error("malformed error object: {0}")]
    InvalidError(String),
    #[error("object is neither a request, a response nor a notification")]
    Unclassifiable,
}

/// True when `value` is an object whose `jsonrpc` member is exactly "2.0".
pub fn is_jsonrpc_envelope(value: &Value) -> bool {
    value
        .get("jsonrpc")
        .and_then(Value::as_str)
        .is_some_and(|version| version == JSONRPC_VERSION)
}

impl WireMessage {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        WireMessage::Request(Request {
            id: id.into(),
            method: method.into(),
            params: Some(params),
        })
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        WireMessage::Notification(Notification {
            method: method.into(),
            params: Some(params),
        })
    }

    pub fn result(id: RequestId, result: Value) -> Self {
        WireMessage::Response(Response {
            id: Some(id),
            outcome: ResponseOutcome::Result(result),
        })
    }

    pub fn error(id: Option<RequestId>, code: i64, message: impl Into<String>) -> Self {
        WireMessage::Response(Response {
            id,
            outcome: ResponseOutcome::Error(RpcErrorObject::new(code, message)),
        })
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            WireMessage::Request(request) => Some(&request.method),
            WireMessage::Notification(notification) => Some(&notification.method),
            WireMessage::Response(_) => None,
        }
    }

    /// Classify a decoded JSON value. A missing `jsonrpc` member is
    /// tolerated for older agents; a present but different version is not.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        match map.remove("jsonrpc") {
            None => {}
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            Some(other) => return Err(ProtocolError::Version(other.to_string())),
        }

        let id = parse_id(map.remove("id"))?;
        let has_result = map.contains_key("result");
        let has_error = map.contains_key("error");

        if let Some(method) = map.remove("method") {
            let Value::String(method) = method else {
                return Err(ProtocolError::InvalidMethod);
            };
            if has_result || has_error {
                return Err(ProtocolError::Ambiguous);
            }
            let params = map.remove("params");
            return Ok(match id {
                Some(id) => WireMessage::Request(Request { id, method, params }),
                None => WireMessage::Notification(Notification { method, params }),
            });
        }

        match (map.remove("result"), map.remove("error")) {
            (Some(_), Some(_)) => Err(ProtocolError::ConflictingOutcome),
            (Some(result), None) => Ok(WireMessage::Response(Response {
                id,
                outcome: ResponseOutcome::Result(result),
            })),
            (None, Some(error)) => {
                let error: RpcErrorObject = serde_json::from_value(error)
                    .map_err(|err| ProtocolError::InvalidError(err.to_string()))?;
                Ok(WireMessage::Response(Response {
                    id,
                    outcome: ResponseOutcome::Error(error),
                }))
            }
            (None, None) => Err(ProtocolError::Unclassifiable),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
        match self {
            WireMessage::Request(request) => {
                map.insert("id".into(), request.id.to_value());
                map.insert("method".into(), Value::String(request.method.clone()));
                if let Some(params) = &request.params {
                    map.insert("params".into(), params.clone());
                }
            }
            WireMessage::Notification(notification) => {
                map.insert("method".into(), Value::String(notification.method.clone()));
                if let Some(params) = &notification.params {
                    map.insert("params".into(), params.clone());
                }
            }
            WireMessage::Response(response) => {
                let id = response
                    .id
                    .as_ref()
                    .map(RequestId::to_value)
                    .unwrap_or(Value::Null);
                map.insert("id".into(), id);
                match &response.outcome {
                    ResponseOutcome::Result(result) => {
                        map.insert("result".into(), result.clone());
                    }
                    ResponseOutcome::Error(error) => {
                        map.insert("error".into(), json!(error));
                    }
                }
            }
        }
        Value::Object(map)
    }
}

fn parse_id(raw: Option<Value>) -> Result<Option<RequestId>, ProtocolError> {
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => number
            .as_i64()
            .map(|value| Some(RequestId::Number(value)))
            .ok_or_else(|| ProtocolError::InvalidId(number.to_string())),
        Some(Value::String(text)) => Ok(Some(RequestId::Text(text))),
        Some(other) => Err(ProtocolError::InvalidId(other.to_string())),
    }
}

impl Serialize for WireMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for WireMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        WireMessage::from_value(value).map_err(D::Error::custom)
    }
}

pub fn method_not_found(id: Option<RequestId>, method: &str) -> WireMessage {
    WireMessage::error(
        id,
        ERROR_METHOD_NOT_FOUND,
        format!("method '{method}' not found"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_three_shapes() {
        let request =
            WireMessage::from_value(json!({"jsonrpc": "2.0", "id": 7, "method": "initialize"}))
                .expect("request");
        assert!(matches!(request, WireMessage::Request(ref r) if r.id == RequestId::Number(7)));

        let notification = WireMessage::from_value(
            json!({"jsonrpc": "2.0", "method": "session/update", "params": {}}),
        )
        .expect("notification");
        assert_eq!(notification.method(), Some("session/update"));

        let response =
            WireMessage::from_value(json!({"jsonrpc": "2.0", "id": "a1", "result": {"ok": true}}))
                .expect("response");
        match response {
            WireMessage::Response(Response {
                id: Some(RequestId::Text(id)),
                outcome: ResponseOutcome::Result(_),
            }) => assert_eq!(id, "a1"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_request_that_is_also_a_response() {
        let err = WireMessage::from_value(
            json!({"jsonrpc": "2.0", "id": 1, "method": "x", "result": null}),
        )
        .unwrap_err();
        assert_eq!(err, ProtocolError::Ambiguous);
    }

    #[test]
    fn rejects_conflicting_outcome_and_wrong_version() {
        let err = WireMessage::from_value(json!({
            "jsonrpc": "2.0", "id": 1, "result": 1, "error": {"code": 1, "message": "x"}
        }))
        .unwrap_err();
        assert_eq!(err, ProtocolError::ConflictingOutcome);

        let err = WireMessage::from_value(json!({"jsonrpc": "1.0", "method": "x"})).unwrap_err();
        assert!(matches!(err, ProtocolError::Version(_)));
    }

    #[test]
    fn error_response_keeps_code_and_message() {
        let message = WireMessage::from_value(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "error": {"code": -32601, "message": "method 'x' not found"}
        }))
        .expect("error response");
        let WireMessage::Response(Response {
            outcome: ResponseOutcome::Error(error),
            ..
        }) = message
        else {
            panic!("expected error response");
        };
        assert_eq!(error.code, ERROR_METHOD_NOT_FOUND);
        assert_eq!(error.message, "method 'x' not found");
    }

    #[test]
    fn serializes_with_version_tag() {
        let value = WireMessage::request(4u64, "session/list", json!({})).to_value();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 4, "method": "session/list", "params": {}})
        );
        assert!(is_jsonrpc_envelope(&value));
    }
}
