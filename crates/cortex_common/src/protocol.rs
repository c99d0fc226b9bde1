//! Wire protocol for the cortexd Unix socket.
//!
//! One JSON document per request and per response; the server closes the
//! connection after writing the response.
//!
//! Request:  `{"method": "...", "params": {...}, "id": "..."}`
//! Response: `{"success": bool, "result"|"error": ..., "timestamp": i64, "id"?: "..."}`
//!
//! The functions here are pure: no I/O, no state.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Largest request the server will buffer
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Method names understood by the daemon
pub mod methods {
    pub const PING: &str = "ping";
    pub const VERSION: &str = "version";
    pub const CONFIG_GET: &str = "config.get";
    pub const CONFIG_RELOAD: &str = "config.reload";
    pub const SHUTDOWN: &str = "shutdown";
    pub const HEALTH: &str = "health";
    pub const HEALTH_CHECK: &str = "health.check";
    pub const ALERTS: &str = "alerts";
    pub const ALERTS_COUNTS: &str = "alerts.counts";
    pub const ALERTS_ACKNOWLEDGE: &str = "alerts.acknowledge";
    pub const ALERTS_DISMISS: &str = "alerts.dismiss";
}

/// Error codes carried in `error.code`.
///
/// The first five follow JSON-RPC; the rest are daemon specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    ParseError = -32700,
    InvalidRequest = -32600,
    MethodNotFound = -32601,
    InvalidParams = -32602,
    InternalError = -32603,
    RateLimited = -32001,
    ConfigError = -32002,
    ResourceUnavailable = -32003,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            -32001 => Some(ErrorCode::RateLimited),
            -32002 => Some(ErrorCode::ConfigError),
            -32003 => Some(ErrorCode::ResourceUnavailable),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::ResourceUnavailable => "RESOURCE_UNAVAILABLE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_i32())
    }
}

/// Why a byte buffer did not decode into a request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Valid prefix of a JSON document; more bytes may complete it
    #[error("incomplete request")]
    Incomplete,
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("missing or empty method")]
    MissingMethod,
    #[error("params must be an object")]
    InvalidParams,
}

impl ParseError {
    /// Code reported to the client for this failure
    pub fn code(&self) -> ErrorCode {
        match self {
            ParseError::Incomplete | ParseError::Malformed(_) | ParseError::MissingMethod => {
                ErrorCode::ParseError
            }
            ParseError::InvalidParams => ErrorCode::InvalidRequest,
        }
    }
}

/// A decoded client request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    /// Always a JSON object
    pub params: Value,
    /// Opaque correlation id, echoed back verbatim
    pub id: Option<String>,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: Value::Object(Map::new()),
            id: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = match params {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key).filter(|v| !v.is_null())
    }
}

/// Error payload of a failed response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: i32,
}

impl ErrorBody {
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_i32(self.code)
    }
}

/// Result xor error
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ok(Value),
    Err(ErrorBody),
}

/// A response as sent by the daemon
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub outcome: Outcome,
    /// Epoch seconds when the response was produced
    pub timestamp: i64,
    pub id: Option<String>,
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Self {
            outcome: Outcome::Ok(result),
            timestamp: chrono::Utc::now().timestamp(),
            id: None,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Err(ErrorBody {
                message: message.into(),
                code: code.as_i32(),
            }),
            timestamp: chrono::Utc::now().timestamp(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Ok(_))
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Ok(v) => Some(v),
            Outcome::Err(_) => None,
        }
    }

    pub fn error_body(&self) -> Option<&ErrorBody> {
        match &self.outcome {
            Outcome::Ok(_) => None,
            Outcome::Err(e) => Some(e),
        }
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    method: &'a str,
    params: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
}

#[derive(Serialize, Deserialize)]
struct WireResponse {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
    #[serde(default)]
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
}

/// Decode one request. `Incomplete` means the bytes are a valid prefix.
pub fn parse_request(bytes: &[u8]) -> Result<Request, ParseError> {
    let doc: Value = serde_json::from_slice(bytes).map_err(|e| {
        if e.is_eof() {
            ParseError::Incomplete
        } else {
            ParseError::Malformed(e.to_string())
        }
    })?;

    let mut obj = match doc {
        Value::Object(obj) => obj,
        _ => return Err(ParseError::Malformed("request must be an object".to_string())),
    };

    let method = match obj.remove("method") {
        Some(Value::String(m)) if !m.is_empty() => m,
        _ => return Err(ParseError::MissingMethod),
    };

    let params = match obj.remove("params") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(p @ Value::Object(_)) => p,
        Some(_) => return Err(ParseError::InvalidParams),
    };

    let id = match obj.remove("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(_) => {
            return Err(ParseError::Malformed(
                "id must be a string or number".to_string(),
            ))
        }
    };

    Ok(Request { method, params, id })
}

/// Serialize a request for sending
pub fn encode_request(request: &Request) -> Vec<u8> {
    let wire = WireRequest {
        method: &request.method,
        params: &request.params,
        id: request.id.as_deref(),
    };
    // Serializing a struct of strings and a Value cannot fail
    serde_json::to_vec(&wire).unwrap_or_default()
}

/// Serialize a response. Exactly one of `result`/`error` is emitted.
pub fn encode_response(response: &Response) -> Vec<u8> {
    let (success, result, error) = match &response.outcome {
        Outcome::Ok(v) => (true, Some(v.clone()), None),
        Outcome::Err(e) => (false, None, Some(e.clone())),
    };
    let wire = WireResponse {
        success,
        result,
        error,
        timestamp: response.timestamp,
        id: response.id.clone().map(Value::String),
    };
    serde_json::to_vec(&wire).unwrap_or_default()
}

/// Decode a response received from the daemon
pub fn decode_response(bytes: &[u8]) -> Result<Response, ParseError> {
    let wire: WireResponse = serde_json::from_slice(bytes).map_err(|e| {
        if e.is_eof() {
            ParseError::Incomplete
        } else {
            ParseError::Malformed(e.to_string())
        }
    })?;

    let outcome = if wire.success {
        Outcome::Ok(wire.result.unwrap_or(Value::Null))
    } else {
        match wire.error {
            Some(e) => Outcome::Err(e),
            None => return Err(ParseError::Malformed("failed response without error".to_string())),
        }
    };

    let id = match wire.id {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    };

    Ok(Response {
        outcome,
        timestamp: wire.timestamp,
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_minimal_request() {
        let req = parse_request(br#"{"method":"ping"}"#).unwrap();
        assert_eq!(req.method, "ping");
        assert_eq!(req.params, json!({}));
        assert_eq!(req.id, None);
    }

    #[test]
    fn test_null_params_treated_as_absent() {
        let req = parse_request(br#"{"method":"health","params":null}"#).unwrap();
        assert_eq!(req.params, json!({}));
    }

    #[test]
    fn test_numeric_id_normalised_to_string() {
        let req = parse_request(br#"{"method":"ping","id":42}"#).unwrap();
        assert_eq!(req.id.as_deref(), Some("42"));

        let req = parse_request(br#"{"method":"ping","id":"abc-1"}"#).unwrap();
        assert_eq!(req.id.as_deref(), Some("abc-1"));
    }

    #[test]
    fn test_truncated_request_is_incomplete() {
        assert_eq!(parse_request(br#"{"method":"pi"#), Err(ParseError::Incomplete));
        assert_eq!(parse_request(b""), Err(ParseError::Incomplete));
    }

    #[test]
    fn test_parse_failures_map_to_codes() {
        let err = parse_request(b"not json").unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
        assert_eq!(err.code(), ErrorCode::ParseError);

        let err = parse_request(br#"{"params":{}}"#).unwrap_err();
        assert_eq!(err, ParseError::MissingMethod);
        assert_eq!(err.code(), ErrorCode::ParseError);

        let err = parse_request(br#"{"method":""}"#).unwrap_err();
        assert_eq!(err, ParseError::MissingMethod);

        let err = parse_request(br#"{"method":"alerts","params":[1,2]}"#).unwrap_err();
        assert_eq!(err, ParseError::InvalidParams);
        assert_eq!(err.code(), ErrorCode::InvalidRequest);

        assert!(matches!(parse_request(b"[1]"), Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_encode_success_shape() {
        let resp = Response::ok(json!({"pong": true})).with_id(Some("7".to_string()));
        let value: Value = serde_json::from_slice(&encode_response(&resp)).unwrap();

        assert_eq!(value["success"], true);
        assert_eq!(value["result"]["pong"], true);
        assert_eq!(value["id"], "7");
        assert!(value.get("error").is_none());
        assert!(value["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_encode_error_shape_without_id() {
        let resp = Response::error(ErrorCode::MethodNotFound, "Method not found: nope");
        let value: Value = serde_json::from_slice(&encode_response(&resp)).unwrap();

        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], -32601);
        assert_eq!(value["error"]["message"], "Method not found: nope");
        assert!(value.get("result").is_none());
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_decode_response_from_wire() {
        let bytes = encode_response(
            &Response::error(ErrorCode::RateLimited, "Rate limit exceeded")
                .with_id(Some("r1".to_string())),
        );
        let resp = decode_response(&bytes).unwrap();
        assert!(!resp.is_success());
        assert_eq!(resp.id.as_deref(), Some("r1"));
        let body = resp.error_body().unwrap();
        assert_eq!(body.error_code(), Some(ErrorCode::RateLimited));
    }

    #[test]
    fn test_decode_rejects_failure_without_error() {
        let err = decode_response(br#"{"success":false,"timestamp":1}"#).unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn test_encode_request_round_trips_through_parser() {
        let req = Request::new(methods::ALERTS)
            .with_params(json!({"severity": "critical"}))
            .with_id("c-1");
        let parsed = parse_request(&encode_request(&req)).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_error_code_values() {
        assert_eq!(ErrorCode::ParseError.as_i32(), -32700);
        assert_eq!(ErrorCode::ResourceUnavailable.as_i32(), -32003);
        assert_eq!(ErrorCode::from_i32(-32002), Some(ErrorCode::ConfigError));
        assert_eq!(ErrorCode::from_i32(1), None);
    }
}
