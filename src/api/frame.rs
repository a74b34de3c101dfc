//! Accessors for the envelope fields of inbound JSON frames.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::EngineError;

/// Correlation field carried by requests and echoed by responses.
pub const REQ_ID: &str = "req_id";

/// Correlation id of a frame, from the top level or the echoed request.
pub fn req_id(frame: &Value) -> Option<u64> {
    frame
        .get(REQ_ID)
        .and_then(Value::as_u64)
        .or_else(|| frame.get("echo_req")?.get(REQ_ID)?.as_u64())
}

/// Message-kind discriminator.
pub fn msg_type(frame: &Value) -> Option<&str> {
    frame.get("msg_type").and_then(Value::as_str)
}

/// Server-assigned subscription id, if the frame belongs to a stream.
pub fn subscription_id(frame: &Value) -> Option<String> {
    frame
        .get("subscription")?
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Error object at the top level of a response.
pub fn remote_error(frame: &Value) -> Option<EngineError> {
    let error = frame.get("error")?;
    let (code, message) = match error {
        Value::Object(obj) => (
            obj.get("code").and_then(Value::as_str).unwrap_or_default(),
            obj.get("message").and_then(Value::as_str).unwrap_or_default(),
        ),
        Value::String(message) => ("", message.as_str()),
        Value::Null => return None,
        _ => ("", ""),
    };
    Some(EngineError::Remote {
        code: code.to_string(),
        message: message.to_string(),
    })
}

/// Render a JSON scalar used as a key (contract ids arrive as numbers).
pub fn key_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Serde helper accepting `0/1`, `true/false` or `"1"` for boolean flags.
pub fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().map_or(false, |v| v != 0.0),
        Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_req_id_falls_back_to_echo() {
        assert_eq!(req_id(&json!({"req_id": 4, "msg_type": "buy"})), Some(4));
        assert_eq!(req_id(&json!({"echo_req": {"req_id": 9}})), Some(9));
        assert_eq!(req_id(&json!({"msg_type": "tick"})), None);
    }

    #[test]
    fn test_remote_error_shapes() {
        let err = remote_error(&json!({
            "req_id": 1,
            "error": {"code": "InvalidToken", "message": "Token invalid"}
        }));
        assert_eq!(
            err,
            Some(EngineError::Remote {
                code: "InvalidToken".to_string(),
                message: "Token invalid".to_string(),
            })
        );
        assert!(remote_error(&json!({"req_id": 1, "error": null})).is_none());
        assert!(remote_error(&json!({"req_id": 1, "buy": {}})).is_none());
    }

    #[test]
    fn test_subscription_and_keys() {
        let frame = json!({"subscription": {"id": "abc"}, "msg_type": "tick"});
        assert_eq!(subscription_id(&frame).as_deref(), Some("abc"));
        assert_eq!(msg_type(&frame), Some("tick"));
        assert_eq!(key_string(&json!(12345)).as_deref(), Some("12345"));
        assert_eq!(key_string(&json!("R_100")).as_deref(), Some("R_100"));
        assert_eq!(key_string(&json!("")), None);
    }
}
