//! Error envelope normalization.
//!
//! SPDK reports failures either as `{"code": <number>, "message": <string>}`
//! or, for a few legacy paths, as a bare string. Both are folded into
//! [`RpcError`]; the structured form displays as `code: <N> msg: <M>`, which
//! [`is_json_error`] can parse back.

use std::fmt::Display;

use serde_json::Value;

use crate::ipc::client::RpcError;

// Error codes from SPDK's include/spdk/jsonrpc.h.
pub const ERROR_PARSE_ERROR: i64 = -32700;
pub const ERROR_INVALID_REQUEST: i64 = -32600;
pub const ERROR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERROR_INVALID_PARAMS: i64 = -32602;
pub const ERROR_INTERNAL_ERROR: i64 = -32603;
pub const ERROR_INVALID_STATE: i64 = -1;

/// Substituted when SPDK sends an empty error string.
const UNSPECIFIED_ERROR: &str = "unspecified error";

/// Turn a response's `error` member into the error the caller sees.
///
/// `Err` carries a description of an error object whose shape is not one
/// SPDK produces; the reader treats that as a broken connection.
pub(crate) fn parse_error_field(method: &str, error: &Value) -> Result<RpcError, String> {
    match error {
        Value::Object(map) => {
            let (Some(code), Some(message)) = (map.get("code"), map.get("message")) else {
                return Err(format!("invalid error {error}"));
            };
            let code = code
                .as_i64()
                .or_else(|| code.as_f64().map(|f| f as i64));
            match (code, message.as_str()) {
                (Some(code), Some(message)) => Ok(RpcError::ServerError {
                    method: method.to_string(),
                    code,
                    message: message.to_string(),
                }),
                _ => Err(format!("invalid error content {error}")),
            }
        }
        Value::String(message) if message.is_empty() => {
            Ok(RpcError::ServerMessage(UNSPECIFIED_ERROR.to_string()))
        }
        Value::String(message) => Ok(RpcError::ServerMessage(message.clone())),
        other => Err(format!("invalid error {other}")),
    }
}

/// Split a canonical `code: <N> msg: <M>` string into its parts.
///
/// The message must fit on one line.
pub fn parse_json_error(text: &str) -> Option<(i64, &str)> {
    let rest = text.strip_prefix("code: ")?;
    let (code, message) = rest.split_once(" msg: ")?;

    let digits = code.strip_prefix('-').unwrap_or(code);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if message.contains('\n') {
        return None;
    }

    code.parse().ok().map(|code| (code, message))
}

/// Check that an error's text is a structured SPDK error with the given code.
///
/// Works on anything whose `Display` output is the canonical string,
/// including an `anyhow::Error` built from an [`RpcError`] with no extra
/// context. Use `code == 0` to match any structured error.
///
/// The match is purely textual. A structured error whose message spans
/// several lines does not match, and a bare string error that happens to
/// read `code: <N> msg: ...` does. When holding an [`RpcError`], use
/// [`RpcError::is_json_error`], which looks at the variant instead.
pub fn is_json_error(err: &impl Display, code: i64) -> bool {
    match parse_json_error(&err.to_string()) {
        Some((actual, _)) => code == 0 || actual == code,
        None => false,
    }
}
