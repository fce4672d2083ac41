//! JSON text codec for [`Frame`]s.
//!
//! Wire format: one UTF-8 JSON object per WebSocket text message.

use crate::error::{GwError, GwResult};
use crate::frame::Frame;
use serde_json::Value;

/// Encode a frame into its JSON text form.
pub fn frame_encode(frame: &Frame) -> GwResult<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a frame from raw bytes.
///
/// Malformed JSON, an unknown `type`, or a shape missing its required
/// fields all fail with [`GwError::Codec`]. A request-shaped object whose
/// string `id` is readable fails with [`GwError::BadRequest`] instead, so
/// the caller can still answer under that id.
pub fn frame_decode(data: &[u8]) -> GwResult<Frame> {
    serde_json::from_slice(data).map_err(|e| match recover_request_id(data) {
        Some(id) => GwError::BadRequest {
            id,
            reason: e.to_string(),
        },
        None => GwError::Codec(format!("bad frame: {e}")),
    })
}

/// The string `id` of a JSON object that is, or claims to be, a request.
fn recover_request_id(data: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(data).ok()?;
    let object = value.as_object()?;
    match object.get("type") {
        None => {}
        Some(Value::String(kind)) if kind == "request" => {}
        Some(_) => return None,
    }
    match object.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        _ => None,
    }
}
