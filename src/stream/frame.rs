use crate::error::{Error, Result};
use bytes::Bytes;
use k8s_openapi::serde_json;
use serde::Serialize;

pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Body of an error delivered inside a stream (or as a JSON error body)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub error: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub forbidden: bool,
}

impl From<&Error> for ErrorPayload {
    fn from(err: &Error) -> Self {
        Self {
            error: err.to_string(),
            forbidden: err.is_forbidden(),
        }
    }
}

/// Encode one push frame: `data: <json>\n\n`.
///
/// Compact JSON never contains raw newlines, so a single `data:` line is
/// always enough.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized
pub fn data_frame<T: Serialize + ?Sized>(payload: &T) -> Result<Bytes> {
    let json = serde_json::to_vec(payload)?;
    let mut frame = Vec::with_capacity(json.len() + 8);
    frame.extend_from_slice(b"data: ");
    frame.extend_from_slice(&json);
    frame.extend_from_slice(b"\n\n");
    Ok(Bytes::from(frame))
}

/// Encode an error as a regular data frame
#[must_use]
pub fn error_frame(err: &Error) -> Bytes {
    let payload = ErrorPayload::from(err);
    data_frame(&payload).unwrap_or_else(|_| Bytes::from_static(b"data: {\"error\":\"internal error\"}\n\n"))
}
