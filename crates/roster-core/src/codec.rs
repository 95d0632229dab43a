//! Transport encoding of the document: pretty JSON wrapped in standard base64.

use crate::model::ApplicationState;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid base64 content: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid document JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Encode the document for a remote write.
pub fn encode(state: &ApplicationState) -> Result<String> {
    let json = serde_json::to_string_pretty(state)?;
    Ok(STANDARD.encode(json))
}

/// Decode remote content. Line breaks inside the payload are ignored, since
/// the contents API wraps base64 at a fixed width.
pub fn decode(content: &[u8]) -> Result<ApplicationState> {
    let compact: Vec<u8> = content
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let json = STANDARD.decode(compact)?;
    Ok(serde_json::from_slice(&json)?)
}
