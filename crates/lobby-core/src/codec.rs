//! JSON text framing for the lobby event stream.
//!
//! Wire format: one WebSocket text frame per event,
//! `{"event": "<tag>", "data": <payload>}`.

use crate::error::{LobbyError, LobbyResult};
use crate::messages::Envelope;

/// Maximum accepted size of a single text frame (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Encode an envelope into a JSON text frame.
pub fn frame_encode(envelope: &Envelope) -> LobbyResult<String> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode a JSON text frame into an envelope.
///
/// Rejects frames larger than [`MAX_FRAME_SIZE`] before parsing.
pub fn frame_decode(text: &str) -> LobbyResult<Envelope> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(LobbyError::InvalidMessage(format!(
            "frame too large: {} bytes (max {})",
            text.len(),
            MAX_FRAME_SIZE
        )));
    }
    Ok(serde_json::from_str(text)?)
}
