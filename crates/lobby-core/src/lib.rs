//! lobby-core: Shared protocol library for the lobby presence hub.
//!
//! Provides the event envelope and typed client/server events, the JSON
//! text-frame codec, unverified bearer-token inspection, and the shared
//! error type.

pub mod codec;
pub mod error;
pub mod messages;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{frame_decode, frame_encode, MAX_FRAME_SIZE};
pub use error::{LobbyError, LobbyResult};
pub use messages::{ClientEvent, Envelope, Identity, PeerInfo, ServerEvent};
pub use token::{bearer_token, peek, TokenPeek};
