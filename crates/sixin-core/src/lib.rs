//! sixin-core: shared protocol library for the sixin realtime server.
//!
//! Provides the typed event model, the event-socket and plain-socket codecs,
//! the STUN wire codec, HMAC bearer tokens, and onion payload encryption.

pub mod codec;
pub mod crypto;
pub mod error;
pub mod messages;
pub mod stun;
pub mod token;

// Re-export commonly used items at crate root.
pub use crypto::{CryptoError, OnionCipher};
pub use error::{SixinError, SixinResult};
pub use messages::{
    ChatMessage, ClientEvent, IceCandidateInit, MessageTarget, RoomId, ServerEvent,
    SessionDescription, TransportKind, UserId,
};
pub use token::{generate_secret, issue_token, verify_token};
