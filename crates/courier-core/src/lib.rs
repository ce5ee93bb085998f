//! courier-core: Shared protocol library for the courier message relay.
//!
//! Provides the line-delimited JSON records exchanged with clients, the line
//! codec, credential hashing and login validation.

pub mod codec;
pub mod credential;
pub mod error;
pub mod identity;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{line_decode, line_encode, LineDecoder};
pub use credential::{CredentialDigest, DIGEST_LEN};
pub use error::{CourierError, CourierResult};
pub use identity::{conversation_key, is_valid_login, validate_login};
pub use messages::{
    BusEnvelope, HandshakeRequest, HandshakeResponse, HandshakeStatus, Intent, MessageRecord,
    MessageStatus,
};
