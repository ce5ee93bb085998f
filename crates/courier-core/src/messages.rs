//! Wire records exchanged with clients and carried on the bus.
//!
//! Every record is one JSON object on its own line. Numeric status and
//! intent codes are decoded into enums up front so that an out-of-range code
//! is a decode error instead of an ambiguous value.

use crate::credential::{self, CredentialDigest};
use crate::error::{CourierError, CourierResult};
use crate::identity::validate_login;
use serde::{Deserialize, Serialize};

/// Text carried by the error record sent back for an unknown recipient.
pub const RECIPIENT_UNKNOWN_TEXT: &str = "incorrect user";

/// What the client wants the handshake to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
#[repr(i64)]
pub enum Intent {
    Register = 0,
    Authenticate = 1,
}

impl From<Intent> for i64 {
    fn from(i: Intent) -> i64 {
        i as i64
    }
}

impl TryFrom<i64> for Intent {
    type Error = String;
    fn try_from(v: i64) -> Result<Self, String> {
        match v {
            0 => Ok(Self::Register),
            1 => Ok(Self::Authenticate),
            other => Err(format!("unknown handshake intent: {other}")),
        }
    }
}

/// Outcome code of a handshake. Anything non-zero is a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
#[repr(i64)]
pub enum HandshakeStatus {
    Accepted = 0,
    AlreadyOnline = 1,
    Rejected = 2,
}

impl From<HandshakeStatus> for i64 {
    fn from(s: HandshakeStatus) -> i64 {
        s as i64
    }
}

impl TryFrom<i64> for HandshakeStatus {
    type Error = String;
    fn try_from(v: i64) -> Result<Self, String> {
        match v {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::AlreadyOnline),
            2 => Ok(Self::Rejected),
            other => Err(format!("unknown handshake status: {other}")),
        }
    }
}

/// Status code of a message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
#[repr(i64)]
pub enum MessageStatus {
    #[default]
    Normal = 0,
    Logout = 1,
    RecipientUnknown = 2,
    Historical = 3,
}

impl From<MessageStatus> for i64 {
    fn from(s: MessageStatus) -> i64 {
        s as i64
    }
}

impl TryFrom<i64> for MessageStatus {
    type Error = String;
    fn try_from(v: i64) -> Result<Self, String> {
        match v {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Logout),
            2 => Ok(Self::RecipientUnknown),
            3 => Ok(Self::Historical),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// First record a client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub login: String,
    /// Hex-encoded credential digest.
    pub credential_hash: String,
    pub intent: Intent,
    /// Client clock, unix seconds.
    #[serde(default)]
    pub timestamp: i64,
}

impl HandshakeRequest {
    pub fn new(login: &str, password: &str, intent: Intent, timestamp: i64) -> Self {
        Self {
            login: login.to_string(),
            credential_hash: credential::hash(password).to_hex(),
            intent,
            timestamp,
        }
    }

    /// Decode the transmitted credential hash.
    pub fn credential(&self) -> CourierResult<CredentialDigest> {
        credential::decode(&self.credential_hash)
    }
}

/// Server answer to a [`HandshakeRequest`]; sent for every outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub login: String,
    pub credential_hash: String,
    pub status: HandshakeStatus,
}

impl HandshakeResponse {
    pub fn for_request(request: &HandshakeRequest, status: HandshakeStatus) -> Self {
        Self {
            login: request.login.clone(),
            credential_hash: request.credential_hash.clone(),
            status,
        }
    }
}

/// A direct message, a logout request, an error notice or a replayed
/// historical message, depending on `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub receiver: String,
    /// Send time, unix seconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub status: MessageStatus,
}

impl MessageRecord {
    pub fn new(sender: &str, receiver: &str, text: &str, timestamp: i64) -> Self {
        Self {
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            timestamp,
            text: text.to_string(),
            status: MessageStatus::Normal,
        }
    }

    /// Logout request for `login`.
    pub fn logout(login: &str, timestamp: i64) -> Self {
        Self {
            sender: login.to_string(),
            receiver: login.to_string(),
            timestamp,
            text: "disconnect".to_string(),
            status: MessageStatus::Logout,
        }
    }

    /// Error notice returned to the sender of `original`.
    pub fn recipient_unknown(original: &MessageRecord) -> Self {
        Self {
            sender: original.sender.clone(),
            receiver: original.receiver.clone(),
            timestamp: original.timestamp,
            text: RECIPIENT_UNKNOWN_TEXT.to_string(),
            status: MessageStatus::RecipientUnknown,
        }
    }

    /// Backlog entry replayed on reconnect.
    pub fn historical(sender: &str, receiver: &str, text: &str, timestamp: i64) -> Self {
        Self {
            status: MessageStatus::Historical,
            ..Self::new(sender, receiver, text, timestamp)
        }
    }

    pub fn is_logout(&self) -> bool {
        self.status == MessageStatus::Logout
    }

    /// Check a record received from a client before it is relayed.
    ///
    /// Only normal and logout records may come from a client; a normal
    /// record needs a valid receiver login and non-empty text.
    pub fn validate_inbound(&self) -> CourierResult<()> {
        match self.status {
            MessageStatus::Logout => Ok(()),
            MessageStatus::Normal => {
                validate_login(&self.receiver).map_err(|_| {
                    CourierError::Protocol(format!("invalid receiver: {:?}", self.receiver))
                })?;
                if self.text.is_empty() {
                    return Err(CourierError::Protocol("empty message text".into()));
                }
                Ok(())
            }
            other => Err(CourierError::Protocol(format!(
                "clients may not send status {}",
                i64::from(other)
            ))),
        }
    }
}

/// Envelope published on the bus. Tagged so consumers never guess at the
/// payload shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusEnvelope {
    Message(MessageRecord),
}
