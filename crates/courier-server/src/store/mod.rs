//! Persistence collaborator: identities, conversations and message history.
//!
//! The relay only talks to the [`Store`] trait. Two backends are provided:
//! [`MemoryStore`] (default, and what the tests use) and [`SqliteStore`].
//! Every call may fail with [`CourierError::Store`]; callers treat that as
//! non-retriable on the hot path.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use courier_core::CourierResult;
#[cfg(test)]
use courier_core::CourierError;

pub type IdentityId = i64;
pub type ConversationId = i64;
pub type MessageId = i64;

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: IdentityId,
    pub login: String,
    /// Hex-encoded credential digest.
    pub credential_hash: String,
    /// Unix seconds.
    pub created_at: i64,
    pub online: bool,
}

/// The unordered pair of identities that exchange messages.
///
/// Stored normalised: `first < second` unless both are the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub first: IdentityId,
    pub second: IdentityId,
}

impl Conversation {
    /// Normalise a pair so lookups are order-independent.
    pub fn pair(a: IdentityId, b: IdentityId) -> (IdentityId, IdentityId) {
        if a <= b { (a, b) } else { (b, a) }
    }

    pub fn contains(&self, id: IdentityId) -> bool {
        self.first == id || self.second == id
    }

    /// The other participant.
    pub fn counterpart(&self, id: IdentityId) -> IdentityId {
        if self.first == id { self.second } else { self.first }
    }
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: IdentityId,
    pub body: String,
    /// Unix seconds.
    pub sent_at: i64,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Create an identity (offline). Fails if the login is taken.
    async fn create_identity(
        &self,
        login: &str,
        credential_hash: &str,
        created_at: i64,
    ) -> CourierResult<Identity>;

    async fn get_identity_by_login(&self, login: &str) -> CourierResult<Option<Identity>>;

    async fn get_identity_by_id(&self, id: IdentityId) -> CourierResult<Option<Identity>>;

    async fn set_online(&self, id: IdentityId, online: bool) -> CourierResult<()>;

    /// Fetch the conversation between two identities, creating it on first
    /// contact. Idempotent for either argument order.
    async fn get_or_create_conversation(
        &self,
        a: IdentityId,
        b: IdentityId,
    ) -> CourierResult<Conversation>;

    async fn get_conversation(&self, id: ConversationId) -> CourierResult<Option<Conversation>>;

    async fn append_message(
        &self,
        conversation_id: ConversationId,
        sender_id: IdentityId,
        body: &str,
        sent_at: i64,
    ) -> CourierResult<StoredMessage>;

    /// Every message of every conversation containing `id`, ordered by
    /// `(sent_at, id)` ascending.
    async fn list_messages_for_identity(&self, id: IdentityId)
        -> CourierResult<Vec<StoredMessage>>;

    /// Mark every identity offline. Run once at startup, before any
    /// connection is accepted, to clear flags left by a crash. Returns how
    /// many identities were flipped.
    async fn reset_presence(&self) -> CourierResult<u64>;

    async fn close(&self) -> CourierResult<()>;
}

/// A store whose every call fails, for exercising error paths.
#[cfg(test)]
pub struct UnavailableStore;

#[cfg(test)]
#[async_trait]
impl Store for UnavailableStore {
    async fn create_identity(&self, _: &str, _: &str, _: i64) -> CourierResult<Identity> {
        Err(CourierError::Store("unavailable".into()))
    }
    async fn get_identity_by_login(&self, _: &str) -> CourierResult<Option<Identity>> {
        Err(CourierError::Store("unavailable".into()))
    }
    async fn get_identity_by_id(&self, _: IdentityId) -> CourierResult<Option<Identity>> {
        Err(CourierError::Store("unavailable".into()))
    }
    async fn set_online(&self, _: IdentityId, _: bool) -> CourierResult<()> {
        Err(CourierError::Store("unavailable".into()))
    }
    async fn get_or_create_conversation(
        &self,
        _: IdentityId,
        _: IdentityId,
    ) -> CourierResult<Conversation> {
        Err(CourierError::Store("unavailable".into()))
    }
    async fn get_conversation(&self, _: ConversationId) -> CourierResult<Option<Conversation>> {
        Err(CourierError::Store("unavailable".into()))
    }
    async fn append_message(
        &self,
        _: ConversationId,
        _: IdentityId,
        _: &str,
        _: i64,
    ) -> CourierResult<StoredMessage> {
        Err(CourierError::Store("unavailable".into()))
    }
    async fn list_messages_for_identity(&self, _: IdentityId) -> CourierResult<Vec<StoredMessage>> {
        Err(CourierError::Store("unavailable".into()))
    }
    async fn reset_presence(&self) -> CourierResult<u64> {
        Err(CourierError::Store("unavailable".into()))
    }
    async fn close(&self) -> CourierResult<()> {
        Ok(())
    }
}
