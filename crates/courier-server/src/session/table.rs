//! Session table: which identities are reachable right now.
//!
//! Maps a login to the outbound channel of its single live connection.
//! Entries are spread over a fixed number of shards keyed by a hash of the
//! login, so unrelated identities never contend for the same lock while
//! `register` stays an atomic check-and-insert per identity.

use crate::store::{IdentityId, MessageId};
use courier_core::{CourierError, CourierResult, MessageRecord};
use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Number of lock shards.
const SHARD_COUNT: usize = 16;

/// A record queued for a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub record: MessageRecord,
    /// Persisted id, when the record is a stored message. Used by the
    /// connection writer to skip messages already sent during backlog replay.
    pub message_id: Option<MessageId>,
}

impl Outbound {
    pub fn message(record: MessageRecord, message_id: MessageId) -> Self {
        Self {
            record,
            message_id: Some(message_id),
        }
    }

    /// A record that was never persisted (error notices).
    pub fn notice(record: MessageRecord) -> Self {
        Self {
            record,
            message_id: None,
        }
    }
}

pub type OutboundTx = mpsc::Sender<Outbound>;

/// A live session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    /// Random per-connection id, for logs.
    pub session_id: String,
    pub login: String,
    pub identity_id: IdentityId,
    pub tx: OutboundTx,
    pub connected_at: Instant,
}

impl SessionHandle {
    pub fn new(login: &str, identity_id: IdentityId, tx: OutboundTx) -> Self {
        Self {
            session_id: generate_session_id(),
            login: login.to_string(),
            identity_id,
            tx,
            connected_at: Instant::now(),
        }
    }
}

/// Result of a best-effort live delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No session for the login.
    Offline,
    /// Session exists but its queue is full or closed.
    Failed(String),
}

/// Concurrency-safe login → session map.
pub struct SessionTable {
    shards: Vec<RwLock<HashMap<String, SessionHandle>>>,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, login: &str) -> &RwLock<HashMap<String, SessionHandle>> {
        let mut hasher = DefaultHasher::new();
        login.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Insert a session unless the login already has one.
    pub async fn register(&self, handle: SessionHandle) -> CourierResult<()> {
        let mut shard = self.shard(&handle.login).write().await;
        match shard.entry(handle.login.clone()) {
            Entry::Occupied(existing) => Err(CourierError::AlreadyOnline(format!(
                "{} (session {})",
                existing.key(),
                existing.get().session_id
            ))),
            Entry::Vacant(slot) => {
                info!(login = %handle.login, session_id = %handle.session_id, "session registered");
                slot.insert(handle);
                Ok(())
            }
        }
    }

    pub async fn lookup(&self, login: &str) -> Option<SessionHandle> {
        self.shard(login).read().await.get(login).cloned()
    }

    /// Remove the session for `login`. No-op if absent.
    pub async fn unregister(&self, login: &str) -> Option<SessionHandle> {
        let removed = self.shard(login).write().await.remove(login);
        if let Some(ref handle) = removed {
            debug!(login, session_id = %handle.session_id, "session unregistered");
        }
        removed
    }

    pub async fn is_online(&self, login: &str) -> bool {
        self.shard(login).read().await.contains_key(login)
    }

    /// Queue a record for `login` without waiting on a slow reader.
    pub async fn deliver(&self, login: &str, outbound: Outbound) -> Delivery {
        let Some(handle) = self.lookup(login).await else {
            return Delivery::Offline;
        };
        match handle.tx.try_send(outbound) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                Delivery::Failed(format!("outbound queue full for {login}"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Delivery::Failed(format!("connection for {login} is closing"))
            }
        }
    }

    /// Number of live sessions.
    pub async fn count(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().await.len();
        }
        total
    }
}

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
