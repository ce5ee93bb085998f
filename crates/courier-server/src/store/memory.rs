//! In-process store backend.

use super::{Conversation, ConversationId, Identity, IdentityId, MessageId, Store, StoredMessage};
use async_trait::async_trait;
use courier_core::{CourierError, CourierResult};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Default)]
struct Inner {
    identities: HashMap<IdentityId, Identity>,
    by_login: HashMap<String, IdentityId>,
    conversations: HashMap<ConversationId, Conversation>,
    by_pair: HashMap<(IdentityId, IdentityId), ConversationId>,
    messages: Vec<StoredMessage>,
    next_identity: IdentityId,
    next_conversation: ConversationId,
    next_message: MessageId,
}

/// Store that keeps everything in memory for the lifetime of the process.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_identity(
        &self,
        login: &str,
        credential_hash: &str,
        created_at: i64,
    ) -> CourierResult<Identity> {
        let mut inner = self.inner.write().await;
        if inner.by_login.contains_key(login) {
            return Err(CourierError::Store(format!("login already exists: {login}")));
        }
        inner.next_identity += 1;
        let identity = Identity {
            id: inner.next_identity,
            login: login.to_string(),
            credential_hash: credential_hash.to_string(),
            created_at,
            online: false,
        };
        inner.by_login.insert(identity.login.clone(), identity.id);
        inner.identities.insert(identity.id, identity.clone());
        Ok(identity)
    }

    async fn get_identity_by_login(&self, login: &str) -> CourierResult<Option<Identity>> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_login
            .get(login)
            .and_then(|id| inner.identities.get(id))
            .cloned())
    }

    async fn get_identity_by_id(&self, id: IdentityId) -> CourierResult<Option<Identity>> {
        Ok(self.inner.read().await.identities.get(&id).cloned())
    }

    async fn set_online(&self, id: IdentityId, online: bool) -> CourierResult<()> {
        let mut inner = self.inner.write().await;
        let identity = inner
            .identities
            .get_mut(&id)
            .ok_or_else(|| CourierError::Store(format!("no identity with id {id}")))?;
        identity.online = online;
        Ok(())
    }

    async fn get_or_create_conversation(
        &self,
        a: IdentityId,
        b: IdentityId,
    ) -> CourierResult<Conversation> {
        let pair = Conversation::pair(a, b);
        let mut inner = self.inner.write().await;
        if let Some(id) = inner.by_pair.get(&pair) {
            return Ok(inner.conversations[id]);
        }
        for id in [a, b] {
            if !inner.identities.contains_key(&id) {
                return Err(CourierError::Store(format!("no identity with id {id}")));
            }
        }
        inner.next_conversation += 1;
        let conversation = Conversation {
            id: inner.next_conversation,
            first: pair.0,
            second: pair.1,
        };
        inner.by_pair.insert(pair, conversation.id);
        inner.conversations.insert(conversation.id, conversation);
        debug!(conversation_id = conversation.id, first = pair.0, second = pair.1, "conversation created");
        Ok(conversation)
    }

    async fn get_conversation(&self, id: ConversationId) -> CourierResult<Option<Conversation>> {
        Ok(self.inner.read().await.conversations.get(&id).copied())
    }

    async fn append_message(
        &self,
        conversation_id: ConversationId,
        sender_id: IdentityId,
        body: &str,
        sent_at: i64,
    ) -> CourierResult<StoredMessage> {
        let mut inner = self.inner.write().await;
        let conversation = inner
            .conversations
            .get(&conversation_id)
            .ok_or_else(|| CourierError::Store(format!("no conversation with id {conversation_id}")))?;
        if !conversation.contains(sender_id) {
            return Err(CourierError::Store(format!(
                "identity {sender_id} is not part of conversation {conversation_id}"
            )));
        }
        inner.next_message += 1;
        let message = StoredMessage {
            id: inner.next_message,
            conversation_id,
            sender_id,
            body: body.to_string(),
            sent_at,
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn list_messages_for_identity(
        &self,
        id: IdentityId,
    ) -> CourierResult<Vec<StoredMessage>> {
        let inner = self.inner.read().await;
        let mut messages: Vec<StoredMessage> = inner
            .messages
            .iter()
            .filter(|m| {
                inner
                    .conversations
                    .get(&m.conversation_id)
                    .is_some_and(|c| c.contains(id))
            })
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.sent_at, m.id));
        Ok(messages)
    }

    async fn reset_presence(&self) -> CourierResult<u64> {
        let mut inner = self.inner.write().await;
        let mut flipped = 0;
        for identity in inner.identities.values_mut().filter(|i| i.online) {
            identity.online = false;
            flipped += 1;
        }
        Ok(flipped)
    }

    async fn close(&self) -> CourierResult<()> {
        debug!("memory store closed");
        Ok(())
    }
}
