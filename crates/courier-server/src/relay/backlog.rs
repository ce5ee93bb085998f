//! Backlog replay for returning identities.
//!
//! Runs inside the connection worker right after a returning handshake and
//! before any live traffic is written, so history always precedes new
//! messages on the wire.

use crate::store::{Conversation, ConversationId, Identity, IdentityId, MessageId, Store};
use crate::transport::RecordWriter;
use courier_core::{CourierError, CourierResult, MessageRecord};
use std::collections::HashMap;
use tokio::io::AsyncWrite;
use tracing::{debug, info};

/// Collect `identity`'s history as historical records, oldest first,
/// paired with their persisted ids.
pub async fn build_backlog(
    store: &dyn Store,
    identity: &Identity,
) -> CourierResult<Vec<(MessageId, MessageRecord)>> {
    let messages = store.list_messages_for_identity(identity.id).await?;

    let mut conversations: HashMap<ConversationId, Conversation> = HashMap::new();
    let mut logins: HashMap<IdentityId, String> = HashMap::new();
    logins.insert(identity.id, identity.login.clone());

    let mut backlog = Vec::with_capacity(messages.len());
    for message in messages {
        let conversation = match conversations.get(&message.conversation_id) {
            Some(c) => *c,
            None => {
                let c = store
                    .get_conversation(message.conversation_id)
                    .await?
                    .ok_or_else(|| {
                        CourierError::Store(format!(
                            "message {} references missing conversation {}",
                            message.id, message.conversation_id
                        ))
                    })?;
                conversations.insert(c.id, c);
                c
            }
        };
        let receiver_id = conversation.counterpart(message.sender_id);
        let sender = resolve_login(store, &mut logins, message.sender_id).await?;
        let receiver = resolve_login(store, &mut logins, receiver_id).await?;

        backlog.push((
            message.id,
            MessageRecord::historical(&sender, &receiver, &message.body, message.sent_at),
        ));
    }
    Ok(backlog)
}

async fn resolve_login(
    store: &dyn Store,
    cache: &mut HashMap<IdentityId, String>,
    id: IdentityId,
) -> CourierResult<String> {
    if let Some(login) = cache.get(&id) {
        return Ok(login.clone());
    }
    let identity = store
        .get_identity_by_id(id)
        .await?
        .ok_or_else(|| CourierError::Store(format!("missing identity {id}")))?;
    cache.insert(id, identity.login.clone());
    Ok(identity.login)
}

/// Write `identity`'s backlog to the connection.
///
/// Returns the highest message id written, which the live writer uses to
/// drop deliveries already covered by the replay.
pub async fn replay<W: AsyncWrite + Unpin>(
    store: &dyn Store,
    identity: &Identity,
    writer: &mut RecordWriter<W>,
) -> CourierResult<Option<MessageId>> {
    let backlog = build_backlog(store, identity).await?;
    let mut watermark = None;
    for (id, record) in &backlog {
        writer.send(record).await?;
        watermark = watermark.max(Some(*id));
    }
    if backlog.is_empty() {
        debug!(login = %identity.login, "no backlog");
    } else {
        info!(login = %identity.login, count = backlog.len(), "backlog replayed");
    }
    Ok(watermark)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, UnavailableStore};
    use crate::transport::RecordReader;
    use courier_core::MessageStatus;

    async fn seed(store: &MemoryStore) -> (Identity, Identity, Identity) {
        let alice = store.create_identity("alice", "a", 0).await.unwrap();
        let bob = store.create_identity("bob", "b", 0).await.unwrap();
        let carol = store.create_identity("carol", "c", 0).await.unwrap();
        let ab = store.get_or_create_conversation(alice.id, bob.id).await.unwrap();
        let ac = store.get_or_create_conversation(carol.id, alice.id).await.unwrap();
        store.append_message(ab.id, bob.id, "b1", 20).await.unwrap();
        store.append_message(ac.id, alice.id, "a->c", 15).await.unwrap();
        store.append_message(ab.id, alice.id, "a->b", 30).await.unwrap();
        store.append_message(ac.id, carol.id, "c1", 10).await.unwrap();
        (alice, bob, carol)
    }

    #[tokio::test]
    async fn merges_conversations_in_time_order() {
        let store = MemoryStore::new();
        let (alice, _, _) = seed(&store).await;

        let backlog = build_backlog(&store, &alice).await.unwrap();
        let view: Vec<(&str, &str, &str, i64)> = backlog
            .iter()
            .map(|(_, r)| {
                (
                    r.sender.as_str(),
                    r.receiver.as_str(),
                    r.text.as_str(),
                    r.timestamp,
                )
            })
            .collect();
        assert_eq!(
            view,
            vec![
                ("carol", "alice", "c1", 10),
                ("alice", "carol", "a->c", 15),
                ("bob", "alice", "b1", 20),
                ("alice", "bob", "a->b", 30),
            ]
        );
        assert!(backlog
            .iter()
            .all(|(_, r)| r.status == MessageStatus::Historical));
    }

    #[tokio::test]
    async fn replay_is_stable_across_reconnects() {
        let store = MemoryStore::new();
        let (_, bob, _) = seed(&store).await;
        let first = build_backlog(&store, &bob).await.unwrap();
        let second = build_backlog(&store, &bob).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn replay_writes_records_and_returns_watermark() {
        let store = MemoryStore::new();
        let (alice, _, _) = seed(&store).await;
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = RecordWriter::new(server);

        let watermark = replay(&store, &alice, &mut writer).await.unwrap();
        assert_eq!(watermark, Some(4));
        drop(writer);

        let mut reader = RecordReader::new(client, 4096);
        let mut texts = Vec::new();
        while let Some(rec) = reader.next_record::<MessageRecord>().await.unwrap() {
            texts.push(rec.text);
        }
        assert_eq!(texts, vec!["c1", "a->c", "b1", "a->b"]);
    }

    #[tokio::test]
    async fn empty_backlog_has_no_watermark() {
        let store = MemoryStore::new();
        let dave = store.create_identity("dave", "d", 0).await.unwrap();
        let (_client, server) = tokio::io::duplex(64);
        let mut writer = RecordWriter::new(server);
        assert_eq!(replay(&store, &dave, &mut writer).await.unwrap(), None);
    }

    #[tokio::test]
    async fn store_failure_aborts_replay() {
        let identity = Identity {
            id: 1,
            login: "alice".into(),
            credential_hash: String::new(),
            created_at: 0,
            online: true,
        };
        assert!(build_backlog(&UnavailableStore, &identity).await.is_err());
    }
}
