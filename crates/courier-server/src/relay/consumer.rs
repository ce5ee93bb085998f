//! Relay consumer: the single loop that turns bus records into persisted
//! messages and live deliveries.
//!
//! Per record:
//! 1. resolve the recipient; unknown recipients get an error notice sent
//!    back to the sender (if reachable) and nothing is persisted
//! 2. resolve the sender, get-or-create the conversation, persist
//! 3. deliver to the recipient and echo to the sender, best effort
//!
//! Persistence never depends on delivery. Store errors skip the record.

use crate::bus::Bus;
use crate::server::shutdown_requested;
use crate::session::{Delivery, Outbound, SessionTable};
use crate::store::{MessageId, Store};
use courier_core::{BusEnvelope, CourierResult, MessageRecord};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Pause after a failed poll so a broken bus does not spin the loop.
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// What happened to one bus record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Persisted; live delivery results for both ends.
    Relayed {
        message_id: MessageId,
        recipient: Delivery,
        echo: Delivery,
    },
    /// Recipient does not exist; `notified` tells whether the sender got the
    /// error notice.
    RecipientUnknown { notified: bool },
    /// Undecodable payload, unknown sender or store failure.
    Dropped(String),
}

pub struct RelayConsumer {
    store: Arc<dyn Store>,
    bus: Arc<dyn Bus>,
    sessions: Arc<SessionTable>,
    poll_timeout: Duration,
}

impl RelayConsumer {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn Bus>,
        sessions: Arc<SessionTable>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            store,
            bus,
            sessions,
            poll_timeout,
        }
    }

    /// Consume until shutdown. The record in hand is always finished before
    /// the loop exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("relay consumer started");
        loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                polled = self.bus.poll(self.poll_timeout) => polled,
            };

            match polled {
                Ok(Some(record)) => {
                    let outcome = self.handle_payload(&record.payload).await;
                    debug!(key = %record.key, ?outcome, "relay record processed");
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "bus poll failed");
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                }
            }
        }
        info!("relay consumer stopped");
    }

    /// Decode and process one bus payload.
    pub async fn handle_payload(&self, payload: &[u8]) -> RelayOutcome {
        match serde_json::from_slice::<BusEnvelope>(payload) {
            Ok(BusEnvelope::Message(record)) => self.handle_message(record).await,
            Err(e) => {
                warn!(error = %e, "undecodable bus record skipped");
                RelayOutcome::Dropped(format!("undecodable: {e}"))
            }
        }
    }

    pub async fn handle_message(&self, record: MessageRecord) -> RelayOutcome {
        match self.route(record).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "relay record skipped");
                RelayOutcome::Dropped(e.to_string())
            }
        }
    }

    async fn route(&self, record: MessageRecord) -> CourierResult<RelayOutcome> {
        let Some(receiver) = self.store.get_identity_by_login(&record.receiver).await? else {
            info!(sender = %record.sender, receiver = %record.receiver, "recipient unknown");
            let notice = MessageRecord::recipient_unknown(&record);
            let delivery = self
                .sessions
                .deliver(&record.sender, Outbound::notice(notice))
                .await;
            log_failed(&record.sender, &delivery);
            return Ok(RelayOutcome::RecipientUnknown {
                notified: delivery == Delivery::Delivered,
            });
        };

        let Some(sender) = self.store.get_identity_by_login(&record.sender).await? else {
            warn!(sender = %record.sender, "sender unknown, record dropped");
            return Ok(RelayOutcome::Dropped(format!("unknown sender {}", record.sender)));
        };

        let conversation = self
            .store
            .get_or_create_conversation(sender.id, receiver.id)
            .await?;
        let stored = self
            .store
            .append_message(conversation.id, sender.id, &record.text, record.timestamp)
            .await?;
        debug!(
            message_id = stored.id,
            conversation_id = conversation.id,
            "message persisted"
        );

        let outbound = Outbound::message(record, stored.id);
        let recipient = self
            .sessions
            .deliver(&receiver.login, outbound.clone())
            .await;
        log_failed(&receiver.login, &recipient);

        // A note to self is delivered once.
        let echo = if sender.id == receiver.id {
            recipient.clone()
        } else {
            let echo = self.sessions.deliver(&sender.login, outbound).await;
            log_failed(&sender.login, &echo);
            echo
        };

        info!(
            sender = %sender.login,
            receiver = %receiver.login,
            message_id = stored.id,
            live = recipient == Delivery::Delivered,
            "message relayed"
        );

        Ok(RelayOutcome::Relayed {
            message_id: stored.id,
            recipient,
            echo,
        })
    }
}

fn log_failed(login: &str, delivery: &Delivery) {
    if let Delivery::Failed(reason) = delivery {
        warn!(login, reason = %reason, "live delivery failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::relay::publish_message;
    use crate::session::SessionHandle;
    use crate::store::{MemoryStore, UnavailableStore};
    use courier_core::MessageStatus;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<MemoryStore>,
        bus: Arc<MemoryBus>,
        sessions: Arc<SessionTable>,
        consumer: RelayConsumer,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new("msgTopic"));
        let sessions = Arc::new(SessionTable::new());
        let consumer = RelayConsumer::new(
            store.clone(),
            bus.clone(),
            sessions.clone(),
            Duration::from_millis(20),
        );
        Fixture {
            store,
            bus,
            sessions,
            consumer,
        }
    }

    async fn connect(f: &Fixture, login: &str) -> mpsc::Receiver<Outbound> {
        let id = match f.store.get_identity_by_login(login).await.unwrap() {
            Some(identity) => identity.id,
            None => f.store.create_identity(login, "h", 0).await.unwrap().id,
        };
        let (tx, rx) = mpsc::channel(8);
        f.sessions
            .register(SessionHandle::new(login, id, tx))
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn live_recipient_gets_message_and_sender_gets_echo() {
        let f = fixture();
        let mut alice = connect(&f, "alice").await;
        let mut bob = connect(&f, "bob").await;

        let rec = MessageRecord::new("alice", "bob", "hi", 100);
        let outcome = f.consumer.handle_message(rec.clone()).await;
        let RelayOutcome::Relayed {
            message_id,
            recipient,
            echo,
        } = outcome
        else {
            panic!("expected relayed, got {outcome:?}");
        };
        assert_eq!(recipient, Delivery::Delivered);
        assert_eq!(echo, Delivery::Delivered);

        let to_bob = bob.recv().await.unwrap();
        assert_eq!(to_bob.record, rec);
        assert_eq!(to_bob.message_id, Some(message_id));
        assert_eq!(alice.recv().await.unwrap().record, rec);
    }

    #[tokio::test]
    async fn offline_recipient_is_persisted_only() {
        let f = fixture();
        let _alice = connect(&f, "alice").await;
        let bob = f.store.create_identity("bob", "h", 0).await.unwrap();

        let outcome = f
            .consumer
            .handle_message(MessageRecord::new("alice", "bob", "hi", 100))
            .await;
        assert!(matches!(
            outcome,
            RelayOutcome::Relayed {
                recipient: Delivery::Offline,
                echo: Delivery::Delivered,
                ..
            }
        ));

        let stored = f.store.list_messages_for_identity(bob.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].body, "hi");
        assert_eq!(stored[0].sent_at, 100);
    }

    #[tokio::test]
    async fn unknown_recipient_notifies_sender_only() {
        let f = fixture();
        let mut alice = connect(&f, "alice").await;
        let alice_id = f.store.get_identity_by_login("alice").await.unwrap().unwrap().id;

        let outcome = f
            .consumer
            .handle_message(MessageRecord::new("alice", "ghost", "anyone?", 5))
            .await;
        assert_eq!(outcome, RelayOutcome::RecipientUnknown { notified: true });

        let notice = alice.recv().await.unwrap();
        assert_eq!(notice.record.status, MessageStatus::RecipientUnknown);
        assert_eq!(notice.record.receiver, "ghost");
        assert_eq!(notice.message_id, None);
        assert!(f
            .store
            .list_messages_for_identity(alice_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unknown_recipient_with_offline_sender_is_dropped_silently() {
        let f = fixture();
        f.store.create_identity("alice", "h", 0).await.unwrap();
        let outcome = f
            .consumer
            .handle_message(MessageRecord::new("alice", "ghost", "x", 5))
            .await;
        assert_eq!(outcome, RelayOutcome::RecipientUnknown { notified: false });
    }

    #[tokio::test]
    async fn note_to_self_is_delivered_once() {
        let f = fixture();
        let mut alice = connect(&f, "alice").await;
        f.consumer
            .handle_message(MessageRecord::new("alice", "alice", "memo", 1))
            .await;
        assert_eq!(alice.recv().await.unwrap().record.text, "memo");
        assert!(alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn store_failure_skips_record() {
        let sessions = Arc::new(SessionTable::new());
        let consumer = RelayConsumer::new(
            Arc::new(UnavailableStore),
            Arc::new(MemoryBus::new("t")),
            sessions,
            Duration::from_millis(10),
        );
        let outcome = consumer
            .handle_message(MessageRecord::new("alice", "bob", "x", 1))
            .await;
        assert!(matches!(outcome, RelayOutcome::Dropped(_)));
    }

    #[tokio::test]
    async fn garbage_payload_is_dropped() {
        let f = fixture();
        let outcome = f.consumer.handle_payload(b"{\"nope\":true}").await;
        assert!(matches!(outcome, RelayOutcome::Dropped(_)));
    }

    #[tokio::test]
    async fn run_loop_consumes_bus_until_shutdown() {
        let f = fixture();
        let mut bob = connect(&f, "bob").await;
        f.store.create_identity("alice", "h", 0).await.unwrap();

        for text in ["one", "two", "three"] {
            publish_message(
                f.bus.as_ref(),
                "msgTopic",
                &MessageRecord::new("alice", "bob", text, 1),
            )
            .await
            .unwrap();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let Fixture { consumer, .. } = f;
        let task = tokio::spawn(consumer.run(shutdown_rx));

        for text in ["one", "two", "three"] {
            assert_eq!(bob.recv().await.unwrap().record.text, text);
        }
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
