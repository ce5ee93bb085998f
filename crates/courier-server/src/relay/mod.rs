//! Routing of direct messages: bus publishing, the relay consumer and
//! backlog replay.

pub mod backlog;
pub mod consumer;

pub use backlog::replay;
pub use consumer::RelayConsumer;

use crate::bus::Bus;
use courier_core::{conversation_key, BusEnvelope, CourierResult, MessageRecord};

/// Publish an inbound message, keyed by its conversation.
pub async fn publish_message(
    bus: &dyn Bus,
    topic: &str,
    record: &MessageRecord,
) -> CourierResult<()> {
    let key = conversation_key(&record.sender, &record.receiver);
    let payload = serde_json::to_vec(&BusEnvelope::Message(record.clone()))?;
    bus.publish(topic, &key, payload).await
}
