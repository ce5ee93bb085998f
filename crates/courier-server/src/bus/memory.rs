//! In-process bus: a single FIFO queue for one topic.

use super::{Bus, BusRecord};
use async_trait::async_trait;
use courier_core::{CourierError, CourierResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// Bus for a single topic, backed by an unbounded channel. Ordering is
/// total, which is stronger than the per-key ordering the relay needs.
pub struct MemoryBus {
    topic: String,
    tx: mpsc::UnboundedSender<BusRecord>,
    rx: Mutex<mpsc::UnboundedReceiver<BusRecord>>,
    closed: AtomicBool,
}

impl MemoryBus {
    pub fn new(topic: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            topic: topic.to_string(),
            tx,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> CourierResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CourierError::Bus("bus closed".into()));
        }
        if topic != self.topic {
            return Err(CourierError::Bus(format!("unknown topic: {topic}")));
        }
        let record = BusRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
        };
        self.tx
            .send(record)
            .map_err(|_| CourierError::Bus("bus receiver dropped".into()))?;
        debug!(topic, key, "published");
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> CourierResult<Option<BusRecord>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CourierError::Bus("bus closed".into()));
        }
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(record)) => Ok(Some(record)),
            Ok(None) => Err(CourierError::Bus("bus channel closed".into())),
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) -> CourierResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(topic = %self.topic, "bus closed");
        }
        Ok(())
    }
}
