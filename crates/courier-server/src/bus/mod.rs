//! Message bus collaborator: decouples ingestion (connection workers) from
//! routing (the relay consumer).
//!
//! The bus is assumed to be at-least-once and partitioned by key. Only an
//! in-process implementation ships here; an external broker plugs in behind
//! the same trait.

pub mod memory;

pub use memory::MemoryBus;

use async_trait::async_trait;
use courier_core::CourierResult;
use std::time::Duration;

/// A record as delivered by [`Bus::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    pub topic: String,
    /// Partition key; records with the same key keep their relative order.
    pub key: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> CourierResult<()>;

    /// Wait up to `timeout` for the next record. `Ok(None)` on timeout.
    async fn poll(&self, timeout: Duration) -> CourierResult<Option<BusRecord>>;

    async fn close(&self) -> CourierResult<()>;
}
