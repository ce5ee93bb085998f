//! Presence: the table of live sessions, one per identity.

pub mod table;

pub use table::{Delivery, Outbound, OutboundTx, SessionHandle, SessionTable};
