//! Durable evidence store for `broadcast-dm`: messages, delivery receipts,
//! per-peer channel preferences, and per-protocol send/ack aggregates, all
//! backed by a single SQLite file opened in WAL mode.

mod error;
mod models;
mod retry;
mod schema;
mod store;

pub use error::{StoreError, StoreResult};
pub use models::{PeerChannelPreference, ProtocolAggregate, Receipt, StoredMessage};
pub use store::EvidenceStore;
