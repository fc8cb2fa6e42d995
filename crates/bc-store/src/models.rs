//! Rows as returned from the store, independent of `bc-envelope`'s wire
//! types so this crate can be reused by anything that just wants a durable
//! log (e.g. an offline inspection tool).

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub uuid: String,
    pub kind: String,
    pub content: String,
    pub timestamp: i64,
    pub from_magnet_link: String,
    pub ack_of_uuid: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub uuid: String,
    pub transport: String,
    pub received_at: i64,
    pub server: Option<String>,
    /// `received_at - message.timestamp`, stored verbatim — may be negative
    /// under clock skew, never clamped.
    pub latency_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerChannelPreference {
    pub identity: String,
    pub protocol: String,
    pub is_working: bool,
    pub last_ack_at: Option<i64>,
    pub avg_latency_ms: Option<i64>,
    pub preference_order: Option<i64>,
    pub cannot_use: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolAggregate {
    pub protocol: String,
    pub total_sent: i64,
    pub total_acked: i64,
    pub avg_latency_ms: Option<i64>,
    pub last_used_at: i64,
}
