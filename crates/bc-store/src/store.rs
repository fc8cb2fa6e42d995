use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreResult;
use crate::models::{PeerChannelPreference, ProtocolAggregate, Receipt, StoredMessage};
use crate::retry::with_retry;
use crate::schema;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// The durable evidence log: messages, delivery receipts, per-peer channel
/// preferences, and per-protocol aggregates. Single-writer by design — one
/// `Mutex<Connection>` is the serialization point every mutation goes
/// through, not a connection pool.
pub struct EvidenceStore {
    conn: Mutex<Connection>,
}

impl EvidenceStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        schema::init(&conn)?;
        Ok(EvidenceStore {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        schema::init(&conn)?;
        Ok(EvidenceStore {
            conn: Mutex::new(conn),
        })
    }

    /// Insert-or-ignore on `uuid` — saving the same message twice is a no-op
    /// the second time.
    pub fn save_message(&self, msg: &StoredMessage) -> StoreResult<()> {
        let conn = self.conn.lock().expect("evidence store mutex poisoned");
        with_retry(|| {
            conn.execute(
                "INSERT OR IGNORE INTO messages
                     (uuid, kind, content, timestamp, from_magnet_link, ack_of_uuid)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    msg.uuid,
                    msg.kind,
                    msg.content,
                    msg.timestamp,
                    msg.from_magnet_link,
                    msg.ack_of_uuid,
                ],
            )
        })?;
        Ok(())
    }

    /// Always appends — a message may legitimately arrive over several
    /// transports, each producing its own receipt.
    pub fn save_receipt(&self, receipt: &Receipt) -> StoreResult<()> {
        let conn = self.conn.lock().expect("evidence store mutex poisoned");
        with_retry(|| {
            conn.execute(
                "INSERT INTO receipts (uuid, transport, received_at, server, latency_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![receipt.uuid, receipt.transport, receipt.received_at, receipt.server, receipt.latency_ms],
            )
        })?;
        Ok(())
    }

    /// Whether a message with this uuid has already been persisted — lets a
    /// caller tell an ordinary acknowledgment apart from an orphan one.
    pub fn message_exists(&self, uuid: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().expect("evidence store mutex poisoned");
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM messages WHERE uuid = ?1", params![uuid], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Upsert keyed on `(identity, protocol)`. `preference_order` is
    /// coalesced: a `None` here preserves whatever was already stored.
    pub fn update_peer_preference(
        &self,
        identity: &str,
        protocol: &str,
        is_working: bool,
        last_ack_at: Option<i64>,
        avg_latency_ms: Option<i64>,
        preference_order: Option<i64>,
        cannot_use: bool,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().expect("evidence store mutex poisoned");
        with_retry(|| {
            conn.execute(
                "INSERT INTO peer_channel_preferences
                     (identity, protocol, is_working, last_ack_at, avg_latency_ms,
                      preference_order, cannot_use)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(identity, protocol) DO UPDATE SET
                     is_working       = excluded.is_working,
                     last_ack_at      = COALESCE(excluded.last_ack_at, peer_channel_preferences.last_ack_at),
                     avg_latency_ms   = COALESCE(excluded.avg_latency_ms, peer_channel_preferences.avg_latency_ms),
                     preference_order = COALESCE(excluded.preference_order, peer_channel_preferences.preference_order),
                     cannot_use       = excluded.cannot_use",
                params![
                    identity,
                    protocol,
                    is_working as i64,
                    last_ack_at,
                    avg_latency_ms,
                    preference_order,
                    cannot_use as i64,
                ],
            )
        })?;
        Ok(())
    }

    /// Increments `total_sent` by 1 and `total_acked` by `acked as i64`.
    /// `avg_latency_ms` follows the exponential-recency rule: if there is no
    /// prior value, adopt `latency_ms` as-is; otherwise the new value is
    /// `(prior + latency_ms) / 2`, floored. This is a deliberate design
    /// choice — it is not a true running mean, it's a recency-weighted
    /// estimator that forgets history geometrically.
    pub fn update_protocol_aggregate(
        &self,
        protocol: &str,
        acked: bool,
        latency_ms: Option<i64>,
        now: i64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().expect("evidence store mutex poisoned");
        with_retry(|| {
            let prior_avg: Option<Option<i64>> = conn
                .query_row(
                    "SELECT avg_latency_ms FROM protocol_aggregates WHERE protocol = ?1",
                    params![protocol],
                    |row| row.get(0),
                )
                .optional()?;

            let new_avg = match (prior_avg.flatten(), latency_ms) {
                (Some(prior), Some(new)) => Some((prior + new) / 2),
                (None, Some(new)) => Some(new),
                (prior, None) => prior,
            };

            conn.execute(
                "INSERT INTO protocol_aggregates
                     (protocol, total_sent, total_acked, avg_latency_ms, last_used_at)
                 VALUES (?1, 1, ?2, ?3, ?4)
                 ON CONFLICT(protocol) DO UPDATE SET
                     total_sent     = total_sent + 1,
                     total_acked    = total_acked + ?2,
                     avg_latency_ms = ?3,
                     last_used_at   = ?4",
                params![protocol, acked as i64, new_avg, now],
            )
        })?;
        Ok(())
    }

    /// Explicit bounded listing, newest first. Resolves the ambiguity
    /// around an all-empty-string "get everything" query by never
    /// implementing one — callers ask for this directly.
    pub fn list_all_messages(&self, limit: u32) -> StoreResult<Vec<StoredMessage>> {
        let conn = self.conn.lock().expect("evidence store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT uuid, kind, content, timestamp, from_magnet_link, ack_of_uuid
             FROM messages ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(StoredMessage {
                    uuid: row.get(0)?,
                    kind: row.get(1)?,
                    content: row.get(2)?,
                    timestamp: row.get(3)?,
                    from_magnet_link: row.get(4)?,
                    ack_of_uuid: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn receipts_for(&self, uuid: &str) -> StoreResult<Vec<Receipt>> {
        let conn = self.conn.lock().expect("evidence store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT uuid, transport, received_at, server, latency_ms FROM receipts
             WHERE uuid = ?1 ORDER BY received_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![uuid], |row| {
                Ok(Receipt {
                    uuid: row.get(0)?,
                    transport: row.get(1)?,
                    received_at: row.get(2)?,
                    server: row.get(3)?,
                    latency_ms: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn peer_preference(
        &self,
        identity: &str,
        protocol: &str,
    ) -> StoreResult<Option<PeerChannelPreference>> {
        let conn = self.conn.lock().expect("evidence store mutex poisoned");
        conn.query_row(
            "SELECT identity, protocol, is_working, last_ack_at, avg_latency_ms,
                    preference_order, cannot_use
             FROM peer_channel_preferences WHERE identity = ?1 AND protocol = ?2",
            params![identity, protocol],
            |row| {
                Ok(PeerChannelPreference {
                    identity: row.get(0)?,
                    protocol: row.get(1)?,
                    is_working: row.get::<_, i64>(2)? != 0,
                    last_ack_at: row.get(3)?,
                    avg_latency_ms: row.get(4)?,
                    preference_order: row.get(5)?,
                    cannot_use: row.get::<_, i64>(6)? != 0,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn protocol_aggregate(&self, protocol: &str) -> StoreResult<Option<ProtocolAggregate>> {
        let conn = self.conn.lock().expect("evidence store mutex poisoned");
        conn.query_row(
            "SELECT protocol, total_sent, total_acked, avg_latency_ms, last_used_at
             FROM protocol_aggregates WHERE protocol = ?1",
            params![protocol],
            |row| {
                Ok(ProtocolAggregate {
                    protocol: row.get(0)?,
                    total_sent: row.get(1)?,
                    total_acked: row.get(2)?,
                    avg_latency_ms: row.get(3)?,
                    last_used_at: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn msg(uuid: &str) -> StoredMessage {
        StoredMessage {
            uuid: uuid.to_string(),
            kind: "message".to_string(),
            content: "hi".to_string(),
            timestamp: 1_000,
            from_magnet_link: "magnet:?x".to_string(),
            ack_of_uuid: None,
        }
    }

    #[test]
    fn save_message_is_idempotent_on_uuid() {
        let store = EvidenceStore::open_in_memory().unwrap();
        store.save_message(&msg("u1")).unwrap();
        store.save_message(&msg("u1")).unwrap();
        assert_eq!(store.list_all_messages(10).unwrap().len(), 1);
    }

    #[test]
    fn save_receipt_always_appends() {
        let store = EvidenceStore::open_in_memory().unwrap();
        store.save_message(&msg("u1")).unwrap();
        for transport in ["xmtp", "nostr", "mqtt"] {
            store
                .save_receipt(&Receipt {
                    uuid: "u1".into(),
                    transport: transport.into(),
                    received_at: 1_000,
                    server: None,
                    latency_ms: 0,
                })
                .unwrap();
        }
        assert_eq!(store.receipts_for("u1").unwrap().len(), 3);
    }

    #[test]
    fn save_receipt_stores_latency_verbatim() {
        let store = EvidenceStore::open_in_memory().unwrap();
        store.save_message(&msg("u1")).unwrap();
        store
            .save_receipt(&Receipt {
                uuid: "u1".into(),
                transport: "xmtp".into(),
                received_at: 1_500,
                server: None,
                latency_ms: 500,
            })
            .unwrap();
        let receipts = store.receipts_for("u1").unwrap();
        assert_eq!(receipts[0].latency_ms, 500);
    }

    #[test]
    fn message_exists_reflects_store_state() {
        let store = EvidenceStore::open_in_memory().unwrap();
        assert!(!store.message_exists("u1").unwrap());
        store.save_message(&msg("u1")).unwrap();
        assert!(store.message_exists("u1").unwrap());
    }

    #[test]
    fn handles_100_concurrent_save_message_calls_with_distinct_uuids() {
        let store = Arc::new(EvidenceStore::open_in_memory().unwrap());
        let handles: Vec<_> = (0..100)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.save_message(&msg(&format!("u{i}"))).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.list_all_messages(200).unwrap().len(), 100);
    }

    #[test]
    fn update_peer_preference_upserts_and_coalesces_order() {
        let store = EvidenceStore::open_in_memory().unwrap();
        store
            .update_peer_preference("alice", "nostr", true, Some(10), Some(50), Some(1), false)
            .unwrap();
        store
            .update_peer_preference("alice", "nostr", false, Some(20), Some(80), None, true)
            .unwrap();

        let pref = store.peer_preference("alice", "nostr").unwrap().unwrap();
        assert!(!pref.is_working);
        assert!(pref.cannot_use);
        assert_eq!(pref.preference_order, Some(1));
    }

    #[test]
    fn update_protocol_aggregate_follows_recency_rule_not_mean() {
        let store = EvidenceStore::open_in_memory().unwrap();
        store
            .update_protocol_aggregate("nostr", true, Some(100), 1_000)
            .unwrap();
        store
            .update_protocol_aggregate("nostr", true, Some(300), 2_000)
            .unwrap();

        let agg = store.protocol_aggregate("nostr").unwrap().unwrap();
        assert_eq!(agg.total_sent, 2);
        assert_eq!(agg.total_acked, 2);
        // (100 + 300) / 2 = 200, not a running mean over 2 samples (would
        // also be 200 here; the third call below is where they'd diverge).
        assert_eq!(agg.avg_latency_ms, Some(200));

        store
            .update_protocol_aggregate("nostr", false, Some(0), 3_000)
            .unwrap();
        let agg = store.protocol_aggregate("nostr").unwrap().unwrap();
        assert_eq!(agg.total_acked, 2);
        // (200 + 0) / 2 = 100 -- an arithmetic mean of all 3 samples would be ~133.
        assert_eq!(agg.avg_latency_ms, Some(100));
    }

    #[test]
    fn total_acked_never_exceeds_total_sent() {
        let store = EvidenceStore::open_in_memory().unwrap();
        store.update_protocol_aggregate("mqtt", false, None, 1).unwrap();
        store.update_protocol_aggregate("mqtt", false, None, 2).unwrap();
        let agg = store.protocol_aggregate("mqtt").unwrap().unwrap();
        assert!(agg.total_acked <= agg.total_sent);
    }

    #[test]
    fn list_all_messages_respects_limit_and_order() {
        let store = EvidenceStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .save_message(&StoredMessage {
                    uuid: format!("u{i}"),
                    kind: "message".into(),
                    content: "hi".into(),
                    timestamp: i,
                    from_magnet_link: "magnet:?x".into(),
                    ack_of_uuid: None,
                })
                .unwrap();
        }
        let page = store.list_all_messages(2).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].uuid, "u4");
        assert_eq!(page[1].uuid, "u3");
    }

    #[test]
    fn migration_adds_server_column_on_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evidence.sqlite3");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE receipts (id INTEGER PRIMARY KEY, uuid TEXT, transport TEXT, received_at INTEGER)",
            )
            .unwrap();
        }
        let store = EvidenceStore::open(&path).unwrap();
        store
            .save_receipt(&Receipt {
                uuid: "u1".into(),
                transport: "mqtt".into(),
                received_at: 1,
                server: Some("broker.example.com".into()),
                latency_ms: 1,
            })
            .unwrap();
        let receipts = store.receipts_for("u1").unwrap();
        assert_eq!(receipts[0].server.as_deref(), Some("broker.example.com"));
    }
}
