//! Table definitions and the one column migration this store has needed so
//! far.

use rusqlite::Connection;

use crate::error::StoreResult;

pub fn init(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS messages (
            uuid              TEXT PRIMARY KEY,
            kind              TEXT NOT NULL,
            content           TEXT NOT NULL,
            timestamp         INTEGER NOT NULL,
            from_magnet_link  TEXT NOT NULL,
            ack_of_uuid       TEXT,
            stored_at         INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_ack_of_uuid
            ON messages(ack_of_uuid) WHERE ack_of_uuid IS NOT NULL;

        CREATE TABLE IF NOT EXISTS receipts (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            uuid          TEXT NOT NULL,
            transport     TEXT NOT NULL,
            received_at   INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_receipts_uuid_received_at
            ON receipts(uuid, received_at);

        CREATE TABLE IF NOT EXISTS peer_channel_preferences (
            identity          TEXT NOT NULL,
            protocol          TEXT NOT NULL,
            is_working        INTEGER NOT NULL,
            last_ack_at       INTEGER,
            avg_latency_ms    INTEGER,
            preference_order  INTEGER,
            cannot_use        INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (identity, protocol)
        );

        CREATE TABLE IF NOT EXISTS protocol_aggregates (
            protocol        TEXT PRIMARY KEY,
            total_sent      INTEGER NOT NULL DEFAULT 0,
            total_acked     INTEGER NOT NULL DEFAULT 0,
            avg_latency_ms  INTEGER,
            last_used_at    INTEGER NOT NULL
        );
        "#,
    )?;

    migrate_receipts_server_column(conn)?;
    migrate_receipts_latency_column(conn)?;
    Ok(())
}

/// `receipts` originally had no notion of which concrete broker/relay
/// endpoint serviced a receipt. Detect its absence and add it in place
/// rather than forcing a destructive rebuild — read what's there, upgrade
/// in place, never silently discard.
fn migrate_receipts_server_column(conn: &Connection) -> StoreResult<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(receipts)")?;
    let has_server = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(Result::ok)
        .any(|name| name == "server");
    drop(stmt);

    if !has_server {
        conn.execute("ALTER TABLE receipts ADD COLUMN server TEXT", [])?;
        tracing::info!("migrated receipts table: added server column");
    }
    Ok(())
}

/// `receipts` originally had no per-receipt latency figure, only the
/// peer-preference aggregate derived one. Detect-and-add, same as the
/// `server` column above.
fn migrate_receipts_latency_column(conn: &Connection) -> StoreResult<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(receipts)")?;
    let has_latency = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(Result::ok)
        .any(|name| name == "latency_ms");
    drop(stmt);

    if !has_latency {
        conn.execute("ALTER TABLE receipts ADD COLUMN latency_ms INTEGER NOT NULL DEFAULT 0", [])?;
        tracing::info!("migrated receipts table: added latency_ms column");
    }
    Ok(())
}
