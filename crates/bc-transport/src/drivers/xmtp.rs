//! D1 — wallet-keyed DM.
//!
//! A real XMTP network client is not a fetchable, lightweight dependency.
//! This driver models the wallet-DM *contract* — a conversation keyed by
//! recipient address, and a process-local encrypted inbox that the same
//! identity reopens across restarts — using primitives already in the
//! stack. Cross-identity delivery, in lieu of the real XMTP network, goes
//! through an in-process mailbox hub: the hub hands the recipient driver the
//! plaintext payload, which it persists into its own at-rest-encrypted
//! local inbox and forwards to the registered handler, exactly as it would
//! after decrypting a real XMTP conversation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use rand::RngCore;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::error::{DriverInitError, TransportErrorKind};
use crate::transport::{InboundHandler, SendOutcome, Transport, TransportStatus};

type MailboxHub = Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>;

fn hub() -> &'static MailboxHub {
    static HUB: OnceLock<MailboxHub> = OnceLock::new();
    HUB.get_or_init(|| Mutex::new(HashMap::new()))
}

/// `sha256("xmtp-encryption-" || address || "-" || priv_key_hex)`. Reproduced
/// bit-for-bit: changing this orphans every user's prior inbox.
fn derive_inbox_key(address: &str, priv_key_hex: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"xmtp-encryption-");
    hasher.update(address.as_bytes());
    hasher.update(b"-");
    hasher.update(priv_key_hex.as_bytes());
    hasher.finalize().into()
}

struct Inner {
    own_address: String,
    priv_key_hex: String,
    db_path: PathBuf,
    handler: Mutex<Option<InboundHandler>>,
    recv_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

pub struct XmtpDriver(Arc<Inner>);

impl XmtpDriver {
    pub fn new(own_address: String, priv_key_hex: String, db_path: PathBuf) -> Self {
        XmtpDriver(Arc::new(Inner {
            own_address,
            priv_key_hex,
            db_path,
            handler: Mutex::new(None),
            recv_task: tokio::sync::Mutex::new(None),
        }))
    }
}

impl Inner {
    fn encrypt_row(&self, plaintext: &[u8]) -> Option<([u8; 12], Vec<u8>)> {
        let key_bytes = derive_inbox_key(&self.own_address, &self.priv_key_hex);
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        let cipher = Aes256Gcm::new(key);
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        match cipher.encrypt(nonce, plaintext) {
            Ok(ciphertext) => Some((nonce_bytes, ciphertext)),
            Err(e) => {
                tracing::warn!(error = %e, "xmtp: failed to encrypt inbox row, dropping from local store");
                None
            }
        }
    }

    fn persist_inbound(&self, sender_tag: &str, plaintext: &[u8]) {
        let Some((nonce, ciphertext)) = self.encrypt_row(plaintext) else {
            return;
        };
        match Connection::open(&self.db_path) {
            Ok(conn) => {
                if let Err(e) = conn.execute(
                    "INSERT INTO inbox (sender, nonce, ciphertext, received_at)
                     VALUES (?1, ?2, ?3, strftime('%s','now'))",
                    params![sender_tag, nonce.to_vec(), ciphertext],
                ) {
                    tracing::warn!(error = %e, "xmtp: failed to persist inbox row");
                }
            }
            Err(e) => tracing::warn!(error = %e, "xmtp: failed to open inbox for write"),
        }
    }
}

#[async_trait]
impl Transport for XmtpDriver {
    async fn init(&self) -> Result<(), DriverInitError> {
        let conn = Connection::open(&self.0.db_path)
            .map_err(|e| DriverInitError::Storage(anyhow::anyhow!(e), "xmtp"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS inbox (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 sender TEXT NOT NULL,
                 nonce BLOB NOT NULL,
                 ciphertext BLOB NOT NULL,
                 received_at INTEGER NOT NULL
             )",
        )
        .map_err(|e| DriverInitError::Storage(anyhow::anyhow!(e), "xmtp"))?;
        drop(conn);

        let (tx, mut rx) = mpsc::unbounded_channel();
        hub().lock().unwrap().insert(self.0.own_address.clone(), tx);

        let inner = Arc::clone(&self.0);
        let task = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                inner.persist_inbound("peer", &payload);
                let handler = inner.handler.lock().unwrap().take();
                if let Some(handler) = handler {
                    handler(payload, None);
                    *inner.handler.lock().unwrap() = Some(handler);
                }
            }
        });
        *self.0.recv_task.lock().await = Some(task);

        Ok(())
    }

    async fn send(&self, recipient_address: &str, payload: &[u8]) -> SendOutcome {
        let start = Instant::now();
        if recipient_address == self.0.own_address {
            return SendOutcome::failed(
                elapsed_ms(start),
                TransportErrorKind::SelfSend,
                "refusing to DM own address",
            );
        }
        let sender = { hub().lock().unwrap().get(recipient_address).cloned() };
        match sender {
            Some(tx) => match tx.send(payload.to_vec()) {
                Ok(()) => SendOutcome::ok(elapsed_ms(start), "delivered to recipient inbox"),
                Err(_) => SendOutcome::failed(
                    elapsed_ms(start),
                    TransportErrorKind::Unreachable,
                    "recipient inbox channel closed",
                ),
            },
            None => SendOutcome::failed(
                elapsed_ms(start),
                TransportErrorKind::Unreachable,
                "recipient has no known DM conversation (never initialized)",
            ),
        }
    }

    fn on_inbound(&self, handler: InboundHandler) {
        *self.0.handler.lock().unwrap() = Some(handler);
    }

    async fn shutdown(&self) {
        hub().lock().unwrap().remove(&self.0.own_address);
        if let Some(task) = self.0.recv_task.lock().await.take() {
            task.abort();
        }
    }

    fn name(&self) -> &'static str {
        "xmtp"
    }

    async fn status(&self) -> TransportStatus {
        let registered = hub().lock().unwrap().contains_key(&self.0.own_address);
        TransportStatus {
            connected: registered as u32,
            total: 1,
            detail: format!("local inbox at {}", self.0.db_path.display()),
        }
    }
}

fn elapsed_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}
