//! D2 — signed-event relay.
//!
//! Builds and signs kind-4 events per NIP-01, encrypts the payload with an
//! ECDH-derived key (NIP-04 is specified with legacy AES-CBC; the contract
//! here only requires *a* symmetric cipher keyed by ECDH, so AES-GCM is used
//! instead — noted in the grounding ledger), and maintains a relay pool over
//! `tokio-tungstenite` with a 5 s reconnect backoff, mirroring the relay
//! re-dial timer shape used elsewhere in this stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secp256k1::{ecdh::SharedSecret, schnorr, Keypair, Message as SecpMessage, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::error::{DriverInitError, TransportErrorKind};
use crate::transport::{InboundHandler, SendOutcome, Transport, TransportStatus};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

struct Inner {
    secret_key: SecretKey,
    own_pubkey_xonly: String,
    relays: Vec<String>,
    handler: Mutex<Option<InboundHandler>>,
    writers: Mutex<HashMap<String, mpsc::UnboundedSender<WsMessage>>>,
    running: AtomicBool,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

pub struct NostrDriver(Arc<Inner>);

impl NostrDriver {
    pub fn new(secret_key: SecretKey, relays: Vec<String>) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        let (xonly, _parity) = keypair.x_only_public_key();

        NostrDriver(Arc::new(Inner {
            secret_key,
            own_pubkey_xonly: hex::encode(xonly.serialize()),
            relays,
            handler: Mutex::new(None),
            writers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }))
    }
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

/// Canonical serialization per NIP-01: `[0, pubkey, created_at, kind, tags, content]`.
fn canonical_event_json(pubkey: &str, created_at: i64, kind: u32, tags: &str, content: &str) -> String {
    format!(
        "[0,\"{}\",{},{},{},{}]",
        pubkey,
        created_at,
        kind,
        tags,
        serde_json_string(content),
    )
}

fn serde_json_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn event_id(canonical: &str) -> String {
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn ecdh_key(secret_key: &SecretKey, their_pubkey: &PublicKey) -> [u8; 32] {
    // SharedSecret::new already returns sha256(compressed x-coordinate).
    *SharedSecret::new(their_pubkey, secret_key).as_ref()
}

fn encrypt_payload(key_bytes: &[u8; 32], plaintext: &[u8]) -> (Vec<u8>, [u8; 12]) {
    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher.encrypt(nonce, plaintext).expect("aes-gcm encrypt");
    (ciphertext, nonce_bytes)
}

fn decrypt_payload(key_bytes: &[u8; 32], ciphertext: &[u8], nonce_bytes: &[u8; 12]) -> Option<Vec<u8>> {
    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher.decrypt(nonce, ciphertext).ok()
}

impl Inner {
    fn build_event(&self, recipient_xonly_pubkey: &str, ciphertext_b64: &str) -> String {
        let created_at = unix_now();
        let tags = format!("[[\"p\",\"{}\"]]", recipient_xonly_pubkey);
        let canonical = canonical_event_json(&self.own_pubkey_xonly, created_at, 4, &tags, ciphertext_b64);
        let id = event_id(&canonical);

        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &self.secret_key);
        let digest: [u8; 32] = Sha256::digest(id.as_bytes()).into();
        let msg = SecpMessage::from_digest(digest);
        let sig: schnorr::Signature = secp.sign_schnorr(&msg, &keypair);

        format!(
            "{{\"id\":\"{id}\",\"pubkey\":\"{pubkey}\",\"created_at\":{created_at},\
              \"kind\":4,\"tags\":{tags},\"content\":{content},\"sig\":\"{sig}\"}}",
            id = id,
            pubkey = self.own_pubkey_xonly,
            created_at = created_at,
            tags = tags,
            content = serde_json_string(ciphertext_b64),
            sig = hex::encode(sig.as_ref() as &[u8]),
        )
    }
}

#[async_trait]
impl Transport for NostrDriver {
    async fn init(&self) -> Result<(), DriverInitError> {
        if self.0.relays.is_empty() {
            return Err(DriverInitError::BadConfig {
                driver: "nostr",
                detail: "no relays configured".into(),
            });
        }
        self.0.running.store(true, Ordering::SeqCst);

        let mut tasks = Vec::new();
        for relay_url in self.0.relays.clone() {
            let inner = Arc::clone(&self.0);
            let task = tokio::spawn(run_relay_loop(inner, relay_url));
            tasks.push(task);
        }
        *self.0.tasks.lock().await = tasks;

        // Give connections a brief moment to establish. Whether any relay
        // actually connected is surfaced through `status()`, not as an
        // init failure — partial relay availability is normal operation.
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }

    async fn send(&self, recipient_address: &str, payload: &[u8]) -> SendOutcome {
        let start = Instant::now();
        let secp = Secp256k1::new();
        let their_pubkey = match parse_xonly_pubkey(&secp, recipient_address) {
            Some(pk) => pk,
            None => {
                return SendOutcome::failed(
                    elapsed_ms(start),
                    TransportErrorKind::Protocol,
                    "recipient is not a valid nostr pubkey",
                )
            }
        };

        let key_bytes = ecdh_key(&self.0.secret_key, &their_pubkey);
        let (ciphertext, nonce) = encrypt_payload(&key_bytes, payload);
        let encoded = format!("{}:{}", hex::encode(ciphertext), hex::encode(nonce));
        let event_json = self.0.build_event(recipient_address, &encoded);
        let req = format!("[\"EVENT\",{}]", event_json);

        let writers: Vec<_> = self.0.writers.lock().unwrap().values().cloned().collect();
        if writers.is_empty() {
            return SendOutcome::failed(
                elapsed_ms(start),
                TransportErrorKind::Unreachable,
                "no relay currently connected",
            );
        }

        let mut successes = 0;
        for writer in &writers {
            if writer.send(WsMessage::Text(req.clone())).is_ok() {
                successes += 1;
            }
        }

        if successes > 0 {
            SendOutcome::ok(elapsed_ms(start), format!("published to {successes} relay(s)"))
        } else {
            SendOutcome::failed(elapsed_ms(start), TransportErrorKind::Unreachable, "all relay publishes failed")
        }
    }

    fn on_inbound(&self, handler: InboundHandler) {
        *self.0.handler.lock().unwrap() = Some(handler);
    }

    async fn shutdown(&self) {
        self.0.running.store(false, Ordering::SeqCst);
        let tasks = self.0.tasks.lock().await.split_off(0);
        for task in tasks {
            task.abort();
        }
        self.0.writers.lock().unwrap().clear();
    }

    fn name(&self) -> &'static str {
        "nostr"
    }

    async fn status(&self) -> TransportStatus {
        let connected = self.0.writers.lock().unwrap().len() as u32;
        TransportStatus {
            connected,
            total: self.0.relays.len() as u32,
            detail: format!("{}/{} relays connected", connected, self.0.relays.len()),
        }
    }
}

fn parse_xonly_pubkey(_secp: &Secp256k1<secp256k1::All>, hex_str: &str) -> Option<PublicKey> {
    let bytes = hex::decode(hex_str).ok()?;
    let xonly = secp256k1::XOnlyPublicKey::from_slice(&bytes).ok()?;
    // Nostr pubkeys are x-only; we don't know the original point's parity,
    // so reconstruct with even parity by BIP-340 convention.
    Some(PublicKey::from_x_only_public_key(xonly, secp256k1::Parity::Even))
}

async fn run_relay_loop(inner: Arc<Inner>, relay_url: String) {
    while inner.running.load(Ordering::SeqCst) {
        match tokio_tungstenite::connect_async(&relay_url).await {
            Ok((ws_stream, _response)) => {
                tracing::info!(relay = %relay_url, "nostr: relay connected");
                let (mut sink, mut stream) = ws_stream.split();

                let filter = format!(
                    "[\"REQ\",\"broadcast-dm\",{{\"kinds\":[4],\"#p\":[\"{}\"]}}]",
                    inner.own_pubkey_xonly
                );
                if sink.send(WsMessage::Text(filter)).await.is_err() {
                    continue;
                }

                let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
                inner.writers.lock().unwrap().insert(relay_url.clone(), tx);

                loop {
                    tokio::select! {
                        outgoing = rx.recv() => {
                            match outgoing {
                                Some(msg) => {
                                    if sink.send(msg).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                        incoming = stream.next() => {
                            match incoming {
                                Some(Ok(WsMessage::Text(text))) => handle_relay_text(&inner, &text),
                                Some(Ok(WsMessage::Close(_))) | None => break,
                                Some(Err(_)) => break,
                                _ => {}
                            }
                        }
                    }
                }

                inner.writers.lock().unwrap().remove(&relay_url);
                tracing::warn!(relay = %relay_url, "nostr: relay connection closed, reconnecting in 5s");
            }
            Err(e) => {
                tracing::warn!(relay = %relay_url, error = %e, "nostr: relay connect failed");
            }
        }
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

fn handle_relay_text(inner: &Arc<Inner>, text: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return;
    };
    let Some(arr) = value.as_array() else { return };
    if arr.first().and_then(|v| v.as_str()) != Some("EVENT") {
        return;
    }
    let Some(event) = arr.get(2) else { return };
    let Some(sender_pubkey_hex) = event.get("pubkey").and_then(|v| v.as_str()) else {
        return;
    };
    let Some(content) = event.get("content").and_then(|v| v.as_str()) else {
        return;
    };
    let Some((ct_hex, nonce_hex)) = content.split_once(':') else {
        return;
    };
    let (Ok(ciphertext), Ok(nonce_vec)) = (hex::decode(ct_hex), hex::decode(nonce_hex)) else {
        return;
    };
    let Ok(nonce): Result<[u8; 12], _> = nonce_vec.try_into() else {
        return;
    };

    let secp = Secp256k1::new();
    let Some(sender_pubkey) = parse_xonly_pubkey(&secp, sender_pubkey_hex) else {
        return;
    };
    let key_bytes = ecdh_key(&inner.secret_key, &sender_pubkey);
    let Some(plaintext) = decrypt_payload(&key_bytes, &ciphertext, &nonce) else {
        tracing::warn!("nostr: failed to decrypt inbound event");
        return;
    };

    let handler = inner.handler.lock().unwrap().take();
    if let Some(handler) = handler {
        handler(plaintext, None);
        *inner.handler.lock().unwrap() = Some(handler);
    }
}

fn elapsed_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    #[test]
    fn event_id_is_stable_for_same_input() {
        let canonical = canonical_event_json("abc", 100, 4, "[]", "hello");
        assert_eq!(event_id(&canonical), event_id(&canonical));
    }

    #[test]
    fn ecdh_key_is_symmetric_between_both_parties() {
        let secp = Secp256k1::new();
        let alice_sk = SecretKey::new(&mut rand::thread_rng());
        let bob_sk = SecretKey::new(&mut rand::thread_rng());
        let alice_pk = PublicKey::from_secret_key(&secp, &alice_sk);
        let bob_pk = PublicKey::from_secret_key(&secp, &bob_sk);

        let alice_side = ecdh_key(&alice_sk, &bob_pk);
        let bob_side = ecdh_key(&bob_sk, &alice_pk);
        assert_eq!(alice_side, bob_side);
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let key = [7u8; 32];
        let (ciphertext, nonce) = encrypt_payload(&key, b"hello world");
        let plaintext = decrypt_payload(&key, &ciphertext, &nonce).unwrap();
        assert_eq!(plaintext, b"hello world");
    }

    /// A relay that accepts and immediately closes the connection forces the
    /// driver through its 5s reconnect backoff; within the spec's 10s window
    /// it must have dialed back in.
    #[tokio::test(flavor = "multi_thread")]
    async fn relay_disconnect_triggers_reconnect_within_backoff() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("ws://{addr}");

        let accept_count = Arc::new(AtomicUsize::new(0));
        let accept_count_srv = Arc::clone(&accept_count);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accept_count_srv.fetch_add(1, Ordering::SeqCst);
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    drop(ws);
                }
            }
        });

        let secret = SecretKey::new(&mut rand::thread_rng());
        let driver = NostrDriver::new(secret, vec![url]);
        driver.init().await.unwrap();

        tokio::time::sleep(RECONNECT_BACKOFF + Duration::from_secs(2)).await;
        driver.shutdown().await;

        assert!(
            accept_count.load(Ordering::SeqCst) >= 2,
            "relay should have been dialed more than once within the backoff window"
        );
    }
}
