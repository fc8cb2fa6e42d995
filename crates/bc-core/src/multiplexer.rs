//! C6 — the Listener Multiplexer: the single inbound path every transport
//! driver's `on_inbound` handler feeds into. Dedups by message uuid, records
//! evidence, fans out to registered handlers, and auto-acknowledges.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use bc_envelope::{create_acknowledgment, ChannelPreference, Message};
use bc_store::{EvidenceStore, Receipt, StoredMessage};

use crate::broadcaster::Broadcaster;

/// Upper bound on distinct uuids tracked for dedup. Sized comfortably past
/// the "≥10^5 distinct messages in 24h" floor without unbounded growth.
const SEEN_CAPACITY: usize = 200_000;

type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Fans inbound payloads from every driver into one pipeline: dedup, persist,
/// notify, auto-ack. Holds a strong [`Arc<Broadcaster>`] to send acks back out
/// — safe, since the multiplexer is downstream of the broadcaster and never
/// needs to be reached back from it, so no ownership cycle forms. Handler
/// registration lives here rather than on `Broadcaster` for the same reason:
/// this is the object that actually dispatches inbound traffic.
pub struct Multiplexer {
    seen: Mutex<lru::LruCache<String, ()>>,
    store: Arc<EvidenceStore>,
    broadcaster: Arc<Broadcaster>,
    own_magnet_link: String,
    message_handlers: Mutex<Vec<MessageHandler>>,
    receipt_handlers: Mutex<Vec<MessageHandler>>,
}

impl Multiplexer {
    pub fn new(store: Arc<EvidenceStore>, broadcaster: Arc<Broadcaster>, own_magnet_link: impl Into<String>) -> Self {
        Multiplexer {
            seen: Mutex::new(lru::LruCache::new(NonZeroUsize::new(SEEN_CAPACITY).unwrap())),
            store,
            broadcaster,
            own_magnet_link: own_magnet_link.into(),
            message_handlers: Mutex::new(Vec::new()),
            receipt_handlers: Mutex::new(Vec::new()),
        }
    }

    /// Register a handler fired, in registration order, for every newly-seen
    /// chat message (not acknowledgments).
    pub fn on_message(&self, handler: impl Fn(Message) + Send + Sync + 'static) {
        self.message_handlers.lock().unwrap().push(Arc::new(handler));
    }

    /// Register a handler fired, in registration order, for every newly-seen
    /// acknowledgment.
    pub fn on_receipt(&self, handler: impl Fn(Message) + Send + Sync + 'static) {
        self.receipt_handlers.lock().unwrap().push(Arc::new(handler));
    }

    /// The single inbound entry point every driver's handler closure calls.
    ///
    /// 1. Parse the payload; malformed input is logged and dropped.
    /// 2. Record a receipt unconditionally — a message arriving over three
    ///    transports is three pieces of delivery evidence, not one.
    /// 3. Dedup on uuid: the first sighting persists the message and fires
    ///    handlers; repeats stop here; this is only ever this instance's first
    ///    sighting, not a durable cross-restart fact (the seen cache is
    ///    in-memory).
    /// 4. Chat messages fan out to message handlers and get auto-acked; acks
    ///    fan out to receipt handlers and are never acked themselves.
    pub async fn handle_inbound(&self, transport_name: &str, payload: Vec<u8>, server_tag: Option<String>) {
        let msg = match Message::deserialize(&payload) {
            Some(m) => m,
            None => {
                tracing::warn!(transport = transport_name, "dropping malformed inbound payload");
                return;
            }
        };

        let received_at = now_millis();
        let receipt = Receipt {
            uuid: msg.uuid.clone(),
            transport: transport_name.to_string(),
            received_at,
            server: server_tag,
            latency_ms: received_at - msg.timestamp,
        };
        if let Err(e) = self.store.save_receipt(&receipt) {
            tracing::warn!(uuid = %msg.uuid, error = %e, "failed to record receipt");
        }

        let first_time = {
            let mut seen = self.seen.lock().unwrap();
            if seen.contains(&msg.uuid) {
                false
            } else {
                seen.put(msg.uuid.clone(), ());
                true
            }
        };
        if !first_time {
            return;
        }

        let stored = StoredMessage {
            uuid: msg.uuid.clone(),
            kind: if msg.is_acknowledgment() { "acknowledgment".to_string() } else { "message".to_string() },
            content: msg.content.clone(),
            timestamp: msg.timestamp,
            from_magnet_link: msg.from_magnet_link.clone(),
            ack_of_uuid: msg.ack_of_uuid.clone(),
        };
        if let Err(e) = self.store.save_message(&stored) {
            tracing::warn!(uuid = %msg.uuid, error = %e, "failed to persist inbound message");
        }

        if msg.is_acknowledgment() {
            self.warn_if_orphan_ack(&msg);
            self.record_ack_preferences(transport_name, &msg);
            for handler in self.receipt_handlers.lock().unwrap().iter() {
                handler(msg.clone());
            }
            return;
        }

        for handler in self.message_handlers.lock().unwrap().iter() {
            handler(msg.clone());
        }

        let ack = create_acknowledgment(&msg, transport_name, self.own_magnet_link.clone(), Vec::new());
        let ack_payload = ack.serialize();
        let recipient = msg.from_magnet_link.clone();
        let broadcaster = Arc::clone(&self.broadcaster);
        tokio::spawn(async move {
            if let Err(e) = broadcaster.send(&recipient, &ack_payload).await {
                tracing::warn!(error = %e, "failed to send auto-acknowledgment");
            }
        });
    }
}

impl Multiplexer {
    /// An acknowledgment's `ack_of_uuid` should refer to a message this
    /// instance has already observed. It isn't always — the original may
    /// have arrived over a transport we never heard back from, or may still
    /// be in flight. Either way the ack is stored regardless; this only
    /// logs the orphan case so it's visible without dropping the evidence.
    fn warn_if_orphan_ack(&self, msg: &Message) {
        let Some(ack_of_uuid) = &msg.ack_of_uuid else {
            return;
        };
        match self.store.message_exists(ack_of_uuid) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(uuid = %msg.uuid, ack_of_uuid = %ack_of_uuid, "orphan ack: acknowledged message never observed");
            }
            Err(e) => {
                tracing::warn!(uuid = %msg.uuid, error = %e, "failed to check ack_of_uuid against store");
            }
        }
    }

    /// Record what an acknowledgment tells us about the peer's reachable
    /// channels: the transport it arrived on worked (latency = now - sent
    /// time), and every channel preference it volunteers gets upserted with
    /// the stated order and cannot-use flag.
    fn record_ack_preferences(&self, transport_name: &str, msg: &Message) {
        let now = now_millis();
        let latency_ms = now - msg.timestamp;
        if let Err(e) =
            self.store.update_peer_preference(&msg.from_magnet_link, transport_name, true, Some(now), Some(latency_ms), None, false)
        {
            tracing::warn!(peer = %msg.from_magnet_link, transport = transport_name, error = %e, "failed to record ack preference");
        }

        let prefs: &[ChannelPreference] = msg.channel_preferences.as_deref().unwrap_or(&[]);
        for pref in prefs {
            if let Err(e) = self.store.update_peer_preference(
                &msg.from_magnet_link,
                &pref.protocol,
                !pref.cannot_use,
                None,
                None,
                pref.preference_order.map(|o| o as i64),
                pref.cannot_use,
            ) {
                tracing::warn!(peer = %msg.from_magnet_link, protocol = %pref.protocol, error = %e, "failed to upsert channel preference");
            }
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before 1970").as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use bc_identity::Protocol;
    use bc_transport::{DriverInitError, InboundHandler, SendOutcome, Transport, TransportStatus};

    struct FakeTransport {
        sends: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn init(&self) -> Result<(), DriverInitError> {
            Ok(())
        }
        async fn send(&self, _recipient_address: &str, _payload: &[u8]) -> SendOutcome {
            self.sends.fetch_add(1, Ordering::SeqCst);
            SendOutcome::ok(1, "sent")
        }
        fn on_inbound(&self, _handler: InboundHandler) {}
        async fn shutdown(&self) {}
        fn name(&self) -> &'static str {
            "fake"
        }
        async fn status(&self) -> TransportStatus {
            TransportStatus { connected: 1, total: 1, detail: "ok".into() }
        }
    }

    async fn setup() -> (Multiplexer, Arc<EvidenceStore>, Arc<AtomicUsize>) {
        let store = Arc::new(EvidenceStore::open_in_memory().unwrap());
        let sends = Arc::new(AtomicUsize::new(0));
        let transport: Arc<dyn Transport> = Arc::new(FakeTransport { sends: Arc::clone(&sends) });
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&store), vec![(Protocol::Xmtp, transport)]));
        broadcaster.initialize().await;
        let own_magnet = bc_identity::Identity::generate().encode();
        let mux = Multiplexer::new(Arc::clone(&store), broadcaster, own_magnet);
        (mux, store, sends)
    }

    #[tokio::test]
    async fn new_chat_message_persists_fires_handler_and_acks() {
        let (mux, store, sends) = setup().await;
        let invocations = Arc::new(AtomicUsize::new(0));
        let inv = Arc::clone(&invocations);
        mux.on_message(move |_msg| {
            inv.fetch_add(1, Ordering::SeqCst);
        });

        let from = bc_identity::Identity::generate().encode();
        let msg = Message::new_text("hi", from).unwrap();
        mux.handle_inbound("xmtp", msg.serialize(), Some("relay1".into())).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(store.list_all_messages(10).unwrap().len(), 1);
        assert_eq!(store.receipts_for(&msg.uuid).unwrap().len(), 1);

        // give the spawned ack task a moment to run
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_message_fires_handler_once_but_records_every_receipt() {
        let (mux, store, _sends) = setup().await;
        let invocations = Arc::new(AtomicUsize::new(0));
        let inv = Arc::clone(&invocations);
        mux.on_message(move |_msg| {
            inv.fetch_add(1, Ordering::SeqCst);
        });

        let from = bc_identity::Identity::generate().encode();
        let msg = Message::new_text("hi", from).unwrap();
        let payload = msg.serialize();

        mux.handle_inbound("xmtp", payload.clone(), Some("relay1".into())).await;
        mux.handle_inbound("nostr", payload.clone(), Some("relay2".into())).await;
        mux.handle_inbound("mqtt", payload, None).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(store.list_all_messages(10).unwrap().len(), 1);
        assert_eq!(store.receipts_for(&msg.uuid).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn acknowledgment_fires_receipt_handler_and_is_never_reacked() {
        let (mux, _store, sends) = setup().await;
        let invocations = Arc::new(AtomicUsize::new(0));
        let inv = Arc::clone(&invocations);
        mux.on_receipt(move |_msg| {
            inv.fetch_add(1, Ordering::SeqCst);
        });

        let from = bc_identity::Identity::generate().encode();
        let original = Message::new_text("hi", from.clone()).unwrap();
        let ack = create_acknowledgment(&original, "xmtp", from, Vec::new());
        mux.handle_inbound("xmtp", ack.serialize(), None).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(sends.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn acknowledgment_marks_peer_channel_as_working() {
        let (mux, store, _sends) = setup().await;
        let from = bc_identity::Identity::generate().encode();
        let original = Message::new_text("hi", from.clone()).unwrap();
        let ack = create_acknowledgment(&original, "nostr", from.clone(), Vec::new());
        mux.handle_inbound("nostr", ack.serialize(), None).await;

        let pref = store.peer_preference(&from, "nostr").unwrap().unwrap();
        assert!(pref.is_working);
        assert!(!pref.cannot_use);
        assert!(pref.avg_latency_ms.is_some());
    }

    #[tokio::test]
    async fn orphan_ack_is_still_stored_and_dispatched() {
        let (mux, store, _sends) = setup().await;
        let invocations = Arc::new(AtomicUsize::new(0));
        let inv = Arc::clone(&invocations);
        mux.on_receipt(move |_msg| {
            inv.fetch_add(1, Ordering::SeqCst);
        });

        // `original` is never fed through `handle_inbound`, so its uuid is
        // unknown to the store when the ack for it arrives.
        let from = bc_identity::Identity::generate().encode();
        let original = Message::new_text("hi", from.clone()).unwrap();
        let ack = create_acknowledgment(&original, "xmtp", from, Vec::new());
        mux.handle_inbound("xmtp", ack.serialize(), None).await;

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(store.list_all_messages(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_is_dropped_without_panicking() {
        let (mux, store, _sends) = setup().await;
        mux.handle_inbound("xmtp", b"not json".to_vec(), None).await;
        assert_eq!(store.list_all_messages(10).unwrap().len(), 0);
    }
}
