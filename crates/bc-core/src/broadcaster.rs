//! C5 — the Broadcaster: fans a single message out across every initialized
//! transport driver concurrently and records the outcome of each attempt.

use std::sync::Arc;
use std::time::Instant;

use bc_identity::Protocol;
use bc_store::EvidenceStore;
use bc_transport::{SendOutcome, Transport};

use crate::error::CoreError;

/// The outcome of sending to one protocol, reported back to the caller.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub protocol: Protocol,
    pub success: bool,
    pub latency_ms: i64,
    pub detail: String,
}

struct Driver {
    protocol: Protocol,
    transport: Arc<dyn Transport>,
    initialized: bool,
}

/// Owns every transport driver and the evidence store they report into.
/// `initialize()` brings drivers up best-effort — one driver failing to
/// connect never prevents the others from working.
pub struct Broadcaster {
    store: Arc<EvidenceStore>,
    drivers: tokio::sync::RwLock<Vec<Driver>>,
}

impl Broadcaster {
    pub fn new(store: Arc<EvidenceStore>, drivers: Vec<(Protocol, Arc<dyn Transport>)>) -> Self {
        let drivers = drivers
            .into_iter()
            .map(|(protocol, transport)| Driver { protocol, transport, initialized: false })
            .collect();
        Broadcaster { store, drivers: tokio::sync::RwLock::new(drivers) }
    }

    pub fn store(&self) -> &Arc<EvidenceStore> {
        &self.store
    }

    /// Bring up every configured driver concurrently. A driver that fails
    /// `init` is logged and left uninitialized — `send` simply skips it.
    pub async fn initialize(&self) {
        let transports: Vec<(usize, Arc<dyn Transport>)> = {
            let drivers = self.drivers.read().await;
            drivers.iter().enumerate().map(|(i, d)| (i, Arc::clone(&d.transport))).collect()
        };

        let results = futures::future::join_all(transports.into_iter().map(|(i, t)| async move {
            let outcome = t.init().await;
            (i, outcome)
        }))
        .await;

        let mut drivers = self.drivers.write().await;
        for (i, outcome) in results {
            match outcome {
                Ok(()) => {
                    drivers[i].initialized = true;
                    tracing::info!(driver = drivers[i].protocol.as_str(), "driver initialized");
                }
                Err(e) => {
                    tracing::warn!(driver = drivers[i].protocol.as_str(), error = %e, "driver failed to initialize, skipping");
                }
            }
        }
    }

    /// Resolve `recipient_magnet` and push `payload` to every initialized
    /// driver concurrently. Returns one [`SendResult`] per initialized
    /// driver — drivers that never initialized are silently excluded, not
    /// reported as failures.
    pub async fn send(&self, recipient_magnet: &str, payload: &[u8]) -> Result<Vec<SendResult>, CoreError> {
        let recipient = bc_identity::decode(recipient_magnet)?;

        let active: Vec<(Protocol, Arc<dyn Transport>, String)> = {
            let drivers = self.drivers.read().await;
            drivers
                .iter()
                .filter(|d| d.initialized)
                .map(|d| (d.protocol, Arc::clone(&d.transport), recipient.address_for(d.protocol)))
                .collect()
        };

        let payload = payload.to_vec();
        let tasks = active.into_iter().map(|(protocol, transport, address)| {
            let payload = payload.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let outcome = transport.send(&address, &payload).await;
                (protocol, outcome, start.elapsed().as_millis() as i64)
            })
        });

        let joined = futures::future::join_all(tasks).await;

        let mut results = Vec::with_capacity(joined.len());
        let now = now_millis();
        for joined_result in joined {
            let (protocol, outcome, measured_latency_ms): (Protocol, SendOutcome, i64) = match joined_result {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "send task panicked");
                    continue;
                }
            };

            if let Err(e) = self.store.update_protocol_aggregate(
                protocol.as_str(),
                outcome.success,
                Some(measured_latency_ms),
                now,
            ) {
                tracing::warn!(protocol = protocol.as_str(), error = %e, "failed to record protocol aggregate");
            }

            results.push(SendResult {
                protocol,
                success: outcome.success,
                latency_ms: measured_latency_ms,
                detail: outcome.detail,
            });
        }

        Ok(results)
    }

    /// Best-effort teardown of every driver, regardless of its init state.
    pub async fn shutdown(&self) {
        let transports: Vec<Arc<dyn Transport>> = {
            let drivers = self.drivers.read().await;
            drivers.iter().map(|d| Arc::clone(&d.transport)).collect()
        };
        futures::future::join_all(transports.iter().map(|t| t.shutdown())).await;
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before 1970").as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bc_transport::{DriverInitError, InboundHandler, TransportStatus};

    struct FakeTransport {
        name: &'static str,
        fail_init: bool,
        sends: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn init(&self) -> Result<(), DriverInitError> {
            if self.fail_init {
                Err(DriverInitError::AllEndpointsUnreachable { driver: self.name })
            } else {
                Ok(())
            }
        }

        async fn send(&self, _recipient_address: &str, _payload: &[u8]) -> SendOutcome {
            self.sends.fetch_add(1, Ordering::SeqCst);
            SendOutcome::ok(1, "sent")
        }

        fn on_inbound(&self, _handler: InboundHandler) {}

        async fn shutdown(&self) {}

        fn name(&self) -> &'static str {
            self.name
        }

        async fn status(&self) -> TransportStatus {
            TransportStatus { connected: 1, total: 1, detail: "ok".into() }
        }
    }

    fn magnet() -> String {
        bc_identity::Identity::generate().encode()
    }

    #[tokio::test]
    async fn send_reaches_every_initialized_driver() {
        let store = Arc::new(EvidenceStore::open_in_memory().unwrap());
        let drivers: Vec<(Protocol, Arc<dyn Transport>)> = vec![
            (Protocol::Xmtp, Arc::new(FakeTransport { name: "xmtp", fail_init: false, sends: AtomicUsize::new(0) })),
            (Protocol::Nostr, Arc::new(FakeTransport { name: "nostr", fail_init: false, sends: AtomicUsize::new(0) })),
        ];
        let bc = Broadcaster::new(store, drivers);
        bc.initialize().await;

        let results = bc.send(&magnet(), b"hi").await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn failed_driver_init_is_excluded_from_send_results() {
        let store = Arc::new(EvidenceStore::open_in_memory().unwrap());
        let drivers: Vec<(Protocol, Arc<dyn Transport>)> = vec![
            (Protocol::Xmtp, Arc::new(FakeTransport { name: "xmtp", fail_init: false, sends: AtomicUsize::new(0) })),
            (Protocol::Mqtt, Arc::new(FakeTransport { name: "mqtt", fail_init: true, sends: AtomicUsize::new(0) })),
        ];
        let bc = Broadcaster::new(store, drivers);
        bc.initialize().await;

        let results = bc.send(&magnet(), b"hi").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].protocol, Protocol::Xmtp);
    }

    #[tokio::test]
    async fn send_with_no_drivers_returns_empty_vector() {
        let store = Arc::new(EvidenceStore::open_in_memory().unwrap());
        let bc = Broadcaster::new(store, vec![]);
        bc.initialize().await;

        let results = bc.send(&magnet(), b"hi").await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn invalid_recipient_magnet_fails_before_touching_any_driver() {
        let store = Arc::new(EvidenceStore::open_in_memory().unwrap());
        let sends = Arc::new(AtomicBool::new(false));
        struct Counting(Arc<AtomicBool>);
        #[async_trait]
        impl Transport for Counting {
            async fn init(&self) -> Result<(), DriverInitError> {
                Ok(())
            }
            async fn send(&self, _recipient_address: &str, _payload: &[u8]) -> SendOutcome {
                self.0.store(true, Ordering::SeqCst);
                SendOutcome::ok(1, "sent")
            }
            fn on_inbound(&self, _handler: InboundHandler) {}
            async fn shutdown(&self) {}
            fn name(&self) -> &'static str {
                "counting"
            }
            async fn status(&self) -> TransportStatus {
                TransportStatus { connected: 1, total: 1, detail: "ok".into() }
            }
        }
        let drivers: Vec<(Protocol, Arc<dyn Transport>)> =
            vec![(Protocol::Xmtp, Arc::new(Counting(Arc::clone(&sends))))];
        let bc = Broadcaster::new(store, drivers);
        bc.initialize().await;

        let err = bc.send("not-a-magnet-link", b"hi").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidRecipient(_)));
        assert!(!sends.load(Ordering::SeqCst));
    }
}
