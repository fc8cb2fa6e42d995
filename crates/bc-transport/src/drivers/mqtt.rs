//! D3 — broker pub/sub.
//!
//! One `rumqttc` client per configured broker, QoS 1, persistent session
//! (`clean_session(false)`), a 10 s per-broker connect timeout, and a 5 s
//! reconnect period once connected — matching the broker-fabric contract
//! almost verbatim, since `rumqttc` already speaks it natively.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};

use crate::error::{DriverInitError, TransportErrorKind};
use crate::transport::{InboundHandler, SendOutcome, Transport, TransportStatus};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_PERIOD: Duration = Duration::from_secs(5);

struct BrokerHandle {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

struct Inner {
    own_hex_id: String,
    brokers: Vec<String>,
    handler: Mutex<Option<InboundHandler>>,
    clients: Mutex<HashMap<String, BrokerHandle>>,
    running: AtomicBool,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

pub struct MqttDriver(Arc<Inner>);

impl MqttDriver {
    pub fn new(own_hex_id: String, brokers: Vec<String>) -> Self {
        MqttDriver(Arc::new(Inner {
            own_hex_id,
            brokers,
            handler: Mutex::new(None),
            clients: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }))
    }
}

fn parse_broker_url(url: &str) -> Option<(String, u16)> {
    let rest = url.strip_prefix("mqtt://")?;
    let (host, port) = rest.split_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

#[async_trait]
impl Transport for MqttDriver {
    async fn init(&self) -> Result<(), DriverInitError> {
        if self.0.brokers.is_empty() {
            return Err(DriverInitError::BadConfig {
                driver: "mqtt",
                detail: "no brokers configured".into(),
            });
        }

        self.0.running.store(true, Ordering::SeqCst);
        let own_topic = format!("dm/{}", self.0.own_hex_id);

        let mut connect_futures = Vec::new();
        for broker_url in self.0.brokers.clone() {
            let inner = Arc::clone(&self.0);
            let topic = own_topic.clone();
            connect_futures.push(tokio::spawn(async move {
                connect_one_broker(inner, broker_url, topic).await
            }));
        }

        let results = futures::future::join_all(connect_futures).await;
        let connected = results.into_iter().filter(|r| matches!(r, Ok(true))).count();

        if connected == 0 {
            return Err(DriverInitError::AllEndpointsUnreachable { driver: "mqtt" });
        }
        Ok(())
    }

    async fn send(&self, recipient_address: &str, payload: &[u8]) -> SendOutcome {
        let start = Instant::now();
        let topic = format!("dm/{}", recipient_address);
        let clients: Vec<AsyncClient> = self
            .0
            .clients
            .lock()
            .unwrap()
            .values()
            .filter(|h| h.connected.load(Ordering::SeqCst))
            .map(|h| h.client.clone())
            .collect();

        if clients.is_empty() {
            return SendOutcome::failed(
                elapsed_ms(start),
                TransportErrorKind::Unreachable,
                "no broker currently connected",
            );
        }

        let mut successes = 0;
        for client in &clients {
            if client
                .publish(topic.clone(), QoS::AtLeastOnce, true, payload.to_vec())
                .await
                .is_ok()
            {
                successes += 1;
            }
        }

        if successes > 0 {
            SendOutcome::ok(elapsed_ms(start), format!("published to {successes} broker(s)"))
        } else {
            SendOutcome::failed(elapsed_ms(start), TransportErrorKind::Unreachable, "all broker publishes failed")
        }
    }

    fn on_inbound(&self, handler: InboundHandler) {
        *self.0.handler.lock().unwrap() = Some(handler);
    }

    async fn shutdown(&self) {
        self.0.running.store(false, Ordering::SeqCst);
        let tasks = self.0.tasks.lock().await.split_off(0);
        for (broker_url, handle) in self.0.clients.lock().unwrap().drain() {
            let _ = handle.client.disconnect();
            tracing::debug!(broker = %broker_url, "mqtt: disconnected");
        }
        for task in tasks {
            task.abort();
        }
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn status(&self) -> TransportStatus {
        let clients = self.0.clients.lock().unwrap();
        let connected = clients.values().filter(|h| h.connected.load(Ordering::SeqCst)).count() as u32;
        TransportStatus {
            connected,
            total: self.0.brokers.len() as u32,
            detail: format!("{}/{} brokers connected", connected, self.0.brokers.len()),
        }
    }
}

async fn connect_one_broker(inner: Arc<Inner>, broker_url: String, own_topic: String) -> bool {
    let Some((host, port)) = parse_broker_url(&broker_url) else {
        tracing::warn!(broker = %broker_url, "mqtt: unparseable broker url");
        return false;
    };

    let client_id = format!("broadcast-dm-{}", &inner.own_hex_id[..inner.own_hex_id.len().min(12)]);
    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(options, 64);

    let connected_flag = Arc::new(AtomicBool::new(false));
    let connect_result = tokio::time::timeout(CONNECT_TIMEOUT, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await;

    let connected = matches!(connect_result, Ok(true));
    if !connected {
        tracing::warn!(broker = %broker_url, "mqtt: connect timed out or failed");
        return false;
    }

    if client.subscribe(own_topic.clone(), QoS::AtLeastOnce).await.is_err() {
        tracing::warn!(broker = %broker_url, "mqtt: failed to subscribe to own topic");
        return false;
    }

    connected_flag.store(true, Ordering::SeqCst);
    inner.clients.lock().unwrap().insert(
        broker_url.clone(),
        BrokerHandle {
            client: client.clone(),
            connected: Arc::clone(&connected_flag),
        },
    );

    let task_inner = Arc::clone(&inner);
    let task_broker_url = broker_url.clone();
    let task = tokio::spawn(async move {
        loop {
            if !task_inner.running.load(Ordering::SeqCst) {
                break;
            }
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let handler = task_inner.handler.lock().unwrap().take();
                    if let Some(handler) = handler {
                        handler(publish.payload.to_vec(), Some(task_broker_url.clone()));
                        *task_inner.handler.lock().unwrap() = Some(handler);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(broker = %task_broker_url, error = %e, "mqtt: connection lost, reconnecting in 5s");
                    connected_flag.store(false, Ordering::SeqCst);
                    tokio::time::sleep(RECONNECT_PERIOD).await;
                }
            }
        }
    });
    inner.tasks.lock().await.push(task);

    true
}

fn elapsed_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_broker_url() {
        assert_eq!(
            parse_broker_url("mqtt://broker.hivemq.com:1883"),
            Some(("broker.hivemq.com".to_string(), 1883))
        );
    }

    #[test]
    fn rejects_malformed_broker_url() {
        assert_eq!(parse_broker_url("not-a-url"), None);
        assert_eq!(parse_broker_url("mqtt://missing-port"), None);
    }

    #[tokio::test]
    async fn init_fails_fast_with_no_brokers_configured() {
        let driver = MqttDriver::new("abcd".into(), vec![]);
        let err = driver.init().await.unwrap_err();
        assert!(matches!(err, DriverInitError::BadConfig { driver: "mqtt", .. }));
    }
}
