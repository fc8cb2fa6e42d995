//! D5 — direct P2P bidirectional stream.
//!
//! `iroh`'s native vocabulary (ed25519 node id, ALPN-scoped bidirectional
//! QUIC streams, accept → read → respond → close) matches this contract
//! almost verbatim — no crate already in the stack models a QUIC direct-dial
//! transport, so `iroh` is pulled in fresh for this one driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use iroh::{Endpoint, NodeId, SecretKey};

use crate::error::{DriverInitError, TransportErrorKind};
use crate::transport::{InboundHandler, SendOutcome, Transport, TransportStatus};

const ALPN: &[u8] = b"broadcast/dm/0";
const MAX_READ_BYTES: usize = 1024 * 1024;
const ACK_BYTES: &[u8] = b"ACK: Received";

struct Inner {
    secret_key: SecretKey,
    own_node_id: NodeId,
    handler: Mutex<Option<InboundHandler>>,
    endpoint: tokio::sync::Mutex<Option<Endpoint>>,
    accept_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    ready: AtomicBool,
}

pub struct IrohDriver(Arc<Inner>);

impl IrohDriver {
    pub fn new(secret_key: SecretKey) -> Self {
        let own_node_id = secret_key.public();
        IrohDriver(Arc::new(Inner {
            secret_key,
            own_node_id,
            handler: Mutex::new(None),
            endpoint: tokio::sync::Mutex::new(None),
            accept_task: tokio::sync::Mutex::new(None),
            ready: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl Transport for IrohDriver {
    async fn init(&self) -> Result<(), DriverInitError> {
        let endpoint = Endpoint::builder()
            .secret_key(self.0.secret_key.clone())
            .alpns(vec![ALPN.to_vec()])
            .bind()
            .await
            .map_err(|e| DriverInitError::Storage(anyhow::anyhow!(e), "iroh"))?;

        let inner = Arc::clone(&self.0);
        let accept_endpoint = endpoint.clone();
        let task = tokio::spawn(async move {
            while let Some(incoming) = accept_endpoint.accept().await {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    if let Err(e) = handle_incoming(inner, incoming).await {
                        tracing::warn!(error = %e, "iroh: inbound connection failed");
                    }
                });
            }
        });

        *self.0.endpoint.lock().await = Some(endpoint);
        *self.0.accept_task.lock().await = Some(task);
        self.0.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, recipient_address: &str, payload: &[u8]) -> SendOutcome {
        let start = Instant::now();

        let node_id: NodeId = match recipient_address.parse() {
            Ok(id) => id,
            Err(_) => {
                return SendOutcome::failed(
                    elapsed_ms(start),
                    TransportErrorKind::Protocol,
                    "recipient is not a valid node id",
                )
            }
        };

        if node_id == self.0.own_node_id {
            return SendOutcome::failed(
                elapsed_ms(start),
                TransportErrorKind::SelfSend,
                "refusing to dial own node id",
            );
        }

        let endpoint = self.0.endpoint.lock().await.clone();
        let Some(endpoint) = endpoint else {
            return SendOutcome::failed(
                elapsed_ms(start),
                TransportErrorKind::NotInitialized,
                "driver not initialized",
            );
        };

        match dial_and_send(&endpoint, node_id, payload).await {
            Ok(()) => SendOutcome::ok(elapsed_ms(start), "stream delivered and acked"),
            Err(kind) => SendOutcome::failed(elapsed_ms(start), kind, "direct stream failed"),
        }
    }

    fn on_inbound(&self, handler: InboundHandler) {
        *self.0.handler.lock().unwrap() = Some(handler);
    }

    async fn shutdown(&self) {
        self.0.ready.store(false, Ordering::SeqCst);
        if let Some(task) = self.0.accept_task.lock().await.take() {
            task.abort();
        }
        if let Some(endpoint) = self.0.endpoint.lock().await.take() {
            endpoint.close().await;
        }
    }

    fn name(&self) -> &'static str {
        "iroh"
    }

    async fn status(&self) -> TransportStatus {
        let ready = self.0.ready.load(Ordering::SeqCst);
        TransportStatus {
            connected: ready as u32,
            total: 1,
            detail: format!("node id {}", self.0.own_node_id),
        }
    }
}

async fn handle_incoming(inner: Arc<Inner>, incoming: iroh::endpoint::Incoming) -> anyhow::Result<()> {
    let connection = incoming.accept()?.await?;
    let (mut send, mut recv) = connection.accept_bi().await?;
    let data = recv.read_to_end(MAX_READ_BYTES).await?;

    let handler = inner.handler.lock().unwrap().take();
    if let Some(handler) = handler {
        handler(data, None);
        *inner.handler.lock().unwrap() = Some(handler);
    }

    send.write_all(ACK_BYTES).await?;
    send.finish()?;
    connection.closed().await;
    Ok(())
}

async fn dial_and_send(endpoint: &Endpoint, node_id: NodeId, payload: &[u8]) -> Result<(), TransportErrorKind> {
    let connection = endpoint
        .connect(node_id, ALPN)
        .await
        .map_err(|_| TransportErrorKind::Unreachable)?;

    let (mut send, mut recv) = connection.open_bi().await.map_err(|_| TransportErrorKind::Protocol)?;
    send.write_all(payload).await.map_err(|_| TransportErrorKind::Protocol)?;
    send.finish().map_err(|_| TransportErrorKind::Protocol)?;

    let _ack = recv.read_to_end(ACK_BYTES.len()).await.map_err(|_| TransportErrorKind::Timeout)?;
    connection.close(0u32.into(), b"done");
    Ok(())
}

fn elapsed_ms(start: Instant) -> i64 {
    start.elapsed().as_millis() as i64
}
