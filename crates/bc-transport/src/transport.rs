use async_trait::async_trait;

use crate::error::{DriverInitError, TransportErrorKind};

/// A callback invoked once per inbound payload. `server_tag` names the
/// concrete relay/broker/node the payload arrived through, when the driver
/// can tell.
pub type InboundHandler = Box<dyn Fn(Vec<u8>, Option<String>) + Send + Sync>;

/// The result of a single `Transport::send` call. Never an `Err` — failure
/// is a value, not an exception, so the broadcaster can always collect one
/// result per initialized driver.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub success: bool,
    pub latency_ms: i64,
    pub detail: String,
    pub error_kind: Option<TransportErrorKind>,
}

impl SendOutcome {
    pub fn ok(latency_ms: i64, detail: impl Into<String>) -> Self {
        SendOutcome {
            success: true,
            latency_ms,
            detail: detail.into(),
            error_kind: None,
        }
    }

    pub fn failed(latency_ms: i64, kind: TransportErrorKind, detail: impl Into<String>) -> Self {
        SendOutcome {
            success: false,
            latency_ms,
            detail: detail.into(),
            error_kind: Some(kind),
        }
    }
}

/// `{connected: k of n, ...}` — a coarse health snapshot surfaced to the
/// CLI/TUI collaborator, never used internally for control flow.
#[derive(Debug, Clone)]
pub struct TransportStatus {
    pub connected: u32,
    pub total: u32,
    pub detail: String,
}

/// The uniform contract every transport driver implements. Held as
/// `Arc<dyn Transport>` so the broadcaster works over a heterogeneous set
/// without compile-time enumeration of the five concrete drivers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect, authenticate, and subscribe for inbound traffic. May
    /// partially succeed (e.g. MQTT: at least one broker connected is
    /// success). A return of `Err` is fatal for this driver only — the
    /// broadcaster logs it as a warning and proceeds without it.
    async fn init(&self) -> Result<(), DriverInitError>;

    /// Send `payload` to `recipient_address` (already resolved from the
    /// recipient's identity for this driver's address space). Never
    /// returns `Err`; every outcome, including failure, is a value.
    async fn send(&self, recipient_address: &str, payload: &[u8]) -> SendOutcome;

    /// Register the single inbound handler. Called once, before `init`.
    fn on_inbound(&self, handler: InboundHandler);

    /// Idempotent, best-effort teardown.
    async fn shutdown(&self);

    fn name(&self) -> &'static str;

    async fn status(&self) -> TransportStatus;
}
