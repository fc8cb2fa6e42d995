use thiserror::Error;

/// Per-attempt failure classification shared by every driver. The
/// broadcaster uses this to decide log severity; it never retries at this
/// layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Unreachable,
    Auth,
    Protocol,
    SelfSend,
    NotInitialized,
}

impl TransportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Unreachable => "unreachable",
            TransportErrorKind::Auth => "auth",
            TransportErrorKind::Protocol => "protocol",
            TransportErrorKind::SelfSend => "self",
            TransportErrorKind::NotInitialized => "notInitialized",
        }
    }
}

/// A fatal failure during `init` — the driver never became usable.
#[derive(Error, Debug)]
pub enum DriverInitError {
    #[error("no configured endpoint for {driver} could be reached")]
    AllEndpointsUnreachable { driver: &'static str },

    #[error("{driver} configuration is missing a required value: {detail}")]
    BadConfig { driver: &'static str, detail: String },

    #[error("{1} local state could not be opened: {0}")]
    Storage(#[source] anyhow::Error, &'static str),
}
