//! The five transport drivers for `broadcast-dm`, behind one uniform
//! contract (`init`/`send`/`on_inbound`/`shutdown`/`name`/`status`) so the
//! broadcaster can hold them as `Arc<dyn Transport>` without enumerating
//! concrete types.

pub mod drivers;
mod error;
mod transport;

pub use drivers::{IrohDriver, MqttDriver, NostrDriver, WakuDriver, XmtpDriver};
pub use error::{DriverInitError, TransportErrorKind};
pub use transport::{InboundHandler, SendOutcome, Transport, TransportStatus};
