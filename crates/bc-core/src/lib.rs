//! The fan-out/fan-in engine tying identity, envelope, store, and transports
//! together: the [`Broadcaster`] sends a message out over every configured
//! transport concurrently, and the [`Multiplexer`] is the single inbound path
//! every transport's [`bc_transport::Transport::on_inbound`] handler feeds
//! into.

mod broadcaster;
pub mod config;
mod error;
mod multiplexer;

pub use broadcaster::{Broadcaster, SendResult};
pub use config::{BroadcastConfig, XmtpEnv};
pub use error::CoreError;
pub use multiplexer::Multiplexer;
