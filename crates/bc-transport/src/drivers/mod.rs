pub mod iroh_direct;
pub mod mqtt;
pub mod nostr;
pub mod waku;
pub mod xmtp;

pub use iroh_direct::IrohDriver;
pub use mqtt::MqttDriver;
pub use nostr::NostrDriver;
pub use waku::WakuDriver;
pub use xmtp::XmtpDriver;
