use serde::{Deserialize, Serialize};

/// One of the five transports a [`crate::Identity`] can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Wallet-keyed encrypted DM transport (D1).
    Xmtp,
    /// Signed-event relay transport (D2).
    Nostr,
    /// Broker pub/sub fabric (D3).
    Mqtt,
    /// P2P pub/sub mesh (D4).
    Waku,
    /// Direct P2P bidirectional stream transport (D5).
    Iroh,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Xmtp,
        Protocol::Nostr,
        Protocol::Mqtt,
        Protocol::Waku,
        Protocol::Iroh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Xmtp => "xmtp",
            Protocol::Nostr => "nostr",
            Protocol::Mqtt => "mqtt",
            Protocol::Waku => "waku",
            Protocol::Iroh => "iroh",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xmtp" => Ok(Protocol::Xmtp),
            "nostr" => Ok(Protocol::Nostr),
            "mqtt" => Ok(Protocol::Mqtt),
            "waku" => Ok(Protocol::Waku),
            "iroh" => Ok(Protocol::Iroh),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}
