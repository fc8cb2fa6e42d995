//! Driver enablement and per-protocol configuration (spec.md §4.5).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmtpEnv {
    Dev,
    Production,
    Local,
}

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub xmtp_enabled: bool,
    pub nostr_enabled: bool,
    pub waku_enabled: bool,
    pub mqtt_enabled: bool,
    pub iroh_enabled: bool,

    pub xmtp_env: XmtpEnv,
    pub nostr_relays: Vec<String>,
    pub mqtt_brokers: Vec<String>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        BroadcastConfig {
            xmtp_enabled: true,
            nostr_enabled: true,
            waku_enabled: true,
            mqtt_enabled: true,
            iroh_enabled: true,
            xmtp_env: XmtpEnv::Dev,
            nostr_relays: vec![
                "wss://relay.damus.io".to_string(),
                "wss://nos.lol".to_string(),
                "wss://relay.nostr.band".to_string(),
            ],
            mqtt_brokers: vec![
                "mqtt://broker.hivemq.com:1883".to_string(),
                "mqtt://broker.emqx.io:1883".to_string(),
                "mqtt://test.mosquitto.org:1883".to_string(),
            ],
        }
    }
}
