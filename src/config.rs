//! YAML-layered configuration loader, modeled on `sven-config::loader`:
//! several well-known paths are each parsed as a YAML layer and shallow-
//! merged, later layers winning, with an explicit `--config` override
//! merged in last.

use std::path::{Path, PathBuf};

use anyhow::Context;
use bc_core::{BroadcastConfig, XmtpEnv};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct FileConfig {
    xmtp_enabled: Option<bool>,
    nostr_enabled: Option<bool>,
    waku_enabled: Option<bool>,
    mqtt_enabled: Option<bool>,
    iroh_enabled: Option<bool>,
    xmtp_env: Option<String>,
    nostr_relays: Option<Vec<String>>,
    mqtt_brokers: Option<Vec<String>>,
    store_path: Option<PathBuf>,
}

pub struct LoadedConfig {
    pub broadcast: BroadcastConfig,
    pub store_path: PathBuf,
}

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/broadcast-dm/config.yaml"));
    paths.push(PathBuf::from("/etc/broadcast-dm/config.yml"));

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/broadcast-dm/config.yaml"));
        paths.push(home.join(".config/broadcast-dm/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("broadcast-dm/config.yaml"));
        paths.push(cfg.join("broadcast-dm/config.yml"));
    }

    paths.push(PathBuf::from(".broadcast-dm.yaml"));
    paths.push(PathBuf::from(".broadcast-dm.yml"));

    paths
}

/// Load configuration by merging every discovered YAML layer. `extra` is an
/// explicit path (the `--config` flag) merged in last, after every
/// auto-discovered layer.
pub fn load(extra: Option<&Path>) -> anyhow::Result<LoadedConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            tracing::debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        tracing::debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let file_config: FileConfig = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        FileConfig::default()
    } else {
        serde_yaml::from_value(merged).context("parsing merged configuration")?
    };

    let mut broadcast = BroadcastConfig::default();
    if let Some(v) = file_config.xmtp_enabled {
        broadcast.xmtp_enabled = v;
    }
    if let Some(v) = file_config.nostr_enabled {
        broadcast.nostr_enabled = v;
    }
    if let Some(v) = file_config.waku_enabled {
        broadcast.waku_enabled = v;
    }
    if let Some(v) = file_config.mqtt_enabled {
        broadcast.mqtt_enabled = v;
    }
    if let Some(v) = file_config.iroh_enabled {
        broadcast.iroh_enabled = v;
    }
    if let Some(env) = file_config.xmtp_env {
        broadcast.xmtp_env = match env.as_str() {
            "dev" => XmtpEnv::Dev,
            "production" => XmtpEnv::Production,
            "local" => XmtpEnv::Local,
            other => anyhow::bail!("unknown xmtpEnv {other:?}, expected dev|production|local"),
        };
    }
    if let Some(relays) = file_config.nostr_relays {
        broadcast.nostr_relays = relays;
    }
    if let Some(brokers) = file_config.mqtt_brokers {
        broadcast.mqtt_brokers = brokers;
    }

    let store_path = file_config.store_path.unwrap_or_else(default_store_path);

    Ok(LoadedConfig { broadcast, store_path })
}

fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("broadcast-dm")
        .join("evidence.sqlite3")
}

/// Deep-merge `src` into `dst`; `src` wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d.entry(k).or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/broadcast_dm_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_with_no_extra_path_returns_defaults() {
        let cfg = load(None).unwrap();
        assert!(cfg.broadcast.xmtp_enabled);
        assert_eq!(cfg.broadcast.nostr_relays.len(), 3);
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "xmtpEnabled: false\nnostrRelays:\n  - wss://example.org").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert!(!cfg.broadcast.xmtp_enabled);
        assert_eq!(cfg.broadcast.nostr_relays, vec!["wss://example.org".to_string()]);
    }

    #[test]
    fn load_rejects_unknown_xmtp_env() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "xmtpEnv: staging").unwrap();
        assert!(load(Some(f.path())).is_err());
    }
}
