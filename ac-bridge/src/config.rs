use crate::topics::Topics;
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {name}: {value}")]
    Env { name: &'static str, value: String },
    #[error("mqtt.qos must be 0, 1 or 2, got {0}")]
    InvalidQos(u8),
    #[error("missing cloud credentials (cloud.username / cloud.password)")]
    MissingCredentials,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BridgeConfig {
    pub mqtt: MqttConf,
    pub topics: Topics,
    pub timers: TimerConf,
    pub cloud: CloudConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// QoS for status, power and liveness publications (0, 1 or 2).
    pub qos: u8,
    /// How long shutdown waits for the event loop to flush the last messages.
    pub shutdown_grace_secs: u64,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: None,
            keep_alive_secs: 30,
            username: None,
            password: None,
            qos: 2,
            shutdown_grace_secs: 5,
        }
    }
}

impl MqttConf {
    /// The configured QoS. `validate` rejects values above 2 at load time.
    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.qos > 2 {
            return Err(ConfigError::InvalidQos(self.qos));
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TimerConf {
    pub full_snapshot_secs: u64,
    pub power_average_secs: u64,
}

impl Default for TimerConf {
    fn default() -> Self {
        Self { full_snapshot_secs: 5 * 60, power_average_secs: 10 * 60 }
    }
}

impl TimerConf {
    pub fn full_snapshot(&self) -> Duration {
        Duration::from_secs(self.full_snapshot_secs.max(1))
    }

    pub fn power_average(&self) -> Duration {
        Duration::from_secs(self.power_average_secs.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CloudConf {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Suffix of the client id registered with the vendor; the username is prepended.
    pub device_id: String,
    /// Skips client registration when already known.
    pub sas_token: Option<String>,
    pub state_poll_secs: u64,
    pub energy_poll_secs: u64,
}

impl Default for CloudConf {
    fn default() -> Self {
        Self {
            base_url: "https://mobileapi.toshibahomeaccontrols.com".into(),
            username: None,
            password: None,
            device_id: "3e6e4eb5f0e5aa46".into(),
            sas_token: None,
            state_poll_secs: 60,
            energy_poll_secs: 120,
        }
    }
}

impl CloudConf {
    pub fn credentials(&self) -> Result<(&str, &str), ConfigError> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Ok((user, pass)),
            _ => Err(ConfigError::MissingCredentials),
        }
    }
}

/// Loads the YAML file named by `AC_BRIDGE_CONFIG` (default `ac-bridge.yaml`),
/// then applies environment overrides. A missing file means defaults.
pub async fn load_config() -> Result<BridgeConfig, ConfigError> {
    let path = std::env::var("AC_BRIDGE_CONFIG").unwrap_or_else(|_| "ac-bridge.yaml".into());
    let mut cfg = load_config_file(&path).await?;
    apply_env_overrides(&mut cfg, |name| std::env::var(name).ok())?;
    cfg.mqtt.validate()?;
    Ok(cfg)
}

pub async fn load_config_file(path: &str) -> Result<BridgeConfig, ConfigError> {
    if !Path::new(path).exists() {
        warn!("no {path}, using default config");
        return Ok(BridgeConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io { path: path.to_string(), source })?;
    let cfg = parse_config(&txt)
        .map_err(|source| ConfigError::Yaml { path: path.to_string(), source })?;
    cfg.mqtt.validate()?;
    Ok(cfg)
}

pub fn parse_config(txt: &str) -> Result<BridgeConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(BridgeConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub fn apply_env_overrides<F>(cfg: &mut BridgeConfig, var: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = var("AC_BRIDGE_MQTT_HOST") {
        cfg.mqtt.host = host;
    }
    if let Some(port) = var("AC_BRIDGE_MQTT_PORT") {
        cfg.mqtt.port = port
            .parse()
            .map_err(|_| ConfigError::Env { name: "AC_BRIDGE_MQTT_PORT", value: port })?;
    }
    if let Some(user) = var("AC_BRIDGE_CLOUD_USERNAME") {
        cfg.cloud.username = Some(user);
    }
    if let Some(pass) = var("AC_BRIDGE_CLOUD_PASSWORD") {
        cfg.cloud.password = Some(pass);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.qos(), QoS::ExactlyOnce);
        assert_eq!(cfg.timers.full_snapshot(), Duration::from_secs(300));
        assert_eq!(cfg.timers.power_average(), Duration::from_secs(600));
        assert_eq!(cfg.topics.bridge_status(), "ac/status");
        assert!(matches!(cfg.cloud.credentials(), Err(ConfigError::MissingCredentials)));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = parse_config(concat!(
            "mqtt:\n  host: broker.lan\n  qos: 1\n",
            "topics:\n  root: hvac\n",
            "timers:\n  full_snapshot_secs: 60\n",
        ))
        .unwrap();
        assert_eq!(cfg.mqtt.host, "broker.lan");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.qos(), QoS::AtLeastOnce);
        assert_eq!(cfg.topics.device_status("den"), "hvac/den/status");
        assert_eq!(cfg.timers.full_snapshot_secs, 60);
        assert_eq!(cfg.timers.power_average_secs, 600);
    }

    #[test]
    fn test_empty_and_invalid_yaml() {
        assert_eq!(parse_config("  \n").unwrap().mqtt.host, "localhost");
        assert!(parse_config("mqtt: [nope").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("AC_BRIDGE_MQTT_HOST", "10.0.0.2"),
            ("AC_BRIDGE_MQTT_PORT", "1884"),
            ("AC_BRIDGE_CLOUD_USERNAME", "me@example.com"),
            ("AC_BRIDGE_CLOUD_PASSWORD", "secret"),
        ]
        .into_iter()
        .collect();
        let mut cfg = BridgeConfig::default();
        apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.mqtt.host, "10.0.0.2");
        assert_eq!(cfg.mqtt.port, 1884);
        assert_eq!(cfg.cloud.credentials().unwrap(), ("me@example.com", "secret"));
    }

    #[test]
    fn test_bad_port_override() {
        let mut cfg = BridgeConfig::default();
        let err = apply_env_overrides(&mut cfg, |k| {
            (k == "AC_BRIDGE_MQTT_PORT").then(|| "abc".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Env { name: "AC_BRIDGE_MQTT_PORT", .. }));
    }

    #[test]
    fn test_qos_above_two_is_rejected() {
        let cfg = parse_config("mqtt:\n  qos: 3\n").unwrap();
        assert!(matches!(cfg.mqtt.validate(), Err(ConfigError::InvalidQos(3))));
        assert!(BridgeConfig::default().mqtt.validate().is_ok());
    }

    #[tokio::test]
    async fn test_config_file_with_bad_qos_fails_to_load() {
        let path = std::env::temp_dir().join(format!("ac-bridge-qos-{}.yaml", std::process::id()));
        fs::write(&path, "mqtt:\n  qos: 7\n").await.unwrap();
        let loaded = load_config_file(&path.to_string_lossy()).await;
        fs::remove_file(&path).await.ok();
        assert!(matches!(loaded, Err(ConfigError::InvalidQos(7))));
    }

    #[tokio::test]
    async fn test_missing_file_means_defaults() {
        let cfg = load_config_file("/nonexistent/ac-bridge.yaml").await.unwrap();
        assert_eq!(cfg.timers, TimerConf::default());
    }
}
