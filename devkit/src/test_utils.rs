/*!
Test harness for the AC bridge

Runs a real synchronization engine against the mock channels:
- Start/stop of the engine in a background task
- Driving both channels from the test
- Assertions on what reached the bus
*/

use crate::mock_bus::{mock_bus, MockBus};
use crate::mock_cloud::{mock_cloud, MockCloud};
use ac_bridge::error::Result as BridgeResult;
use ac_bridge::models::FieldMap;
use ac_bridge::{BridgeConfig, SyncEngine};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct TestHarness {
    pub bus: MockBus,
    pub cloud: MockCloud,
    pub config: BridgeConfig,
    engine: Option<JoinHandle<BridgeResult<()>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestHarness {
    /// Engine with default configuration; the cloud accepts the given command fields.
    pub fn new(accepted: &[&str]) -> Self {
        Self::with_config(BridgeConfig::default(), accepted)
    }

    pub fn with_config(config: BridgeConfig, accepted: &[&str]) -> Self {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ac_bridge=debug")),
            )
            .try_init()
            .ok();

        let (bus, bus_events) = mock_bus();
        let (cloud, cloud_events) = mock_cloud(accepted);
        let engine = SyncEngine::new(&config, Arc::new(bus.clone()), Arc::new(cloud.clone()));
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(engine.run(bus_events, cloud_events, async {
            rx.await.ok();
        }));

        Self { bus, cloud, config, engine: Some(handle), shutdown: Some(tx) }
    }

    /// Both channels report an established connection.
    pub async fn connect_all(&self) {
        self.bus.connect();
        self.cloud.connect();
        self.settle().await;
    }

    /// Lets the engine process everything queued so far.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    pub async fn report_status(&self, device_id: &str, fields: Value) {
        self.cloud.report_status(device_id, AcMessageBuilder::fields(fields));
        self.settle().await;
    }

    pub async fn send_command(&self, device_id: &str, payload: Value) {
        let topic = self.config.topics.device_command(device_id);
        self.bus.simulate_incoming(&topic, payload.to_string());
        self.settle().await;
    }

    /// Requests a graceful stop and returns what the engine returned.
    pub async fn shutdown(&mut self) -> Result<BridgeResult<()>> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.join().await
    }

    /// Waits for the engine to stop on its own.
    pub async fn join(&mut self) -> Result<BridgeResult<()>> {
        let handle = self.engine.take().ok_or_else(|| anyhow::anyhow!("engine already joined"))?;
        let outcome = tokio::time::timeout(Duration::from_secs(30), handle).await??;
        info!("Engine stopped: {:?}", outcome.as_ref().err());
        Ok(outcome)
    }

    pub fn is_running(&self) -> bool {
        self.engine.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Status payloads published for a device, oldest first.
    pub fn status_updates(&self, device_id: &str) -> Vec<Value> {
        self.bus.json_messages(&self.config.topics.device_status(device_id))
    }

    pub fn power_updates(&self, device_id: &str) -> Vec<Value> {
        self.bus.json_messages(&self.config.topics.device_power(device_id))
    }

    /// Every value published on the bridge status topic.
    pub fn liveness_updates(&self) -> Vec<String> {
        self.bus.text_messages(&self.config.topics.bridge_status())
    }

    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> Result<Option<Value>> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if let Some(msg) = self.bus.json_messages(topic).pop() {
                return Ok(Some(msg));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        warn!("Timeout waiting for message on {}", topic);
        Ok(None)
    }

    pub fn assert_message_sent(&self, topic: &str, expected: &Value) -> Result<()> {
        if self.bus.json_messages(topic).iter().any(|m| m == expected) {
            return Ok(());
        }
        anyhow::bail!("Expected message not found on topic: {}", topic);
    }

    /// Checks a dotted path in the latest message on a topic.
    pub fn assert_field_equals(
        &self,
        topic: &str,
        field_path: &str,
        expected: &Value,
    ) -> Result<()> {
        let Some(msg) = self.bus.json_messages(topic).pop() else {
            anyhow::bail!("No message on {}", topic);
        };
        match get_nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!(
                "Field '{}' mismatch: expected {:?}, got {:?}",
                field_path,
                expected,
                actual
            ),
            None => {
                anyhow::bail!("Field '{}' not found in latest message on {}", field_path, topic)
            }
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let messages = self.bus.published_messages();
        let mut topic_counts = HashMap::new();
        for msg in &messages {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }
        TestStats {
            total_messages: messages.len(),
            topic_counts,
            subscriptions: self.bus.subscriptions(),
            commands_sent: self.cloud.sent_commands().len(),
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        if let Some(handle) = self.engine.take() {
            handle.abort();
        }
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| current.as_object()?.get(part))
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub subscriptions: Vec<String>,
    pub commands_sent: usize,
}

/// Builds the payloads the bridge exchanges.
pub struct AcMessageBuilder;

impl AcMessageBuilder {
    /// Field map from a JSON object; non-scalar values are skipped.
    pub fn fields(value: Value) -> FieldMap {
        match value {
            Value::Object(map) => map
                .into_iter()
                .filter_map(|(k, v)| ac_bridge::models::FieldValue::from_json(v).map(|v| (k, v)))
                .collect(),
            _ => FieldMap::new(),
        }
    }

    /// `{"Name": .., "Status": {..}}`
    pub fn status(device_id: &str, fields: Value) -> Value {
        serde_json::json!({ "Name": device_id, "Status": fields })
    }

    pub fn power(device_id: &str, watts: f64) -> Value {
        serde_json::json!({ "Name": device_id, "Power": watts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builders() {
        let fields =
            AcMessageBuilder::fields(json!({"mode": "cool", "power": 500, "nested": {"x": 1}}));
        assert_eq!(fields.len(), 2);
        let status = AcMessageBuilder::status("den", json!({"mode": "cool"}));
        assert_eq!(status["Status"]["mode"], "cool");
        assert_eq!(AcMessageBuilder::power("den", 450.0)["Power"], 450.0);
    }

    #[test]
    fn test_nested_field_lookup() {
        let msg = json!({"Name": "den", "Status": {"mode": "heat"}});
        assert_eq!(get_nested_field(&msg, "Status.mode"), Some(&json!("heat")));
        assert_eq!(get_nested_field(&msg, "Status.fan"), None);
        assert_eq!(get_nested_field(&msg, "Name.x"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_harness_publishes_online_after_both_channels() {
        let mut harness = TestHarness::new(&["mode"]);
        harness.connect_all().await;

        assert_eq!(harness.liveness_updates(), vec!["online"]);
        assert_eq!(harness.bus.subscriptions(), vec!["ac/+/cmd", "ac/cmd"]);

        let outcome = harness.shutdown().await.unwrap();
        assert!(outcome.is_ok());
        assert_eq!(harness.get_stats().topic_counts["ac/status"], 2);
    }
}
