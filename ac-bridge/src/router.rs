//! Inbound bus messages: device commands and bridge-wide requests.

use crate::bus::BusSink;
use crate::cloud::CloudHandle;
use crate::error::{BridgeError, Result};
use crate::models::{parse_field_payload, Command, FieldMap, ParsedFields, PayloadError};
use crate::store::DeviceStore;
use crate::topics::Topics;
use rumqttc::QoS;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bridge-wide request on the general command topic that refreshes every device.
const REFRESH_REQUEST: &str = "status";

#[derive(Debug, Clone, PartialEq)]
pub enum DropReason {
    UnknownDevice,
    Malformed(PayloadError),
    NoValidFields,
    /// The cloud could not encode a value.
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Forwarded(Command),
    Dropped(DropReason),
    /// Every known device should get a full snapshot now.
    RefreshAll,
    Ignored,
}

pub struct CommandRouter {
    store: DeviceStore,
    cloud: Arc<dyn CloudHandle>,
    bus: Arc<dyn BusSink>,
    topics: Topics,
    qos: QoS,
    accepted: BTreeSet<String>,
}

impl CommandRouter {
    pub fn new(
        store: DeviceStore,
        cloud: Arc<dyn CloudHandle>,
        bus: Arc<dyn BusSink>,
        topics: Topics,
        qos: QoS,
    ) -> Self {
        let accepted = cloud.command_fields();
        Self { store, cloud, bus, topics, qos, accepted }
    }

    pub async fn subscribe(&self) -> Result<()> {
        self.bus.subscribe(&self.topics.command_wildcard(), self.qos).await?;
        self.bus.subscribe(&self.topics.general_command(), self.qos).await?;
        info!(
            "Listening on {} and {}",
            self.topics.command_wildcard(),
            self.topics.general_command()
        );
        Ok(())
    }

    /// Handles one inbound message. Only errors that must stop the bridge are
    /// returned; everything else ends up in the outcome.
    pub async fn route(&self, topic: &str, payload: &[u8]) -> Result<RouteOutcome> {
        if topic == self.topics.general_command() {
            return Ok(self.general_command(payload));
        }
        match self.topics.command_device(topic) {
            Some(device_id) => self.device_command(device_id, payload).await,
            None => {
                warn!("Unexpected message on {}", topic);
                Ok(RouteOutcome::Ignored)
            }
        }
    }

    fn general_command(&self, payload: &[u8]) -> RouteOutcome {
        let request = String::from_utf8_lossy(payload);
        if request.trim() == REFRESH_REQUEST {
            info!("Status refresh requested");
            RouteOutcome::RefreshAll
        } else {
            warn!("General command {:?} not implemented", request);
            RouteOutcome::Ignored
        }
    }

    async fn device_command(&self, device_id: &str, payload: &[u8]) -> Result<RouteOutcome> {
        if !self.store.contains(device_id) {
            warn!("[{}] command for unknown device dropped", device_id);
            return Ok(RouteOutcome::Dropped(DropReason::UnknownDevice));
        }

        let parsed = match parse_field_payload(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("[{}] malformed command dropped: {}", device_id, e);
                return Ok(RouteOutcome::Dropped(DropReason::Malformed(e)));
            }
        };

        let fields = self.validate(device_id, parsed);
        if fields.is_empty() {
            warn!("[{}] command has no valid field, nothing sent", device_id);
            return Ok(RouteOutcome::Dropped(DropReason::NoValidFields));
        }

        debug!("[{}] forwarding {:?}", device_id, fields);
        match self.cloud.send_command(device_id, fields.clone()).await {
            Ok(()) => {
                let command = Command { device_id: device_id.to_string(), fields };
                Ok(RouteOutcome::Forwarded(command))
            }
            Err(BridgeError::InvalidCommand(reason)) => {
                warn!("[{}] command rejected: {}", device_id, reason);
                Ok(RouteOutcome::Dropped(DropReason::Rejected(reason)))
            }
            Err(e) => Err(e),
        }
    }

    /// Keeps the fields the cloud accepts and logs the rest.
    fn validate(&self, device_id: &str, parsed: ParsedFields) -> FieldMap {
        for name in &parsed.rejected {
            warn!("[{}] field {} has no scalar value, dropped", device_id, name);
        }
        parsed
            .fields
            .into_iter()
            .filter(|(name, _)| {
                let known = self.accepted.contains(name);
                if !known {
                    warn!("[{}] unknown command field {}, dropped", device_id, name);
                }
                known
            })
            .collect()
    }
}
