//! Status and power publication for each device.
//!
//! Every publication for a device goes through that device's lane, a mutex held
//! from the store read until the bus accepted the message. A timer snapshot can
//! therefore never overtake a delta computed before it.

use crate::bus::BusSink;
use crate::error::Result;
use crate::models::{FieldMap, PowerPayload, StatusUpdate, UpdateKind};
use crate::store::DeviceStore;
use crate::topics::Topics;
use rumqttc::QoS;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

/// What a status event led to.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPublication {
    pub first_observation: bool,
    /// `None` when nothing changed.
    pub published: Option<StatusUpdate>,
}

pub struct DeltaPublisher {
    store: DeviceStore,
    bus: Arc<dyn BusSink>,
    topics: Topics,
    qos: QoS,
    lanes: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeltaPublisher {
    pub fn new(store: DeviceStore, bus: Arc<dyn BusSink>, topics: Topics, qos: QoS) -> Self {
        Self { store, bus, topics, qos, lanes: parking_lot::Mutex::new(HashMap::new()) }
    }

    pub fn store(&self) -> &DeviceStore {
        &self.store
    }

    fn lane(&self, device_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.lanes.lock().entry(device_id.to_string()).or_default().clone()
    }

    /// Merges a status event and publishes the result: a full snapshot on first
    /// observation, otherwise only the changed fields.
    pub async fn on_status_event(
        &self,
        device_id: &str,
        fields: FieldMap,
    ) -> Result<StatusPublication> {
        let lane = self.lane(device_id);
        let _guard = lane.lock().await;

        let applied = self.store.apply_status_event(device_id, fields);
        let update = if applied.first_observation {
            let fields = self.store.full_snapshot(device_id).unwrap_or_default();
            info!("[{}] new device, {} fields", device_id, fields.len());
            StatusUpdate { device_id: device_id.to_string(), kind: UpdateKind::Full, fields }
        } else if applied.changed.is_empty() {
            debug!("[{}] no change", device_id);
            return Ok(StatusPublication { first_observation: false, published: None });
        } else {
            StatusUpdate {
                device_id: device_id.to_string(),
                kind: UpdateKind::Delta,
                fields: applied.changed,
            }
        };

        self.publish_status(&update).await?;
        Ok(StatusPublication {
            first_observation: applied.first_observation,
            published: Some(update),
        })
    }

    /// Publishes every field currently known for the device.
    pub async fn publish_full_snapshot(&self, device_id: &str) -> Result<()> {
        let lane = self.lane(device_id);
        let _guard = lane.lock().await;

        let Some(fields) = self.store.full_snapshot(device_id) else {
            warn!("[{}] snapshot requested for unknown device", device_id);
            return Ok(());
        };
        let update =
            StatusUpdate { device_id: device_id.to_string(), kind: UpdateKind::Full, fields };
        self.publish_status(&update).await
    }

    pub fn record_power(&self, device_id: &str, watts: f64, at: OffsetDateTime) {
        if !self.store.record_power_sample(device_id, watts, at) {
            warn!("[{}] power sample for unknown device dropped", device_id);
        }
    }

    /// Drains the averaging window and publishes its mean. Returns what was
    /// published; an empty window publishes nothing.
    pub async fn publish_power_average(&self, device_id: &str) -> Result<Option<f64>> {
        let lane = self.lane(device_id);
        let _guard = lane.lock().await;

        let Some(power) = self.store.drain_power_average(device_id) else {
            debug!("[{}] no power samples in window", device_id);
            return Ok(None);
        };
        let payload = serde_json::to_vec(&PowerPayload { name: device_id.to_string(), power })?;
        self.bus.publish(&self.topics.device_power(device_id), self.qos, false, payload).await?;
        debug!("[{}] power {:.1} W", device_id, power);
        Ok(Some(power))
    }

    async fn publish_status(&self, update: &StatusUpdate) -> Result<()> {
        let payload = serde_json::to_vec(&update.to_payload())?;
        self.bus
            .publish(&self.topics.device_status(&update.device_id), self.qos, false, payload)
            .await?;
        debug!(
            "[{}] published {:?} status ({} fields)",
            update.device_id,
            update.kind,
            update.fields.len()
        );
        self.store.mark_published(&update.device_id, &update.fields);
        Ok(())
    }
}
