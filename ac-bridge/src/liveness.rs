/*!
 * LIVENESS REPORTER - Retained online/offline flag on `ac/status`
 *
 * ROLE: tracks whether the cloud and bus channels are both established and
 * publishes each online/offline transition exactly once.
 *
 * The bus connection carries a last will `offline` on the same topic, so a bus
 * loss is recorded but never published by us.
 */

use crate::bus::BusSink;
use crate::error::{Channel, Result};
use crate::topics::Topics;
use rumqttc::QoS;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// Both channel flags plus the derived value. Starts offline with both channels down.
#[derive(Debug, Clone)]
pub struct ConnectivityState {
    cloud_up: bool,
    bus_up: bool,
    current: Connectivity,
}

impl Default for ConnectivityState {
    fn default() -> Self {
        Self { cloud_up: false, bus_up: false, current: Connectivity::Offline }
    }
}

impl ConnectivityState {
    pub fn current(&self) -> Connectivity {
        self.current
    }

    /// Returns the new value when this call changed it.
    pub fn channel_up(&mut self, channel: Channel) -> Option<Connectivity> {
        self.set(channel, true)
    }

    pub fn channel_down(&mut self, channel: Channel) -> Option<Connectivity> {
        self.set(channel, false)
    }

    fn set(&mut self, channel: Channel, up: bool) -> Option<Connectivity> {
        match channel {
            Channel::Cloud => self.cloud_up = up,
            Channel::Bus => self.bus_up = up,
        }
        let next = if self.cloud_up && self.bus_up {
            Connectivity::Online
        } else {
            Connectivity::Offline
        };
        if next == self.current {
            return None;
        }
        self.current = next;
        Some(next)
    }
}

pub struct LivenessReporter {
    // Held across the publish so transitions reach the broker in order.
    state: Mutex<ConnectivityState>,
    bus: Arc<dyn BusSink>,
    topics: Topics,
    qos: QoS,
}

impl LivenessReporter {
    pub fn new(bus: Arc<dyn BusSink>, topics: Topics, qos: QoS) -> Self {
        Self { state: Mutex::new(ConnectivityState::default()), bus, topics, qos }
    }

    pub async fn channel_up(&self, channel: Channel) -> Result<()> {
        let mut state = self.state.lock().await;
        debug!("{} channel up", channel);
        if let Some(Connectivity::Online) = state.channel_up(channel) {
            self.publish(&self.topics.online).await?;
            info!("Bridge online");
        }
        Ok(())
    }

    pub async fn channel_down(&self, channel: Channel) -> Result<()> {
        let mut state = self.state.lock().await;
        debug!("{} channel down", channel);
        if let Some(Connectivity::Offline) = state.channel_down(channel) {
            if channel == Channel::Bus {
                info!("Bridge offline (bus lost, last will applies)");
                return Ok(());
            }
            self.publish(&self.topics.offline).await?;
            info!("Bridge offline");
        }
        Ok(())
    }

    async fn publish(&self, value: &str) -> Result<()> {
        self.bus
            .publish(&self.topics.bridge_status(), self.qos, true, value.as_bytes().to_vec())
            .await
    }
}
