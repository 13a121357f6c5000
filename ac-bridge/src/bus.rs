//! Message bus channel: the MQTT side of the bridge.
//!
//! The bus is split like rumqttc itself: a cloneable sink ([`BusSink`]) used to
//! publish and subscribe, and an event source ([`BusSource`]) that must be
//! polled continuously for anything to reach the broker.

use crate::config::MqttConf;
use crate::error::{BridgeError, Channel, Result};
use crate::topics::Topics;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use std::time::Duration;
use tracing::{debug, info};

/// Something the bus reported.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// The broker accepted the connection.
    Connected,
    /// A message arrived on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// Our own disconnect went out; the source is finished.
    Closed,
}

#[async_trait]
pub trait BusSink: Send + Sync {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()>;
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BusSource: Send {
    async fn next_event(&mut self) -> Result<BusEvent>;
}

#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
}

pub struct MqttBusEvents {
    eventloop: EventLoop,
}

/// Builds the MQTT client. Nothing touches the network until the returned
/// event source is polled.
pub fn create_mqtt_client(cfg: &MqttConf, topics: &Topics) -> (MqttBus, MqttBusEvents) {
    let client_id = cfg.client_id.clone().unwrap_or_else(default_client_id);
    let mut opts = MqttOptions::new(client_id.clone(), &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    opts.set_last_will(LastWill::new(
        topics.bridge_status(),
        topics.offline.clone(),
        cfg.qos(),
        true,
    ));
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(user.clone(), pass.clone());
    }

    info!("MQTT client {} -> {}:{}", client_id, cfg.host, cfg.port);
    let (client, eventloop) = AsyncClient::new(opts, 64);
    (MqttBus { client }, MqttBusEvents { eventloop })
}

fn default_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("ac-bridge-{}", &id[..8])
}

#[async_trait]
impl BusSink for MqttBus {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        self.client.publish(topic, qos, retain, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.client.subscribe(topic, qos).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.client.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl BusSource for MqttBusEvents {
    async fn next_event(&mut self) -> Result<BusEvent> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    debug!("MQTT connack: {:?}", ack.code);
                    return Ok(BusEvent::Connected);
                }
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    return Ok(BusEvent::Message { topic: p.topic, payload: p.payload.to_vec() });
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    let reason = "broker sent disconnect";
                    return Err(BridgeError::connection_lost(Channel::Bus, reason));
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(BusEvent::Closed),
                Ok(_) => {}
                Err(e) => return Err(BridgeError::connection_lost(Channel::Bus, e.to_string())),
            }
        }
    }
}
