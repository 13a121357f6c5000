//! AC Bridge - keeps cloud-connected air-conditioning units in sync with an MQTT bus.
//!
//! Device status from the vendor cloud is published as deltas and periodic full
//! snapshots, commands from the bus are validated and forwarded to the cloud, and
//! a retained flag tells subscribers whether the bridge is online.

pub mod bus;
pub mod cloud;
pub mod config;
pub mod engine;
pub mod error;
pub mod liveness;
pub mod models;
pub mod publisher;
pub mod router;
pub mod shutdown;
pub mod store;
pub mod topics;

pub use config::BridgeConfig;
pub use engine::SyncEngine;
pub use error::{BridgeError, Channel, Result};
