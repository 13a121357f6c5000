//! Cloud device channel: where device status comes from and where commands go.

pub mod fcu;
pub mod toshiba;

use crate::error::Result;
use crate::models::FieldMap;
use async_trait::async_trait;
use std::collections::BTreeSet;
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq)]
pub enum CloudEvent {
    /// The vendor session is established and devices are known.
    Connected,
    /// Reported fields of one device. Absent fields are simply not included.
    Status { device_id: String, fields: FieldMap },
    /// One measured wattage reading.
    Power { device_id: String, watts: f64, at: OffsetDateTime },
}

/// Command side of the cloud channel.
#[async_trait]
pub trait CloudHandle: Send + Sync {
    /// Field names the vendor accepts in a command.
    fn command_fields(&self) -> BTreeSet<String>;

    /// Sends every field in one call. Returns `InvalidCommand` when a value cannot
    /// be encoded; any other error is fatal.
    async fn send_command(&self, device_id: &str, fields: FieldMap) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Event side of the cloud channel. `next_event` must be cancel-safe.
#[async_trait]
pub trait CloudSource: Send {
    async fn next_event(&mut self) -> Result<CloudEvent>;
}
