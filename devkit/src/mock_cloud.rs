/*!
Mock cloud channel.

The test plays the vendor: it reports status and power, drops the
connection, and inspects the commands the bridge sent.
*/

use ac_bridge::cloud::{CloudEvent, CloudHandle, CloudSource};
use ac_bridge::error::{BridgeError, Channel, Result};
use ac_bridge::models::{Command, FieldMap};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Clone)]
pub struct MockCloud {
    accepted: BTreeSet<String>,
    sent: Arc<Mutex<Vec<Command>>>,
    rejected_fields: Arc<Mutex<BTreeSet<String>>>,
    fail_commands: Arc<AtomicBool>,
    fail_close: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<Result<CloudEvent>>,
}

pub struct MockCloudEvents {
    rx: mpsc::UnboundedReceiver<Result<CloudEvent>>,
}

/// A cloud that accepts commands carrying only the given fields.
pub fn mock_cloud(accepted: &[&str]) -> (MockCloud, MockCloudEvents) {
    let (events, rx) = mpsc::unbounded_channel();
    let cloud = MockCloud {
        accepted: accepted.iter().map(|f| f.to_string()).collect(),
        sent: Arc::new(Mutex::new(Vec::new())),
        rejected_fields: Arc::new(Mutex::new(BTreeSet::new())),
        fail_commands: Arc::new(AtomicBool::new(false)),
        fail_close: Arc::new(AtomicBool::new(false)),
        closed: Arc::new(AtomicBool::new(false)),
        events,
    };
    (cloud, MockCloudEvents { rx })
}

impl MockCloud {
    pub fn connect(&self) {
        let _ = self.events.send(Ok(CloudEvent::Connected));
    }

    pub fn report_status(&self, device_id: &str, fields: FieldMap) {
        info!("[MOCK] [{}] status {:?}", device_id, fields);
        let status = CloudEvent::Status { device_id: device_id.to_string(), fields };
        let _ = self.events.send(Ok(status));
    }

    pub fn report_power(&self, device_id: &str, watts: f64) {
        let _ = self.events.send(Ok(CloudEvent::Power {
            device_id: device_id.to_string(),
            watts,
            at: OffsetDateTime::now_utc(),
        }));
    }

    pub fn drop_connection(&self, reason: &str) {
        let _ = self.events.send(Err(BridgeError::connection_lost(Channel::Cloud, reason)));
    }

    /// Commands carrying this field are refused as values the cloud cannot encode.
    pub fn reject_field(&self, field: &str) {
        self.rejected_fields.lock().insert(field.to_string());
    }

    /// Every later command fails with a fatal cloud error.
    pub fn fail_commands(&self) {
        self.fail_commands.store(true, Ordering::SeqCst);
    }

    /// Closing the channel reports an error (it is still marked closed).
    pub fn fail_close(&self) {
        self.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn sent_commands(&self) -> Vec<Command> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CloudHandle for MockCloud {
    fn command_fields(&self) -> BTreeSet<String> {
        self.accepted.clone()
    }

    async fn send_command(&self, device_id: &str, fields: FieldMap) -> Result<()> {
        if self.fail_commands.load(Ordering::SeqCst) {
            return Err(BridgeError::connection_lost(Channel::Cloud, "mock command failure"));
        }
        if let Some(field) = fields.keys().find(|f| self.rejected_fields.lock().contains(*f)) {
            return Err(BridgeError::InvalidCommand(format!("cannot encode {field}")));
        }
        self.sent.lock().push(Command { device_id: device_id.to_string(), fields });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(BridgeError::Protocol("mock close failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudSource for MockCloudEvents {
    async fn next_event(&mut self) -> Result<CloudEvent> {
        match self.rx.recv().await {
            Some(event) => event,
            None => Err(BridgeError::connection_lost(Channel::Cloud, "mock cloud dropped")),
        }
    }
}
