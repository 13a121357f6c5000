/*!
 * SYNCHRONIZATION ENGINE - Coordinating loop between the cloud and the bus
 *
 * ROLE: runs each inbound source in its own task, dispatches their events to
 * the publisher, router and liveness reporter, and owns the per-device timers.
 *
 * FAILURE: there is no retry. The first fatal error (or a shutdown request)
 * runs one shutdown routine: timers and the cloud source stop, `offline` goes
 * out while the bus is still up, both channels close, and the bus event loop
 * gets a bounded time to flush.
 */

use crate::bus::{BusEvent, BusSink, BusSource};
use crate::cloud::{CloudEvent, CloudHandle, CloudSource};
use crate::config::{BridgeConfig, TimerConf};
use crate::error::{BridgeError, Channel, Result};
use crate::liveness::LivenessReporter;
use crate::publisher::DeltaPublisher;
use crate::router::{CommandRouter, RouteOutcome};
use crate::store::DeviceStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

enum Inbound {
    Bus(Result<BusEvent>),
    Cloud(Result<CloudEvent>),
}

pub struct SyncEngine {
    bus: Arc<dyn BusSink>,
    cloud: Arc<dyn CloudHandle>,
    publisher: Arc<DeltaPublisher>,
    router: CommandRouter,
    liveness: LivenessReporter,
    timers: TimerConf,
    shutdown_grace: Duration,
}

impl SyncEngine {
    pub fn new(cfg: &BridgeConfig, bus: Arc<dyn BusSink>, cloud: Arc<dyn CloudHandle>) -> Self {
        let store = DeviceStore::new();
        let qos = cfg.mqtt.qos();
        let publisher =
            Arc::new(DeltaPublisher::new(store.clone(), bus.clone(), cfg.topics.clone(), qos));
        let router =
            CommandRouter::new(store, cloud.clone(), bus.clone(), cfg.topics.clone(), qos);
        let liveness = LivenessReporter::new(bus.clone(), cfg.topics.clone(), qos);
        Self {
            bus,
            cloud,
            publisher,
            router,
            liveness,
            timers: cfg.timers.clone(),
            shutdown_grace: cfg.mqtt.shutdown_grace(),
        }
    }

    pub fn store(&self) -> &DeviceStore {
        self.publisher.store()
    }

    /// Runs until a fatal error or until `shutdown` resolves. A requested
    /// shutdown returns `Ok`; every other exit returns the error that caused it.
    pub async fn run<B, C, F>(self, bus_events: B, cloud_events: C, shutdown: F) -> Result<()>
    where
        B: BusSource + 'static,
        C: CloudSource + 'static,
        F: Future<Output = ()>,
    {
        // Unbounded so the bus source keeps being polled while a publish waits on it.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bus_task = tokio::spawn(forward_bus(bus_events, tx.clone()));
        let cloud_task = tokio::spawn(forward_cloud(cloud_events, tx));
        let mut timers: JoinSet<Result<()>> = JoinSet::new();
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                Some(inbound) = rx.recv() => {
                    if let Err(e) = self.dispatch(inbound, &mut timers).await {
                        break Err(e);
                    }
                }
                Some(joined) = timers.join_next(), if !timers.is_empty() => {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => break Err(e),
                        Err(source) => {
                            break Err(BridgeError::Task { name: "device timer".into(), source })
                        }
                    }
                }
            }
        };

        if let Err(e) = &outcome {
            error!("Fatal: {}", e);
        }
        self.shutdown(timers, cloud_task, bus_task, rx).await;
        outcome
    }

    async fn dispatch(&self, inbound: Inbound, timers: &mut JoinSet<Result<()>>) -> Result<()> {
        match inbound {
            Inbound::Bus(Ok(BusEvent::Connected)) => {
                info!("Bus connected");
                self.liveness.channel_up(Channel::Bus).await?;
                self.router.subscribe().await?;
            }
            Inbound::Bus(Ok(BusEvent::Message { topic, payload })) => {
                if let RouteOutcome::RefreshAll = self.router.route(&topic, &payload).await? {
                    for device_id in self.store().device_ids() {
                        self.publisher.publish_full_snapshot(&device_id).await?;
                    }
                }
            }
            Inbound::Bus(Ok(BusEvent::Closed)) => {
                return Err(BridgeError::connection_lost(Channel::Bus, "closed unexpectedly"));
            }
            Inbound::Bus(Err(e)) => {
                self.liveness.channel_down(Channel::Bus).await?;
                return Err(e);
            }
            Inbound::Cloud(Ok(CloudEvent::Connected)) => {
                info!("Cloud connected");
                self.liveness.channel_up(Channel::Cloud).await?;
            }
            Inbound::Cloud(Ok(CloudEvent::Status { device_id, fields })) => {
                let publication = self.publisher.on_status_event(&device_id, fields).await?;
                if publication.first_observation {
                    self.spawn_timers(timers, &device_id);
                }
            }
            Inbound::Cloud(Ok(CloudEvent::Power { device_id, watts, at })) => {
                self.publisher.record_power(&device_id, watts, at);
            }
            Inbound::Cloud(Err(e)) => return Err(e),
        }
        Ok(())
    }

    fn spawn_timers(&self, timers: &mut JoinSet<Result<()>>, device_id: &str) {
        debug!("[{}] starting timers", device_id);
        let (id, publisher) = (device_id.to_string(), &self.publisher);
        timers.spawn(snapshot_timer(publisher.clone(), id.clone(), self.timers.full_snapshot()));
        timers.spawn(power_timer(publisher.clone(), id, self.timers.power_average()));
    }

    async fn shutdown(
        &self,
        mut timers: JoinSet<Result<()>>,
        cloud_task: JoinHandle<()>,
        bus_task: JoinHandle<()>,
        mut rx: mpsc::UnboundedReceiver<Inbound>,
    ) {
        info!("Shutting down");
        timers.abort_all();
        cloud_task.abort();

        // A dead bus may never drain its request queue, so every bus call is bounded.
        match timeout(self.shutdown_grace, self.liveness.channel_down(Channel::Cloud)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to publish offline: {}", e),
            Err(_) => warn!("Timed out publishing offline"),
        }
        if let Err(e) = self.cloud.close().await {
            error!("Failed to close cloud channel: {}", e);
        }
        match timeout(self.shutdown_grace, self.bus.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to close bus channel: {}", e),
            Err(_) => warn!("Timed out closing bus channel"),
        }

        let flushed = timeout(self.shutdown_grace, async {
            while let Some(inbound) = rx.recv().await {
                match inbound {
                    Inbound::Bus(Ok(BusEvent::Closed)) => return true,
                    Inbound::Bus(Err(e)) => {
                        debug!("Bus ended during shutdown: {}", e);
                        return false;
                    }
                    _ => {}
                }
            }
            false
        })
        .await;
        match flushed {
            Ok(true) => debug!("Bus flushed"),
            Ok(false) => {}
            Err(_) => warn!("Bus did not flush within {:?}", self.shutdown_grace),
        }
        bus_task.abort();
        info!("Shutdown complete");
    }
}

/// Full snapshot every period, first one a full period after the device appeared.
async fn snapshot_timer(
    publisher: Arc<DeltaPublisher>,
    device_id: String,
    period: Duration,
) -> Result<()> {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        publisher.publish_full_snapshot(&device_id).await?;
    }
}

async fn power_timer(
    publisher: Arc<DeltaPublisher>,
    device_id: String,
    period: Duration,
) -> Result<()> {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        publisher.publish_power_average(&device_id).await?;
    }
}

async fn forward_bus<B: BusSource>(mut source: B, tx: mpsc::UnboundedSender<Inbound>) {
    loop {
        let event = source.next_event().await;
        let last = matches!(event, Err(_) | Ok(BusEvent::Closed));
        if tx.send(Inbound::Bus(event)).is_err() || last {
            return;
        }
    }
}

async fn forward_cloud<C: CloudSource>(mut source: C, tx: mpsc::UnboundedSender<Inbound>) {
    loop {
        let event = source.next_event().await;
        let last = event.is_err();
        if tx.send(Inbound::Cloud(event)).is_err() || last {
            return;
        }
    }
}
