/*!
 * AC BRIDGE - Process entry point
 *
 * ROLE: loads configuration, logs in to the vendor cloud, connects the MQTT
 * bus and runs the synchronization engine until a fatal error, Ctrl-C or SIGTERM.
 * Any fatal error leaves through `main` as an error, so the exit status is non-zero.
 */

use ac_bridge::bus::create_mqtt_client;
use ac_bridge::cloud::toshiba;
use ac_bridge::config::load_config;
use ac_bridge::shutdown::shutdown_signal;
use ac_bridge::SyncEngine;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ac_bridge=info")),
        )
        .init();

    info!("AC bridge {} starting", env!("CARGO_PKG_VERSION"));

    let cfg = load_config().await.context("loading configuration")?;
    let (username, password) = cfg.cloud.credentials().context("checking cloud credentials")?;

    let (cloud, cloud_events) = toshiba::connect(&cfg.cloud, username, password)
        .await
        .context("connecting to the AC cloud")?;
    let (bus, bus_events) = create_mqtt_client(&cfg.mqtt, &cfg.topics);

    let engine = SyncEngine::new(&cfg, Arc::new(bus), Arc::new(cloud));
    engine
        .run(bus_events, cloud_events, shutdown_signal())
        .await
        .context("synchronization engine stopped")?;

    info!("AC bridge stopped");
    Ok(())
}

