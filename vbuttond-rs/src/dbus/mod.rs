pub mod manager;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tracing::{info, warn};
use zbus::connection::Builder;

use crate::config::BusKind;
use crate::pipeline::Pipeline;

pub const BUS_NAME: &str = "org.asterics.vbutton1";
pub const OBJECT_PATH: &str = "/org/asterics/vbutton1";

/* Serve the manager interface until SIGINT/SIGTERM. Every slot switch is announced
 * as a PropertiesChanged signal for ActiveSlot, Slots and Transports; edits to stored slots or
 * recordings made over the bus announce Slots and InfraredRecordings. */
pub async fn run_server(pipeline: Arc<Pipeline>, bus: BusKind, transaction_timeout: Duration) -> Result<()> {
    let stored_changed = Arc::new(Notify::new());
    let manager = manager::VButtonManager::new(Arc::clone(&pipeline), transaction_timeout, stored_changed.clone());

    let builder = match bus {
        BusKind::System => Builder::system()?,
        BusKind::Session => Builder::session()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, manager)?
        .build()
        .await
        .with_context(|| format!("Cannot claim {} on the {:?} bus", BUS_NAME, bus))?;

    info!("DBus server ready on {}", BUS_NAME);

    let iface_ref = conn
        .object_server()
        .interface::<_, manager::VButtonManager>(OBJECT_PATH)
        .await?;
    let mut active = pipeline.switcher().subscribe_active();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Cannot install SIGTERM handler")?;

    loop {
        tokio::select! {
            changed = active.changed() => {
                if changed.is_err() {
                    warn!("Switcher stopped, shutting down");
                    break;
                }
                let emitter = iface_ref.signal_emitter();
                if let Err(e) = iface_ref.get().await.active_slot_changed(emitter).await {
                    warn!("Cannot emit ActiveSlot change: {}", e);
                }
                if let Err(e) = iface_ref.get().await.slots_changed(emitter).await {
                    warn!("Cannot emit Slots change: {}", e);
                }
                if let Err(e) = iface_ref.get().await.transports_changed(emitter).await {
                    warn!("Cannot emit Transports change: {}", e);
                }
            }
            _ = stored_changed.notified() => {
                let emitter = iface_ref.signal_emitter();
                let iface = iface_ref.get().await;
                if let Err(e) = iface.slots_changed(emitter).await {
                    warn!("Cannot emit Slots change: {}", e);
                }
                if let Err(e) = iface.infrared_recordings_changed(emitter).await {
                    warn!("Cannot emit InfraredRecordings change: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
        }
    }

    drop(iface_ref);
    drop(conn);
    Ok(())
}
