/* vbuttond: turns raw sensor and button edges into debounced virtual button events,
 * routes them through the HID and action chains and hot-swaps stored slot configurations. */
mod action;
mod chain;
mod config;
mod dbus;
mod debounce;
mod flags;
mod hid;
mod pipeline;
mod slot;
mod storage;
mod switcher;
mod vb;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use action::LoggingCollaborators;
use hid::HidQueues;
use pipeline::Pipeline;
use storage::SlotStorage;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config::config_path(std::env::args().nth(1));
    let config = config::load_config(&config_path)
        .with_context(|| format!("Loading {}", config_path.display()))?;
    info!("vbuttond starting, slots under {}", config.storage_root.display());

    let storage = Arc::new(
        SlotStorage::open(&config.storage_root)
            .await
            .with_context(|| format!("Opening slot storage at {}", config.storage_root.display()))?,
    );

    let tx = storage.start("startup", config.pipeline.transaction_timeout).await?;
    let counts = (storage.slot_count(&tx).await, storage.ir_count(&tx).await);
    storage.finish(tx)?;
    match counts {
        (Ok(slots), Ok(recordings)) => info!("{} slots, {} infrared recordings stored", slots, recordings),
        (Err(e), _) | (_, Err(e)) => warn!("Cannot survey slot storage: {}", e),
    }

    let (usb, usb_task) = hid::spawn_transport("usb", config.pipeline.hid_queue);
    let (ble, ble_task) = hid::spawn_transport("ble", config.pipeline.hid_queue);

    let collaborators = Arc::new(LoggingCollaborators::new(
        Arc::clone(&storage),
        config.pipeline.transaction_timeout,
    ));
    let pipeline = Arc::new(Pipeline::start(
        &config.pipeline,
        storage,
        collaborators,
        HidQueues { usb, ble },
    ));

    /* A broken default slot leaves the pipeline empty but the DBus surface usable. */
    match pipeline.boot().await {
        Ok(outcome) => info!("Slot {} '{}' active", outcome.slot.number, outcome.slot.name),
        Err(e) => error!("Cannot apply default slot: {}", e),
    }

    dbus::run_server(Arc::clone(&pipeline), config.bus, config.pipeline.transaction_timeout).await?;

    match Arc::try_unwrap(pipeline) {
        Ok(pipeline) => pipeline.shutdown(),
        Err(_) => warn!("Pipeline still referenced at shutdown"),
    }
    usb_task.abort();
    ble_task.abort();
    info!("vbuttond stopped");
    Ok(())
}
