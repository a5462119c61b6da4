/* Daemon configuration, read from an INI file.
 *
 *   [storage]  root
 *   [pipeline] edge_queue, switch_queue, hid_queue, chain_lock_timeout_ms, transaction_timeout_ms
 *   [routing]  usb, ble
 *   [dbus]     bus = system | session
 *
 * A missing file is not an error: every key has a default. */

use std::path::{Path, PathBuf};
use std::time::Duration;

use configparser::ini::Ini;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vbuttond/vbuttond.conf";
pub const CONFIG_ENV: &str = "VBUTTOND_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("[{section}] {key} = '{value}': {reason}")]
    Invalid {
        section: &'static str,
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
}

/* Queue sizes and timeouts of the event pipeline. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub edge_queue: usize,
    pub switch_queue: usize,
    pub hid_queue: usize,
    pub chain_lock_timeout: Duration,
    pub transaction_timeout: Duration,
    /* routing used until the first slot is applied */
    pub route_usb: bool,
    pub route_ble: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            edge_queue: 64,
            switch_queue: 8,
            hid_queue: 32,
            chain_lock_timeout: Duration::from_millis(100),
            transaction_timeout: Duration::from_millis(500),
            route_usb: true,
            route_ble: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub storage_root: PathBuf,
    pub pipeline: PipelineConfig,
    pub bus: BusKind,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("/var/lib/vbuttond"),
            pipeline: PipelineConfig::default(),
            bus: BusKind::System,
        }
    }
}

/* Pick the config file: first CLI argument, then the environment, then the default. */
pub fn config_path(arg: Option<String>) -> PathBuf {
    arg.or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

pub fn load_config(path: &Path) -> Result<DaemonConfig, ConfigError> {
    if !path.exists() {
        warn!("Config file {} not found, using defaults", path.display());
        return Ok(DaemonConfig::default());
    }
    let mut ini = Ini::new();
    ini.load(path).map_err(|reason| ConfigError::Parse {
        path: path.to_path_buf(),
        reason,
    })?;
    let config = parse(&ini)?;
    debug!("Loaded config from {}: {:?}", path.display(), config);
    Ok(config)
}

fn invalid(section: &'static str, key: &'static str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        section,
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/* A positive integer, or `default` if the key is absent. */
fn positive(ini: &Ini, section: &'static str, key: &'static str, default: u64) -> Result<u64, ConfigError> {
    let Some(value) = ini.get(section, key) else {
        return Ok(default);
    };
    match value.trim().parse::<u64>() {
        Ok(0) => Err(invalid(section, key, &value, "must be greater than zero")),
        Ok(n) => Ok(n),
        Err(e) => Err(invalid(section, key, &value, e)),
    }
}

fn flag(ini: &Ini, section: &'static str, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = ini.get(section, key) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(section, key, &value, "expected a boolean")),
    }
}

fn parse(ini: &Ini) -> Result<DaemonConfig, ConfigError> {
    let defaults = DaemonConfig::default();
    let p = &defaults.pipeline;

    let storage_root = ini
        .get("storage", "root")
        .map(PathBuf::from)
        .unwrap_or(defaults.storage_root.clone());

    let ms = |key: &'static str, default: Duration| {
        positive(ini, "pipeline", key, default.as_millis() as u64).map(Duration::from_millis)
    };
    let pipeline = PipelineConfig {
        edge_queue: positive(ini, "pipeline", "edge_queue", p.edge_queue as u64)? as usize,
        switch_queue: positive(ini, "pipeline", "switch_queue", p.switch_queue as u64)? as usize,
        hid_queue: positive(ini, "pipeline", "hid_queue", p.hid_queue as u64)? as usize,
        chain_lock_timeout: ms("chain_lock_timeout_ms", p.chain_lock_timeout)?,
        transaction_timeout: ms("transaction_timeout_ms", p.transaction_timeout)?,
        route_usb: flag(ini, "routing", "usb", p.route_usb)?,
        route_ble: flag(ini, "routing", "ble", p.route_ble)?,
    };

    let bus = match ini.get("dbus", "bus") {
        None => defaults.bus,
        Some(v) => match v.trim().to_ascii_lowercase().as_str() {
            "system" => BusKind::System,
            "session" => BusKind::Session,
            _ => return Err(invalid("dbus", "bus", &v, "expected 'system' or 'session'")),
        },
    };

    Ok(DaemonConfig {
        storage_root,
        pipeline,
        bus,
    })
}
