/* Configuration switcher: the one task allowed to replace the running slot.
 *
 * Requests arrive on a bounded channel (from the general action chain and the
 * DBus surface). Each request is handled with the pipeline stopped: the
 * `CONFIG_STABLE` bit is cleared for the duration, which cancels every
 * debounce timer and gates both chains. Everything that can fail (reading the
 * settings record, reading and decoding each payload) happens before anything
 * running is touched, so a failed switch leaves the previous configuration in
 * place. */

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::action::{ActionChain, Collaborators};
use crate::chain::ChainError;
use crate::debounce::{DebounceHandle, DebounceSettings};
use crate::flags::{EventFlags, CONFIG_STABLE, ROUTE_BLE, ROUTE_USB};
use crate::hid::HidChain;
use crate::slot::{validate_name, ActionKind, GeneralConfig, SlotError, SlotImage, VbAction};
use crate::storage::{SlotStorage, SlotTarget, StorageError, Transaction};
use crate::vb::{VirtualButton, VB_COUNT};

/* Pause between attempts to get the storage transaction. */
const TRANSACTION_RETRY: Duration = Duration::from_millis(50);

const CALLER: &str = "switcher";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "to", content = "name", rename_all = "snake_case")]
pub enum SwitchRequest {
    Next,
    Prev,
    Default,
    Name(String),
    /* re-apply the staged (or running) configuration without reading storage */
    Update,
    RestoreFactory,
}

impl SwitchRequest {
    /* Parse a client token: a keyword (case-insensitive) or a slot name. */
    pub fn parse(token: &str) -> Result<Self, SwitchError> {
        let token = token.trim();
        Ok(match token.to_ascii_uppercase().as_str() {
            "" => return Err(SwitchError::InvalidName(String::new())),
            "NEXT" => SwitchRequest::Next,
            "PREV" => SwitchRequest::Prev,
            "DEFAULT" => SwitchRequest::Default,
            "UPDATE" => SwitchRequest::Update,
            "RESTOREFACTORY" => SwitchRequest::RestoreFactory,
            _ => {
                validate_name(token).map_err(|_| SwitchError::InvalidName(token.to_string()))?;
                SwitchRequest::Name(token.to_string())
            }
        })
    }
}

impl fmt::Display for SwitchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchRequest::Next => f.write_str("NEXT"),
            SwitchRequest::Prev => f.write_str("PREV"),
            SwitchRequest::Default => f.write_str("DEFAULT"),
            SwitchRequest::Name(name) => f.write_str(name),
            SwitchRequest::Update => f.write_str("UPDATE"),
            SwitchRequest::RestoreFactory => f.write_str("RESTOREFACTORY"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("payload of {vb}: {source}")]
    Payload {
        vb: VirtualButton,
        #[source]
        source: SlotError,
    },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("invalid slot name '{0}'")]
    InvalidName(String),
    #[error("{0} payloads staged for {max} buttons", max = VB_COUNT)]
    StagedShape(usize),
    #[error("nothing to update: no staged or running configuration")]
    NothingToUpdate,
    #[error("switch request queue is full")]
    QueueFull,
    #[error("switcher is not running")]
    Closed,
}

/* The slot currently applied. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSlot {
    pub number: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub slot: ActiveSlot,
    /* false for requests that only touch storage */
    pub applied: bool,
}

type Reply = oneshot::Sender<Result<SwitchOutcome, SwitchError>>;

struct SwitchMessage {
    request: SwitchRequest,
    reply: Option<Reply>,
}

/* Configurations shared between the switcher task and its handles. */
#[derive(Default)]
struct Configs {
    /* waiting for an `Update` request */
    staged: Option<SlotImage>,
    /* what the chains were last built from */
    running: Option<SlotImage>,
}

/* Cloneable handle to the switcher. */
#[derive(Clone)]
pub struct SwitcherHandle {
    tx: mpsc::Sender<SwitchMessage>,
    configs: Arc<Mutex<Configs>>,
    active: watch::Receiver<Option<ActiveSlot>>,
}

/* Receiving half, handed to `spawn_switcher` once the rest of the pipeline exists. */
pub struct SwitcherInbox {
    rx: mpsc::Receiver<SwitchMessage>,
    configs: Arc<Mutex<Configs>>,
    active: watch::Sender<Option<ActiveSlot>>,
}

pub fn channel(capacity: usize) -> (SwitcherHandle, SwitcherInbox) {
    let (tx, rx) = mpsc::channel(capacity);
    let (active_tx, active_rx) = watch::channel(None);
    let configs = Arc::new(Mutex::new(Configs::default()));
    (
        SwitcherHandle {
            tx,
            configs: configs.clone(),
            active: active_rx,
        },
        SwitcherInbox {
            rx,
            configs,
            active: active_tx,
        },
    )
}

impl SwitcherHandle {
    /* Queue a request without waiting. Used from the dispatch path. */
    pub fn try_request(&self, request: SwitchRequest) -> Result<(), SwitchError> {
        self.tx
            .try_send(SwitchMessage { request, reply: None })
            .map_err(|e| match e {
                TrySendError::Full(_) => SwitchError::QueueFull,
                TrySendError::Closed(_) => SwitchError::Closed,
            })
    }

    /* Queue a request and wait for its outcome. */
    pub async fn request(&self, request: SwitchRequest) -> Result<SwitchOutcome, SwitchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SwitchMessage {
                request,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| SwitchError::Closed)?;
        reply_rx.await.map_err(|_| SwitchError::Closed)?
    }

    /* Stage a configuration for the next `Update` request, replacing any earlier one.
     * Every payload must decode against the record's kind tags. */
    pub async fn stage_update(&self, staged: SlotImage) -> Result<(), SwitchError> {
        validate_name(&staged.name).map_err(|_| SwitchError::InvalidName(staged.name.clone()))?;
        if staged.payloads.len() != VB_COUNT {
            return Err(SwitchError::StagedShape(staged.payloads.len()));
        }
        decode_actions(&staged.config, &staged.payloads)?;
        self.configs.lock().await.staged = Some(staged);
        Ok(())
    }

    /* The staged configuration if there is one, else the running one. */
    pub async fn snapshot(&self) -> Option<SlotImage> {
        let configs = self.configs.lock().await;
        configs.staged.clone().or_else(|| configs.running.clone())
    }

    pub fn active(&self) -> Option<ActiveSlot> {
        self.active.borrow().clone()
    }

    pub fn subscribe_active(&self) -> watch::Receiver<Option<ActiveSlot>> {
        self.active.clone()
    }
}

/* Everything the switcher rebuilds or reads. */
pub struct SwitcherDeps {
    pub storage: Arc<SlotStorage>,
    pub flags: EventFlags,
    pub hid: Arc<HidChain>,
    pub actions: Arc<ActionChain>,
    pub debounce: DebounceHandle,
    pub collaborators: Arc<dyn Collaborators>,
    pub transaction_timeout: Duration,
}

/* A fully decoded configuration, ready to apply. */
struct Prepared {
    slot: ActiveSlot,
    config: GeneralConfig,
    payloads: Vec<Vec<u8>>,
    actions: Vec<(VirtualButton, VbAction)>,
}

/* Slot reached by stepping once from `current`, wrapping at both ends.
 * Without a valid current slot both directions land on slot 0. */
fn neighbor(current: Option<u32>, count: u32, forward: bool) -> Option<u32> {
    if count == 0 {
        return None;
    }
    let Some(c) = current.filter(|c| *c < count) else {
        return Some(0);
    };
    Some(match (forward, c) {
        (true, _) => (c + 1) % count,
        (false, 0) => count - 1,
        (false, _) => c - 1,
    })
}

/* Decode every configured payload against the kind tags of `config`. */
fn decode_actions(config: &GeneralConfig, payloads: &[Vec<u8>]) -> Result<Vec<(VirtualButton, VbAction)>, SwitchError> {
    let mut actions = Vec::new();
    for vb in VirtualButton::all() {
        let kind = config.vb_kind[vb.index()];
        if kind == ActionKind::None {
            continue;
        }
        let payload = &payloads[vb.index()];
        let action = VbAction::from_payload(kind, payload).map_err(|source| SwitchError::Payload { vb, source })?;
        actions.push((vb, action));
    }
    Ok(actions)
}

struct Switcher {
    deps: SwitcherDeps,
    rx: mpsc::Receiver<SwitchMessage>,
    configs: Arc<Mutex<Configs>>,
    active: watch::Sender<Option<ActiveSlot>>,
    /* slot NEXT/PREV step from; forgotten after a factory restore */
    current: Option<u32>,
}

impl Switcher {
    async fn run(mut self) {
        info!("Configuration switcher started");

        while let Some(SwitchMessage { request, reply }) = self.rx.recv().await {
            info!("Switch request: {}", request);
            let result = self.handle(&request).await;
            match &result {
                Ok(outcome) => info!(
                    "Switch {} done: slot {} '{}'{}",
                    request,
                    outcome.slot.number,
                    outcome.slot.name,
                    if outcome.applied { "" } else { " (stored only)" }
                ),
                Err(e) => error!("Switch {} failed: {}", request, e),
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }

        debug!("Configuration switcher loop exited");
    }

    /* Get the storage transaction, retrying until it is free. */
    async fn acquire(&self) -> Transaction {
        loop {
            match self.deps.storage.start(CALLER, self.deps.transaction_timeout).await {
                Ok(tx) => return tx,
                Err(e) => {
                    warn!("{}; retrying", e);
                    tokio::time::sleep(TRANSACTION_RETRY).await;
                }
            }
        }
    }

    async fn handle(&mut self, request: &SwitchRequest) -> Result<SwitchOutcome, SwitchError> {
        let mut tx = self.acquire().await;
        self.deps.flags.clear(CONFIG_STABLE);

        let result = self.switch(&mut tx, request).await;

        if let Err(e) = self.deps.storage.finish(tx) {
            warn!("Finishing storage transaction: {}", e);
        }
        self.deps.flags.set(CONFIG_STABLE);

        if let Ok(SwitchOutcome { slot, applied: true }) = &result {
            if let Err(e) = self.deps.collaborators.acknowledge_slot(slot.number).await {
                warn!("Slot acknowledgement failed: {:#}", e);
            }
        }
        result
    }

    async fn switch(&mut self, tx: &mut Transaction, request: &SwitchRequest) -> Result<SwitchOutcome, SwitchError> {
        let prepared = match request {
            SwitchRequest::RestoreFactory => return self.restore_factory(tx).await,
            SwitchRequest::Update => self.prepare_update().await?,
            _ => self.prepare_load(tx, request).await?,
        };
        let slot = prepared.slot.clone();
        self.apply(prepared).await?;
        Ok(SwitchOutcome { slot, applied: true })
    }

    async fn restore_factory(&mut self, tx: &mut Transaction) -> Result<SwitchOutcome, SwitchError> {
        let storage = &self.deps.storage;
        let removed = storage.delete_all_slots(tx).await?;
        let image = storage.store_default_slot(tx).await?;
        info!("Factory restore: removed {} slots", removed);
        self.current = None;
        Ok(SwitchOutcome {
            slot: ActiveSlot {
                number: 0,
                name: image.name,
            },
            applied: false,
        })
    }

    async fn prepare_update(&mut self) -> Result<Prepared, SwitchError> {
        let image = {
            let mut configs = self.configs.lock().await;
            configs.staged.take().or_else(|| configs.running.clone())
        };
        let SlotImage { name, config, payloads } = image.ok_or(SwitchError::NothingToUpdate)?;
        let actions = decode_actions(&config, &payloads)?;
        Ok(Prepared {
            slot: ActiveSlot {
                number: self.current.unwrap_or(0),
                name,
            },
            config,
            payloads,
            actions,
        })
    }

    async fn prepare_load(&mut self, tx: &mut Transaction, request: &SwitchRequest) -> Result<Prepared, SwitchError> {
        let storage = &self.deps.storage;
        let count = storage.slot_count(tx).await?;
        let target = match request {
            SwitchRequest::Next | SwitchRequest::Prev => {
                let forward = matches!(request, SwitchRequest::Next);
                let n = neighbor(self.current, count, forward)
                    .ok_or_else(|| StorageError::NotFound("any slot".into()))?;
                SlotTarget::Number(n)
            }
            SwitchRequest::Name(name) => SlotTarget::Name(name.clone()),
            _ => SlotTarget::Number(0),
        };

        let loaded = match storage.load_general(tx, &target).await {
            Err(StorageError::NotFound(_)) if count == 0 && *request == SwitchRequest::Default => {
                info!("Storage is empty, creating the factory default slot");
                storage.store_default_slot(tx).await?;
                storage.load_general(tx, &target).await?
            }
            other => other?,
        };

        let mut payloads = vec![Vec::new(); VB_COUNT];
        for vb in VirtualButton::all() {
            if loaded.config.vb_kind[vb.index()] == ActionKind::None {
                continue;
            }
            let payload = storage.load_vb_payload(tx, vb).await?;
            let expected = usize::from(loaded.config.vb_payload_len[vb.index()]);
            if payload.len() != expected {
                return Err(SwitchError::Payload {
                    vb,
                    source: SlotError::Payload(format!("{} bytes stored, record says {}", payload.len(), expected)),
                });
            }
            payloads[vb.index()] = payload;
        }
        let actions = decode_actions(&loaded.config, &payloads)?;

        Ok(Prepared {
            slot: ActiveSlot {
                number: loaded.number,
                name: loaded.name,
            },
            config: loaded.config,
            payloads,
            actions,
        })
    }

    /* Replace the running configuration. Only reached with everything decoded.
     * Both chain tables are taken before anything running changes; if either
     * is contended the previous configuration stays whole. */
    async fn apply(&mut self, prepared: Prepared) -> Result<(), SwitchError> {
        let Prepared {
            slot,
            config,
            payloads,
            actions,
        } = prepared;
        let deps = &self.deps;

        let mut hid = deps.hid.lock_for_replace().await?;
        let mut general = deps.actions.lock_for_replace().await?;

        if let Err(e) = deps.collaborators.reconfigure_analog(&config.analog).await {
            warn!("Analog reconfiguration failed: {:#}", e);
        }
        deps.flags.assign(ROUTE_USB, config.usb_active);
        deps.flags.assign(ROUTE_BLE, config.ble_active);
        if let Err(e) = deps.hid.sink().release_all() {
            warn!("Release-all before switch: {}", e);
        }

        hid.clear();
        general.clear();
        for (vb, action) in &actions {
            let origin = Some(action.to_string());
            let hid_entries: Vec<_> = action.hid_bindings().into_iter().map(|(e, c)| (e, c, origin.clone())).collect();
            if !hid_entries.is_empty() {
                hid.install(*vb, hid_entries);
            }
            let general_entries: Vec<_> =
                action.general_bindings().into_iter().map(|(e, a)| (e, a, origin.clone())).collect();
            if !general_entries.is_empty() {
                general.install(*vb, general_entries);
            }
            debug!("{}: {}", vb, action);
        }
        drop(general);
        drop(hid);
        deps.debounce.reconfigure(DebounceSettings::from_config(&config));

        info!(
            "Applied slot {} '{}' ({} buttons configured)",
            slot.number,
            slot.name,
            actions.len()
        );
        self.current = Some(slot.number);
        self.configs.lock().await.running = Some(SlotImage {
            name: slot.name.clone(),
            config,
            payloads,
        });
        self.active.send_replace(Some(slot));
        Ok(())
    }
}

pub fn spawn_switcher(inbox: SwitcherInbox, deps: SwitcherDeps) -> JoinHandle<()> {
    let switcher = Switcher {
        deps,
        rx: inbox.rx,
        configs: inbox.configs,
        active: inbox.active,
        current: None,
    };
    tokio::spawn(async move {
        switcher.run().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tokens() {
        assert_eq!(SwitchRequest::parse("next").unwrap(), SwitchRequest::Next);
        assert_eq!(SwitchRequest::parse(" RestoreFactory ").unwrap(), SwitchRequest::RestoreFactory);
        assert_eq!(SwitchRequest::parse("joystick").unwrap(), SwitchRequest::Name("joystick".into()));
        assert!(matches!(SwitchRequest::parse(""), Err(SwitchError::InvalidName(_))));
        assert!(SwitchRequest::parse(&"n".repeat(40)).is_err());
        assert_eq!(SwitchRequest::Name("x".into()).to_string(), "x");
    }

    #[test]
    fn test_neighbor_wraps() {
        assert_eq!(neighbor(Some(2), 3, true), Some(0));
        assert_eq!(neighbor(Some(0), 3, true), Some(1));
        assert_eq!(neighbor(Some(0), 3, false), Some(2));
        assert_eq!(neighbor(Some(1), 3, false), Some(0));
        assert_eq!(neighbor(None, 3, false), Some(0));
        assert_eq!(neighbor(Some(7), 3, true), Some(0));
        assert_eq!(neighbor(Some(0), 0, true), None);
    }

    #[test]
    fn test_request_serde_shape() {
        let json = serde_json::to_string(&SwitchRequest::Name("mouse".into())).unwrap();
        assert_eq!(json, r#"{"to":"name","name":"mouse"}"#);
        let next: SwitchRequest = serde_json::from_str(r#"{"to":"next"}"#).unwrap();
        assert_eq!(next, SwitchRequest::Next);
    }

    #[tokio::test]
    async fn test_try_request_reports_full_queue() {
        let (handle, inbox) = channel(1);
        handle.try_request(SwitchRequest::Next).unwrap();
        assert!(matches!(handle.try_request(SwitchRequest::Prev), Err(SwitchError::QueueFull)));
        drop(inbox);
        assert!(matches!(handle.try_request(SwitchRequest::Prev), Err(SwitchError::Closed)));
    }

    #[tokio::test]
    async fn test_stage_update_checks_shape() {
        let (handle, _inbox) = channel(1);
        let staged = SlotImage {
            name: "tmp".into(),
            config: GeneralConfig::default(),
            payloads: vec![Vec::new(); 3],
        };
        assert!(matches!(handle.stage_update(staged).await, Err(SwitchError::StagedShape(3))));
        assert!(handle.snapshot().await.is_none());

        /* the record says Calibrate, the payload is a macro */
        let mut config = GeneralConfig::default();
        let mut payloads = vec![Vec::new(); VB_COUNT];
        config.bind(VirtualButton::new(1).unwrap(), &VbAction::Calibrate).unwrap();
        payloads[1] = VbAction::Macro("x".into()).to_payload().unwrap();
        config.vb_payload_len[1] = payloads[1].len() as u16;
        let bad = SlotImage {
            name: "tmp".into(),
            config,
            payloads,
        };
        assert!(matches!(handle.stage_update(bad).await, Err(SwitchError::Payload { .. })));

        let good = SlotImage::from_actions("tmp", GeneralConfig::default(), &[]).unwrap();
        handle.stage_update(good.clone()).await.unwrap();
        assert_eq!(handle.snapshot().await, Some(good));
    }
}
