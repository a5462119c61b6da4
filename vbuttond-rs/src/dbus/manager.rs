use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};
use zbus::{fdo, interface};

use crate::flags::{ROUTE_BLE, ROUTE_USB};
use crate::pipeline::Pipeline;
use crate::slot::{GeneralConfig, SlotImage, VbAction};
use crate::storage::{IrRecording, SlotStorage, StorageError};
use crate::switcher::SwitchRequest;
use crate::vb::{Edge, RawEdge, RawEdgeKind, VirtualButton};

/* DBus API version, bumped on incompatible changes to the interface below. */
pub const API_VERSION: i32 = 1;

/* The org.asterics.vbutton1.Manager interface.
 *
 * Entry point for clients (vbuttonctl, the configuration UI): slot
 * switching and listing, live bindings, edge injection and stored data. */
pub struct VButtonManager {
    pipeline: Arc<Pipeline>,
    transaction_timeout: Duration,
    /* poked whenever the stored slot or infrared lists change */
    stored_changed: Arc<Notify>,
}

impl VButtonManager {
    pub fn new(pipeline: Arc<Pipeline>, transaction_timeout: Duration, stored_changed: Arc<Notify>) -> Self {
        Self {
            pipeline,
            transaction_timeout,
            stored_changed,
        }
    }

    fn storage(&self) -> &SlotStorage {
        self.pipeline.storage()
    }

    /* Names from a numbered listing, in number order. */
    async fn list_names(&self, infrared: bool) -> fdo::Result<Vec<String>> {
        let storage = self.storage();
        let tx = storage
            .start("dbus-list", self.transaction_timeout)
            .await
            .map_err(failed)?;
        let listed = if infrared {
            storage.list_ir(&tx).await
        } else {
            storage.list_slots(&tx).await
        };
        storage.finish(tx).map_err(failed)?;
        Ok(listed.map_err(failed)?.into_iter().map(|(_, name)| name).collect())
    }
}

fn failed(e: impl std::fmt::Display) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

fn invalid(e: impl std::fmt::Display) -> fdo::Error {
    fdo::Error::InvalidArgs(e.to_string())
}

fn storage_error(e: StorageError) -> fdo::Error {
    match e {
        StorageError::InvalidArgument(reason) => fdo::Error::InvalidArgs(reason),
        StorageError::Full => fdo::Error::LimitsExceeded(e.to_string()),
        other => failed(other),
    }
}

/* Parse an action in its stored JSON form, e.g. `{"kind":"mouse_click","param":"left"}`. */
fn parse_action(json: &str) -> fdo::Result<VbAction> {
    serde_json::from_str(json).map_err(|e| fdo::Error::InvalidArgs(format!("action: {e}")))
}

#[interface(name = "org.asterics.vbutton1.Manager")]
impl VButtonManager {
    /* The DBus API version (constant, read-only). */
    #[zbus(property, name = "APIVersion")]
    async fn api_version(&self) -> i32 {
        API_VERSION
    }

    /* Name of the slot currently applied, empty before the first switch. */
    #[zbus(property)]
    async fn active_slot(&self) -> String {
        self.pipeline
            .switcher()
            .active()
            .map(|slot| slot.name)
            .unwrap_or_default()
    }

    /* Slot names, indexed by slot number. */
    #[zbus(property)]
    async fn slots(&self) -> fdo::Result<Vec<String>> {
        self.list_names(false).await
    }

    /* Names of the stored infrared recordings, in number order. */
    #[zbus(property)]
    async fn infrared_recordings(&self) -> fdo::Result<Vec<String>> {
        self.list_names(true).await
    }

    /* HID transports commands are routed to, set by the running slot. */
    #[zbus(property)]
    async fn transports(&self) -> Vec<String> {
        let routing = self.pipeline.flags().get();
        [(ROUTE_USB, "usb"), (ROUTE_BLE, "ble")]
            .into_iter()
            .filter(|(bit, _)| routing & bit != 0)
            .map(|(_, name)| name.to_string())
            .collect()
    }

    /* Buttons with at least one entry in either chain. */
    async fn bound_buttons(&self) -> fdo::Result<Vec<u32>> {
        let (hid, actions) = (self.pipeline.hid(), self.pipeline.actions());
        let mut bound = Vec::new();
        for vb in VirtualButton::all() {
            for edge in [Edge::Press, Edge::Release] {
                if hid.is_active(vb, edge).await.map_err(failed)?
                    || actions.is_active(vb, edge).await.map_err(failed)?
                {
                    bound.push(vb.index() as u32);
                    break;
                }
            }
        }
        Ok(bound)
    }

    /* Entry counts of the HID chain and the general action chain. */
    async fn chain_sizes(&self) -> fdo::Result<(u32, u32)> {
        let hid = self.pipeline.hid().len().await.map_err(failed)?;
        let actions = self.pipeline.actions().len().await.map_err(failed)?;
        Ok((hid as u32, actions as u32))
    }

    /* Switch configuration. `token` is NEXT, PREV, DEFAULT, UPDATE, */
    /* RESTOREFACTORY or a slot name. Returns the active slot afterwards. */
    async fn switch(&self, token: &str) -> fdo::Result<String> {
        let request = SwitchRequest::parse(token).map_err(invalid)?;
        info!("DBus: switch {}", request);
        let restore = request == SwitchRequest::RestoreFactory;
        let outcome = self.pipeline.switcher().request(request).await.map_err(failed)?;
        if restore {
            self.stored_changed.notify_one();
        }
        Ok(outcome.slot.name)
    }

    /* Delete a slot by name; later slots move down by one. */
    async fn delete_slot(&self, name: &str) -> fdo::Result<()> {
        let active = self.pipeline.switcher().active();
        if active.as_ref().is_some_and(|slot| slot.name.eq_ignore_ascii_case(name)) {
            return Err(fdo::Error::Failed(format!("slot '{}' is active", name)));
        }

        let _batch = self.pipeline.command_batch().await;
        let storage = self.storage();
        let mut tx = storage
            .start("dbus-delete", self.transaction_timeout)
            .await
            .map_err(failed)?;
        let result = match storage.find_slot(&tx, name).await {
            Ok(Some(n)) => storage.delete_slot(&mut tx, n).await.map(|_| n),
            Ok(None) => Err(StorageError::NotFound(name.to_string())),
            Err(e) => Err(e),
        };
        storage.finish(tx).map_err(failed)?;
        let deleted = result.map_err(failed)?;
        info!("DBus: deleted slot {} '{}'", deleted, name);
        self.stored_changed.notify_one();

        /* The active slot may have been renumbered; reload it by name. */
        if let Some(slot) = active {
            if slot.number > deleted {
                if let Err(e) = self.pipeline.switcher().try_request(SwitchRequest::Name(slot.name)) {
                    warn!("Cannot resync active slot after delete: {}", e);
                }
            }
        }
        Ok(())
    }

    /* Save the staged configuration (else the running one) as slot `name`:
     * overwrites a slot of that name, otherwise appends. Returns its number. */
    async fn store_slot(&self, name: &str) -> fdo::Result<u32> {
        let mut image = self
            .pipeline
            .switcher()
            .snapshot()
            .await
            .ok_or_else(|| fdo::Error::Failed("no configuration to store".into()))?;
        image.name = name.to_string();

        let storage = self.storage();
        let mut tx = storage
            .start("dbus-store", self.transaction_timeout)
            .await
            .map_err(failed)?;
        let result = storage.store_slot(&mut tx, &image).await;
        storage.finish(tx).map_err(failed)?;
        let number = result.map_err(storage_error)?;
        info!("DBus: stored slot {} '{}'", number, name);
        self.stored_changed.notify_one();
        Ok(number)
    }

    /* Stage a configuration for the next UPDATE switch. `actions` pairs a */
    /* button with its JSON action; unlisted buttons are unbound. Timing and */
    /* analog settings are taken over from the running configuration. */
    async fn stage_update(&self, name: &str, actions: Vec<(u32, String)>) -> fdo::Result<()> {
        let mut parsed = Vec::with_capacity(actions.len());
        for (vb, json) in &actions {
            parsed.push((VirtualButton::new(*vb).map_err(invalid)?, parse_action(json)?));
        }
        let switcher = self.pipeline.switcher();
        let base = switcher
            .snapshot()
            .await
            .map(|image| image.config)
            .unwrap_or_else(GeneralConfig::default);
        let image = SlotImage::from_actions(name, base, &parsed).map_err(invalid)?;
        switcher.stage_update(image).await.map_err(invalid)?;
        info!("DBus: staged '{}' ({} buttons)", name, parsed.len());
        Ok(())
    }

    /* Bind an action to a button in the running configuration only. */
    /* Returns how many chain entries were added. */
    async fn bind(&self, vb: u32, action: &str, replace: bool) -> fdo::Result<u32> {
        let vb = VirtualButton::new(vb).map_err(invalid)?;
        let action = parse_action(action)?;
        let added = self.pipeline.bind(vb, &action, replace).await.map_err(failed)?;
        Ok(added as u32)
    }

    async fn unbind(&self, vb: u32) -> fdo::Result<u32> {
        let vb = VirtualButton::new(vb).map_err(invalid)?;
        let removed = self.pipeline.unbind(vb).await.map_err(failed)?;
        Ok(removed as u32)
    }

    /* Run an action once without binding it. */
    async fn fire(&self, action: &str) -> fdo::Result<()> {
        let action = parse_action(action)?;
        self.pipeline.fire(&action).await.map_err(failed)
    }

    /* Buttons and edges bound to an action, given in its JSON form. */
    async fn find_binding(&self, action: &str) -> fdo::Result<Vec<(u32, String)>> {
        let action = parse_action(action)?;
        let hits = self
            .pipeline
            .find_bindings(&action.to_string())
            .await
            .map_err(failed)?;
        Ok(hits.into_iter().map(|(vb, edge)| (vb.index() as u32, edge.to_string())).collect())
    }

    /* Push a raw edge (press, release or ambiguous) as if an input producer saw it. */
    async fn inject_edge(&self, vb: u32, kind: &str) -> fdo::Result<()> {
        let vb = VirtualButton::new(vb).map_err(invalid)?;
        let kind = RawEdgeKind::parse(kind).map_err(invalid)?;
        self.pipeline
            .edge_sender()
            .try_send(RawEdge { vb, kind })
            .map_err(|e| fdo::Error::LimitsExceeded(format!("edge queue: {}", e)))
    }

    /* Everything bound to a virtual button, one line per chain entry. */
    async fn bindings(&self, vb: u32) -> fdo::Result<Vec<String>> {
        let vb = VirtualButton::new(vb).map_err(invalid)?;
        self.pipeline.bindings(vb).await.map_err(failed)
    }

    /* Store a raw infrared recording (packed edge items). Returns its number. */
    async fn store_infrared(&self, name: &str, items: Vec<u32>) -> fdo::Result<u32> {
        let storage = self.storage();
        let tx = storage
            .start("dbus-ir", self.transaction_timeout)
            .await
            .map_err(failed)?;
        let rec = IrRecording {
            name: name.to_string(),
            items,
        };
        let result = storage.store_ir(&tx, &rec).await;
        storage.finish(tx).map_err(failed)?;
        let number = result.map_err(storage_error)?;
        self.stored_changed.notify_one();
        Ok(number)
    }

    async fn delete_infrared(&self, name: &str) -> fdo::Result<()> {
        let storage = self.storage();
        let tx = storage
            .start("dbus-ir", self.transaction_timeout)
            .await
            .map_err(failed)?;
        let result = storage.delete_ir(&tx, name).await;
        storage.finish(tx).map_err(failed)?;
        if !result.map_err(storage_error)? {
            return Err(fdo::Error::Failed(format!("no infrared recording '{}'", name)));
        }
        info!("DBus: deleted infrared recording '{}'", name);
        self.stored_changed.notify_one();
        Ok(())
    }

    /* Store a global string (WiFi passphrase and similar) outside any slot. */
    async fn set_secret(&self, key: &str, value: &str) -> fdo::Result<()> {
        self.storage().kv().set(key, value).await.map_err(storage_error)
    }

    /* Whether a global string is set. Values are never read back over the bus. */
    async fn has_secret(&self, key: &str) -> fdo::Result<bool> {
        Ok(self.storage().kv().get(key).await.map_err(storage_error)?.is_some())
    }

    async fn remove_secret(&self, key: &str) -> fdo::Result<bool> {
        self.storage().kv().remove(key).await.map_err(storage_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::tests::RecordingCollaborators;
    use crate::config::PipelineConfig;
    use crate::hid::HidQueues;
    use tokio::sync::mpsc;

    async fn manager(dir: &tempfile::TempDir) -> VButtonManager {
        let storage = Arc::new(SlotStorage::open(dir.path()).await.unwrap());
        let (usb, _) = mpsc::channel(8);
        let (ble, _) = mpsc::channel(8);
        let pipeline = Pipeline::start(
            &PipelineConfig::default(),
            storage,
            Arc::new(RecordingCollaborators::default()),
            HidQueues { usb, ble },
        );
        pipeline.boot().await.unwrap();
        VButtonManager::new(Arc::new(pipeline), Duration::from_millis(500), Arc::new(Notify::new()))
    }

    #[tokio::test]
    async fn test_properties_after_boot() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        assert_eq!(manager.api_version().await, API_VERSION);
        assert_eq!(manager.active_slot().await, "mouse");
        assert_eq!(manager.slots().await.unwrap(), ["mouse"]);
        assert!(manager.infrared_recordings().await.unwrap().is_empty());
        assert_eq!(manager.transports().await, ["usb"]);
    }

    #[tokio::test]
    async fn test_bound_buttons_and_chain_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        /* factory slot: hold, click, switch, two wheels, calibrate */
        assert_eq!(manager.bound_buttons().await.unwrap(), [0, 1, 2, 3, 4, 5]);
        assert_eq!(manager.chain_sizes().await.unwrap(), (5, 2));

        manager.unbind(0).await.unwrap();
        manager.bind(7, r#"{"kind":"calibrate"}"#, false).await.unwrap();
        assert_eq!(manager.bound_buttons().await.unwrap(), [1, 2, 3, 4, 5, 7]);
        assert_eq!(manager.chain_sizes().await.unwrap(), (3, 3));
    }

    #[tokio::test]
    async fn test_switch_rejects_bad_token() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        assert!(matches!(manager.switch("").await, Err(fdo::Error::InvalidArgs(_))));
        assert_eq!(manager.switch("next").await.unwrap(), "mouse");
    }

    #[tokio::test]
    async fn test_delete_active_slot_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        assert!(manager.delete_slot("MOUSE").await.is_err());
        assert!(manager.delete_slot("nothing").await.is_err());
        assert_eq!(manager.slots().await.unwrap(), ["mouse"]);
    }

    #[tokio::test]
    async fn test_inject_edge_validates_input() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        assert!(matches!(manager.inject_edge(99, "press").await, Err(fdo::Error::InvalidArgs(_))));
        assert!(matches!(manager.inject_edge(1, "hold").await, Err(fdo::Error::InvalidArgs(_))));
        manager.inject_edge(1, "press").await.unwrap();
    }

    #[tokio::test]
    async fn test_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;
        manager.set_secret("wifi_psk", "hunter22").await.unwrap();
        assert!(matches!(manager.set_secret("", "x").await, Err(fdo::Error::InvalidArgs(_))));
        let stored = manager.storage().kv().get("wifi_psk").await.unwrap();
        assert_eq!(stored.as_deref(), Some("hunter22"));

        assert!(manager.has_secret("wifi_psk").await.unwrap());
        assert!(manager.remove_secret("wifi_psk").await.unwrap());
        assert!(!manager.has_secret("wifi_psk").await.unwrap());
        assert!(!manager.remove_secret("wifi_psk").await.unwrap());
    }

    #[tokio::test]
    async fn test_stage_update_then_store() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;

        let click = r#"{"kind":"mouse_click","param":"right"}"#;
        assert!(matches!(
            manager.stage_update("typing", vec![(4, "{".into())]).await,
            Err(fdo::Error::InvalidArgs(_))
        ));
        manager.stage_update("typing", vec![(4, click.into())]).await.unwrap();

        /* the staged configuration is stored before it is ever applied */
        assert_eq!(manager.store_slot("typing").await.unwrap(), 1);
        assert_eq!(manager.switch("UPDATE").await.unwrap(), "typing");
        assert_eq!(manager.bindings(4).await.unwrap(), ["press hid MouseClick(Right)"]);
        assert!(manager.bindings(0).await.unwrap().is_empty());

        /* with nothing staged the running configuration is stored */
        assert_eq!(manager.store_slot("copy").await.unwrap(), 2);
        assert_eq!(manager.slots().await.unwrap(), ["mouse", "typing", "copy"]);
        assert!(matches!(manager.store_slot("").await, Err(fdo::Error::InvalidArgs(_))));
    }

    #[tokio::test]
    async fn test_bind_fire_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;

        let wheel = r#"{"kind":"mouse_wheel","param":3}"#;
        /* the factory slot scrolls up on vb3 */
        assert_eq!(manager.find_binding(wheel).await.unwrap(), [(3, "press".to_string())]);

        assert_eq!(manager.bind(9, wheel, true).await.unwrap(), 1);
        assert_eq!(
            manager.find_binding(wheel).await.unwrap(),
            [(3, "press".to_string()), (9, "press".to_string())]
        );
        assert_eq!(manager.unbind(9).await.unwrap(), 1);
        assert!(matches!(manager.bind(40, wheel, false).await, Err(fdo::Error::InvalidArgs(_))));

        manager.fire(r#"{"kind":"calibrate"}"#).await.unwrap();
        assert!(matches!(manager.fire("calibrate").await, Err(fdo::Error::InvalidArgs(_))));
    }

    #[tokio::test]
    async fn test_infrared_store_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir).await;

        assert_eq!(manager.store_infrared("tv", vec![0x8000_0100, 0x0000_0100]).await.unwrap(), 0);
        assert_eq!(manager.infrared_recordings().await.unwrap(), ["tv"]);
        assert!(matches!(manager.store_infrared("", vec![1]).await, Err(fdo::Error::InvalidArgs(_))));

        manager.delete_infrared("tv").await.unwrap();
        assert!(manager.delete_infrared("tv").await.is_err());
        assert!(manager.infrared_recordings().await.unwrap().is_empty());
    }
}
