/* The pipeline context: builds and wires every runtime component.
 *
 *   edge queue -> debounce engine -> event queue -> dispatch task -> HID chain / action chain
 *
 * The switcher shares both chains and the debounce handle, and the action
 * chain's sink holds the switcher handle, so the switcher channel is created
 * first and its task spawned last. Until the first slot is applied
 * `CONFIG_STABLE` stays clear and nothing is dispatched. */

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::action::{ActionChain, Collaborators, GeneralSink};
use crate::chain::ChainError;
use crate::config::PipelineConfig;
use crate::debounce::{self, DebounceSettings};
use crate::flags::{EventFlags, CMD_QUEUE_IDLE, CONFIG_STABLE, ROUTE_BLE, ROUTE_USB};
use crate::hid::{HidChain, HidQueues, HidSink};
use crate::storage::SlotStorage;
use crate::switcher::{self, SwitchError, SwitchOutcome, SwitchRequest, SwitcherDeps, SwitcherHandle};
use crate::slot::VbAction;
use crate::vb::{Edge, RawEdge, Trigger, VbEvent, VirtualButton};

/* Held while an external command batch runs; dispatch is gated until it drops. */
pub struct CommandBatch {
    flags: EventFlags,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for CommandBatch {
    fn drop(&mut self) {
        self.flags.set(CMD_QUEUE_IDLE);
    }
}

pub struct Pipeline {
    flags: EventFlags,
    storage: Arc<SlotStorage>,
    hid: Arc<HidChain>,
    actions: Arc<ActionChain>,
    switcher: SwitcherHandle,
    edges: mpsc::Sender<RawEdge>,
    batch: Arc<Mutex<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /* Build the pipeline and spawn its tasks. No slot is loaded yet; see `boot`. */
    pub fn start(
        config: &PipelineConfig,
        storage: Arc<SlotStorage>,
        collaborators: Arc<dyn Collaborators>,
        hid_queues: HidQueues,
    ) -> Self {
        let mut initial = CMD_QUEUE_IDLE;
        if config.route_usb {
            initial |= ROUTE_USB;
        }
        if config.route_ble {
            initial |= ROUTE_BLE;
        }
        let flags = EventFlags::new(initial);

        let (switcher, inbox) = switcher::channel(config.switch_queue);

        let hid = Arc::new(HidChain::new(
            HidSink::new(hid_queues, flags.clone()),
            flags.clone(),
            config.chain_lock_timeout,
        ));
        let actions = Arc::new(ActionChain::new(
            GeneralSink::new(collaborators.clone(), switcher.clone()),
            flags.clone(),
            config.chain_lock_timeout,
        ));

        let (edge_tx, edge_rx) = mpsc::channel(config.edge_queue);
        let (event_tx, event_rx) = mpsc::channel(config.edge_queue);
        let (debounce, debounce_task) =
            debounce::spawn_engine(edge_rx, event_tx, &flags, DebounceSettings::default());

        let dispatch_task = tokio::spawn(dispatch_events(event_rx, hid.clone(), actions.clone()));

        let switcher_task = switcher::spawn_switcher(
            inbox,
            SwitcherDeps {
                storage: storage.clone(),
                flags: flags.clone(),
                hid: hid.clone(),
                actions: actions.clone(),
                debounce,
                collaborators,
                transaction_timeout: config.transaction_timeout,
            },
        );

        info!("Event pipeline started");
        Self {
            flags,
            storage,
            hid,
            actions,
            switcher,
            edges: edge_tx,
            batch: Arc::new(Mutex::new(())),
            tasks: vec![debounce_task, dispatch_task, switcher_task],
        }
    }

    /* Apply the default slot, creating it on an empty store. */
    pub async fn boot(&self) -> Result<SwitchOutcome, SwitchError> {
        self.switcher.request(SwitchRequest::Default).await
    }

    pub fn flags(&self) -> &EventFlags {
        &self.flags
    }

    pub fn storage(&self) -> &Arc<SlotStorage> {
        &self.storage
    }

    pub fn switcher(&self) -> &SwitcherHandle {
        &self.switcher
    }

    pub fn hid(&self) -> &Arc<HidChain> {
        &self.hid
    }

    pub fn actions(&self) -> &Arc<ActionChain> {
        &self.actions
    }

    /* Where input producers push raw edges. */
    pub fn edge_sender(&self) -> mpsc::Sender<RawEdge> {
        self.edges.clone()
    }

    /* Start an external command batch: dispatch stays gated until the guard drops.
     * A batch never starts while a switch is rebuilding the chains. */
    pub async fn command_batch(&self) -> CommandBatch {
        let guard = self.batch.clone().lock_owned().await;
        self.flags.wait_all(CONFIG_STABLE).await;
        self.flags.clear(CMD_QUEUE_IDLE);
        CommandBatch {
            flags: self.flags.clone(),
            _guard: guard,
        }
    }

    /* Human-readable list of everything bound to `vb`, HID entries first. */
    pub async fn bindings(&self, vb: VirtualButton) -> Result<Vec<String>, ChainError> {
        let mut out: Vec<String> = self
            .hid
            .entries_for(vb)
            .await?
            .into_iter()
            .map(|e| format!("{} hid {:?}", e.edge, e.action))
            .collect();
        out.extend(
            self.actions
                .entries_for(vb)
                .await?
                .into_iter()
                .map(|e| format!("{} action {}", e.edge, e.action)),
        );
        Ok(out)
    }

    /* Bind `action` to `vb` in the running chains without touching storage.
     * With `replace` everything `vb` had before is dropped first. Returns how
     * many chain entries were added. */
    pub async fn bind(&self, vb: VirtualButton, action: &VbAction, replace: bool) -> Result<usize, ChainError> {
        let _batch = self.command_batch().await;
        let origin = Some(action.to_string());
        let hid = action.hid_bindings();
        let general = action.general_bindings();
        if replace && hid.is_empty() {
            self.hid.remove(vb).await?;
        }
        if replace && general.is_empty() {
            self.actions.remove(vb).await?;
        }

        let added = hid.len() + general.len();
        for (i, (edge, cmd)) in hid.into_iter().enumerate() {
            self.hid
                .add(Trigger::Button(vb), edge, cmd, origin.clone(), replace && i == 0)
                .await?;
        }
        for (i, (edge, general)) in general.into_iter().enumerate() {
            self.actions
                .add(Trigger::Button(vb), edge, general, origin.clone(), replace && i == 0)
                .await?;
        }
        info!("{}: bound {} ({} entries)", vb, action, added);
        Ok(added)
    }

    /* Drop everything bound to `vb`. Returns how many entries went. */
    pub async fn unbind(&self, vb: VirtualButton) -> Result<usize, ChainError> {
        let _batch = self.command_batch().await;
        Ok(self.hid.remove(vb).await? + self.actions.remove(vb).await?)
    }

    /* Run `action` once, now, as a press followed by its release side. */
    pub async fn fire(&self, action: &VbAction) -> Result<(), ChainError> {
        for (edge, cmd) in action.hid_bindings() {
            self.hid.add(Trigger::SingleShot, edge, cmd, None, false).await?;
        }
        for (edge, general) in action.general_bindings() {
            self.actions.add(Trigger::SingleShot, edge, general, None, false).await?;
        }
        Ok(())
    }

    /* Buttons carrying an entry built from `origin` (an action's text form). */
    pub async fn find_bindings(&self, origin: &str) -> Result<Vec<(VirtualButton, Edge)>, ChainError> {
        let mut hits = self.hid.find_origin(origin).await?;
        hits.extend(self.actions.find_origin(origin).await?);
        hits.sort_by_key(|(vb, edge)| (vb.index(), *edge == Edge::Release));
        hits.dedup();
        Ok(hits)
    }

    /* Stop every pipeline task. */
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        debug!("Event pipeline stopped");
    }
}

/* Route each confirmed event through both chains. */
async fn dispatch_events(mut events: mpsc::Receiver<VbEvent>, hid: Arc<HidChain>, actions: Arc<ActionChain>) {
    while let Some(event) = events.recv().await {
        match hid.dispatch(event.vb, event.edge).await {
            Ok(0) => {}
            Ok(n) => debug!("{} {}: {} HID commands", event.vb, event.edge, n),
            Err(e) => warn!("{} {}: HID dispatch: {}", event.vb, event.edge, e),
        }
        match actions.dispatch(event.vb, event.edge).await {
            Ok(0) => {}
            Ok(n) => debug!("{} {}: {} actions", event.vb, event.edge, n),
            Err(e) => warn!("{} {}: action dispatch: {}", event.vb, event.edge, e),
        }
    }
    debug!("Dispatch task exited");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::action::tests::RecordingCollaborators;
    use crate::hid::{HidCommand, MouseButton};
    use crate::slot::{factory_default, GeneralConfig, SlotImage, VbAction};
    use crate::storage::{SlotTarget, StorageError};
    use crate::vb::{Edge, VB_COUNT};

    const T: Duration = Duration::from_millis(500);

    struct Harness {
        dir: tempfile::TempDir,
        pipeline: Pipeline,
        collab: Arc<RecordingCollaborators>,
        usb: mpsc::Receiver<HidCommand>,
        _ble: mpsc::Receiver<HidCommand>,
    }

    fn vb(id: u32) -> VirtualButton {
        VirtualButton::new(id).unwrap()
    }

    async fn harness(slots: &[SlotImage]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(SlotStorage::open(dir.path()).await.unwrap());
        let mut tx = storage.start("test", T).await.unwrap();
        for image in slots {
            storage.store_slot(&mut tx, image).await.unwrap();
        }
        storage.finish(tx).unwrap();

        let (usb_tx, usb) = mpsc::channel(64);
        let (ble_tx, ble) = mpsc::channel(64);
        let collab = Arc::new(RecordingCollaborators::default());
        let pipeline = Pipeline::start(
            &PipelineConfig::default(),
            storage,
            collab.clone(),
            HidQueues { usb: usb_tx, ble: ble_tx },
        );
        Harness {
            dir,
            pipeline,
            collab,
            usb,
            _ble: ble,
        }
    }

    fn named(name: &str, action: VbAction) -> SlotImage {
        SlotImage::from_actions(name, GeneralConfig::default(), &[(vb(0), action)]).unwrap()
    }

    async fn switch(h: &Harness, token: &str) -> Result<SwitchOutcome, SwitchError> {
        h.pipeline.switcher().request(SwitchRequest::parse(token).unwrap()).await
    }

    #[tokio::test]
    async fn test_boot_on_empty_store_fabricates_default() {
        let h = harness(&[]).await;
        let outcome = h.pipeline.boot().await.unwrap();
        assert_eq!(outcome.slot.name, "mouse");
        assert!(outcome.applied);
        assert!(h.pipeline.flags().all_set(CONFIG_STABLE | CMD_QUEUE_IDLE));

        let storage = h.pipeline.storage();
        let mut tx = storage.start("test", T).await.unwrap();
        let loaded = storage.load_general(&mut tx, &SlotTarget::Number(0)).await.unwrap();
        assert_eq!(loaded.config, factory_default().unwrap().config);
        storage.finish(tx).unwrap();

        assert!(h.pipeline.hid().is_active(vb(0), Edge::Press).await.unwrap());
        assert!(h.pipeline.actions().is_active(vb(2), Edge::Press).await.unwrap());
        assert_eq!(h.collab.calls(), ["analog:Mouse", "ack:0"]);
    }

    #[tokio::test]
    async fn test_next_wraps_around() {
        let slots = [
            named("a", VbAction::Calibrate),
            named("b", VbAction::Calibrate),
            named("c", VbAction::Calibrate),
        ];
        let h = harness(&slots).await;
        assert_eq!(switch(&h, "c").await.unwrap().slot.number, 2);
        assert_eq!(switch(&h, "NEXT").await.unwrap().slot.name, "a");
        assert_eq!(switch(&h, "NEXT").await.unwrap().slot.name, "b");
        assert_eq!(switch(&h, "PREV").await.unwrap().slot.name, "a");
        assert_eq!(switch(&h, "PREV").await.unwrap().slot.name, "c");
        assert_eq!(h.pipeline.switcher().active().unwrap().number, 2);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_running_configuration() {
        let slots = [named("mouse", VbAction::MouseHold(MouseButton::Left)), named("broken", VbAction::Calibrate)];
        let h = harness(&slots).await;
        h.pipeline.boot().await.unwrap();

        /* same length, different kind: the record says Calibrate */
        let payload_file = h.dir.path().join("001_VB.fms");
        let mut bytes = std::fs::read(&payload_file).unwrap();
        let good = VbAction::Calibrate.to_payload().unwrap();
        let at = bytes.windows(good.len()).position(|w| w == good.as_slice()).unwrap();
        bytes[at + 2] = b'X';
        std::fs::write(&payload_file, bytes).unwrap();

        let err = switch(&h, "broken").await.unwrap_err();
        assert!(matches!(err, SwitchError::Payload { .. }), "{err}");
        assert_eq!(h.pipeline.switcher().active().unwrap().name, "mouse");
        assert!(h.pipeline.flags().all_set(CONFIG_STABLE));
        assert!(h.pipeline.hid().is_active(vb(0), Edge::Release).await.unwrap());
        assert!(!h.pipeline.actions().is_active(vb(0), Edge::Press).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_name_is_reported() {
        let h = harness(&[named("mouse", VbAction::Calibrate)]).await;
        let err = switch(&h, "nosuch").await.unwrap_err();
        assert!(matches!(err, SwitchError::Storage(StorageError::NotFound(_))));
        assert!(h.pipeline.flags().all_set(CONFIG_STABLE));
    }

    #[tokio::test]
    async fn test_restore_factory_leaves_single_default_slot() {
        let slots = [named("a", VbAction::Calibrate), named("b", VbAction::Calibrate)];
        let h = harness(&slots).await;
        switch(&h, "b").await.unwrap();

        let outcome = switch(&h, "RESTOREFACTORY").await.unwrap();
        assert!(!outcome.applied);
        let storage = h.pipeline.storage();
        let tx = storage.start("test", T).await.unwrap();
        assert_eq!(storage.list_slots(&tx).await.unwrap(), vec![(0, "mouse".to_string())]);
        storage.finish(tx).unwrap();

        assert_eq!(switch(&h, "NEXT").await.unwrap().slot.name, "mouse");
    }

    #[tokio::test]
    async fn test_update_applies_staged_configuration() {
        let h = harness(&[]).await;
        h.pipeline.boot().await.unwrap();

        let mut config = GeneralConfig::default();
        let mut payloads = vec![Vec::new(); VB_COUNT];
        payloads[4] = config.bind(vb(4), &VbAction::KeyPress(vec![0x2c])).unwrap();
        h.pipeline
            .switcher()
            .stage_update(SlotImage {
                name: "typing".into(),
                config,
                payloads,
            })
            .await
            .unwrap();

        let outcome = switch(&h, "UPDATE").await.unwrap();
        assert_eq!(outcome.slot.name, "typing");
        assert!(h.pipeline.hid().is_active(vb(4), Edge::Press).await.unwrap());
        assert!(!h.pipeline.hid().is_active(vb(0), Edge::Press).await.unwrap());

        /* nothing staged: re-applies the running configuration */
        assert_eq!(switch(&h, "UPDATE").await.unwrap().slot.name, "typing");
    }

    #[tokio::test]
    async fn test_press_reaches_usb_transport() {
        let mut h = harness(&[]).await;
        h.pipeline.boot().await.unwrap();
        assert_eq!(h.usb.recv().await, Some(HidCommand::ReleaseAll));

        let edges = h.pipeline.edge_sender();
        edges.send(RawEdge::press(vb(0))).await.unwrap();
        let cmd = tokio::time::timeout(Duration::from_secs(2), h.usb.recv()).await.unwrap();
        assert_eq!(cmd, Some(HidCommand::MousePress(MouseButton::Left)));

        edges.send(RawEdge::release(vb(0))).await.unwrap();
        let cmd = tokio::time::timeout(Duration::from_secs(2), h.usb.recv()).await.unwrap();
        assert_eq!(cmd, Some(HidCommand::MouseRelease(MouseButton::Left)));
    }

    async fn wait_for_call(collab: &RecordingCollaborators, call: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !collab.calls().iter().any(|c| c == call) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn two_button(name: &str, first: VbAction, second: VbAction) -> SlotImage {
        SlotImage::from_actions(name, GeneralConfig::default(), &[(vb(0), first), (vb(1), second)]).unwrap()
    }

    #[tokio::test]
    async fn test_switch_while_macro_runs() {
        let slots = [
            two_button("a", VbAction::Macro("slow".into()), VbAction::MouseHold(MouseButton::Left)),
            named("b", VbAction::KeyPress(vec![0x04])),
        ];
        let h = harness(&slots).await;
        h.pipeline.boot().await.unwrap();

        h.pipeline.edge_sender().send(RawEdge::press(vb(0))).await.unwrap();
        wait_for_call(&h.collab, "macro:slow").await;

        let outcome = switch(&h, "b").await.unwrap();
        assert_eq!(outcome.slot.name, "b");
        assert!(h.pipeline.hid().is_active(vb(0), Edge::Press).await.unwrap());
        assert!(!h.pipeline.hid().is_active(vb(1), Edge::Press).await.unwrap());
        assert!(!h.pipeline.actions().is_active(vb(0), Edge::Press).await.unwrap());
    }

    #[tokio::test]
    async fn test_contended_chain_keeps_running_slot_whole() {
        let slots = [
            two_button("a", VbAction::Macro("hello".into()), VbAction::MouseHold(MouseButton::Left)),
            named("b", VbAction::KeyPress(vec![0x04])),
        ];
        let mut h = harness(&slots).await;
        h.pipeline.boot().await.unwrap();
        assert_eq!(h.usb.recv().await, Some(HidCommand::ReleaseAll));
        let routes_before = h.pipeline.flags().all_set(ROUTE_USB);

        let held = h.pipeline.actions().lock_for_replace().await.unwrap();
        let err = switch(&h, "b").await.unwrap_err();
        drop(held);

        assert!(matches!(err, SwitchError::Chain(ChainError::LockTimeout("action"))), "{err}");
        assert_eq!(h.pipeline.switcher().active().unwrap().name, "a");
        assert!(h.pipeline.flags().all_set(CONFIG_STABLE));
        assert_eq!(h.pipeline.flags().all_set(ROUTE_USB), routes_before);
        assert!(h.pipeline.hid().is_active(vb(1), Edge::Press).await.unwrap());
        assert!(h.pipeline.actions().is_active(vb(0), Edge::Press).await.unwrap());
        assert!(h.usb.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_switch_waits_for_busy_storage() {
        let h = harness(&[named("a", VbAction::Calibrate), named("b", VbAction::Calibrate)]).await;
        let storage = h.pipeline.storage().clone();
        let tx = storage.start("test", T).await.unwrap();

        let switcher = h.pipeline.switcher().clone();
        let pending = tokio::spawn(async move { switcher.request(SwitchRequest::Name("b".into())).await });

        /* longer than one transaction timeout, so the switcher has to retry */
        tokio::time::sleep(T + Duration::from_millis(200)).await;
        assert!(!pending.is_finished());
        assert!(h.pipeline.switcher().active().is_none());

        storage.finish(tx).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(3), pending).await.unwrap().unwrap().unwrap();
        assert_eq!(outcome.slot.name, "b");
    }

    #[tokio::test]
    async fn test_live_bind_replace_and_unbind() {
        let mut h = harness(&[]).await;
        h.pipeline.boot().await.unwrap();
        assert_eq!(h.usb.recv().await, Some(HidCommand::ReleaseAll));

        /* vb0 carries MOUSE_HOLD left in the factory slot */
        let added = h.pipeline.bind(vb(0), &VbAction::Macro("hi".into()), true).await.unwrap();
        assert_eq!(added, 1);
        assert!(!h.pipeline.hid().is_active(vb(0), Edge::Press).await.unwrap());
        assert_eq!(h.pipeline.bindings(vb(0)).await.unwrap(), ["press action macro 'hi'"]);

        let keys = VbAction::KeyPress(vec![0x04]);
        assert_eq!(h.pipeline.bind(vb(0), &keys, false).await.unwrap(), 2);
        assert_eq!(h.pipeline.bind(vb(7), &keys, false).await.unwrap(), 2);
        assert_eq!(
            h.pipeline.find_bindings(&keys.to_string()).await.unwrap(),
            [(vb(0), Edge::Press), (vb(0), Edge::Release), (vb(7), Edge::Press), (vb(7), Edge::Release)]
        );
        assert!(h.pipeline.flags().all_set(CMD_QUEUE_IDLE));

        assert_eq!(h.pipeline.unbind(vb(0)).await.unwrap(), 3);
        assert!(h.pipeline.bindings(vb(0)).await.unwrap().is_empty());
        assert_eq!(h.pipeline.find_bindings(&keys.to_string()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fire_runs_once_without_binding() {
        let mut h = harness(&[]).await;
        h.pipeline.boot().await.unwrap();
        assert_eq!(h.usb.recv().await, Some(HidCommand::ReleaseAll));

        let bound = h.pipeline.hid().len().await.unwrap();
        h.pipeline.fire(&VbAction::KeyPress(vec![0x05])).await.unwrap();
        assert_eq!(h.usb.recv().await, Some(HidCommand::KeyPress(0x05)));
        assert_eq!(h.usb.recv().await, Some(HidCommand::KeyRelease(0x05)));

        h.pipeline.fire(&VbAction::Calibrate).await.unwrap();
        assert_eq!(h.collab.calls().last().map(String::as_str), Some("calibrate"));
        assert_eq!(h.pipeline.hid().len().await.unwrap(), bound);
    }

    #[tokio::test]
    async fn test_command_batch_waits_for_first_slot() {
        let h = harness(&[]).await;
        let early = tokio::time::timeout(Duration::from_millis(50), h.pipeline.command_batch()).await;
        assert!(early.is_err());
        assert!(h.pipeline.flags().all_set(CMD_QUEUE_IDLE));

        h.pipeline.boot().await.unwrap();
        drop(h.pipeline.command_batch().await);
        assert!(h.pipeline.flags().all_set(CMD_QUEUE_IDLE));
    }

    #[tokio::test]
    async fn test_command_batch_gates_dispatch() {
        let mut h = harness(&[]).await;
        h.pipeline.boot().await.unwrap();
        assert_eq!(h.usb.recv().await, Some(HidCommand::ReleaseAll));

        let batch = h.pipeline.command_batch().await;
        assert!(!h.pipeline.flags().all_set(CMD_QUEUE_IDLE));
        assert_eq!(h.pipeline.hid().dispatch(vb(0), Edge::Press).await.unwrap(), 0);
        drop(batch);
        assert_eq!(h.pipeline.hid().dispatch(vb(0), Edge::Press).await.unwrap(), 1);

        let bindings = h.pipeline.bindings(vb(2)).await.unwrap();
        assert_eq!(bindings, ["press action switch NEXT"]);
    }
}
