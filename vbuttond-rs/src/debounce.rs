/* Debounce engine: one timer record per virtual button, driven by a single task.
 *
 * `DebounceTable` is the state machine and knows nothing about tasks; the
 * engine task feeds it raw edges and deadline expiries and forwards the
 * confirmed events to the dispatch path. Arming and cancelling a timer is a
 * plain table write, so nothing on the edge path ever blocks on a timer. */

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};

use crate::flags::{EventFlags, CONFIG_STABLE};
use crate::slot::{GeneralConfig, VbTiming};
use crate::vb::{Edge, EventOrigin, RawEdge, VbEvent, VirtualButton, VB_COUNT};

/* Used when neither the button nor the slot configures a debounce time. */
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(60);

/* Debounce times below this are not worth a timer; the edge is confirmed at once. */
pub const BYPASS_THRESHOLD: Duration = Duration::from_millis(5);

/* Resolved debounce configuration of the running slot. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebounceSettings {
    press: Duration,
    release: Duration,
    deadtime: Duration,
    per_vb: [VbTiming; VB_COUNT],
}

impl Default for DebounceSettings {
    fn default() -> Self {
        Self {
            press: Duration::ZERO,
            release: Duration::ZERO,
            deadtime: Duration::ZERO,
            per_vb: [VbTiming::default(); VB_COUNT],
        }
    }
}

fn ms(v: u16) -> Duration {
    Duration::from_millis(u64::from(v))
}

impl DebounceSettings {
    pub fn from_config(config: &GeneralConfig) -> Self {
        Self {
            press: ms(config.debounce_press_ms),
            release: ms(config.debounce_release_ms),
            deadtime: ms(config.deadtime_ms),
            per_vb: config.vb_timing,
        }
    }

    /* Per-button override, then slot-global value, then the built-in fallback. */
    pub fn debounce_time(&self, vb: VirtualButton, edge: Edge) -> Duration {
        let timing = &self.per_vb[vb.index()];
        let (own, global) = match edge {
            Edge::Press => (ms(timing.press_ms), self.press),
            Edge::Release => (ms(timing.release_ms), self.release),
        };
        [own, global]
            .into_iter()
            .find(|d| !d.is_zero())
            .unwrap_or(DEFAULT_DEBOUNCE)
    }

    pub fn deadtime(&self, vb: VirtualButton) -> Option<Duration> {
        let own = ms(self.per_vb[vb.index()].deadtime_ms);
        [own, self.deadtime].into_iter().find(|d| !d.is_zero())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    ArmedPress(Instant),
    ArmedRelease(Instant),
    Deadtime(Instant),
}

impl TimerState {
    fn deadline(self) -> Option<Instant> {
        match self {
            TimerState::Idle => None,
            TimerState::ArmedPress(t) | TimerState::ArmedRelease(t) | TimerState::Deadtime(t) => Some(t),
        }
    }

    fn armed(edge: Edge, deadline: Instant) -> Self {
        match edge {
            Edge::Press => TimerState::ArmedPress(deadline),
            Edge::Release => TimerState::ArmedRelease(deadline),
        }
    }
}

/// Per-button debounce state machine.
pub struct DebounceTable {
    timers: [TimerState; VB_COUNT],
    settings: DebounceSettings,
}

impl DebounceTable {
    pub fn new(settings: DebounceSettings) -> Self {
        Self {
            timers: [TimerState::Idle; VB_COUNT],
            settings,
        }
    }

    pub fn set_settings(&mut self, settings: DebounceSettings) {
        self.settings = settings;
    }

    #[cfg(test)]
    fn state(&self, vb: VirtualButton) -> TimerState {
        self.timers[vb.index()]
    }

    fn event(vb: VirtualButton, edge: Edge, origin: EventOrigin) -> VbEvent {
        VbEvent { vb, edge, origin }
    }

    /* State after a confirmed event: deadtime if configured, else idle. */
    fn after_confirm(&self, vb: VirtualButton, now: Instant) -> TimerState {
        match self.settings.deadtime(vb) {
            Some(d) => TimerState::Deadtime(now + d),
            None => TimerState::Idle,
        }
    }

    /* Feed one raw edge. Returns an event when the edge is confirmed at once or cancels a press. */
    pub fn on_edge(&mut self, raw: RawEdge, now: Instant) -> Option<VbEvent> {
        let vb = raw.vb;
        let state = self.timers[vb.index()];

        match (state, raw.kind.direction()) {
            (TimerState::Idle, None) => {
                debug!("{}: ambiguous edge while idle ignored", vb);
                None
            }
            (TimerState::Idle, Some(edge)) => {
                let time = self.settings.debounce_time(vb, edge);
                if time < BYPASS_THRESHOLD {
                    self.timers[vb.index()] = self.after_confirm(vb, now);
                    return Some(Self::event(vb, edge, EventOrigin::Bypass));
                }
                trace!("{}: arming {} timer for {:?}", vb, edge, time);
                self.timers[vb.index()] = TimerState::armed(edge, now + time);
                None
            }
            (TimerState::ArmedPress(_), Some(Edge::Press))
            | (TimerState::ArmedRelease(_), Some(Edge::Release)) => None,
            (TimerState::ArmedPress(_), _) => {
                self.timers[vb.index()] = TimerState::Idle;
                if raw.kind.carries_release() {
                    debug!("{}: press cancelled by release, emitting synthetic release", vb);
                    Some(Self::event(vb, Edge::Release, EventOrigin::Synthetic))
                } else {
                    None
                }
            }
            (TimerState::ArmedRelease(_), _) => {
                debug!("{}: release timer cancelled by {:?}", vb, raw.kind);
                self.timers[vb.index()] = TimerState::Idle;
                None
            }
            (TimerState::Deadtime(_), _) => {
                trace!("{}: edge {:?} during deadtime ignored", vb, raw.kind);
                None
            }
        }
    }

    /* Advance every timer whose deadline is at or before `now`. */
    pub fn expire(&mut self, now: Instant) -> Vec<VbEvent> {
        let mut events = Vec::new();
        for vb in VirtualButton::all() {
            let state = self.timers[vb.index()];
            match state {
                TimerState::ArmedPress(t) | TimerState::ArmedRelease(t) if t <= now => {
                    let edge = if matches!(state, TimerState::ArmedPress(_)) {
                        Edge::Press
                    } else {
                        Edge::Release
                    };
                    events.push(Self::event(vb, edge, EventOrigin::Debounced));
                    self.timers[vb.index()] = self.after_confirm(vb, now);
                }
                TimerState::Deadtime(t) if t <= now => {
                    self.timers[vb.index()] = TimerState::Idle;
                }
                _ => {}
            }
        }
        events
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().filter_map(|t| t.deadline()).min()
    }

    /* Cancel every outstanding timer. Returns how many were running. */
    pub fn cancel_all(&mut self) -> usize {
        let running = self.timers.iter().filter(|t| **t != TimerState::Idle).count();
        self.timers = [TimerState::Idle; VB_COUNT];
        running
    }
}

/* ------------------------------------------------------------------ */
/* Engine task                                                          */
/* ------------------------------------------------------------------ */

/* Handle used by the configuration switcher to push new debounce settings. */
#[derive(Clone)]
pub struct DebounceHandle {
    settings_tx: std::sync::Arc<watch::Sender<DebounceSettings>>,
}

impl DebounceHandle {
    pub fn reconfigure(&self, settings: DebounceSettings) {
        self.settings_tx.send_replace(settings);
    }
}

struct DebounceEngine {
    table: DebounceTable,
    edges: mpsc::Receiver<RawEdge>,
    events: mpsc::Sender<VbEvent>,
    flags: watch::Receiver<u32>,
    settings: watch::Receiver<DebounceSettings>,
}

impl DebounceEngine {
    fn apply_settings(&mut self) {
        let settings = self.settings.borrow_and_update().clone();
        self.table.set_settings(settings);
    }

    async fn emit(&mut self, event: VbEvent) -> bool {
        debug!("{} {} ({:?})", event.vb, event.edge, event.origin);
        self.events.send(event).await.is_ok()
    }

    /* Quiesced: drop timers and edges until the configuration is stable again. */
    async fn quiesce(&mut self) -> bool {
        let cancelled = self.table.cancel_all();
        let mut dropped = 0;
        while self.edges.try_recv().is_ok() {
            dropped += 1;
        }
        if cancelled > 0 || dropped > 0 {
            debug!("Pipeline unstable: cancelled {} timers, dropped {} edges", cancelled, dropped);
        }

        tokio::select! {
            biased;
            changed = self.settings.changed() => {
                if changed.is_ok() {
                    self.apply_settings();
                }
                true
            }
            changed = self.flags.changed() => changed.is_ok(),
            edge = self.edges.recv() => {
                if let Some(edge) = edge {
                    trace!("Dropping {:?}, pipeline not stable", edge);
                }
                edge.is_some()
            }
        }
    }

    async fn run(mut self) {
        info!("Debounce engine started ({} virtual buttons)", VB_COUNT);

        loop {
            if self.settings.has_changed().unwrap_or(false) {
                self.apply_settings();
            }

            let stable = *self.flags.borrow_and_update() & CONFIG_STABLE != 0;
            if !stable {
                if !self.quiesce().await {
                    break;
                }
                continue;
            }

            let deadline = self.table.next_deadline();
            let wake = deadline.unwrap_or_else(Instant::now);

            tokio::select! {
                biased;
                changed = self.settings.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.apply_settings();
                }
                changed = self.flags.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = sleep_until(wake), if deadline.is_some() => {
                    for event in self.table.expire(Instant::now()) {
                        if !self.emit(event).await {
                            return;
                        }
                    }
                }
                edge = self.edges.recv() => {
                    let Some(edge) = edge else { break };
                    if let Some(event) = self.table.on_edge(edge, Instant::now()) {
                        if !self.emit(event).await {
                            return;
                        }
                    }
                }
            }
        }

        debug!("Debounce engine loop exited");
    }
}

/* Spawn the debounce engine task. */
pub fn spawn_engine(
    edges: mpsc::Receiver<RawEdge>,
    events: mpsc::Sender<VbEvent>,
    flags: &EventFlags,
    settings: DebounceSettings,
) -> (DebounceHandle, JoinHandle<()>) {
    let (settings_tx, settings_rx) = watch::channel(settings.clone());
    let engine = DebounceEngine {
        table: DebounceTable::new(settings),
        edges,
        events,
        flags: flags.subscribe(),
        settings: settings_rx,
    };
    let task = tokio::spawn(async move {
        engine.run().await;
    });
    (
        DebounceHandle {
            settings_tx: std::sync::Arc::new(settings_tx),
        },
        task,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::CMD_QUEUE_IDLE;
    use crate::vb::RawEdgeKind;

    fn vb(id: u32) -> VirtualButton {
        VirtualButton::new(id).unwrap()
    }

    fn settings_with(press_ms: u16, release_ms: u16, deadtime_ms: u16) -> DebounceSettings {
        let config = GeneralConfig {
            debounce_press_ms: press_ms,
            debounce_release_ms: release_ms,
            deadtime_ms,
            ..GeneralConfig::default()
        };
        DebounceSettings::from_config(&config)
    }

    #[test]
    fn test_time_resolution_order() {
        let mut config = GeneralConfig {
            debounce_press_ms: 40,
            ..GeneralConfig::default()
        };
        config.vb_timing[3].press_ms = 15;
        config.vb_timing[3].deadtime_ms = 200;
        let settings = DebounceSettings::from_config(&config);

        assert_eq!(settings.debounce_time(vb(3), Edge::Press), Duration::from_millis(15));
        assert_eq!(settings.debounce_time(vb(4), Edge::Press), Duration::from_millis(40));
        assert_eq!(settings.debounce_time(vb(4), Edge::Release), DEFAULT_DEBOUNCE);
        assert_eq!(settings.deadtime(vb(3)), Some(Duration::from_millis(200)));
        assert_eq!(settings.deadtime(vb(4)), None);
    }

    #[test]
    fn test_short_press_yields_no_confirmed_event() {
        let mut table = DebounceTable::new(settings_with(50, 50, 0));
        let t0 = Instant::now();

        assert_eq!(table.on_edge(RawEdge::press(vb(1)), t0), None);
        let event = table.on_edge(RawEdge::release(vb(1)), t0 + Duration::from_millis(20));
        assert_eq!(
            event,
            Some(VbEvent {
                vb: vb(1),
                edge: Edge::Release,
                origin: EventOrigin::Synthetic
            })
        );
        assert!(table.expire(t0 + Duration::from_millis(500)).is_empty());
        assert_eq!(table.state(vb(1)), TimerState::Idle);
    }

    #[test]
    fn test_held_press_yields_exactly_one_press() {
        let mut table = DebounceTable::new(settings_with(50, 50, 0));
        let t0 = Instant::now();
        table.on_edge(RawEdge::press(vb(2)), t0);
        /* same-direction re-assertion is a no-op */
        table.on_edge(RawEdge::press(vb(2)), t0 + Duration::from_millis(30));
        assert!(table.expire(t0 + Duration::from_millis(49)).is_empty());

        let events = table.expire(t0 + Duration::from_millis(50));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].edge, Edge::Press);
        assert_eq!(events[0].origin, EventOrigin::Debounced);
        assert!(table.expire(t0 + Duration::from_millis(200)).is_empty());
    }

    #[test]
    fn test_release_timer_cancelled_by_press_emits_nothing() {
        let mut table = DebounceTable::new(settings_with(50, 50, 0));
        let t0 = Instant::now();
        table.on_edge(RawEdge::release(vb(0)), t0);
        assert_eq!(table.on_edge(RawEdge::press(vb(0)), t0 + Duration::from_millis(5)), None);
        assert_eq!(table.state(vb(0)), TimerState::Idle);
    }

    #[test]
    fn test_ambiguous_edge_cancels_press_with_release() {
        let mut table = DebounceTable::new(settings_with(50, 50, 0));
        let t0 = Instant::now();
        let ambiguous = RawEdge {
            vb: vb(6),
            kind: RawEdgeKind::Ambiguous,
        };
        assert_eq!(table.on_edge(ambiguous, t0), None);
        assert_eq!(table.state(vb(6)), TimerState::Idle);

        table.on_edge(RawEdge::press(vb(6)), t0);
        let event = table.on_edge(ambiguous, t0 + Duration::from_millis(1)).unwrap();
        assert_eq!(event.origin, EventOrigin::Synthetic);
        assert_eq!(table.state(vb(6)), TimerState::Idle);
    }

    #[test]
    fn test_bypass_and_deadtime() {
        let mut table = DebounceTable::new(settings_with(2, 2, 100));
        let t0 = Instant::now();
        let event = table.on_edge(RawEdge::press(vb(4)), t0).unwrap();
        assert_eq!(event.origin, EventOrigin::Bypass);
        assert!(matches!(table.state(vb(4)), TimerState::Deadtime(_)));

        /* quiet period swallows edges */
        assert_eq!(table.on_edge(RawEdge::release(vb(4)), t0 + Duration::from_millis(50)), None);
        assert!(table.expire(t0 + Duration::from_millis(100)).is_empty());
        assert_eq!(table.state(vb(4)), TimerState::Idle);
        assert!(table.on_edge(RawEdge::release(vb(4)), t0 + Duration::from_millis(101)).is_some());
    }

    #[test]
    fn test_one_timer_state_per_button() {
        let mut table = DebounceTable::new(settings_with(30, 30, 40));
        let t0 = Instant::now();
        for (i, kind) in [RawEdgeKind::Press, RawEdgeKind::Release, RawEdgeKind::Ambiguous]
            .into_iter()
            .cycle()
            .take(30)
            .enumerate()
        {
            let now = t0 + Duration::from_millis(7 * i as u64);
            table.on_edge(RawEdge { vb: vb(9), kind }, now);
            table.expire(now);
            assert_eq!(table.timers.len(), VB_COUNT);
            let others_idle = VirtualButton::all()
                .filter(|v| *v != vb(9))
                .all(|v| table.state(v) == TimerState::Idle);
            assert!(others_idle);
        }
    }

    #[test]
    fn test_cancel_all() {
        let mut table = DebounceTable::new(settings_with(30, 30, 0));
        let t0 = Instant::now();
        table.on_edge(RawEdge::press(vb(0)), t0);
        table.on_edge(RawEdge::release(vb(1)), t0);
        assert_eq!(table.cancel_all(), 2);
        assert_eq!(table.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_confirms_and_quiesces() {
        let flags = EventFlags::new(CONFIG_STABLE | CMD_QUEUE_IDLE);
        let (edge_tx, edge_rx) = mpsc::channel(8);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (_handle, _task) = spawn_engine(edge_rx, event_tx, &flags, settings_with(50, 50, 0));

        edge_tx.send(RawEdge::press(vb(1))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let event = event_rx.try_recv().unwrap();
        assert_eq!((event.vb, event.edge, event.origin), (vb(1), Edge::Press, EventOrigin::Debounced));

        /* a pending timer dies with the stable bit */
        edge_tx.send(RawEdge::release(vb(1))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        flags.clear(CONFIG_STABLE);
        edge_tx.send(RawEdge::press(vb(2))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(event_rx.try_recv().is_err());

        flags.set(CONFIG_STABLE);
        tokio::time::sleep(Duration::from_millis(1)).await;
        edge_tx.send(RawEdge::press(vb(2))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(event_rx.try_recv().unwrap().vb, vb(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_picks_up_new_settings() {
        let flags = EventFlags::new(CONFIG_STABLE | CMD_QUEUE_IDLE);
        let (edge_tx, edge_rx) = mpsc::channel(8);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (handle, _task) = spawn_engine(edge_rx, event_tx, &flags, settings_with(50, 50, 0));

        handle.reconfigure(settings_with(1, 1, 0));
        tokio::time::sleep(Duration::from_millis(1)).await;
        edge_tx.send(RawEdge::press(vb(0))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(event_rx.try_recv().unwrap().origin, EventOrigin::Bypass);
    }
}
