/* HID vocabulary of the command chain, the sink that routes it onto the
 * USB/BLE transport queues, and the transport sender tasks.
 *
 * Wire encoding belongs to the link layer; a transport here only folds the
 * incoming commands into report state and hands the report on (logged). */

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chain::{ActionSink, CommandChain, SinkError};
use crate::flags::{EventFlags, ROUTE_BLE, ROUTE_USB};
use crate::vb::{Edge, VirtualButton};

/* Keyboard usage ids of the modifier keys (left ctrl .. right gui). */
const MODIFIER_FIRST: u8 = 0xe0;
const MODIFIER_LAST: u8 = 0xe7;

/* Boot keyboard report carries six simultaneous keys. */
const KEYBOARD_ROLLOVER: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn mask(self) -> u8 {
        match self {
            MouseButton::Left => 0x01,
            MouseButton::Right => 0x02,
            MouseButton::Middle => 0x04,
        }
    }
}

impl fmt::Display for MouseButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MouseButton::Left => f.write_str("left"),
            MouseButton::Right => f.write_str("right"),
            MouseButton::Middle => f.write_str("middle"),
        }
    }
}

/* A prebuilt HID command as stored in the HID command chain. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidCommand {
    KeyPress(u8),
    KeyRelease(u8),
    /* press if released, release if pressed */
    KeyToggle(u8),
    MousePress(MouseButton),
    MouseRelease(MouseButton),
    MouseClick(MouseButton),
    MouseDoubleClick(MouseButton),
    MouseWheel(i8),
    MouseMove { x: i8, y: i8 },
    JoystickPress(u8),
    JoystickRelease(u8),
    ReleaseAll,
}

pub type HidChain = CommandChain<HidCommand, HidSink>;

/* ------------------------------------------------------------------ */
/* Sink                                                                 */
/* ------------------------------------------------------------------ */

/* Input queues of the two HID transports. */
#[derive(Clone)]
pub struct HidQueues {
    pub usb: mpsc::Sender<HidCommand>,
    pub ble: mpsc::Sender<HidCommand>,
}

/* Fires HID commands onto the transports enabled by the routing flags. */
pub struct HidSink {
    queues: HidQueues,
    flags: EventFlags,
}

impl HidSink {
    pub fn new(queues: HidQueues, flags: EventFlags) -> Self {
        Self { queues, flags }
    }

    /* Release every key and button on both transports, regardless of routing. */
    pub fn release_all(&self) -> Result<(), SinkError> {
        self.push_to(true, true, HidCommand::ReleaseAll)
    }

    /* Offer `cmd` to every selected queue; a failing queue does not stop the
     * others. Reports the first failure. */
    fn push_to(&self, usb: bool, ble: bool, cmd: HidCommand) -> Result<(), SinkError> {
        let targets = [(usb, &self.queues.usb, "usb"), (ble, &self.queues.ble, "ble")];
        let mut first = None;
        for (_, queue, name) in targets.into_iter().filter(|(on, _, _)| *on) {
            if let Err(e) = push(queue, name, cmd) {
                warn!("HID {:?} not queued: {}", cmd, e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

fn push(queue: &mpsc::Sender<HidCommand>, name: &'static str, cmd: HidCommand) -> Result<(), SinkError> {
    queue.try_send(cmd).map_err(|e| match e {
        TrySendError::Full(_) => SinkError::QueueFull(name),
        TrySendError::Closed(_) => SinkError::QueueClosed(name),
    })
}

#[async_trait]
impl ActionSink<HidCommand> for HidSink {
    fn vocabulary(&self) -> &'static str {
        "hid"
    }

    async fn fire(&self, vb: Option<VirtualButton>, edge: Edge, cmd: &HidCommand) -> Result<(), SinkError> {
        let routing = self.flags.get();
        debug!("HID {:?} for {:?}/{} (routing {:#x})", cmd, vb, edge, routing);
        self.push_to(routing & ROUTE_USB != 0, routing & ROUTE_BLE != 0, *cmd)
    }
}

/* ------------------------------------------------------------------ */
/* Transport sender                                                     */
/* ------------------------------------------------------------------ */

/* A report handed to the link layer. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidReport {
    /* modifiers, reserved, six key slots */
    Keyboard([u8; 8]),
    Mouse { buttons: u8, x: i8, y: i8, wheel: i8 },
    Joystick { buttons: u32 },
}

/* Pressed-state of one transport, folded from the command stream. */
#[derive(Debug, Default)]
pub struct HidState {
    modifiers: u8,
    keys: Vec<u8>,
    mouse_buttons: u8,
    joystick_buttons: u32,
}

impl HidState {
    fn keyboard_report(&self) -> HidReport {
        let mut report = [0u8; 8];
        report[0] = self.modifiers;
        for (slot, key) in report[2..].iter_mut().zip(&self.keys) {
            *slot = *key;
        }
        HidReport::Keyboard(report)
    }

    fn mouse_report(&self, x: i8, y: i8, wheel: i8) -> HidReport {
        HidReport::Mouse {
            buttons: self.mouse_buttons,
            x,
            y,
            wheel,
        }
    }

    /* Apply one command and return the reports it produces, in order. */
    pub fn apply(&mut self, cmd: HidCommand) -> Vec<HidReport> {
        match cmd {
            HidCommand::KeyPress(key @ MODIFIER_FIRST..=MODIFIER_LAST) => {
                self.modifiers |= 1 << (key - MODIFIER_FIRST);
                vec![self.keyboard_report()]
            }
            HidCommand::KeyRelease(key @ MODIFIER_FIRST..=MODIFIER_LAST) => {
                self.modifiers &= !(1 << (key - MODIFIER_FIRST));
                vec![self.keyboard_report()]
            }
            HidCommand::KeyPress(key) => {
                if !self.keys.contains(&key) {
                    if self.keys.len() == KEYBOARD_ROLLOVER {
                        warn!("Keyboard rollover exceeded, dropping key {:#04x}", key);
                        return Vec::new();
                    }
                    self.keys.push(key);
                }
                vec![self.keyboard_report()]
            }
            HidCommand::KeyRelease(key) => {
                self.keys.retain(|k| *k != key);
                vec![self.keyboard_report()]
            }
            HidCommand::KeyToggle(key) => {
                let held = match key {
                    MODIFIER_FIRST..=MODIFIER_LAST => self.modifiers & (1 << (key - MODIFIER_FIRST)) != 0,
                    _ => self.keys.contains(&key),
                };
                if held {
                    self.apply(HidCommand::KeyRelease(key))
                } else {
                    self.apply(HidCommand::KeyPress(key))
                }
            }
            HidCommand::MousePress(button) => {
                self.mouse_buttons |= button.mask();
                vec![self.mouse_report(0, 0, 0)]
            }
            HidCommand::MouseRelease(button) => {
                self.mouse_buttons &= !button.mask();
                vec![self.mouse_report(0, 0, 0)]
            }
            HidCommand::MouseClick(button) => self.click(button, 1),
            HidCommand::MouseDoubleClick(button) => self.click(button, 2),
            HidCommand::MouseWheel(steps) => vec![self.mouse_report(0, 0, steps)],
            HidCommand::MouseMove { x, y } => vec![self.mouse_report(x, y, 0)],
            HidCommand::JoystickPress(n) => {
                self.joystick_buttons |= 1u32.checked_shl(u32::from(n)).unwrap_or(0);
                vec![HidReport::Joystick { buttons: self.joystick_buttons }]
            }
            HidCommand::JoystickRelease(n) => {
                self.joystick_buttons &= !1u32.checked_shl(u32::from(n)).unwrap_or(0);
                vec![HidReport::Joystick { buttons: self.joystick_buttons }]
            }
            HidCommand::ReleaseAll => {
                *self = HidState::default();
                vec![
                    self.keyboard_report(),
                    self.mouse_report(0, 0, 0),
                    HidReport::Joystick { buttons: 0 },
                ]
            }
        }
    }

    fn click(&mut self, button: MouseButton, count: usize) -> Vec<HidReport> {
        let held = self.mouse_buttons;
        let mut reports = Vec::with_capacity(count * 2);
        for _ in 0..count {
            self.mouse_buttons = held | button.mask();
            reports.push(self.mouse_report(0, 0, 0));
            self.mouse_buttons = held & !button.mask();
            reports.push(self.mouse_report(0, 0, 0));
        }
        reports
    }
}

/* Spawn a transport sender task consuming its own bounded input queue. */
pub fn spawn_transport(name: &'static str, capacity: usize) -> (mpsc::Sender<HidCommand>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<HidCommand>(capacity);

    let task = tokio::spawn(async move {
        info!("HID transport {} started", name);
        let mut state = HidState::default();
        while let Some(cmd) = rx.recv().await {
            for report in state.apply(cmd) {
                debug!("{} report: {:02x?}", name, report);
            }
        }
        debug!("HID transport {} queue closed", name);
    });

    (tx, task)
}
