/* Slot contents: the fixed-size general settings record, the per-button action
 * payloads, and the factory default slot.
 *
 * `GeneralConfig` is persisted as a fixed little-endian record of
 * `GENERAL_CONFIG_SIZE` bytes; the checksum in the slot file covers exactly
 * these bytes. Per-button payloads are serialized separately (JSON) and only
 * their kind tag and size live in the record. */

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::GeneralAction;
use crate::hid::{HidCommand, MouseButton};
use crate::switcher::SwitchRequest;
use crate::vb::{Edge, VirtualButton, VB_COUNT};

pub const SLOT_NAME_MAX: usize = 32;
pub const GENERAL_CONFIG_SIZE: usize = 256;

/* Payloads larger than this are refused, both on store and on load. */
pub const PAYLOAD_MAX: usize = 1024;

pub const DEFAULT_SLOT_NAME: &str = "mouse";

pub const FEEDBACK_BUZZER: u8 = 1 << 0;
pub const FEEDBACK_LED: u8 = 1 << 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("settings record truncated at byte {0}")]
    Truncated(usize),
    #[error("unknown action kind tag {0}")]
    UnknownKind(u8),
    #[error("unknown keyboard locale tag {0}")]
    UnknownLocale(u8),
    #[error("unknown analog mode tag {0}")]
    UnknownAnalogMode(u8),
    #[error("invalid name '{0}' (1..={max} bytes)", max = SLOT_NAME_MAX)]
    InvalidName(String),
    #[error("payload of {0} bytes exceeds {max}", max = PAYLOAD_MAX)]
    PayloadTooLarge(usize),
    #[error("payload does not decode: {0}")]
    Payload(String),
    #[error("payload kind {found:?} does not match configured kind {expected:?}")]
    KindMismatch { expected: ActionKind, found: ActionKind },
}

pub fn validate_name(name: &str) -> Result<(), SlotError> {
    if name.is_empty() || name.len() > SLOT_NAME_MAX {
        return Err(SlotError::InvalidName(name.to_string()));
    }
    Ok(())
}

/* ------------------------------------------------------------------ */
/* Enumerations stored as tags                                          */
/* ------------------------------------------------------------------ */

/* Keyboard locale tag; the tables themselves live with the keyboard layer. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Locale {
    UsEnglish = 0,
    German = 1,
    French = 2,
    Spanish = 3,
    Italian = 4,
    Swedish = 5,
}

impl Locale {
    fn from_tag(tag: u8) -> Result<Self, SlotError> {
        Ok(match tag {
            0 => Locale::UsEnglish,
            1 => Locale::German,
            2 => Locale::French,
            3 => Locale::Spanish,
            4 => Locale::Italian,
            5 => Locale::Swedish,
            other => return Err(SlotError::UnknownLocale(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AnalogMode {
    Mouse = 0,
    Joystick = 1,
    Alternative = 2,
}

impl AnalogMode {
    fn from_tag(tag: u8) -> Result<Self, SlotError> {
        Ok(match tag {
            0 => AnalogMode::Mouse,
            1 => AnalogMode::Joystick,
            2 => AnalogMode::Alternative,
            other => return Err(SlotError::UnknownAnalogMode(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ActionKind {
    #[default]
    None = 0,
    KeyPress = 1,
    KeyToggle = 2,
    MouseHold = 3,
    MouseClick = 4,
    MouseDoubleClick = 5,
    MouseWheel = 6,
    MouseMove = 7,
    JoystickButton = 8,
    Macro = 9,
    Infrared = 10,
    Calibrate = 11,
    ConfigSwitch = 12,
}

impl ActionKind {
    pub fn from_tag(tag: u8) -> Result<Self, SlotError> {
        Ok(match tag {
            0 => ActionKind::None,
            1 => ActionKind::KeyPress,
            2 => ActionKind::KeyToggle,
            3 => ActionKind::MouseHold,
            4 => ActionKind::MouseClick,
            5 => ActionKind::MouseDoubleClick,
            6 => ActionKind::MouseWheel,
            7 => ActionKind::MouseMove,
            8 => ActionKind::JoystickButton,
            9 => ActionKind::Macro,
            10 => ActionKind::Infrared,
            11 => ActionKind::Calibrate,
            12 => ActionKind::ConfigSwitch,
            other => return Err(SlotError::UnknownKind(other)),
        })
    }
}

/* ------------------------------------------------------------------ */
/* General settings record                                              */
/* ------------------------------------------------------------------ */

/* Per-button timing overrides in milliseconds; 0 inherits the global value. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VbTiming {
    pub press_ms: u16,
    pub release_ms: u16,
    pub deadtime_ms: u16,
}

/* Settings handed to the analog input collaborator. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalogConfig {
    pub mode: AnalogMode,
    pub sensitivity_x: u8,
    pub sensitivity_y: u8,
    pub deadzone_x: u8,
    pub deadzone_y: u8,
    pub acceleration: u8,
    pub max_speed: u8,
    pub threshold_sip: u16,
    pub threshold_puff: u16,
    pub threshold_strong_sip: u16,
    pub threshold_strong_puff: u16,
}

impl Default for AnalogConfig {
    fn default() -> Self {
        Self {
            mode: AnalogMode::Mouse,
            sensitivity_x: 40,
            sensitivity_y: 40,
            deadzone_x: 20,
            deadzone_y: 20,
            acceleration: 50,
            max_speed: 50,
            threshold_sip: 500,
            threshold_puff: 525,
            threshold_strong_sip: 300,
            threshold_strong_puff: 700,
        }
    }
}

/// Whole-device settings of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralConfig {
    pub locale: Locale,
    pub feedback: u8,
    pub usb_active: bool,
    pub ble_active: bool,
    pub debounce_press_ms: u16,
    pub debounce_release_ms: u16,
    pub deadtime_ms: u16,
    pub vb_timing: [VbTiming; VB_COUNT],
    pub analog: AnalogConfig,
    pub vb_kind: [ActionKind; VB_COUNT],
    pub vb_payload_len: [u16; VB_COUNT],
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            locale: Locale::UsEnglish,
            feedback: FEEDBACK_BUZZER | FEEDBACK_LED,
            usb_active: true,
            ble_active: false,
            debounce_press_ms: 0,
            debounce_release_ms: 0,
            deadtime_ms: 0,
            vb_timing: [VbTiming::default(); VB_COUNT],
            analog: AnalogConfig::default(),
            vb_kind: [ActionKind::None; VB_COUNT],
            vb_payload_len: [0; VB_COUNT],
        }
    }
}

/* Little-endian cursor over a settings record. */
struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn u8(&mut self) -> Result<u8, SlotError> {
        let b = *self.buf.get(self.pos).ok_or(SlotError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, SlotError> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + 2)
            .ok_or(SlotError::Truncated(self.pos))?;
        self.pos += 2;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn bool(&mut self) -> Result<bool, SlotError> {
        Ok(self.u8()? != 0)
    }
}

impl GeneralConfig {
    pub fn to_bytes(&self) -> [u8; GENERAL_CONFIG_SIZE] {
        let mut out = Vec::with_capacity(GENERAL_CONFIG_SIZE);
        out.push(self.locale as u8);
        out.push(self.feedback);
        out.push(u8::from(self.usb_active));
        out.push(u8::from(self.ble_active));
        out.extend_from_slice(&self.debounce_press_ms.to_le_bytes());
        out.extend_from_slice(&self.debounce_release_ms.to_le_bytes());
        out.extend_from_slice(&self.deadtime_ms.to_le_bytes());
        for t in &self.vb_timing {
            out.extend_from_slice(&t.press_ms.to_le_bytes());
            out.extend_from_slice(&t.release_ms.to_le_bytes());
            out.extend_from_slice(&t.deadtime_ms.to_le_bytes());
        }
        let a = &self.analog;
        out.extend_from_slice(&[
            a.mode as u8,
            a.sensitivity_x,
            a.sensitivity_y,
            a.deadzone_x,
            a.deadzone_y,
            a.acceleration,
            a.max_speed,
        ]);
        for threshold in [
            a.threshold_sip,
            a.threshold_puff,
            a.threshold_strong_sip,
            a.threshold_strong_puff,
        ] {
            out.extend_from_slice(&threshold.to_le_bytes());
        }
        out.extend(self.vb_kind.iter().map(|k| *k as u8));
        for len in &self.vb_payload_len {
            out.extend_from_slice(&len.to_le_bytes());
        }

        /* remaining bytes are reserved and stay zero */
        let mut record = [0u8; GENERAL_CONFIG_SIZE];
        record[..out.len()].copy_from_slice(&out);
        record
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, SlotError> {
        if buf.len() < GENERAL_CONFIG_SIZE {
            return Err(SlotError::Truncated(buf.len()));
        }
        let mut r = RecordReader { buf, pos: 0 };

        let locale = Locale::from_tag(r.u8()?)?;
        let feedback = r.u8()?;
        let usb_active = r.bool()?;
        let ble_active = r.bool()?;
        let debounce_press_ms = r.u16()?;
        let debounce_release_ms = r.u16()?;
        let deadtime_ms = r.u16()?;

        let mut vb_timing = [VbTiming::default(); VB_COUNT];
        for t in vb_timing.iter_mut() {
            t.press_ms = r.u16()?;
            t.release_ms = r.u16()?;
            t.deadtime_ms = r.u16()?;
        }

        let analog = AnalogConfig {
            mode: AnalogMode::from_tag(r.u8()?)?,
            sensitivity_x: r.u8()?,
            sensitivity_y: r.u8()?,
            deadzone_x: r.u8()?,
            deadzone_y: r.u8()?,
            acceleration: r.u8()?,
            max_speed: r.u8()?,
            threshold_sip: r.u16()?,
            threshold_puff: r.u16()?,
            threshold_strong_sip: r.u16()?,
            threshold_strong_puff: r.u16()?,
        };

        let mut vb_kind = [ActionKind::None; VB_COUNT];
        for kind in vb_kind.iter_mut() {
            *kind = ActionKind::from_tag(r.u8()?)?;
        }
        let mut vb_payload_len = [0u16; VB_COUNT];
        for len in vb_payload_len.iter_mut() {
            *len = r.u16()?;
        }

        Ok(Self {
            locale,
            feedback,
            usb_active,
            ble_active,
            debounce_press_ms,
            debounce_release_ms,
            deadtime_ms,
            vb_timing,
            analog,
            vb_kind,
            vb_payload_len,
        })
    }

    /* Record `action` as the configuration of `vb` and return its serialized payload. */
    pub fn bind(&mut self, vb: VirtualButton, action: &VbAction) -> Result<Vec<u8>, SlotError> {
        let payload = action.to_payload()?;
        self.vb_kind[vb.index()] = action.kind();
        self.vb_payload_len[vb.index()] = payload.len() as u16;
        Ok(payload)
    }
}

/* ------------------------------------------------------------------ */
/* Per-button actions                                                   */
/* ------------------------------------------------------------------ */

/// The action configured for one virtual button (its persisted payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "param", rename_all = "snake_case")]
pub enum VbAction {
    None,
    /// Keys (HID usage ids) held while the button is held.
    KeyPress(Vec<u8>),
    /// Keys pressed on one press and released on the next.
    KeyToggle(Vec<u8>),
    MouseHold(MouseButton),
    MouseClick(MouseButton),
    MouseDoubleClick(MouseButton),
    MouseWheel(i8),
    MouseMove { x: i8, y: i8 },
    JoystickButton(u8),
    Macro(String),
    Infrared(String),
    Calibrate,
    ConfigSwitch(SwitchRequest),
}

impl VbAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            VbAction::None => ActionKind::None,
            VbAction::KeyPress(_) => ActionKind::KeyPress,
            VbAction::KeyToggle(_) => ActionKind::KeyToggle,
            VbAction::MouseHold(_) => ActionKind::MouseHold,
            VbAction::MouseClick(_) => ActionKind::MouseClick,
            VbAction::MouseDoubleClick(_) => ActionKind::MouseDoubleClick,
            VbAction::MouseWheel(_) => ActionKind::MouseWheel,
            VbAction::MouseMove { .. } => ActionKind::MouseMove,
            VbAction::JoystickButton(_) => ActionKind::JoystickButton,
            VbAction::Macro(_) => ActionKind::Macro,
            VbAction::Infrared(_) => ActionKind::Infrared,
            VbAction::Calibrate => ActionKind::Calibrate,
            VbAction::ConfigSwitch(_) => ActionKind::ConfigSwitch,
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, SlotError> {
        let payload = serde_json::to_vec(self).map_err(|e| SlotError::Payload(e.to_string()))?;
        if payload.len() > PAYLOAD_MAX {
            return Err(SlotError::PayloadTooLarge(payload.len()));
        }
        Ok(payload)
    }

    /* Decode a payload and check it against the kind recorded in the settings record. */
    pub fn from_payload(expected: ActionKind, payload: &[u8]) -> Result<Self, SlotError> {
        if payload.len() > PAYLOAD_MAX {
            return Err(SlotError::PayloadTooLarge(payload.len()));
        }
        let action: VbAction =
            serde_json::from_slice(payload).map_err(|e| SlotError::Payload(e.to_string()))?;
        if action.kind() != expected {
            return Err(SlotError::KindMismatch {
                expected,
                found: action.kind(),
            });
        }
        Ok(action)
    }

    /* HID chain entries this action compiles to. */
    pub fn hid_bindings(&self) -> Vec<(Edge, HidCommand)> {
        match self {
            VbAction::KeyPress(keys) => keys
                .iter()
                .map(|k| (Edge::Press, HidCommand::KeyPress(*k)))
                .chain(keys.iter().map(|k| (Edge::Release, HidCommand::KeyRelease(*k))))
                .collect(),
            VbAction::KeyToggle(keys) => keys
                .iter()
                .map(|k| (Edge::Press, HidCommand::KeyToggle(*k)))
                .collect(),
            VbAction::MouseHold(b) => vec![
                (Edge::Press, HidCommand::MousePress(*b)),
                (Edge::Release, HidCommand::MouseRelease(*b)),
            ],
            VbAction::MouseClick(b) => vec![(Edge::Press, HidCommand::MouseClick(*b))],
            VbAction::MouseDoubleClick(b) => vec![(Edge::Press, HidCommand::MouseDoubleClick(*b))],
            VbAction::MouseWheel(steps) => vec![(Edge::Press, HidCommand::MouseWheel(*steps))],
            VbAction::MouseMove { x, y } => vec![(Edge::Press, HidCommand::MouseMove { x: *x, y: *y })],
            VbAction::JoystickButton(n) => vec![
                (Edge::Press, HidCommand::JoystickPress(*n)),
                (Edge::Release, HidCommand::JoystickRelease(*n)),
            ],
            _ => Vec::new(),
        }
    }

    /* General-action chain entries this action compiles to. */
    pub fn general_bindings(&self) -> Vec<(Edge, GeneralAction)> {
        match self {
            VbAction::Macro(text) => vec![(Edge::Press, GeneralAction::Macro(text.clone()))],
            VbAction::Infrared(name) => vec![(Edge::Press, GeneralAction::Infrared(name.clone()))],
            VbAction::Calibrate => vec![(Edge::Press, GeneralAction::Calibrate)],
            VbAction::ConfigSwitch(req) => vec![(Edge::Press, GeneralAction::SwitchSlot(req.clone()))],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for VbAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = |keys: &[u8]| {
            keys.iter()
                .map(|k| format!("{k:#04x}"))
                .collect::<Vec<_>>()
                .join(" ")
        };
        match self {
            VbAction::None => f.write_str("NONE"),
            VbAction::KeyPress(k) => write!(f, "KEY_PRESS {}", keys(k)),
            VbAction::KeyToggle(k) => write!(f, "KEY_TOGGLE {}", keys(k)),
            VbAction::MouseHold(b) => write!(f, "MOUSE_HOLD {b}"),
            VbAction::MouseClick(b) => write!(f, "MOUSE_CLICK {b}"),
            VbAction::MouseDoubleClick(b) => write!(f, "MOUSE_DOUBLE_CLICK {b}"),
            VbAction::MouseWheel(s) => write!(f, "MOUSE_WHEEL {s}"),
            VbAction::MouseMove { x, y } => write!(f, "MOUSE_MOVE {x} {y}"),
            VbAction::JoystickButton(n) => write!(f, "JOYSTICK_BUTTON {n}"),
            VbAction::Macro(text) => write!(f, "MACRO {text}"),
            VbAction::Infrared(name) => write!(f, "INFRARED {name}"),
            VbAction::Calibrate => f.write_str("CALIBRATE"),
            VbAction::ConfigSwitch(req) => write!(f, "SWITCH {req}"),
        }
    }
}

/* ------------------------------------------------------------------ */
/* Factory default                                                      */
/* ------------------------------------------------------------------ */

/// A complete slot as held in memory: settings plus one payload per button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotImage {
    pub name: String,
    pub config: GeneralConfig,
    pub payloads: Vec<Vec<u8>>,
}

impl SlotImage {
    /* Build an image from per-button actions; buttons without an action stay `None`. */
    pub fn from_actions(
        name: &str,
        mut config: GeneralConfig,
        actions: &[(VirtualButton, VbAction)],
    ) -> Result<Self, SlotError> {
        validate_name(name)?;
        let mut payloads = vec![Vec::new(); VB_COUNT];
        for vb in VirtualButton::all() {
            config.vb_kind[vb.index()] = ActionKind::None;
            config.vb_payload_len[vb.index()] = 0;
        }
        for (vb, action) in actions {
            payloads[vb.index()] = config.bind(*vb, action)?;
        }
        Ok(Self {
            name: name.to_string(),
            config,
            payloads,
        })
    }
}

/* The slot fabricated on first boot and by a factory reset. */
pub fn factory_default() -> Result<SlotImage, SlotError> {
    let config = GeneralConfig {
        locale: Locale::German,
        ..GeneralConfig::default()
    };
    let actions: Vec<(VirtualButton, VbAction)> = VirtualButton::all()
        .zip([
            VbAction::MouseHold(MouseButton::Left),
            VbAction::MouseClick(MouseButton::Right),
            VbAction::ConfigSwitch(SwitchRequest::Next),
            VbAction::MouseWheel(3),
            VbAction::MouseWheel(-3),
            VbAction::Calibrate,
        ])
        .collect();
    SlotImage::from_actions(DEFAULT_SLOT_NAME, config, &actions)
}
