/* Virtual buttons: the logical input channels every other subsystem is keyed by.
 *
 * A virtual button is only an id in a fixed range. All validation of that range
 * happens here so the rest of the daemon can take a `VirtualButton` at face value. */

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/* Number of virtual buttons, fixed at build time. Bitmaps are `u32`, so this must stay <= 32. */
pub const VB_COUNT: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VbError {
    #[error("virtual button {0} out of range (0..{max})", max = VB_COUNT)]
    OutOfRange(u32),
    #[error("unknown edge kind '{0}'")]
    UnknownEdge(String),
}

/* A validated virtual button id. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct VirtualButton(u8);

impl VirtualButton {
    pub fn new(id: u32) -> Result<Self, VbError> {
        if (id as usize) < VB_COUNT {
            Ok(Self(id as u8))
        } else {
            Err(VbError::OutOfRange(id))
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    /* Bit of this button in an active-bitmap word. */
    pub fn mask(self) -> u32 {
        1u32 << self.0
    }

    /* Iterate every virtual button in id order. */
    pub fn all() -> impl Iterator<Item = VirtualButton> {
        (0..VB_COUNT as u8).map(VirtualButton)
    }
}

impl TryFrom<u8> for VirtualButton {
    type Error = VbError;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        Self::new(u32::from(id))
    }
}

impl From<VirtualButton> for u8 {
    fn from(vb: VirtualButton) -> u8 {
        vb.0
    }
}

impl fmt::Display for VirtualButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VB{}", self.0)
    }
}

/* Where a command is bound: a persistent virtual button, or nowhere (fire once, now). */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Button(VirtualButton),
    SingleShot,
}

/* Confirmed edge direction. */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Edge {
    Press,
    Release,
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Press => f.write_str("press"),
            Edge::Release => f.write_str("release"),
        }
    }
}

/* What a producer observed. `Ambiguous` is a press and a release seen in the same sample. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEdgeKind {
    Press,
    Release,
    Ambiguous,
}

impl RawEdgeKind {
    /* Parse the textual form used on the DBus surface. */
    pub fn parse(s: &str) -> Result<Self, VbError> {
        match s.to_ascii_lowercase().as_str() {
            "press" => Ok(RawEdgeKind::Press),
            "release" => Ok(RawEdgeKind::Release),
            "ambiguous" | "both" => Ok(RawEdgeKind::Ambiguous),
            _ => Err(VbError::UnknownEdge(s.to_string())),
        }
    }

    pub fn direction(self) -> Option<Edge> {
        match self {
            RawEdgeKind::Press => Some(Edge::Press),
            RawEdgeKind::Release => Some(Edge::Release),
            RawEdgeKind::Ambiguous => None,
        }
    }

    pub fn carries_release(self) -> bool {
        matches!(self, RawEdgeKind::Release | RawEdgeKind::Ambiguous)
    }
}

/* A raw, undebounced edge as pushed by an input producer. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEdge {
    pub vb: VirtualButton,
    pub kind: RawEdgeKind,
}

impl RawEdge {
    pub fn press(vb: VirtualButton) -> Self {
        Self { vb, kind: RawEdgeKind::Press }
    }

    pub fn release(vb: VirtualButton) -> Self {
        Self { vb, kind: RawEdgeKind::Release }
    }
}

/* Why a `VbEvent` was emitted. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /* Debounce timer expired. */
    Debounced,
    /* Debounce time below the bypass threshold. */
    Bypass,
    /* Release emitted because a pending press was cancelled. */
    Synthetic,
}

/* A confirmed virtual button event, ready for dispatch. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VbEvent {
    pub vb: VirtualButton,
    pub edge: Edge,
    pub origin: EventOrigin,
}
