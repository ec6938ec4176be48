//! Session event types and helpers.
//!
//! The dispatcher's receiver thread publishes these for every asynchronous
//! notification and for transport-level failures; the session applies them
//! from the client thread via `wait_for_stop` / `pump_events`. Events are
//! delivered strictly in transport arrival order and are never matched to a
//! pending request.

use std::sync::mpsc;

use crate::types::Address;

/// Event emitted by the dispatcher's receiver thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEvent
{
    /// The target stopped; carries the raw register blob from the wire
    /// (decoded against the session's machine descriptor when applied).
    Stopped
    {
        /// Raw wire stop code.
        code: tether_protocol::StopCode,
        /// Program counter reported by the target.
        pc: Address,
        /// Register snapshot blob, replaces the session's snapshot wholesale.
        registers: Vec<u8>,
    },
    /// The target loaded an executable image.
    ModuleLoaded
    {
        /// Base load address.
        base: Address,
        /// Mapped size in bytes.
        size: u64,
        /// Target-side image path.
        path: String,
    },
    /// The target unloaded the image at `base`.
    ModuleUnloaded
    {
        /// Base load address of the unloaded image.
        base: Address,
    },
    /// The target process or kernel terminated.
    Exited
    {
        /// Exit code.
        code: i32,
    },
    /// Three consecutive malformed frames; the session must detach.
    Desync
    {
        /// Number of consecutive malformed frames seen.
        malformed: u32,
    },
    /// The transport failed or was closed underneath the receiver.
    ConnectionLost
    {
        /// Human-readable cause.
        detail: String,
    },
}

impl TargetEvent
{
    /// Human-readable description of the event.
    #[must_use]
    pub fn describe(&self) -> String
    {
        match self {
            Self::Stopped { code, pc, .. } => format!("target stopped ({code:?}) at {pc}"),
            Self::ModuleLoaded { base, path, .. } => format!("module {path} loaded at {base}"),
            Self::ModuleUnloaded { base } => format!("module at {base} unloaded"),
            Self::Exited { code } => format!("target exited with code {code}"),
            Self::Desync { malformed } => {
                format!("protocol desynchronized after {malformed} malformed frames")
            }
            Self::ConnectionLost { detail } => format!("connection lost: {detail}"),
        }
    }
}

/// Sender side of the target event channel.
pub type TargetEventSender = mpsc::Sender<TargetEvent>;
/// Receiver side of the target event channel.
pub type TargetEventReceiver = mpsc::Receiver<TargetEvent>;

/// Create a new target event channel.
#[must_use]
pub fn event_channel() -> (TargetEventSender, TargetEventReceiver)
{
    mpsc::channel()
}
