//! Execution state machine.
//!
//! The session tracks exactly one of these states and every target-facing
//! operation checks it *before* any frame is sent. Operations that need a
//! stopped target are rejected synchronously while it runs — never queued —
//! so a late-arriving stop notification can never race a queued command.

use std::fmt;

use tether_protocol::StopCode;

use crate::types::Address;

/// Where the session is in its attach-to-detach lifecycle.
///
/// ```text
/// Detached -> Attaching -> Stopped <-> Running -> Exited
///                 |            |____________|        |
///                 +------- Detached  <---------------+
/// ```
///
/// Any state can fall to `Detached` on transport loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState
{
    /// No target. The initial and final state.
    Detached,
    /// Attach handshake sent, waiting for the target's reply.
    Attaching,
    /// Target is stopped; memory, register, and breakpoint operations are
    /// legal.
    Stopped,
    /// Target is executing; only break-in and detach are legal.
    Running,
    /// Target terminated. Breakpoints and modules are invalidated; only
    /// detach remains legal.
    Exited,
}

impl ExecutionState
{
    /// Whether operations that require a stopped target are legal now.
    #[must_use]
    pub fn can_inspect(self) -> bool
    {
        self == ExecutionState::Stopped
    }

    /// Whether the session still holds a live target.
    #[must_use]
    pub fn is_live(self) -> bool
    {
        matches!(self, ExecutionState::Stopped | ExecutionState::Running)
    }
}

impl fmt::Display for ExecutionState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let name = match self {
            ExecutionState::Detached => "detached",
            ExecutionState::Attaching => "attaching",
            ExecutionState::Stopped => "stopped",
            ExecutionState::Running => "running",
            ExecutionState::Exited => "exited",
        };
        write!(f, "{name}")
    }
}

/// Why the target stopped, as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason
{
    /// Stopped at attach time (the initial handshake snapshot).
    Attach,
    /// The debugger asked for a break-in.
    BreakRequest,
    /// A breakpoint at this address was hit.
    Breakpoint(Address),
    /// A single step completed.
    Step,
    /// The target took a signal or exception.
    Exception(u8),
}

impl StopReason
{
    /// Map a wire stop code (plus the reported pc) to a session stop reason.
    #[must_use]
    pub fn from_wire(code: StopCode, address: Address) -> Self
    {
        match code {
            StopCode::BreakRequest => StopReason::BreakRequest,
            StopCode::Breakpoint => StopReason::Breakpoint(address),
            StopCode::Step => StopReason::Step,
            StopCode::Exception(signal) => StopReason::Exception(signal),
        }
    }
}

impl fmt::Display for StopReason
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            StopReason::Attach => write!(f, "attached"),
            StopReason::BreakRequest => write!(f, "break-in"),
            StopReason::Breakpoint(address) => write!(f, "breakpoint at {address}"),
            StopReason::Step => write!(f, "step complete"),
            StopReason::Exception(signal) => write!(f, "exception {signal}"),
        }
    }
}
