//! # Error Types
//!
//! General error handling for the debugger core.
//!
//! We use `thiserror` to generate `Error` trait implementations and nice
//! error messages.
//!
//! ## Error Categories
//!
//! 1. **Connection errors**: Connection, Timeout, Closed, Detached — the
//!    transport-level class; `Connection`, `Closed`, and `Detached` are
//!    fatal to the session
//! 2. **Protocol errors**: Protocol, Desync — malformed frames are tolerated
//!    up to a threshold, then escalate to the fatal `Desync`
//! 3. **State errors**: InvalidState — caller misuse, always rejected
//!    synchronously, never retried
//! 4. **Configuration errors**: UnsupportedMachine — fatal, never defaulted
//! 5. **Image errors**: ImageFormat — degrades symbol resolution for one
//!    module only
//! 6. **Target errors**: TargetFault — the outcome of one request, session
//!    state untouched

use std::time::Duration;

use thiserror::Error;

use crate::state::ExecutionState;
use crate::types::Address;

/// Main error type for debugger core operations.
#[derive(Error, Debug)]
pub enum DebugError
{
    /// The transport failed: refused, reset, or otherwise lost.
    ///
    /// Fatal to the session. The client should create a fresh session and
    /// re-attach rather than retrying operations on this one.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A blocking wait (request reply or receive) exceeded its deadline.
    ///
    /// Distinct from [`DebugError::Connection`] so callers can tell "target
    /// unresponsive" from "target gone".
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The transport was closed deliberately from this side.
    #[error("Transport closed")]
    Closed,

    /// The session detached while the operation was in flight.
    ///
    /// Waiters blocked on a reply are woken with this rather than being left
    /// blocked when another thread detaches.
    #[error("Session detached")]
    Detached,

    /// A malformed or unexpected frame was received.
    ///
    /// Recoverable in isolation: the frame is dropped and logged. Three
    /// consecutive malformed frames escalate to [`DebugError::Desync`].
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The frame stream has desynchronized beyond recovery.
    ///
    /// Silent resynchronization risks corrupting target state, so the
    /// session is forced to detach instead.
    #[error("Protocol desynchronized after {0} consecutive malformed frames")]
    Desync(u32),

    /// The operation is not legal in the current execution state.
    ///
    /// Rejected synchronously before anything is sent on the transport;
    /// operations are never queued behind a state change. The caller must
    /// stop the target explicitly first.
    #[error("Operation '{operation}' invalid while {state}")]
    InvalidState
    {
        /// Name of the rejected operation.
        operation: &'static str,
        /// Execution state the session was in.
        state: ExecutionState,
    },

    /// The machine type tag is not one this client supports.
    ///
    /// A fatal configuration error: machine types are never silently
    /// defaulted.
    #[error("Unsupported machine type tag 0x{0:02x}")]
    UnsupportedMachine(u8),

    /// The attach handshake reply did not match the confirmed machine
    /// type's register layout.
    #[error("Attach handshake mismatch: {0}")]
    HandshakeMismatch(String),

    /// A module image could not be parsed.
    ///
    /// Recoverable: the module stays tracked so its address range is known,
    /// but symbol resolution inside it degrades to raw addresses.
    #[error("Image format error in {path}: {detail}")]
    ImageFormat
    {
        /// Path of the unparseable image.
        path: String,
        /// What went wrong.
        detail: String,
    },

    /// The target reported that it could not perform the request.
    ///
    /// For example a write to an invalid address. Scoped to that request;
    /// the session stays attached and stopped.
    #[error("Target fault (code {code}) during {operation}")]
    TargetFault
    {
        /// Target-defined error code.
        code: u32,
        /// Name of the operation the target rejected.
        operation: &'static str,
    },

    /// The target sent a reply of the wrong shape for the request.
    #[error("Unexpected reply {got} to {operation}")]
    UnexpectedReply
    {
        /// Kind name of the reply that arrived.
        got: &'static str,
        /// Name of the request it was correlated with.
        operation: &'static str,
    },

    /// No breakpoint exists at the given address.
    #[error("No breakpoint at {0}")]
    NoBreakpoint(Address),

    /// A breakpoint already exists at the given address.
    ///
    /// At most one breakpoint may exist (and be armed) per address.
    #[error("Breakpoint already set at {0}")]
    BreakpointExists(Address),

    /// Wire-level encode/decode failure.
    #[error("Wire error: {0}")]
    Wire(#[from] tether_protocol::WireError),

    /// I/O error (sockets, image files, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DebugError
{
    /// Whether this error is fatal to the session.
    ///
    /// Fatal errors force a transition to `Detached`; the client is expected
    /// to attach a fresh session rather than retry on this one.
    #[must_use]
    pub fn is_fatal(&self) -> bool
    {
        matches!(
            self,
            DebugError::Connection(_) | DebugError::Closed | DebugError::Detached | DebugError::Desync(_)
        )
    }
}

/// Convenience type alias for `Result<T, DebugError>`
pub type Result<T> = std::result::Result<T, DebugError>;
