//! # tether-core
//!
//! Remote-target debugging primitives for Tether.
//!
//! This crate provides the client side of a remote debugging engagement:
//! - Attach handshake and machine type confirmation
//! - Execution control (continue, step, break-in) with a strict state machine
//! - Memory reading/writing and register inspection while stopped
//! - Software breakpoints with exactly-once original-byte restoration
//! - Module tracking and lazy ELF symbol resolution
//!
//! ## Architecture
//!
//! A [`Session`] owns a [`Dispatcher`](dispatch::Dispatcher), which owns the
//! [`Transport`]. A dedicated receiver thread decodes inbound frames,
//! correlates replies to outstanding requests by sequence number, and queues
//! asynchronous notifications as [`TargetEvent`]s for the session to apply.
//! All other state (modules, breakpoints, registers, execution state) lives
//! in the session and mutates only on the caller's thread.

pub mod breakpoints;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod session;
pub mod state;
pub mod symbols;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use breakpoints::{Breakpoint, BreakpointStore};
pub use error::{DebugError, Result};
pub use events::TargetEvent;
pub use session::{Session, SessionEvent, DEFAULT_REQUEST_TIMEOUT};
pub use state::{ExecutionState, StopReason};
pub use symbols::{Module, ModuleMap, ResolvedSymbol};
pub use transport::{TcpTransport, Transport};
pub use types::{Address, ArchDescriptor, MachineType, RegisterSet};
