//! The debugging session.
//!
//! A [`Session`] is the full state of one attach-to-detach engagement: the
//! dispatcher over the transport, the confirmed machine type, the module
//! map, the breakpoint store, the current register snapshot, and the
//! execution state. Every target-facing operation validates the execution
//! state *before* building a frame, so a request that is illegal while the
//! target runs is rejected without touching the transport.
//!
//! ## Thread Safety
//!
//! The session is **not** internally locked. The dispatcher's receiver
//! thread only queues events; all session mutation happens on the thread
//! calling these methods. For shared use, wrap the session in a `Mutex` —
//! that mutex is the session-wide lock the concurrency model calls for.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tether_protocol::Message;
use tracing::{debug, info, warn};

use crate::breakpoints::BreakpointStore;
use crate::dispatch::Dispatcher;
use crate::error::{DebugError, Result};
use crate::events::{TargetEvent, TargetEventReceiver};
use crate::state::{ExecutionState, StopReason};
use crate::symbols::{Module, ModuleMap, ResolvedSymbol};
use crate::transport::{TcpTransport, Transport};
use crate::types::{Address, MachineType, RegisterSet};

/// Default deadline for a correlated request's reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A session-level event, produced by applying a target notification.
#[derive(Debug)]
pub enum SessionEvent
{
    /// The target stopped; the register snapshot has been replaced and all
    /// armed breakpoints disarmed.
    Stopped(StopReason),
    /// A module was loaded and is now tracked.
    ModuleLoaded(Arc<Module>),
    /// The module at this base was unloaded and evicted.
    ModuleUnloaded(Address),
    /// The target terminated; breakpoints and modules are invalidated.
    Exited(i32),
}

/// One attach-to-detach debugging engagement.
pub struct Session
{
    dispatcher: Dispatcher,
    events: TargetEventReceiver,
    machine: MachineType,
    state: ExecutionState,
    registers: RegisterSet,
    modules: ModuleMap,
    breakpoints: BreakpointStore,
    request_timeout: Duration,
    last_stop: Option<StopReason>,
}

impl Session
{
    /// Attach over an already-connected transport.
    ///
    /// Performs the attach handshake: sends the machine type the client
    /// expects, confirms the target's machine type from the reply, and
    /// validates that the initial register snapshot has exactly the
    /// register count and word size that machine's descriptor dictates.
    ///
    /// ## Errors
    ///
    /// `UnsupportedMachine` if the target's machine tag is unknown;
    /// `HandshakeMismatch` if the register blob does not match the
    /// descriptor; transport and timeout errors from the handshake
    /// request. On any failure the transport is closed.
    pub fn attach(transport: Box<dyn Transport>, expected: MachineType, request_timeout: Duration) -> Result<Self>
    {
        let (dispatcher, events) = Dispatcher::start(transport);
        let mut session = Session {
            dispatcher,
            events,
            machine: expected,
            state: ExecutionState::Attaching,
            registers: RegisterSet::zeroed(expected),
            modules: ModuleMap::new(),
            breakpoints: BreakpointStore::new(),
            request_timeout,
            last_stop: None,
        };
        // A handshake failure drops the session while still `Attaching`,
        // which closes the transport on the way out.
        session.handshake(expected)?;
        Ok(session)
    }

    fn handshake(&mut self, expected: MachineType) -> Result<()>
    {
        debug!(%expected, "attach handshake");
        let reply = self.dispatcher.request(
            &Message::Attach {
                expected_machine: expected.tag(),
            },
            self.request_timeout,
        )?;

        let (machine_tag, blob) = match reply {
            Message::AttachReply { machine, registers } => (machine, registers),
            other => {
                return Err(DebugError::UnexpectedReply {
                    got: other.kind_name(),
                    operation: "attach",
                })
            }
        };

        let machine = MachineType::from_tag(machine_tag)?;
        if machine != expected {
            info!(%expected, confirmed = %machine, "target machine differs from expected");
        }
        self.registers = RegisterSet::from_wire(machine, &blob)?;
        self.machine = machine;
        self.state = ExecutionState::Stopped;
        self.last_stop = Some(StopReason::Attach);
        info!(%machine, pc = %self.registers.pc(), "attached, target stopped");
        Ok(())
    }

    /// Connect to a TCP endpoint and attach, expecting the host's machine
    /// type.
    ///
    /// ## Errors
    ///
    /// `Connection` when the endpoint is unreachable; everything
    /// [`Session::attach`] can return.
    pub fn connect_tcp(endpoint: &str, request_timeout: Duration) -> Result<Self>
    {
        let transport = TcpTransport::connect(endpoint)?;
        Session::attach(Box::new(transport), MachineType::host()?, request_timeout)
    }

    /// The confirmed machine type.
    #[must_use]
    pub fn machine(&self) -> MachineType
    {
        self.machine
    }

    /// The current execution state.
    #[must_use]
    pub fn state(&self) -> ExecutionState
    {
        self.state
    }

    /// The register snapshot from the most recent stop.
    #[must_use]
    pub fn registers(&self) -> &RegisterSet
    {
        &self.registers
    }

    /// The most recent stop reason, if the target has stopped.
    #[must_use]
    pub fn last_stop(&self) -> Option<StopReason>
    {
        self.last_stop
    }

    /// The tracked module map.
    #[must_use]
    pub fn modules(&self) -> &ModuleMap
    {
        &self.modules
    }

    /// The breakpoint store.
    #[must_use]
    pub fn breakpoints(&self) -> &BreakpointStore
    {
        &self.breakpoints
    }

    /// Replies dropped for lack of an outstanding request.
    #[must_use]
    pub fn stray_replies(&self) -> u64
    {
        self.dispatcher.stray_replies()
    }

    /// Resolve a target address to `module!symbol+offset`.
    #[must_use]
    pub fn resolve(&self, address: Address) -> Option<ResolvedSymbol>
    {
        self.modules.resolve(address)
    }

    /// Find a symbol's target address by (optionally `module!`-qualified)
    /// name.
    #[must_use]
    pub fn find_symbol(&self, name: &str) -> Option<Address>
    {
        self.modules.find(name)
    }

    fn require_stopped(&self, operation: &'static str) -> Result<()>
    {
        if self.state.can_inspect() {
            Ok(())
        } else {
            Err(DebugError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Issue a correlated request, mapping target faults and handling fatal
    /// transport errors by dropping to `Detached`.
    fn issue(&mut self, message: &Message, operation: &'static str) -> Result<Message>
    {
        match self.dispatcher.request(message, self.request_timeout) {
            Ok(Message::TargetFault { code }) => Err(DebugError::TargetFault { code, operation }),
            Ok(reply) => Ok(reply),
            Err(err) => {
                if err.is_fatal() {
                    self.drop_to_detached();
                }
                Err(err)
            }
        }
    }

    /// Read target memory.
    ///
    /// Legal only while stopped. Because armed breakpoints are disarmed
    /// before any stop is reported, the returned bytes never contain the
    /// client's own trap instructions.
    ///
    /// ## Errors
    ///
    /// `InvalidState` unless stopped (nothing is sent); `TargetFault` when
    /// the target rejects the address; transport errors.
    pub fn read_memory(&mut self, address: Address, length: u32) -> Result<Vec<u8>>
    {
        self.require_stopped("read-memory")?;
        let reply = self.issue(
            &Message::ReadMemory {
                address: address.value(),
                length,
            },
            "read-memory",
        )?;
        match reply {
            Message::MemoryData { data } => Ok(data),
            other => Err(DebugError::UnexpectedReply {
                got: other.kind_name(),
                operation: "read-memory",
            }),
        }
    }

    /// Write target memory.
    ///
    /// ## Errors
    ///
    /// `InvalidState` unless stopped (nothing is sent); `TargetFault` when
    /// the target rejects the write; transport errors.
    pub fn write_memory(&mut self, address: Address, data: Vec<u8>) -> Result<()>
    {
        self.require_stopped("write-memory")?;
        let reply = self.issue(
            &Message::WriteMemory {
                address: address.value(),
                data,
            },
            "write-memory",
        )?;
        match reply {
            Message::Ack => Ok(()),
            other => Err(DebugError::UnexpectedReply {
                got: other.kind_name(),
                operation: "write-memory",
            }),
        }
    }

    /// Re-fetch the register snapshot from the target.
    ///
    /// ## Errors
    ///
    /// `InvalidState` unless stopped (nothing is sent); transport errors;
    /// `HandshakeMismatch` if the blob no longer matches the descriptor.
    pub fn fetch_registers(&mut self) -> Result<&RegisterSet>
    {
        self.require_stopped("get-registers")?;
        let reply = self.issue(&Message::GetRegisters, "get-registers")?;
        match reply {
            Message::RegisterData { data } => {
                self.registers = RegisterSet::from_wire(self.machine, &data)?;
                Ok(&self.registers)
            }
            other => Err(DebugError::UnexpectedReply {
                got: other.kind_name(),
                operation: "get-registers",
            }),
        }
    }

    /// Push a modified register snapshot to the target.
    ///
    /// ## Errors
    ///
    /// `InvalidState` unless stopped (nothing is sent); `HandshakeMismatch`
    /// if the snapshot belongs to a different machine type; `TargetFault`
    /// or transport errors from the write.
    pub fn set_registers(&mut self, registers: RegisterSet) -> Result<()>
    {
        self.require_stopped("set-registers")?;
        if registers.machine() != self.machine {
            return Err(DebugError::HandshakeMismatch(format!(
                "snapshot is for {}, session is {}",
                registers.machine(),
                self.machine
            )));
        }
        let reply = self.issue(
            &Message::SetRegisters {
                data: registers.to_wire(),
            },
            "set-registers",
        )?;
        match reply {
            Message::Ack => {
                self.registers = registers;
                Ok(())
            }
            other => Err(DebugError::UnexpectedReply {
                got: other.kind_name(),
                operation: "set-registers",
            }),
        }
    }

    /// Track a breakpoint at `address`.
    ///
    /// The trap instruction is not written yet: arming happens when the
    /// target is resumed, so target memory holds real instructions for the
    /// whole time it is stopped.
    ///
    /// ## Errors
    ///
    /// `InvalidState` unless stopped; `BreakpointExists` if one is already
    /// tracked at `address`.
    pub fn set_breakpoint(&mut self, address: Address) -> Result<()>
    {
        self.require_stopped("set-breakpoint")?;
        self.breakpoints.insert(address)?;
        debug!(%address, "breakpoint set");
        Ok(())
    }

    /// Remove the breakpoint at `address`, restoring original bytes if the
    /// trap is somehow still armed.
    ///
    /// ## Errors
    ///
    /// `InvalidState` unless stopped; `NoBreakpoint` if none is tracked
    /// there; transport errors from a restoration write.
    pub fn clear_breakpoint(&mut self, address: Address) -> Result<()>
    {
        self.require_stopped("clear-breakpoint")?;
        if self.breakpoints.get(address).is_none() {
            return Err(DebugError::NoBreakpoint(address));
        }
        // Normally disarmed at stop time; restore here if a disarm failed.
        // The saved bytes are consumed only once the write lands, so a
        // faulting restore can be retried.
        if let Some(original) = self
            .breakpoints
            .get(address)
            .and_then(|breakpoint| breakpoint.original_bytes.clone())
        {
            self.write_memory(address, original.to_vec())?;
            let _ = self.breakpoints.take_armed_bytes(address);
        }
        self.breakpoints.remove(address)?;
        debug!(%address, "breakpoint cleared");
        Ok(())
    }

    /// Enable or disable the breakpoint at `address`.
    ///
    /// ## Errors
    ///
    /// `InvalidState` unless stopped; `NoBreakpoint` if none is tracked.
    pub fn enable_breakpoint(&mut self, address: Address, enabled: bool) -> Result<()>
    {
        self.require_stopped("enable-breakpoint")?;
        self.breakpoints.set_enabled(address, enabled)
    }

    /// Write the trap opcode for every enabled, unarmed breakpoint, saving
    /// the displaced bytes.
    ///
    /// All-or-nothing: if any breakpoint fails to arm, the ones armed so
    /// far are disarmed again before the error is returned, so a stopped
    /// target never keeps a trap from a failed resume.
    fn arm_all(&mut self) -> Result<()>
    {
        let opcode = self.machine.descriptor().breakpoint_opcode;
        for address in self.breakpoints.pending_arm() {
            if let Err(err) = self.arm_one(address, opcode) {
                if let Err(undo) = self.disarm_all() {
                    warn!(%undo, "failed to unwind partially armed breakpoints");
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn arm_one(&mut self, address: Address, opcode: &[u8]) -> Result<()>
    {
        // Trap opcodes are at most 4 bytes on every supported machine.
        #[allow(clippy::cast_possible_truncation)]
        let opcode_len = opcode.len() as u32;
        let original = self.read_memory(address, opcode_len)?;
        if original.len() != opcode.len() {
            return Err(DebugError::TargetFault {
                code: 0,
                operation: "arm-breakpoint",
            });
        }
        self.write_memory(address, opcode.to_vec())?;
        self.breakpoints.mark_armed(address, SmallVec::from_slice(&original))?;
        debug!(%address, "breakpoint armed");
        Ok(())
    }

    /// Restore the displaced bytes for every armed breakpoint.
    ///
    /// Runs as part of applying a stop, before the stop is reported, so a
    /// subsequent memory read never observes a trap opcode. The saved bytes
    /// are consumed only once the restoring write lands; after a failed
    /// write they stay with the breakpoint so a retry or a later clear can
    /// still restore.
    fn disarm_all(&mut self) -> Result<()>
    {
        for address in self.breakpoints.armed() {
            let Some(original) = self
                .breakpoints
                .get(address)
                .and_then(|breakpoint| breakpoint.original_bytes.clone())
            else {
                continue;
            };
            self.write_memory(address, original.to_vec())?;
            let _ = self.breakpoints.take_armed_bytes(address);
            debug!(%address, "breakpoint disarmed");
        }
        Ok(())
    }

    /// Resume the target.
    ///
    /// Flushes all pending breakpoint arming writes, posts the continue,
    /// and transitions to `Running` immediately: continue is
    /// fire-and-forget from the target's perspective.
    ///
    /// ## Errors
    ///
    /// `InvalidState` unless stopped; arming or transport errors (the
    /// session stays stopped if arming fails).
    pub fn resume(&mut self) -> Result<()>
    {
        self.require_stopped("continue")?;
        self.arm_all()?;
        self.post_resume(&Message::Continue)
    }

    /// Execute one instruction and stop again.
    ///
    /// ## Errors
    ///
    /// As for [`Session::resume`].
    pub fn step(&mut self) -> Result<()>
    {
        self.require_stopped("step")?;
        self.arm_all()?;
        self.post_resume(&Message::Step)
    }

    fn post_resume(&mut self, message: &Message) -> Result<()>
    {
        if let Err(err) = self.dispatcher.post(message) {
            if err.is_fatal() {
                self.drop_to_detached();
            }
            return Err(err);
        }
        self.state = ExecutionState::Running;
        self.last_stop = None;
        debug!(kind = message.kind_name(), "target resumed");
        Ok(())
    }

    /// Ask a running target to break in.
    ///
    /// The only target-facing operation that *requires* `Running`. The stop
    /// arrives later as an asynchronous notification; wait for it with
    /// [`Session::wait_for_stop`].
    ///
    /// ## Errors
    ///
    /// `InvalidState` unless running; transport errors.
    pub fn break_in(&mut self) -> Result<()>
    {
        if self.state != ExecutionState::Running {
            return Err(DebugError::InvalidState {
                operation: "break",
                state: self.state,
            });
        }
        self.dispatcher.post(&Message::Break)
    }

    /// Apply queued notifications without blocking.
    ///
    /// Returns the session events produced, in arrival order.
    ///
    /// ## Errors
    ///
    /// Fatal events (desync, connection loss) surface as errors after the
    /// session has dropped to `Detached`.
    pub fn pump_events(&mut self) -> Result<Vec<SessionEvent>>
    {
        let mut applied = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => applied.push(self.apply_event(event)?),
                Err(mpsc::TryRecvError::Empty) => return Ok(applied),
                Err(mpsc::TryRecvError::Disconnected) => {
                    if self.state != ExecutionState::Detached {
                        self.drop_to_detached();
                        return Err(DebugError::Detached);
                    }
                    return Ok(applied);
                }
            }
        }
    }

    /// Block until the next session event or the timeout.
    ///
    /// ## Errors
    ///
    /// `Timeout` when nothing arrives in time; fatal events surface as
    /// errors after dropping to `Detached`.
    pub fn wait_for_event(&mut self, timeout: Duration) -> Result<SessionEvent>
    {
        match self.events.recv_timeout(timeout) {
            Ok(event) => self.apply_event(event),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(DebugError::Timeout(timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.drop_to_detached();
                Err(DebugError::Detached)
            }
        }
    }

    /// Block until the target stops, applying module events along the way.
    ///
    /// ## Errors
    ///
    /// `Timeout` if no stop arrives in time; `InvalidState` if the target
    /// exits instead of stopping (only detach is legal afterwards); fatal
    /// events as errors.
    pub fn wait_for_stop(&mut self, timeout: Duration) -> Result<StopReason>
    {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(DebugError::Timeout(timeout))?;
            match self.wait_for_event(remaining)? {
                SessionEvent::Stopped(reason) => return Ok(reason),
                SessionEvent::Exited(code) => {
                    info!(code, "target exited while waiting for stop");
                    return Err(DebugError::InvalidState {
                        operation: "wait-for-stop",
                        state: self.state,
                    });
                }
                SessionEvent::ModuleLoaded(module) => {
                    debug!(path = module.path(), base = %module.base(), "module event while waiting");
                }
                SessionEvent::ModuleUnloaded(base) => {
                    debug!(%base, "module unloaded while waiting");
                }
            }
        }
    }

    fn apply_event(&mut self, event: TargetEvent) -> Result<SessionEvent>
    {
        match event {
            TargetEvent::Stopped { code, pc, registers } => {
                // Replace the snapshot wholesale, then disarm before anyone
                // can read memory, so trap bytes are never observed.
                self.registers = RegisterSet::from_wire(self.machine, &registers)?;
                self.state = ExecutionState::Stopped;
                self.disarm_all()?;
                let reason = StopReason::from_wire(code, pc);
                if let StopReason::Breakpoint(address) = reason {
                    if let Some(hits) = self.breakpoints.record_hit(address) {
                        debug!(%address, hits, "breakpoint hit");
                    } else {
                        warn!(%address, "stop at address with no tracked breakpoint");
                    }
                }
                self.last_stop = Some(reason);
                info!(%reason, pc = %pc, "target stopped");
                Ok(SessionEvent::Stopped(reason))
            }
            TargetEvent::ModuleLoaded { base, size, path } => {
                let module = self.modules.insert(base, size, path);
                Ok(SessionEvent::ModuleLoaded(module))
            }
            TargetEvent::ModuleUnloaded { base } => {
                if self.modules.remove(base).is_none() {
                    warn!(%base, "unload for unknown module");
                }
                Ok(SessionEvent::ModuleUnloaded(base))
            }
            TargetEvent::Exited { code } => {
                info!(code, "target exited");
                self.state = ExecutionState::Exited;
                self.breakpoints.invalidate_all();
                self.modules.clear();
                Ok(SessionEvent::Exited(code))
            }
            TargetEvent::Desync { malformed } => {
                self.drop_to_detached();
                Err(DebugError::Desync(malformed))
            }
            TargetEvent::ConnectionLost { detail } => {
                self.drop_to_detached();
                Err(DebugError::Connection(detail))
            }
        }
    }

    /// Detach from the target.
    ///
    /// Legal in every state. Posts a detach if the target is still live,
    /// closes the transport (waking any blocked waiters with `Detached`),
    /// and releases all modules and breakpoints.
    pub fn detach(&mut self)
    {
        if self.state.is_live() {
            let _ = self.dispatcher.post(&Message::Detach);
        }
        info!("detaching");
        self.drop_to_detached();
    }

    fn drop_to_detached(&mut self)
    {
        self.dispatcher.shutdown();
        self.breakpoints.invalidate_all();
        self.modules.clear();
        self.state = ExecutionState::Detached;
        self.last_stop = None;
    }
}

impl Drop for Session
{
    fn drop(&mut self)
    {
        if self.state != ExecutionState::Detached {
            self.detach();
        }
    }
}
