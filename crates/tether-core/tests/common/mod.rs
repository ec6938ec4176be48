//! Shared test support: an in-memory scripted target.
//!
//! The mock answers requests synchronously from the client's send path and
//! queues notifications for the dispatcher's receiver thread, so every test
//! runs against the real framing, correlation, and session logic with no
//! real socket.

// Each integration test binary compiles its own copy of this module and
// uses a different subset of it.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tether_core::transport::Transport;
use tether_core::{DebugError, MachineType, RegisterSet, Result, Session};
use tether_protocol::{Frame, Message};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const FAULT_CODE: u32 = 0x0bad_f00d;

/// A scripted in-memory debug target.
pub struct MockTarget
{
    machine: MachineType,
    memory: Mutex<HashMap<u64, u8>>,
    registers: Mutex<Vec<u8>>,
    /// Notification batches emitted on successive resume requests
    /// (Continue, Step, or Break), front first.
    on_resume: Mutex<VecDeque<Vec<Message>>>,
    /// Requests touching this address draw a TargetFault reply.
    fault_address: Option<u64>,
    /// Addresses whose next memory write draws a single TargetFault.
    fault_once_writes: Mutex<Vec<u64>>,
    /// Machine tag reported in the attach reply, when overridden.
    attach_tag: Mutex<Option<u8>>,
    sent: AtomicU64,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    available: Condvar,
    closed: Mutex<bool>,
}

impl MockTarget
{
    pub fn new(machine: MachineType, pc: u64) -> Arc<Self>
    {
        Arc::new(Self::build(machine, pc, None))
    }

    pub fn with_fault_at(machine: MachineType, pc: u64, fault_address: u64) -> Arc<Self>
    {
        Arc::new(Self::build(machine, pc, Some(fault_address)))
    }

    fn build(machine: MachineType, pc: u64, fault_address: Option<u64>) -> Self
    {
        MockTarget {
            machine,
            memory: Mutex::new(HashMap::new()),
            registers: Mutex::new(registers_blob(machine, pc)),
            on_resume: Mutex::new(VecDeque::new()),
            fault_address,
            fault_once_writes: Mutex::new(Vec::new()),
            attach_tag: Mutex::new(None),
            sent: AtomicU64::new(0),
            inbound: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            closed: Mutex::new(false),
        }
    }

    /// Seed target memory.
    pub fn preload_memory(&self, address: u64, bytes: &[u8])
    {
        let mut memory = self.memory.lock().unwrap();
        for (index, byte) in bytes.iter().enumerate() {
            memory.insert(address + index as u64, *byte);
        }
    }

    /// Current target memory contents (unwritten bytes read as zero).
    pub fn memory_at(&self, address: u64, length: usize) -> Vec<u8>
    {
        let memory = self.memory.lock().unwrap();
        (0..length)
            .map(|index| *memory.get(&(address + index as u64)).unwrap_or(&0))
            .collect()
    }

    /// Report this raw machine tag in the attach reply instead of the real
    /// one.
    pub fn force_attach_tag(&self, tag: u8)
    {
        *self.attach_tag.lock().unwrap() = Some(tag);
    }

    /// Fault the next memory write at `address`, once; later writes there
    /// succeed again.
    pub fn fault_next_write(&self, address: u64)
    {
        self.fault_once_writes.lock().unwrap().push(address);
    }

    /// Whether the client has closed the transport.
    pub fn is_closed(&self) -> bool
    {
        *self.closed.lock().unwrap()
    }

    /// Replace the register blob the target reports.
    pub fn set_registers_blob(&self, blob: Vec<u8>)
    {
        *self.registers.lock().unwrap() = blob;
    }

    /// Queue the notifications the target will emit on its next resume.
    pub fn script_resume(&self, notifications: Vec<Message>)
    {
        self.on_resume.lock().unwrap().push_back(notifications);
    }

    /// Emit a notification immediately (sequence 0).
    pub fn notify(&self, message: &Message)
    {
        self.push_frame(&Frame::new(message.kind(), 0, message.encode_payload()));
    }

    /// Number of frames the client has sent so far.
    pub fn sent(&self) -> u64
    {
        self.sent.load(Ordering::SeqCst)
    }

    fn push_frame(&self, frame: &Frame)
    {
        self.inbound.lock().unwrap().push_back(frame.encode().unwrap());
        self.available.notify_all();
    }

    fn reply(&self, request: &Frame, message: &Message)
    {
        self.push_frame(&Frame::new(message.kind(), request.sequence, message.encode_payload()));
    }

    fn handle(&self, request: &Frame, message: Message)
    {
        match message {
            Message::Attach { .. } => {
                let registers = self.registers.lock().unwrap().clone();
                let machine = self.attach_tag.lock().unwrap().unwrap_or_else(|| self.machine.tag());
                self.reply(request, &Message::AttachReply { machine, registers });
            }
            Message::ReadMemory { address, length } => {
                if self.fault_address == Some(address) {
                    self.reply(request, &Message::TargetFault { code: FAULT_CODE });
                    return;
                }
                let data = self.memory_at(address, length as usize);
                self.reply(request, &Message::MemoryData { data });
            }
            Message::WriteMemory { address, data } => {
                let fault_once = {
                    let mut once = self.fault_once_writes.lock().unwrap();
                    once.iter().position(|&a| a == address).map(|index| once.remove(index))
                };
                if fault_once.is_some() || self.fault_address == Some(address) {
                    self.reply(request, &Message::TargetFault { code: FAULT_CODE });
                    return;
                }
                self.preload_memory(address, &data);
                self.reply(request, &Message::Ack);
            }
            Message::GetRegisters => {
                let data = self.registers.lock().unwrap().clone();
                self.reply(request, &Message::RegisterData { data });
            }
            Message::SetRegisters { data } => {
                *self.registers.lock().unwrap() = data;
                self.reply(request, &Message::Ack);
            }
            Message::Continue | Message::Step | Message::Break => {
                let batch = self.on_resume.lock().unwrap().pop_front().unwrap_or_default();
                for notification in &batch {
                    self.notify(notification);
                }
            }
            Message::Detach => {}
            other => panic!("client sent unexpected message: {}", other.kind_name()),
        }
    }
}

/// The mock's client-side endpoint. A local wrapper, since `Transport`
/// comes from another crate and cannot be implemented on `Arc` directly
/// here.
pub struct MockTransport(pub Arc<MockTarget>);

impl MockTransport
{
    pub fn new(target: &Arc<MockTarget>) -> Box<Self>
    {
        Box::new(MockTransport(Arc::clone(target)))
    }
}

impl Transport for MockTransport
{
    fn send(&self, frame: &[u8]) -> Result<()>
    {
        let target = &self.0;
        if *target.closed.lock().unwrap() {
            return Err(DebugError::Closed);
        }
        target.sent.fetch_add(1, Ordering::SeqCst);
        let decoded = Frame::decode(frame).expect("client sent malformed frame");
        let message = Message::decode(decoded.kind, &decoded.payload).expect("client sent undecodable message");
        target.handle(&decoded, message);
        Ok(())
    }

    fn receive(&self, timeout: Option<Duration>) -> Result<Vec<u8>>
    {
        let target = &self.0;
        let mut inbound = target.inbound.lock().unwrap();
        loop {
            if let Some(bytes) = inbound.pop_front() {
                return Ok(bytes);
            }
            if *target.closed.lock().unwrap() {
                return Err(DebugError::Closed);
            }
            inbound = match timeout {
                Some(limit) => {
                    let (guard, wait) = target.available.wait_timeout(inbound, limit).unwrap();
                    if wait.timed_out() {
                        return Err(DebugError::Timeout(limit));
                    }
                    guard
                }
                None => target.available.wait_timeout(inbound, Duration::from_millis(20)).unwrap().0,
            };
        }
    }

    fn close(&self)
    {
        *self.0.closed.lock().unwrap() = true;
        self.0.available.notify_all();
    }
}

/// Encode a register blob for `machine` with the pc register set.
pub fn registers_blob(machine: MachineType, pc: u64) -> Vec<u8>
{
    let mut registers = RegisterSet::zeroed(machine);
    let pc_name = machine.descriptor().register_names[machine.descriptor().pc_index];
    registers.set(pc_name, pc).unwrap();
    registers.to_wire()
}

/// Attach a session over the mock.
pub fn attach(target: &Arc<MockTarget>) -> Session
{
    Session::attach(MockTransport::new(target), target.machine, REQUEST_TIMEOUT).unwrap()
}

/// A scripted stop notification.
pub fn stop_message(machine: MachineType, code: tether_protocol::StopCode, pc: u64) -> Message
{
    Message::Stop {
        code,
        address: pc,
        registers: registers_blob(machine, pc),
    }
}
