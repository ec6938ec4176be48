//! Typed protocol messages and their payload encodings.
//!
//! Every message is one variant of [`Message`]; the decode boundary is an
//! exhaustive match over the kind byte that rejects unknown tags with
//! [`WireError::UnknownKind`]. There is no struct-overlay trickery: payloads
//! are read field by field, little-endian, with explicit bounds checks.
//!
//! ## Kind byte ranges
//!
//! - `0x01..=0x3f`: requests (client → target)
//! - `0x81..=0xbf`: replies (target → client, echo the request's sequence)
//! - `0xc1..=0xff`: asynchronous notifications (target → client, sequence 0)

use crate::error::WireError;

mod kind
{
    pub const ATTACH: u8 = 0x01;
    pub const DETACH: u8 = 0x02;
    pub const CONTINUE: u8 = 0x03;
    pub const STEP: u8 = 0x04;
    pub const BREAK: u8 = 0x05;
    pub const READ_MEMORY: u8 = 0x06;
    pub const WRITE_MEMORY: u8 = 0x07;
    pub const GET_REGISTERS: u8 = 0x08;
    pub const SET_REGISTERS: u8 = 0x09;

    pub const ATTACH_REPLY: u8 = 0x81;
    pub const ACK: u8 = 0x82;
    pub const MEMORY_DATA: u8 = 0x83;
    pub const REGISTER_DATA: u8 = 0x84;
    pub const TARGET_FAULT: u8 = 0x85;

    pub const STOP: u8 = 0xc1;
    pub const MODULE_LOAD: u8 = 0xc2;
    pub const MODULE_UNLOAD: u8 = 0xc3;
    pub const EXITED: u8 = 0xc4;
}

/// Why the target stopped, as reported in a [`Message::Stop`] notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCode
{
    /// The debugger asked for a break-in and the target honored it.
    BreakRequest,
    /// A breakpoint trap instruction was executed.
    Breakpoint,
    /// A single step completed.
    Step,
    /// The target took a signal or processor exception.
    Exception(u8),
}

impl StopCode
{
    fn encode(self) -> [u8; 2]
    {
        match self {
            StopCode::BreakRequest => [0, 0],
            StopCode::Breakpoint => [1, 0],
            StopCode::Step => [2, 0],
            StopCode::Exception(signal) => [3, signal],
        }
    }

    fn decode(code: u8, extra: u8) -> Result<Self, WireError>
    {
        match code {
            0 => Ok(StopCode::BreakRequest),
            1 => Ok(StopCode::Breakpoint),
            2 => Ok(StopCode::Step),
            3 => Ok(StopCode::Exception(extra)),
            _ => Err(WireError::BadPayload {
                kind: "Stop",
                detail: "unknown stop code",
            }),
        }
    }
}

/// One debug protocol message, request, reply, or notification.
///
/// Register blobs are raw bytes here; `tether-core` decodes them against the
/// session's architecture descriptor, which is the only place that knows the
/// register count and word size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message
{
    /// Attach handshake. Carries the machine type the client expects so the
    /// target can refuse a layout mismatch up front.
    Attach
    {
        /// Machine type tag the client expects (see `tether-core`).
        expected_machine: u8,
    },
    /// End the session. Fire-and-forget.
    Detach,
    /// Resume execution. Fire-and-forget.
    Continue,
    /// Execute one instruction, then stop. Fire-and-forget.
    Step,
    /// Ask a running target to stop. Fire-and-forget; the stop arrives as an
    /// asynchronous [`Message::Stop`] notification.
    Break,
    /// Read `length` bytes of target memory at `address`.
    ReadMemory
    {
        /// Target virtual address to read from.
        address: u64,
        /// Number of bytes to read.
        length: u32,
    },
    /// Write bytes into target memory at `address`.
    WriteMemory
    {
        /// Target virtual address to write to.
        address: u64,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// Fetch the current thread's register snapshot.
    GetRegisters,
    /// Replace the current thread's registers with the given blob.
    SetRegisters
    {
        /// Register blob, `register_count * word_size` bytes.
        data: Vec<u8>,
    },

    /// Reply to [`Message::Attach`]: the target's actual machine type and
    /// the initial register snapshot.
    AttachReply
    {
        /// Machine type tag the target actually runs.
        machine: u8,
        /// Initial register blob.
        registers: Vec<u8>,
    },
    /// Generic success reply for requests that return no data.
    Ack,
    /// Reply to [`Message::ReadMemory`].
    MemoryData
    {
        /// The bytes read.
        data: Vec<u8>,
    },
    /// Reply to [`Message::GetRegisters`].
    RegisterData
    {
        /// Register blob, `register_count * word_size` bytes.
        data: Vec<u8>,
    },
    /// The target could not perform the request (bad address, protected
    /// page, ...). Scoped to the request that triggered it; carries the
    /// target's error code.
    TargetFault
    {
        /// Target-defined error code.
        code: u32,
    },

    /// Asynchronous stop notification with the new register snapshot.
    Stop
    {
        /// Why the target stopped.
        code: StopCode,
        /// Program counter at the stop.
        address: u64,
        /// Register blob, replaces the client's snapshot wholesale.
        registers: Vec<u8>,
    },
    /// An executable image was loaded into the target address space.
    ModuleLoad
    {
        /// Base load address; unique among live modules.
        base: u64,
        /// Size of the mapped image in bytes.
        size: u64,
        /// Target-side path of the image.
        path: String,
    },
    /// The image at `base` was unloaded; its base address may be reused.
    ModuleUnload
    {
        /// Base load address of the unloaded image.
        base: u64,
    },
    /// The target process or kernel terminated.
    Exited
    {
        /// Exit code reported by the target.
        code: i32,
    },
}

fn read_u32(payload: &[u8], offset: usize, kind: &'static str) -> Result<u32, WireError>
{
    let bytes: [u8; 4] = payload
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or(WireError::BadPayload {
            kind,
            detail: "truncated u32 field",
        })?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(payload: &[u8], offset: usize, kind: &'static str) -> Result<u64, WireError>
{
    let bytes: [u8; 8] = payload
        .get(offset..offset + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or(WireError::BadPayload {
            kind,
            detail: "truncated u64 field",
        })?;
    Ok(u64::from_le_bytes(bytes))
}

fn expect_len(payload: &[u8], len: usize, kind: &'static str) -> Result<(), WireError>
{
    if payload.len() == len {
        Ok(())
    } else {
        Err(WireError::BadPayload {
            kind,
            detail: "unexpected payload length",
        })
    }
}

impl Message
{
    /// The kind byte this message is encoded with.
    #[must_use]
    pub fn kind(&self) -> u8
    {
        match self {
            Message::Attach { .. } => kind::ATTACH,
            Message::Detach => kind::DETACH,
            Message::Continue => kind::CONTINUE,
            Message::Step => kind::STEP,
            Message::Break => kind::BREAK,
            Message::ReadMemory { .. } => kind::READ_MEMORY,
            Message::WriteMemory { .. } => kind::WRITE_MEMORY,
            Message::GetRegisters => kind::GET_REGISTERS,
            Message::SetRegisters { .. } => kind::SET_REGISTERS,
            Message::AttachReply { .. } => kind::ATTACH_REPLY,
            Message::Ack => kind::ACK,
            Message::MemoryData { .. } => kind::MEMORY_DATA,
            Message::RegisterData { .. } => kind::REGISTER_DATA,
            Message::TargetFault { .. } => kind::TARGET_FAULT,
            Message::Stop { .. } => kind::STOP,
            Message::ModuleLoad { .. } => kind::MODULE_LOAD,
            Message::ModuleUnload { .. } => kind::MODULE_UNLOAD,
            Message::Exited { .. } => kind::EXITED,
        }
    }

    /// Short human-readable name for logging.
    #[must_use]
    pub fn kind_name(&self) -> &'static str
    {
        match self {
            Message::Attach { .. } => "Attach",
            Message::Detach => "Detach",
            Message::Continue => "Continue",
            Message::Step => "Step",
            Message::Break => "Break",
            Message::ReadMemory { .. } => "ReadMemory",
            Message::WriteMemory { .. } => "WriteMemory",
            Message::GetRegisters => "GetRegisters",
            Message::SetRegisters { .. } => "SetRegisters",
            Message::AttachReply { .. } => "AttachReply",
            Message::Ack => "Ack",
            Message::MemoryData { .. } => "MemoryData",
            Message::RegisterData { .. } => "RegisterData",
            Message::TargetFault { .. } => "TargetFault",
            Message::Stop { .. } => "Stop",
            Message::ModuleLoad { .. } => "ModuleLoad",
            Message::ModuleUnload { .. } => "ModuleUnload",
            Message::Exited { .. } => "Exited",
        }
    }

    /// True for asynchronous notifications (kind byte `0xc1..`).
    #[must_use]
    pub fn is_notification(&self) -> bool
    {
        self.kind() >= kind::STOP
    }

    /// True for replies (kind byte `0x81..=0xbf`).
    #[must_use]
    pub fn is_reply(&self) -> bool
    {
        (kind::ATTACH_REPLY..kind::STOP).contains(&self.kind())
    }

    /// True for requests that await a correlated reply.
    ///
    /// Continue, Step, Break, and Detach are fire-and-forget: the target's
    /// response, if any, arrives as an asynchronous notification.
    #[must_use]
    pub fn expects_reply(&self) -> bool
    {
        matches!(
            self,
            Message::Attach { .. }
                | Message::ReadMemory { .. }
                | Message::WriteMemory { .. }
                | Message::GetRegisters
                | Message::SetRegisters { .. }
        )
    }

    /// Encode this message's payload bytes.
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8>
    {
        match self {
            Message::Attach { expected_machine } => vec![*expected_machine],
            Message::Detach
            | Message::Continue
            | Message::Step
            | Message::Break
            | Message::GetRegisters
            | Message::Ack => Vec::new(),
            Message::ReadMemory { address, length } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&address.to_le_bytes());
                payload.extend_from_slice(&length.to_le_bytes());
                payload
            }
            Message::WriteMemory { address, data } => {
                let mut payload = Vec::with_capacity(8 + data.len());
                payload.extend_from_slice(&address.to_le_bytes());
                payload.extend_from_slice(data);
                payload
            }
            Message::SetRegisters { data } | Message::MemoryData { data } | Message::RegisterData { data } => {
                data.clone()
            }
            Message::AttachReply { machine, registers } => {
                let mut payload = Vec::with_capacity(1 + registers.len());
                payload.push(*machine);
                payload.extend_from_slice(registers);
                payload
            }
            Message::TargetFault { code } => code.to_le_bytes().to_vec(),
            Message::Stop {
                code,
                address,
                registers,
            } => {
                let mut payload = Vec::with_capacity(10 + registers.len());
                payload.extend_from_slice(&code.encode());
                payload.extend_from_slice(&address.to_le_bytes());
                payload.extend_from_slice(registers);
                payload
            }
            Message::ModuleLoad { base, size, path } => {
                let mut payload = Vec::with_capacity(16 + path.len());
                payload.extend_from_slice(&base.to_le_bytes());
                payload.extend_from_slice(&size.to_le_bytes());
                payload.extend_from_slice(path.as_bytes());
                payload
            }
            Message::ModuleUnload { base } => base.to_le_bytes().to_vec(),
            Message::Exited { code } => code.to_le_bytes().to_vec(),
        }
    }

    /// Decode a message from its kind byte and payload.
    ///
    /// ## Errors
    ///
    /// `UnknownKind` for a kind byte outside the protocol; `BadPayload` /
    /// `BadString` when the payload does not match the kind's shape.
    pub fn decode(kind_byte: u8, payload: &[u8]) -> Result<Self, WireError>
    {
        match kind_byte {
            kind::ATTACH => {
                expect_len(payload, 1, "Attach")?;
                Ok(Message::Attach {
                    expected_machine: payload[0],
                })
            }
            kind::DETACH => {
                expect_len(payload, 0, "Detach")?;
                Ok(Message::Detach)
            }
            kind::CONTINUE => {
                expect_len(payload, 0, "Continue")?;
                Ok(Message::Continue)
            }
            kind::STEP => {
                expect_len(payload, 0, "Step")?;
                Ok(Message::Step)
            }
            kind::BREAK => {
                expect_len(payload, 0, "Break")?;
                Ok(Message::Break)
            }
            kind::READ_MEMORY => {
                expect_len(payload, 12, "ReadMemory")?;
                Ok(Message::ReadMemory {
                    address: read_u64(payload, 0, "ReadMemory")?,
                    length: read_u32(payload, 8, "ReadMemory")?,
                })
            }
            kind::WRITE_MEMORY => {
                if payload.len() < 8 {
                    return Err(WireError::BadPayload {
                        kind: "WriteMemory",
                        detail: "missing address",
                    });
                }
                Ok(Message::WriteMemory {
                    address: read_u64(payload, 0, "WriteMemory")?,
                    data: payload[8..].to_vec(),
                })
            }
            kind::GET_REGISTERS => {
                expect_len(payload, 0, "GetRegisters")?;
                Ok(Message::GetRegisters)
            }
            kind::SET_REGISTERS => Ok(Message::SetRegisters {
                data: payload.to_vec(),
            }),
            kind::ATTACH_REPLY => {
                if payload.is_empty() {
                    return Err(WireError::BadPayload {
                        kind: "AttachReply",
                        detail: "missing machine type",
                    });
                }
                Ok(Message::AttachReply {
                    machine: payload[0],
                    registers: payload[1..].to_vec(),
                })
            }
            kind::ACK => {
                expect_len(payload, 0, "Ack")?;
                Ok(Message::Ack)
            }
            kind::MEMORY_DATA => Ok(Message::MemoryData {
                data: payload.to_vec(),
            }),
            kind::REGISTER_DATA => Ok(Message::RegisterData {
                data: payload.to_vec(),
            }),
            kind::TARGET_FAULT => {
                expect_len(payload, 4, "TargetFault")?;
                Ok(Message::TargetFault {
                    code: read_u32(payload, 0, "TargetFault")?,
                })
            }
            kind::STOP => {
                if payload.len() < 10 {
                    return Err(WireError::BadPayload {
                        kind: "Stop",
                        detail: "truncated stop header",
                    });
                }
                Ok(Message::Stop {
                    code: StopCode::decode(payload[0], payload[1])?,
                    address: read_u64(payload, 2, "Stop")?,
                    registers: payload[10..].to_vec(),
                })
            }
            kind::MODULE_LOAD => {
                if payload.len() < 16 {
                    return Err(WireError::BadPayload {
                        kind: "ModuleLoad",
                        detail: "truncated module header",
                    });
                }
                let path = std::str::from_utf8(&payload[16..])
                    .map_err(|_| WireError::BadString)?
                    .to_string();
                Ok(Message::ModuleLoad {
                    base: read_u64(payload, 0, "ModuleLoad")?,
                    size: read_u64(payload, 8, "ModuleLoad")?,
                    path,
                })
            }
            kind::MODULE_UNLOAD => {
                expect_len(payload, 8, "ModuleUnload")?;
                Ok(Message::ModuleUnload {
                    base: read_u64(payload, 0, "ModuleUnload")?,
                })
            }
            kind::EXITED => {
                expect_len(payload, 4, "Exited")?;
                Ok(Message::Exited {
                    code: i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
                })
            }
            other => Err(WireError::UnknownKind(other)),
        }
    }
}
