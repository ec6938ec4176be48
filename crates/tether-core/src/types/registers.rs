//! Register snapshots.

use std::fmt;

use crate::error::{DebugError, Result};
use crate::types::{Address, MachineType};

/// A full register snapshot for one thread/processor.
///
/// Sized exactly by the session's [`MachineType`] descriptor: one `u64`
/// slot per register, regardless of the target word size (32-bit targets
/// zero-extend). The snapshot is replaced wholesale on every stop event and
/// never partially mutated by incoming data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSet
{
    machine: MachineType,
    values: Box<[u64]>,
}

impl RegisterSet
{
    /// Create a zeroed snapshot for a machine type.
    #[must_use]
    pub fn zeroed(machine: MachineType) -> Self
    {
        RegisterSet {
            machine,
            values: vec![0; machine.descriptor().register_count()].into_boxed_slice(),
        }
    }

    /// Decode a snapshot from a wire blob.
    ///
    /// The blob must be exactly `register_count * word_size` bytes of
    /// little-endian values, as dictated by the machine descriptor.
    ///
    /// ## Errors
    ///
    /// `HandshakeMismatch` when the blob length does not match the
    /// descriptor — the register layout the target sent is not the one this
    /// client expects.
    pub fn from_wire(machine: MachineType, blob: &[u8]) -> Result<Self>
    {
        let descriptor = machine.descriptor();
        if blob.len() != descriptor.snapshot_len() {
            return Err(DebugError::HandshakeMismatch(format!(
                "register blob is {} bytes, {} requires {} ({} registers x {} bytes)",
                blob.len(),
                machine,
                descriptor.snapshot_len(),
                descriptor.register_count(),
                descriptor.word_size
            )));
        }

        let mut values = Vec::with_capacity(descriptor.register_count());
        for chunk in blob.chunks_exact(descriptor.word_size) {
            let value = if descriptor.word_size == 8 {
                u64::from_le_bytes(chunk.try_into().unwrap_or([0; 8]))
            } else {
                u64::from(u32::from_le_bytes(chunk.try_into().unwrap_or([0; 4])))
            };
            values.push(value);
        }

        Ok(RegisterSet {
            machine,
            values: values.into_boxed_slice(),
        })
    }

    /// Encode this snapshot back to a wire blob.
    ///
    /// On 32-bit targets the upper halves are truncated; values written via
    /// [`RegisterSet::set`] are already masked to the word size.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8>
    {
        let descriptor = self.machine.descriptor();
        let mut blob = Vec::with_capacity(descriptor.snapshot_len());
        for value in &self.values {
            if descriptor.word_size == 8 {
                blob.extend_from_slice(&value.to_le_bytes());
            } else {
                #[allow(clippy::cast_possible_truncation)]
                blob.extend_from_slice(&(*value as u32).to_le_bytes());
            }
        }
        blob
    }

    /// The machine type this snapshot belongs to.
    #[must_use]
    pub fn machine(&self) -> MachineType
    {
        self.machine
    }

    /// All register values in snapshot index order.
    #[must_use]
    pub fn values(&self) -> &[u64]
    {
        &self.values
    }

    /// Value of a register by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<u64>
    {
        let index = self.machine.descriptor().register_index(name)?;
        Some(self.values[index])
    }

    /// Set a register by name, masking to the target word size.
    ///
    /// ## Errors
    ///
    /// `HandshakeMismatch` if the name does not exist for this machine.
    pub fn set(&mut self, name: &str, value: u64) -> Result<()>
    {
        let descriptor = self.machine.descriptor();
        let index = descriptor
            .register_index(name)
            .ok_or_else(|| DebugError::HandshakeMismatch(format!("no register '{name}' on {}", self.machine)))?;
        self.values[index] = if descriptor.word_size == 4 {
            value & 0xffff_ffff
        } else {
            value
        };
        Ok(())
    }

    /// The program counter.
    #[must_use]
    pub fn pc(&self) -> Address
    {
        Address::new(self.values[self.machine.descriptor().pc_index])
    }

    /// The stack pointer.
    #[must_use]
    pub fn sp(&self) -> Address
    {
        Address::new(self.values[self.machine.descriptor().sp_index])
    }

    /// The frame pointer.
    #[must_use]
    pub fn fp(&self) -> Address
    {
        Address::new(self.values[self.machine.descriptor().fp_index])
    }
}

impl fmt::Display for RegisterSet
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let descriptor = self.machine.descriptor();
        for (index, name) in descriptor.register_names.iter().enumerate() {
            if index > 0 {
                if index % 4 == 0 {
                    writeln!(f)?;
                } else {
                    write!(f, "  ")?;
                }
            }
            if descriptor.word_size == 8 {
                write!(f, "{name:>6}={:016x}", self.values[index])?;
            } else {
                write!(f, "{name:>6}={:08x}", self.values[index])?;
            }
        }
        Ok(())
    }
}
