//! Platform-agnostic core types: addresses, machine descriptors, register
//! snapshots.

pub mod address;
pub mod machine;
pub mod registers;

pub use address::Address;
pub use machine::{ArchDescriptor, MachineType};
pub use registers::RegisterSet;
