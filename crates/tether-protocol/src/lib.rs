//! # tether-protocol
//!
//! The wire format spoken between a tether debugger client and a debug
//! target (kernel stub or remote process agent).
//!
//! This crate is pure bytes: it knows how to frame, checksum, encode, and
//! decode protocol messages, but performs no I/O. The transport and the
//! request/reply correlation live in `tether-core`.
//!
//! ## Frame layout
//!
//! Every frame is a 16-byte little-endian header followed by a payload:
//!
//! | offset | size | field          |
//! |--------|------|----------------|
//! | 0      | 2    | magic (0x4B44) |
//! | 2      | 1    | message kind   |
//! | 3      | 1    | flags          |
//! | 4      | 4    | payload length |
//! | 8      | 2    | checksum       |
//! | 10     | 2    | reserved (0)   |
//! | 12     | 4    | sequence       |
//!
//! The checksum is a 16-bit word sum over the header (with the checksum
//! field zeroed) and the payload. Requests carry a fresh sequence number;
//! replies echo the request's sequence; asynchronous notifications carry
//! sequence zero and are never matched to a pending request.

pub mod error;
pub mod frame;
pub mod message;

pub use error::WireError;
pub use frame::{checksum, Frame, FrameHeader, FRAME_HEADER_LEN, FRAME_MAGIC, MAX_PAYLOAD_LEN};
pub use message::{Message, StopCode};
