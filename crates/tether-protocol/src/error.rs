//! Wire-level error type.
//!
//! These errors cover everything that can go wrong while turning bytes into
//! frames and frames into messages. Session-level policy (how many malformed
//! frames to tolerate, when to detach) lives in `tether-core`.

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
///
/// Every variant carries enough context to log which part of the frame was
/// bad; the decoder never guesses or resynchronizes on its own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError
{
    /// The buffer ended before a complete header or payload was available.
    #[error("Truncated frame: needed {needed} bytes, have {have}")]
    Truncated
    {
        /// Number of bytes required to continue decoding.
        needed: usize,
        /// Number of bytes actually available.
        have: usize,
    },

    /// The magic field did not match [`crate::FRAME_MAGIC`].
    #[error("Bad frame magic: 0x{0:04x}")]
    BadMagic(u16),

    /// The payload length field exceeds [`crate::MAX_PAYLOAD_LEN`].
    #[error("Frame payload length {0} exceeds maximum")]
    Oversize(u32),

    /// The checksum in the header did not match the computed checksum.
    #[error("Bad frame checksum: header says 0x{expected:04x}, computed 0x{computed:04x}")]
    BadChecksum
    {
        /// Checksum value carried in the frame header.
        expected: u16,
        /// Checksum computed over the received bytes.
        computed: u16,
    },

    /// The message kind byte does not name any known message.
    ///
    /// Unknown kinds are rejected at the decode boundary rather than being
    /// reinterpreted; a newer peer speaking an extended protocol must
    /// negotiate, not smuggle.
    #[error("Unknown message kind: 0x{0:02x}")]
    UnknownKind(u8),

    /// The payload did not decode as the shape its kind requires.
    #[error("Bad payload for {kind}: {detail}")]
    BadPayload
    {
        /// Human-readable name of the message kind being decoded.
        kind: &'static str,
        /// What was wrong with the payload.
        detail: &'static str,
    },

    /// A string field in the payload was not valid UTF-8.
    #[error("Payload string is not valid UTF-8")]
    BadString,
}
