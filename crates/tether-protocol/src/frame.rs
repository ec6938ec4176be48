//! Frame header, checksum, and whole-frame encode/decode.

use crate::error::WireError;

/// Magic value identifying a tether debug frame ("DK" in little-endian).
pub const FRAME_MAGIC: u16 = 0x4B44;

/// Size in bytes of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 16;

/// Upper bound on the payload carried by a single frame.
///
/// Large memory transfers are chunked by the session; a length above this is
/// treated as a framing error since it almost certainly means the stream has
/// desynchronized.
pub const MAX_PAYLOAD_LEN: u32 = 1 << 20;

/// Compute the 16-bit word-sum checksum over a series of byte slices.
///
/// The sum is taken over consecutive little-endian 16-bit words across the
/// concatenation of the slices; a trailing odd byte is added as a final low
/// byte. Addition wraps at 16 bits.
#[must_use]
pub fn checksum(parts: &[&[u8]]) -> u16
{
    let mut sum: u16 = 0;
    let mut carry: Option<u8> = None;
    for part in parts {
        let mut bytes = part.iter().copied();
        // A leftover odd byte from the previous slice pairs with the first
        // byte of this one.
        if let Some(low) = carry.take() {
            match bytes.next() {
                Some(high) => {
                    sum = sum.wrapping_add(u16::from_le_bytes([low, high]));
                }
                None => {
                    carry = Some(low);
                    continue;
                }
            }
        }

        loop {
            let Some(low) = bytes.next() else { break };
            match bytes.next() {
                Some(high) => {
                    sum = sum.wrapping_add(u16::from_le_bytes([low, high]));
                }
                None => {
                    carry = Some(low);
                    break;
                }
            }
        }
    }

    if let Some(low) = carry {
        sum = sum.wrapping_add(u16::from(low));
    }

    sum
}

/// Parsed fixed-size frame header.
///
/// The header is what a transport needs to delimit frames on a byte stream:
/// it can be parsed and sanity-checked (magic, length bound) before the
/// payload has arrived. Checksum verification happens later in
/// [`Frame::decode`], once the payload is in hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader
{
    /// Message kind byte (see [`crate::message::Message`]).
    pub kind: u8,
    /// Flags byte; currently always zero, reserved for protocol evolution.
    pub flags: u8,
    /// Length in bytes of the payload following the header.
    pub payload_len: u32,
    /// Checksum over the zero-checksum header plus the payload.
    pub checksum: u16,
    /// Sequence number (zero for asynchronous notifications).
    pub sequence: u32,
}

impl FrameHeader
{
    /// Parse a header from the first [`FRAME_HEADER_LEN`] bytes of `bytes`.
    ///
    /// Validates the magic and the payload length bound so a transport can
    /// reject a desynchronized stream before trying to read a garbage-sized
    /// payload. Does not verify the checksum.
    ///
    /// ## Errors
    ///
    /// - `Truncated` if fewer than [`FRAME_HEADER_LEN`] bytes are available
    /// - `BadMagic` if the magic field is wrong
    /// - `Oversize` if the payload length exceeds [`MAX_PAYLOAD_LEN`]
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError>
    {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(WireError::Truncated {
                needed: FRAME_HEADER_LEN,
                have: bytes.len(),
            });
        }

        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        if magic != FRAME_MAGIC {
            return Err(WireError::BadMagic(magic));
        }

        let payload_len = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(WireError::Oversize(payload_len));
        }

        Ok(FrameHeader {
            kind: bytes[2],
            flags: bytes[3],
            payload_len,
            checksum: u16::from_le_bytes([bytes[8], bytes[9]]),
            sequence: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        })
    }

    fn encode_with_checksum(self, checksum: u16) -> [u8; FRAME_HEADER_LEN]
    {
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0..2].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
        header[2] = self.kind;
        header[3] = self.flags;
        header[4..8].copy_from_slice(&self.payload_len.to_le_bytes());
        header[8..10].copy_from_slice(&checksum.to_le_bytes());
        // bytes 10..12 reserved, zero
        header[12..16].copy_from_slice(&self.sequence.to_le_bytes());
        header
    }
}

/// One complete wire frame: header fields plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame
{
    /// Message kind byte.
    pub kind: u8,
    /// Flags byte (currently always zero).
    pub flags: u8,
    /// Sequence number; zero for notifications.
    pub sequence: u32,
    /// Type-specific payload bytes.
    pub payload: Vec<u8>,
}

impl Frame
{
    /// Build a frame for a message payload.
    #[must_use]
    pub fn new(kind: u8, sequence: u32, payload: Vec<u8>) -> Self
    {
        Frame {
            kind,
            flags: 0,
            sequence,
            payload,
        }
    }

    /// Encode this frame to wire bytes, computing the checksum.
    ///
    /// ## Errors
    ///
    /// Returns `Oversize` if the payload exceeds [`MAX_PAYLOAD_LEN`].
    pub fn encode(&self) -> Result<Vec<u8>, WireError>
    {
        let payload_len =
            u32::try_from(self.payload.len()).map_err(|_| WireError::Oversize(u32::MAX))?;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(WireError::Oversize(payload_len));
        }

        let header = FrameHeader {
            kind: self.kind,
            flags: self.flags,
            payload_len,
            checksum: 0,
            sequence: self.sequence,
        };
        let zeroed = header.encode_with_checksum(0);
        let sum = checksum(&[&zeroed, &self.payload]);
        let mut bytes = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&header.encode_with_checksum(sum));
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Decode and fully validate a frame from wire bytes.
    ///
    /// Verifies magic, length, and checksum. The message kind is *not*
    /// interpreted here; [`crate::message::Message::decode`] does that.
    ///
    /// ## Errors
    ///
    /// Any [`WireError`] framing variant; `BadChecksum` if the checksum over
    /// the received bytes does not match the header field.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError>
    {
        let header = FrameHeader::parse(bytes)?;
        let total = FRAME_HEADER_LEN + header.payload_len as usize;
        if bytes.len() < total {
            return Err(WireError::Truncated {
                needed: total,
                have: bytes.len(),
            });
        }

        let payload = &bytes[FRAME_HEADER_LEN..total];
        let zeroed = FrameHeader {
            checksum: 0,
            ..header
        }
        .encode_with_checksum(0);
        let computed = checksum(&[&zeroed, payload]);
        if computed != header.checksum {
            return Err(WireError::BadChecksum {
                expected: header.checksum,
                computed,
            });
        }

        Ok(Frame {
            kind: header.kind,
            flags: header.flags,
            sequence: header.sequence,
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_checksum_word_sum()
    {
        // 0x0201 + 0x0403 = 0x0604
        assert_eq!(checksum(&[&[0x01, 0x02, 0x03, 0x04]]), 0x0604);
    }

    #[test]
    fn test_checksum_trailing_odd_byte()
    {
        // 0x0201 + 0x0003 = 0x0204
        assert_eq!(checksum(&[&[0x01, 0x02, 0x03]]), 0x0204);
    }

    #[test]
    fn test_checksum_spans_slices()
    {
        // Split points must not change the result.
        let whole = checksum(&[&[0x01, 0x02, 0x03, 0x04, 0x05]]);
        let split = checksum(&[&[0x01], &[0x02, 0x03], &[], &[0x04, 0x05]]);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_checksum_wraps()
    {
        assert_eq!(checksum(&[&[0xff, 0xff, 0x02, 0x00]]), 0x0001);
    }

    #[test]
    fn test_frame_roundtrip()
    {
        let frame = Frame::new(0x06, 42, vec![0xde, 0xad, 0xbe, 0xef]);
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes.len(), FRAME_HEADER_LEN + 4);
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_frame_bad_magic()
    {
        let frame = Frame::new(0x01, 1, Vec::new());
        let mut bytes = frame.encode().unwrap();
        bytes[0] = 0x00;
        assert!(matches!(Frame::decode(&bytes), Err(WireError::BadMagic(_))));
    }

    #[test]
    fn test_frame_corrupt_payload_fails_checksum()
    {
        let frame = Frame::new(0x06, 7, vec![1, 2, 3, 4, 5]);
        let mut bytes = frame.encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            Frame::decode(&bytes),
            Err(WireError::BadChecksum { .. })
        ));
    }

    #[test]
    fn test_frame_truncated()
    {
        let frame = Frame::new(0x06, 7, vec![1, 2, 3, 4, 5]);
        let bytes = frame.encode().unwrap();
        assert!(matches!(
            Frame::decode(&bytes[..bytes.len() - 2]),
            Err(WireError::Truncated { .. })
        ));
        assert!(matches!(
            FrameHeader::parse(&bytes[..8]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_header_rejects_oversize()
    {
        let frame = Frame::new(0x01, 1, Vec::new());
        let mut bytes = frame.encode().unwrap();
        bytes[4..8].copy_from_slice(&(MAX_PAYLOAD_LEN + 1).to_le_bytes());
        assert!(matches!(
            FrameHeader::parse(&bytes),
            Err(WireError::Oversize(_))
        ));
    }
}
