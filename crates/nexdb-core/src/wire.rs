//! nexdb wire format: the on-wire frame every circuit speaks.
//!
//! These types ARE the protocol. Every field and every size is part of the
//! wire format; changing anything here is a breaking change for peers.
//!
//! A frame is a fixed 16-byte header, a payload, and a 4-byte footer, all in
//! network byte order:
//!
//! ```text
//! Header:  length:u32 | msgId:u32 | segmentIndex:u32 | flags:u32
//! Payload: <length - 16 - 4> bytes
//! Footer:  checksum:u32   (CRC-32 over Payload only)
//! ```
//!
//! The header and footer use zerocopy big-endian integers, so there is no
//! manual byte shuffling and no unsafe code in this module.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Header / Footer ──────────────────────────────────────────────────────────

/// Fixed frame header.
///
/// `length` covers the whole frame (header + payload + footer), so the first
/// four bytes of any frame are a self-delimiting prefix the receiver can
/// peek before committing to consume the rest.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    pub length: U32<NetworkEndian>,
    pub msg_id: U32<NetworkEndian>,
    pub segment_index: U32<NetworkEndian>,
    pub flags: U32<NetworkEndian>,
}

assert_eq_size!(FrameHeader, [u8; 16]);

/// Frame footer. The checksum covers the payload bytes exactly as they
/// appear on the wire, i.e. after encryption.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameFooter {
    pub checksum: U32<NetworkEndian>,
}

assert_eq_size!(FrameFooter, [u8; 4]);

pub const HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();
pub const FOOTER_SIZE: usize = std::mem::size_of::<FrameFooter>();
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;

/// Size of the length prefix the receiver peeks.
pub const LENGTH_PREFIX: usize = std::mem::size_of::<u32>();

// ── Flags ────────────────────────────────────────────────────────────────────

/// Frame flag bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameFlags(u32);

impl FrameFlags {
    /// More segments follow for this message.
    pub const SEGMENTED: FrameFlags = FrameFlags(0x1);
    /// The message was compressed before segmentation.
    pub const COMPRESSED: FrameFlags = FrameFlags(0x2);
    /// This frame's payload is sealed with the sender's transmit key.
    pub const ENCRYPTED: FrameFlags = FrameFlags(0x4);
    /// The sender switched keys; rotate the receive key before decrypting.
    pub const KEY_UPDATE: FrameFlags = FrameFlags(0x8);

    const ALL: u32 = 0xF;

    pub const fn empty() -> Self {
        FrameFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Keep unknown bits as-is; a newer peer may set them.
    pub const fn from_bits_retain(bits: u32) -> Self {
        FrameFlags(bits)
    }

    pub const fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FrameFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FrameFlags) {
        self.0 &= !other.0;
    }

    pub const fn unknown_bits(self) -> u32 {
        self.0 & !Self::ALL
    }
}

impl BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for FrameFlags {
    fn bitor_assign(&mut self, rhs: FrameFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(FrameFlags, &str); 4] = [
            (FrameFlags::SEGMENTED, "SEGMENTED"),
            (FrameFlags::COMPRESSED, "COMPRESSED"),
            (FrameFlags::ENCRYPTED, "ENCRYPTED"),
            (FrameFlags::KEY_UPDATE, "KEY_UPDATE"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if self.unknown_bits() != 0 {
            if !first {
                f.write_str(" | ")?;
            }
            write!(f, "0x{:x}", self.unknown_bits())?;
            first = false;
        }
        if first {
            f.write_str("(empty)")?;
        }
        Ok(())
    }
}

// ── Checksum ─────────────────────────────────────────────────────────────────

/// IEEE CRC-32 (the zlib/Ethernet polynomial).
const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

pub fn checksum(payload: &[u8]) -> u32 {
    CRC32.checksum(payload)
}

// ── Frame ────────────────────────────────────────────────────────────────────

/// One decoded frame: a single segment of a logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    pub msg_id: u32,
    pub segment_index: u32,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl WireFrame {
    pub fn new(msg_id: u32, segment_index: u32, flags: FrameFlags, payload: Bytes) -> Self {
        Self {
            msg_id,
            segment_index,
            flags,
            payload,
        }
    }

    /// Total encoded size, which is also the value of the `length` field.
    pub fn encoded_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Serialize header, payload and footer. The checksum is computed here
    /// over the payload as given.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out.freeze())
    }

    pub fn encode_into(&self, out: &mut BytesMut) -> Result<(), WireError> {
        let length = u32::try_from(self.encoded_len())
            .map_err(|_| WireError::FrameTooLarge(self.encoded_len()))?;

        let header = FrameHeader {
            length: U32::new(length),
            msg_id: U32::new(self.msg_id),
            segment_index: U32::new(self.segment_index),
            flags: U32::new(self.flags.bits()),
        };
        let footer = FrameFooter {
            checksum: U32::new(checksum(&self.payload)),
        };

        out.reserve(self.encoded_len());
        out.put_slice(header.as_bytes());
        out.put_slice(&self.payload);
        out.put_slice(footer.as_bytes());
        Ok(())
    }

    /// Parse one complete frame. `bytes` must be exactly the frame, as
    /// delimited by its length prefix.
    ///
    /// A checksum mismatch is reported as [`WireError::ChecksumMismatch`]
    /// carrying the frame's identity so the caller can log what it dropped.
    pub fn decode(bytes: &[u8]) -> Result<WireFrame, WireError> {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(WireError::Truncated(bytes.len()));
        }

        let header = FrameHeader::read_from_prefix(bytes).ok_or(WireError::Truncated(bytes.len()))?;
        let declared = header.length.get() as usize;
        if declared != bytes.len() {
            return Err(WireError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }

        let payload_end = bytes.len() - FOOTER_SIZE;
        let footer = FrameFooter::read_from(&bytes[payload_end..])
            .ok_or(WireError::Truncated(bytes.len()))?;
        let payload = &bytes[HEADER_SIZE..payload_end];

        let expected = footer.checksum.get();
        let actual = checksum(payload);
        if expected != actual {
            return Err(WireError::ChecksumMismatch {
                msg_id: header.msg_id.get(),
                segment_index: header.segment_index.get(),
                expected,
                actual,
            });
        }

        Ok(WireFrame {
            msg_id: header.msg_id.get(),
            segment_index: header.segment_index.get(),
            flags: FrameFlags::from_bits_retain(header.flags.get()),
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Read the length prefix out of the first four bytes of a frame.
pub fn declared_length(prefix: [u8; LENGTH_PREFIX]) -> u32 {
    u32::from_be_bytes(prefix)
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when encoding or interpreting a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame of {0} bytes is shorter than the {}-byte header+footer", FRAME_OVERHEAD)]
    Truncated(usize),

    #[error("length prefix says {declared} bytes but {actual} were supplied")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("frame of {0} bytes does not fit a u32 length prefix")]
    FrameTooLarge(usize),

    #[error(
        "checksum mismatch on msg {msg_id} segment {segment_index}: \
         footer 0x{expected:08x}, computed 0x{actual:08x}"
    )]
    ChecksumMismatch {
        msg_id: u32,
        segment_index: u32,
        expected: u32,
        actual: u32,
    },
}

// ── Tests ────────────────────────────────────────────────────────────────────
