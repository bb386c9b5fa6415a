//! VoSPI packet layout and classification
//!
//! Every bus transfer yields one fixed-size packet:
//!
//! ```text
//! +--------+--------+------------------------------------------+
//! | ID (2) | CRC (2)| payload: width x big-endian u16 samples  |
//! +--------+--------+------------------------------------------+
//! ```
//!
//! The identifier's high nibble is all-ones for discard packets (timing padding
//! between frames). Otherwise its low 12 bits carry the line number.

use serde::{Deserialize, Serialize};

/// Bytes of header (ID + CRC) preceding the payload
pub const VOSPI_HEADER_SIZE: usize = 4;

/// Native sensor width in samples
pub const LEPTON_WIDTH: usize = 80;

/// Native sensor height in lines
pub const LEPTON_HEIGHT: usize = 60;

/// Packet size for the native 80x60 geometry
pub const VOSPI_PACKET_SIZE: usize = VOSPI_HEADER_SIZE + LEPTON_WIDTH * 2;

/// Mask selecting the discard marker in the packet identifier
const DISCARD_MASK: u16 = 0xF000;

/// Mask selecting the line number in the packet identifier
const LINE_MASK: u16 = 0x0FFF;

/// CRC-16/CCITT generator polynomial (x^16 + x^12 + x^5 + 1)
const CRC16_POLY: u16 = 0x1021;

/// Frame geometry shared by the assembler, buffer and renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameGeometry {
    /// Samples per line
    pub width: usize,
    /// Lines per frame
    pub height: usize,
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self::LEPTON
    }
}

impl FrameGeometry {
    /// The 80x60 geometry the sensor streams natively
    pub const LEPTON: FrameGeometry = FrameGeometry {
        width: LEPTON_WIDTH,
        height: LEPTON_HEIGHT,
    };

    /// Create a geometry with explicit dimensions
    pub const fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Payload bytes carried by one line packet
    pub const fn payload_size(&self) -> usize {
        self.width * 2
    }

    /// Total bytes moved by one bus transfer
    pub const fn packet_size(&self) -> usize {
        VOSPI_HEADER_SIZE + self.payload_size()
    }

    /// Number of samples in a complete frame
    pub const fn sample_count(&self) -> usize {
        self.width * self.height
    }
}

/// Result of classifying a single packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Timing padding, carries no scanline
    Discard,
    /// A scanline with the given line number
    Line(u16),
    /// Not a discard, but the line number is outside the frame (or the packet is truncated)
    Invalid,
}

/// Read the 16-bit identifier from the front of a packet
#[inline]
pub fn packet_id(data: &[u8]) -> Option<u16> {
    if data.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([data[0], data[1]]))
}

/// Classify a received packet against a frame height
///
/// A packet is `Discard` iff the identifier's high nibble is all ones. Otherwise
/// the low 12 bits are the line number, and anything at or past `height` is `Invalid`.
#[inline]
pub fn classify(data: &[u8], height: usize) -> PacketKind {
    let Some(id) = packet_id(data) else {
        return PacketKind::Invalid;
    };

    if id & DISCARD_MASK == DISCARD_MASK {
        return PacketKind::Discard;
    }

    let line = id & LINE_MASK;
    if usize::from(line) >= height {
        PacketKind::Invalid
    } else {
        PacketKind::Line(line)
    }
}

/// CRC-16/CCITT over the packet as the sensor computes it
///
/// The identifier's high nibble and both CRC bytes are treated as zero.
/// Initial value 0, no reflection, no final XOR.
pub fn packet_crc(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for (i, &byte) in data.iter().enumerate() {
        let byte = match i {
            0 => byte & 0x0F,
            2 | 3 => 0,
            _ => byte,
        };
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Check the CRC field of a full packet against its contents
pub fn crc_matches(data: &[u8]) -> bool {
    if data.len() < VOSPI_HEADER_SIZE {
        return false;
    }
    let stored = u16::from_be_bytes([data[2], data[3]]);
    stored == packet_crc(data)
}

/// Decode one line of big-endian samples from a packet into `row`
///
/// Returns `false` without touching `row` if the packet is too short.
pub fn decode_line(data: &[u8], row: &mut [u16]) -> bool {
    let needed = VOSPI_HEADER_SIZE + row.len() * 2;
    if data.len() < needed {
        return false;
    }

    let payload = &data[VOSPI_HEADER_SIZE..needed];
    for (sample, bytes) in row.iter_mut().zip(payload.chunks_exact(2)) {
        *sample = u16::from_be_bytes([bytes[0], bytes[1]]);
    }
    true
}
