//! Synthetic VoSPI packet generation for testing
//!
//! Generates well-formed packets (with valid CRCs) carrying known sample values
//! for sample-exact test validation.
//!
//! # Example
//!
//! ```rust,ignore
//! use vospi_scope_lib::test_utils::PacketGenerator;
//!
//! let gen = PacketGenerator::default();
//!
//! // Three discard packets followed by a frame whose samples encode their position
//! let mut packets = gen.discards(3);
//! packets.extend(gen.gradient_frame());
//! ```

use crate::packet::{packet_crc, FrameGeometry, VOSPI_HEADER_SIZE};

/// Identifier used for generated discard packets
pub const DISCARD_ID: u16 = 0xF000;

/// Generates synthetic VoSPI packets for testing
#[derive(Debug, Clone, Copy)]
pub struct PacketGenerator {
    geometry: FrameGeometry,
}

impl Default for PacketGenerator {
    fn default() -> Self {
        Self::new(FrameGeometry::LEPTON)
    }
}

impl PacketGenerator {
    /// Create a generator for the given frame geometry
    pub fn new(geometry: FrameGeometry) -> Self {
        Self { geometry }
    }

    /// Geometry of the generated packets
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// A single discard packet
    pub fn discard(&self) -> Vec<u8> {
        self.raw_packet(DISCARD_ID)
    }

    /// `count` consecutive discard packets
    pub fn discards(&self, count: usize) -> Vec<Vec<u8>> {
        (0..count).map(|_| self.discard()).collect()
    }

    /// A packet with an arbitrary identifier and zero payload, CRC left at zero
    ///
    /// Useful for identifiers that are neither discards nor in-range lines.
    pub fn invalid_packet(&self, id: u16) -> Vec<u8> {
        self.raw_packet(id)
    }

    /// A line packet with a valid CRC
    ///
    /// `samples` shorter than the frame width are zero-padded; extra samples are ignored.
    pub fn line_packet(&self, line: u16, samples: &[u16]) -> Vec<u8> {
        let mut packet = self.raw_packet(line & 0x0FFF);

        let payload = &mut packet[VOSPI_HEADER_SIZE..];
        for (bytes, &sample) in payload
            .chunks_exact_mut(2)
            .zip(samples.iter().take(self.geometry.width))
        {
            bytes.copy_from_slice(&sample.to_be_bytes());
        }

        let crc = packet_crc(&packet);
        packet[2..4].copy_from_slice(&crc.to_be_bytes());
        packet
    }

    /// All line packets of one frame, sample values given by `value(row, col)`
    pub fn frame_packets<F>(&self, value: F) -> Vec<Vec<u8>>
    where
        F: Fn(usize, usize) -> u16,
    {
        (0..self.geometry.height)
            .map(|row| {
                let samples: Vec<u16> =
                    (0..self.geometry.width).map(|col| value(row, col)).collect();
                self.line_packet(row as u16, &samples)
            })
            .collect()
    }

    /// A frame where each sample holds its row-major index
    pub fn gradient_frame(&self) -> Vec<Vec<u8>> {
        let width = self.geometry.width;
        self.frame_packets(|row, col| (row * width + col) as u16)
    }

    /// A frame where every sample has the same value
    pub fn solid_frame(&self, value: u16) -> Vec<Vec<u8>> {
        self.frame_packets(|_, _| value)
    }

    /// Discard padding followed by a frame, repeated `frames` times
    pub fn stream(&self, frames: usize, padding: usize) -> Vec<Vec<u8>> {
        let mut packets = Vec::with_capacity(frames * (padding + self.geometry.height));
        for _ in 0..frames {
            packets.extend(self.discards(padding));
            packets.extend(self.gradient_frame());
        }
        packets
    }

    fn raw_packet(&self, id: u16) -> Vec<u8> {
        let mut packet = vec![0u8; self.geometry.packet_size()];
        packet[..2].copy_from_slice(&id.to_be_bytes());
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{classify, crc_matches, decode_line, PacketKind};

    #[test]
    fn test_discard_classifies() {
        let gen = PacketGenerator::default();
        let packet = gen.discard();
        assert_eq!(packet.len(), 164);
        assert_eq!(classify(&packet, 60), PacketKind::Discard);
    }

    #[test]
    fn test_line_packet_has_valid_crc() {
        let gen = PacketGenerator::default();
        let packet = gen.line_packet(17, &[0xBEEF; 80]);
        assert_eq!(classify(&packet, 60), PacketKind::Line(17));
        assert!(crc_matches(&packet));
    }

    #[test]
    fn test_line_packet_pads_short_samples() {
        let gen = PacketGenerator::default();
        let packet = gen.line_packet(0, &[1, 2]);
        let mut row = [0xFFFFu16; 80];
        assert!(decode_line(&packet, &mut row));
        assert_eq!(&row[..3], &[1, 2, 0]);
    }

    #[test]
    fn test_gradient_frame_values() {
        let gen = PacketGenerator::default();
        let packets = gen.gradient_frame();
        assert_eq!(packets.len(), 60);

        let mut row = [0u16; 80];
        decode_line(&packets[59], &mut row);
        assert_eq!(row[79], 4799);
    }

    #[test]
    fn test_stream_layout() {
        let gen = PacketGenerator::new(FrameGeometry::new(4, 2));
        let packets = gen.stream(2, 3);
        assert_eq!(packets.len(), 10);
        assert_eq!(classify(&packets[3], 2), PacketKind::Line(0));
        assert_eq!(classify(&packets[5], 2), PacketKind::Discard);
    }
}
