//! Packet replay for running the pipeline without hardware.
//!
//! [`ReplayTransport`] implements [`PacketTransport`] over a list of recorded
//! packets, so the synchronizer, assembler and stream controller see exactly what
//! the sensor produced during a capture session.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::path::Path;
//! use vospi_scope_lib::replay::{ReplayConfig, ReplayTransport};
//!
//! let mut transport = ReplayTransport::load(Path::new("packets_12345.bin"), ReplayConfig::default())?;
//! let frame = assembler.read_frame(&mut transport)?;
//! ```

use std::path::Path;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::capture::{self, read_metadata, CaptureError, CaptureMetadata};
use crate::transport::{self, PacketTransport, TransportError};

/// Errors that can occur while loading a replay.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// The capture file could not be read.
    #[error("failed to load capture: {0}")]
    Load(#[from] CaptureError),

    /// A recorded packet does not match the expected packet size.
    #[error("invalid packet {index}: {len} bytes, expected {expected}")]
    InvalidPacket {
        /// Position of the packet in the recording.
        index: usize,
        /// Recorded length.
        len: usize,
        /// Packet size for the configured geometry.
        expected: usize,
    },

    /// The recording contains no packets.
    #[error("capture contains no packets")]
    Empty,
}

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Configuration for packet replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayConfig {
    /// Start over from the first packet after the last one.
    pub loop_playback: bool,
    /// Delay inserted after every packet (zero = as fast as possible).
    pub packet_delay: Duration,
}

/// Serves recorded packets through the transport interface.
#[derive(Debug, Clone)]
pub struct ReplayTransport {
    packets: Vec<Vec<u8>>,
    position: usize,
    config: ReplayConfig,
    metadata: Option<CaptureMetadata>,
    loops: u64,
}

impl ReplayTransport {
    /// Replay an in-memory packet list once.
    pub fn new(packets: Vec<Vec<u8>>) -> Self {
        Self::with_config(packets, ReplayConfig::default())
    }

    /// Replay an in-memory packet list with explicit settings.
    pub fn with_config(packets: Vec<Vec<u8>>, config: ReplayConfig) -> Self {
        Self {
            packets,
            position: 0,
            config,
            metadata: None,
            loops: 0,
        }
    }

    /// Load a recording written by [`CaptureState`](crate::capture::CaptureState).
    ///
    /// Companion metadata is picked up from `metadata_<ts>.json` next to a
    /// `packets_<ts>.bin` file, or from the same path with a `.json` extension.
    ///
    /// # Errors
    ///
    /// Returns `ReplayError::Load` if the file cannot be read.
    /// Returns `ReplayError::Empty` if it holds no packets.
    /// Returns `ReplayError::InvalidPacket` if packets disagree with the recorded geometry.
    pub fn load(path: &Path, config: ReplayConfig) -> Result<Self> {
        let packets = capture::read_packets(path)?;
        if packets.is_empty() {
            return Err(ReplayError::Empty);
        }

        let metadata = try_load_metadata(path);
        if let Some(ref meta) = metadata {
            let expected = meta.geometry().packet_size();
            if let Some((index, packet)) = packets
                .iter()
                .enumerate()
                .find(|(_, p)| p.len() != expected)
            {
                return Err(ReplayError::InvalidPacket {
                    index,
                    len: packet.len(),
                    expected,
                });
            }
            log::info!(
                "Metadata: {}x{} from {}, {} packets, {} frames, {} ms",
                meta.width,
                meta.height,
                if meta.device.is_empty() {
                    "unknown device"
                } else {
                    meta.device.as_str()
                },
                meta.total_packets,
                meta.total_frames,
                meta.duration_ms
            );
        }

        log::info!("Loaded {} packets from {}", packets.len(), path.display());

        Ok(Self {
            packets,
            position: 0,
            config,
            metadata,
            loops: 0,
        })
    }

    /// Metadata loaded alongside the recording, if any.
    #[must_use]
    pub fn metadata(&self) -> Option<&CaptureMetadata> {
        self.metadata.as_ref()
    }

    /// Total packets in the recording.
    #[must_use]
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Packets left before the end of the current pass.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.packets.len() - self.position
    }

    /// Completed passes over the recording when looping.
    #[must_use]
    pub fn loops(&self) -> u64 {
        self.loops
    }

    /// Rewind to the first packet.
    pub fn reset(&mut self) {
        self.position = 0;
    }
}

impl PacketTransport for ReplayTransport {
    fn transfer(&mut self, buf: &mut [u8]) -> transport::Result<()> {
        if self.position >= self.packets.len() {
            if !self.config.loop_playback || self.packets.is_empty() {
                return Err(TransportError::Exhausted);
            }
            self.position = 0;
            self.loops += 1;
            log::debug!("Replay looped ({} passes)", self.loops);
        }

        let packet = &self.packets[self.position];
        if packet.len() < buf.len() {
            return Err(TransportError::ShortRead {
                expected: buf.len(),
                actual: packet.len(),
            });
        }
        if packet.len() > buf.len() {
            return Err(TransportError::PacketSize {
                expected: buf.len(),
                actual: packet.len(),
            });
        }
        buf.copy_from_slice(packet);
        self.position += 1;

        if !self.config.packet_delay.is_zero() {
            thread::sleep(self.config.packet_delay);
        }
        Ok(())
    }
}

/// Look for companion metadata next to a packet file.
fn try_load_metadata(path: &Path) -> Option<CaptureMetadata> {
    let file_name = path.file_name().and_then(|n| n.to_str())?;

    let candidates = [
        path.with_file_name(
            file_name
                .replacen("packets_", "metadata_", 1)
                .replace(".bin", ".json"),
        ),
        path.with_extension("json"),
    ];

    candidates
        .iter()
        .filter(|p| p.as_path() != path && p.exists())
        .find_map(|p| match read_metadata(p) {
            Ok(meta) => Some(meta),
            Err(e) => {
                log::warn!("Ignoring unreadable metadata {}: {}", p.display(), e);
                None
            }
        })
}
