//! Frame assembly from VoSPI line packets
//!
//! A frame is built from exactly `height` consecutive line packets numbered
//! `0..height`. Assembly is all-or-nothing: any discard, gap or out-of-order line
//! after line 0 abandons the frame and drops lock, so a partially filled frame is
//! never handed to the caller.
//!
//! # Usage
//!
//! ```rust,ignore
//! use vospi_scope_lib::frame_assembler::FrameAssembler;
//!
//! let mut assembler = FrameAssembler::new(FrameGeometry::LEPTON, SyncConfig::default());
//!
//! loop {
//!     match assembler.read_frame(&mut transport) {
//!         Ok(frame) => process_frame(frame),
//!         Err(e) if e.is_fatal() => break,
//!         Err(_) => continue,
//!     }
//! }
//! ```

use std::ops::Index;

use thiserror::Error;

use crate::config::SyncConfig;
use crate::packet::{decode_line, FrameGeometry, PacketKind};
use crate::synchronizer::{SyncError, SyncState, Synchronizer};
use crate::transport::{PacketTransport, TransportError};

/// Reasons a frame attempt was abandoned
#[derive(Error, Debug)]
pub enum FrameError {
    /// A discard packet arrived where a line was expected
    #[error("lost sync at line {line}")]
    LostSync {
        /// Line that was expected
        line: u16,
    },

    /// A line arrived out of sequence (`found` is `None` for an invalid line number)
    #[error("out-of-order packet: expected line {expected}, found {found:?}")]
    OutOfOrder {
        /// Line that was expected
        expected: u16,
        /// Line that arrived instead
        found: Option<u16>,
    },

    /// The expected line arrived but failed its CRC check
    #[error("checksum mismatch on line {line}")]
    Checksum {
        /// Line whose CRC failed
        line: u16,
    },

    /// Too many consecutive discards while waiting for a frame start
    #[error("link idle: {discards} consecutive discard packets")]
    LinkIdle {
        /// Length of the discard run
        discards: u32,
    },

    /// No frame start within the packet budget
    #[error("no frame start within {packets} packets")]
    NoFrameStart {
        /// Packets examined
        packets: u32,
    },

    /// The transport failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<SyncError> for FrameError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::LinkIdle { discards } => FrameError::LinkIdle { discards },
            SyncError::NoFrameStart { packets } => FrameError::NoFrameStart { packets },
            SyncError::Transport(e) => FrameError::Transport(e),
        }
    }
}

impl FrameError {
    /// Whether the failure is a protocol-level loss of lock (retry after resync)
    pub fn requires_resync(&self) -> bool {
        !self.is_fatal()
    }

    /// Whether the failure comes from the transport itself
    ///
    /// Capture cannot continue after a fatal error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::Transport(_))
    }
}

/// Result type alias for frame assembly.
pub type Result<T> = std::result::Result<T, FrameError>;

/// A complete frame of raw 16-bit samples in row-major order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    geometry: FrameGeometry,
    samples: Vec<u16>,
    sequence: u64,
}

impl Frame {
    /// Create a zero-filled frame
    pub fn new(geometry: FrameGeometry) -> Self {
        Self {
            geometry,
            samples: vec![0; geometry.sample_count()],
            sequence: 0,
        }
    }

    /// Build a frame from existing samples
    ///
    /// Returns `None` if the sample count doesn't match the geometry.
    pub fn from_samples(geometry: FrameGeometry, samples: Vec<u16>) -> Option<Self> {
        if samples.len() != geometry.sample_count() {
            return None;
        }
        Some(Self {
            geometry,
            samples,
            sequence: 0,
        })
    }

    /// Frame dimensions
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Samples per row
    pub fn width(&self) -> usize {
        self.geometry.width
    }

    /// Number of rows
    pub fn height(&self) -> usize {
        self.geometry.height
    }

    /// Position of this frame in the capture (starting at 1)
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// All samples, row-major
    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    /// One row of samples
    ///
    /// # Panics
    ///
    /// Panics if `row >= height`.
    pub fn row(&self, row: usize) -> &[u16] {
        let start = row * self.geometry.width;
        &self.samples[start..start + self.geometry.width]
    }

    fn row_mut(&mut self, row: usize) -> &mut [u16] {
        let start = row * self.geometry.width;
        &mut self.samples[start..start + self.geometry.width]
    }

    /// Sample at (row, col), if in bounds
    pub fn get(&self, row: usize, col: usize) -> Option<u16> {
        if row >= self.geometry.height || col >= self.geometry.width {
            return None;
        }
        self.samples.get(row * self.geometry.width + col).copied()
    }

    /// Smallest and largest sample in the frame
    ///
    /// An empty frame yields `(u16::MAX, 0)`.
    pub fn min_max(&self) -> (u16, u16) {
        self.samples
            .iter()
            .fold((u16::MAX, 0), |(lo, hi), &v| (lo.min(v), hi.max(v)))
    }
}

impl Index<usize> for Frame {
    type Output = [u16];

    fn index(&self, row: usize) -> &[u16] {
        self.row(row)
    }
}

/// Reads whole frames from a packet transport
#[derive(Debug)]
pub struct FrameAssembler {
    sync: Synchronizer,
    geometry: FrameGeometry,
    frames_completed: u64,
    frames_aborted: u64,
}

impl FrameAssembler {
    /// Create an assembler for the given geometry
    pub fn new(geometry: FrameGeometry, config: SyncConfig) -> Self {
        Self {
            sync: Synchronizer::new(geometry, config),
            geometry,
            frames_completed: 0,
            frames_aborted: 0,
        }
    }

    /// Frame dimensions
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Lock state of the underlying synchronizer
    pub fn sync_state(&self) -> SyncState {
        self.sync.state()
    }

    /// The synchronizer, for reading counters
    pub fn synchronizer(&self) -> &Synchronizer {
        &self.sync
    }

    /// The synchronizer, for recording outcomes and backoff decisions
    pub fn synchronizer_mut(&mut self) -> &mut Synchronizer {
        &mut self.sync
    }

    /// Frames returned successfully so far
    pub fn frames_completed(&self) -> u64 {
        self.frames_completed
    }

    /// Frame attempts abandoned after lock was established
    pub fn frames_aborted(&self) -> u64 {
        self.frames_aborted
    }

    /// Read one complete frame
    ///
    /// Locates the next frame start, reusing the line-0 packet that established
    /// it, then reads lines `1..height` in strict order.
    ///
    /// # Errors
    ///
    /// - `FrameError::LinkIdle` / `NoFrameStart` if no frame start is found
    /// - `FrameError::LostSync` if a discard packet interrupts the frame
    /// - `FrameError::OutOfOrder` if a line is skipped, repeated or invalid
    /// - `FrameError::Checksum` if CRC checking is enabled and a line fails it
    /// - `FrameError::Transport` if the bus fails
    pub fn read_frame<T>(&mut self, transport: &mut T) -> Result<Frame>
    where
        T: PacketTransport + ?Sized,
    {
        self.sync.locate_start(transport)?;

        let mut frame = Frame::new(self.geometry);
        self.store_line(&mut frame, 0)?;

        let height = u16::try_from(self.geometry.height).unwrap_or(u16::MAX);
        for expected in 1..height {
            let kind = self.sync.read_packet(transport)?;
            match kind {
                PacketKind::Line(line) if line == expected => {
                    if !self.sync.crc_ok() {
                        return Err(self.abort(FrameError::Checksum { line }));
                    }
                    self.store_line(&mut frame, expected)?;
                }
                PacketKind::Line(line) => {
                    return Err(self.abort(FrameError::OutOfOrder {
                        expected,
                        found: Some(line),
                    }));
                }
                PacketKind::Invalid => {
                    return Err(self.abort(FrameError::OutOfOrder {
                        expected,
                        found: None,
                    }));
                }
                PacketKind::Discard => {
                    return Err(self.abort(FrameError::LostSync { line: expected }));
                }
            }
        }

        self.frames_completed += 1;
        frame.sequence = self.frames_completed;
        Ok(frame)
    }

    fn store_line(&mut self, frame: &mut Frame, line: u16) -> Result<()> {
        let row = frame.row_mut(usize::from(line));
        if decode_line(self.sync.packet(), row) {
            Ok(())
        } else {
            let err = FrameError::Transport(TransportError::ShortRead {
                expected: self.geometry.packet_size(),
                actual: self.sync.packet().len(),
            });
            Err(self.abort(err))
        }
    }

    fn abort(&mut self, err: FrameError) -> FrameError {
        self.frames_aborted += 1;
        self.sync.lose_sync();
        log::debug!("Frame abandoned: {}", err);
        err
    }
}
