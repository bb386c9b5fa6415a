//! Raw packet recording for offline analysis and replay
//!
//! Every packet clocked off the bus can be tee'd into a [`CaptureState`] by wrapping
//! the transport in a [`RecordingTransport`]. Recordings feed
//! [`ReplayTransport`](crate::replay::ReplayTransport), which lets the full pipeline
//! run without a sensor attached.
//!
//! # File Format
//!
//! - `packets_<ts>.bin`: sequence of `[u32 LE: length][bytes: packet]...`
//! - `metadata_<ts>.json`: geometry, bus settings and capture totals
//!
//! # Example
//!
//! ```ignore
//! let capture = Arc::new(CaptureState::new());
//! capture.start_capture(CaptureMetadata::for_geometry(FrameGeometry::LEPTON))?;
//!
//! let mut transport = RecordingTransport::new(spi, Arc::clone(&capture));
//! // ... stream ...
//!
//! let result = capture.stop_capture(Path::new("/output"))?;
//! ```

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;

use crate::packet::{classify, FrameGeometry, PacketKind};
use crate::transport::{self, PacketTransport};

/// Upper bound on a single recorded packet; anything larger is a corrupt file
const MAX_PACKET_LEN: usize = 64 * 1024;

/// Errors that can occur during packet capture operations.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Capture is not currently active when trying to stop.
    #[error("capture is not active")]
    NotActive,

    /// Capture is already active when trying to start.
    #[error("capture is already active")]
    AlreadyActive,

    /// Failed to acquire lock on internal state.
    #[error("failed to acquire lock: {0}")]
    LockError(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Output directory does not exist.
    #[error("output directory does not exist: {0}")]
    DirectoryNotFound(String),

    /// A recorded packet header claims an implausible length.
    #[error("corrupt packet record at offset {offset}: length {len}")]
    Corrupt {
        /// Byte offset of the record header
        offset: u64,
        /// Length the header claimed
        len: usize,
    },
}

/// Result type alias for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Metadata about the capture session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureMetadata {
    /// Bus device the packets came from.
    #[serde(default)]
    pub device: String,
    /// SPI clock rate in Hz.
    #[serde(default)]
    pub speed_hz: u32,
    /// Frame width in samples.
    pub width: usize,
    /// Frame height in lines.
    pub height: usize,
    /// Total number of packets captured.
    #[serde(default)]
    pub total_packets: u64,
    /// Number of those packets that were discard packets.
    #[serde(default)]
    pub discard_packets: u64,
    /// Total number of complete frames assembled while recording.
    #[serde(default)]
    pub total_frames: u64,
    /// Capture duration in milliseconds.
    #[serde(default)]
    pub duration_ms: u64,
    /// Total bytes captured.
    #[serde(default)]
    pub total_bytes: u64,
    /// Optional description or notes about the capture.
    #[serde(default)]
    pub description: String,
}

impl CaptureMetadata {
    /// Metadata for a capture of the given geometry
    pub fn for_geometry(geometry: FrameGeometry) -> Self {
        Self {
            width: geometry.width,
            height: geometry.height,
            ..Default::default()
        }
    }

    /// Frame geometry recorded in the metadata
    pub fn geometry(&self) -> FrameGeometry {
        FrameGeometry::new(self.width, self.height)
    }
}

/// Result returned when capture stops successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResult {
    /// Path to the saved packets file.
    pub packets_path: PathBuf,
    /// Path to the saved metadata file.
    pub metadata_path: PathBuf,
    /// Summary of the capture session.
    pub metadata: CaptureMetadata,
}

/// Thread-safe state for recording bus packets.
///
/// The capture thread records through a shared reference while the
/// controller starts and stops the session.
pub struct CaptureState {
    /// Whether capture is currently active.
    is_capturing: AtomicBool,
    /// Captured packet data.
    packets: Mutex<Vec<Vec<u8>>>,
    /// When the capture started.
    start_time: Mutex<Option<Instant>>,
    /// Metadata about the capture session.
    metadata: Mutex<CaptureMetadata>,
    packet_count: AtomicU64,
    discard_count: AtomicU64,
    byte_count: AtomicU64,
}

impl CaptureState {
    /// Creates a new capture state with no active capture.
    #[must_use]
    pub fn new() -> Self {
        Self {
            is_capturing: AtomicBool::new(false),
            packets: Mutex::new(Vec::new()),
            start_time: Mutex::new(None),
            metadata: Mutex::new(CaptureMetadata::default()),
            packet_count: AtomicU64::new(0),
            discard_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
        }
    }

    /// Returns whether capture is currently active.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.is_capturing.load(Ordering::Acquire)
    }

    /// Returns the current packet count.
    #[must_use]
    pub fn packet_count(&self) -> u64 {
        self.packet_count.load(Ordering::Relaxed)
    }

    /// Returns the number of discard packets recorded.
    #[must_use]
    pub fn discard_count(&self) -> u64 {
        self.discard_count.load(Ordering::Relaxed)
    }

    /// Returns the current byte count.
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.byte_count.load(Ordering::Relaxed)
    }

    /// Starts a new capture session.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::AlreadyActive` if a capture is already in progress.
    /// Returns `CaptureError::LockError` if the internal mutex is poisoned.
    pub fn start_capture(&self, metadata: CaptureMetadata) -> Result<()> {
        if self
            .is_capturing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::AlreadyActive);
        }

        self.packets
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?
            .clear();

        self.packet_count.store(0, Ordering::Release);
        self.discard_count.store(0, Ordering::Release);
        self.byte_count.store(0, Ordering::Release);

        *self
            .start_time
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))? = Some(Instant::now());
        *self
            .metadata
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))? = metadata;

        log::info!("Packet capture started");
        Ok(())
    }

    /// Records a packet. Ignored when no capture is active.
    pub fn record_packet(&self, packet: &[u8]) {
        if !self.is_capturing.load(Ordering::Acquire) {
            return;
        }

        self.packet_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count
            .fetch_add(packet.len() as u64, Ordering::Relaxed);
        // Height only matters for Line vs Invalid, so any value works here
        if classify(packet, usize::MAX) == PacketKind::Discard {
            self.discard_count.fetch_add(1, Ordering::Relaxed);
        }

        if let Ok(mut packets) = self.packets.lock() {
            packets.push(packet.to_vec());
        } else {
            log::warn!("Failed to acquire lock for packet recording");
        }
    }

    /// Increments the frame counter in metadata.
    pub fn record_frame(&self) {
        if !self.is_capturing.load(Ordering::Acquire) {
            return;
        }

        if let Ok(mut meta) = self.metadata.lock() {
            meta.total_frames += 1;
        }
    }

    /// Stops the capture and saves data to disk.
    ///
    /// # Errors
    ///
    /// Returns `CaptureError::NotActive` if no capture is in progress.
    /// Returns `CaptureError::DirectoryNotFound` if the output directory doesn't exist.
    /// Returns `CaptureError::Io` or `CaptureError::Json` if writing fails.
    pub fn stop_capture(&self, output_dir: &Path) -> Result<CaptureResult> {
        if self
            .is_capturing
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CaptureError::NotActive);
        }

        if !output_dir.is_dir() {
            return Err(CaptureError::DirectoryNotFound(
                output_dir.display().to_string(),
            ));
        }

        let duration_ms = self
            .start_time
            .lock()
            .map_err(|e| CaptureError::LockError(e.to_string()))?
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let metadata = {
            let mut meta = self
                .metadata
                .lock()
                .map_err(|e| CaptureError::LockError(e.to_string()))?;
            meta.duration_ms = duration_ms;
            meta.total_packets = self.packet_count.load(Ordering::Acquire);
            meta.discard_packets = self.discard_count.load(Ordering::Acquire);
            meta.total_bytes = self.byte_count.load(Ordering::Acquire);
            meta.clone()
        };

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);

        let packets_path = output_dir.join(format!("packets_{}.bin", timestamp));
        {
            let packets = self
                .packets
                .lock()
                .map_err(|e| CaptureError::LockError(e.to_string()))?;
            write_packets(&packets_path, &packets)?;
        }

        let metadata_path = output_dir.join(format!("metadata_{}.json", timestamp));
        write_metadata(&metadata_path, &metadata)?;

        log::info!(
            "Capture stopped: {} packets ({} discard), {} frames, {} ms",
            metadata.total_packets,
            metadata.discard_packets,
            metadata.total_frames,
            duration_ms
        );

        Ok(CaptureResult {
            packets_path,
            metadata_path,
            metadata,
        })
    }

    /// Cancels the current capture without saving.
    pub fn cancel_capture(&self) {
        self.is_capturing.store(false, Ordering::Release);
        if let Ok(mut packets) = self.packets.lock() {
            packets.clear();
        }
        log::info!("Capture cancelled");
    }
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport decorator that tees every received packet into a [`CaptureState`]
pub struct RecordingTransport<T> {
    inner: T,
    capture: Arc<CaptureState>,
}

impl<T: PacketTransport> RecordingTransport<T> {
    /// Wrap `inner`, recording into `capture` whenever it is active
    pub fn new(inner: T, capture: Arc<CaptureState>) -> Self {
        Self { inner, capture }
    }

    /// The shared capture state
    pub fn capture(&self) -> &Arc<CaptureState> {
        &self.capture
    }
}

impl<T: PacketTransport> PacketTransport for RecordingTransport<T> {
    fn transfer(&mut self, buf: &mut [u8]) -> transport::Result<()> {
        self.inner.transfer(buf)?;
        self.capture.record_packet(buf);
        Ok(())
    }
}

/// Writes packets in the `[u32 LE: length][bytes]` record format.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be written.
pub fn write_packets(path: &Path, packets: &[Vec<u8>]) -> Result<()> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);

    for packet in packets {
        let len = packet.len() as u32;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(packet)?;
    }

    file.flush()?;
    log::debug!("Saved {} packets to {}", packets.len(), path.display());
    Ok(())
}

/// Saves capture metadata as pretty-printed JSON.
///
/// # Errors
///
/// Returns `CaptureError::Json` or `CaptureError::Io` if saving fails.
pub fn write_metadata(path: &Path, metadata: &CaptureMetadata) -> Result<()> {
    let json = serde_json::to_string_pretty(metadata)?;
    std::fs::write(path, json)?;
    log::debug!("Saved metadata to {}", path.display());
    Ok(())
}

/// Reads packets from a binary capture file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read or ends mid-record.
/// Returns `CaptureError::Corrupt` if a record header has an implausible length.
pub fn read_packets(path: &Path) -> Result<Vec<Vec<u8>>> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
    let mut packets = Vec::new();
    let mut offset = 0u64;

    loop {
        let mut len_bytes = [0u8; 4];
        match file.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(CaptureError::Io(e)),
        }

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_PACKET_LEN {
            return Err(CaptureError::Corrupt { offset, len });
        }

        let mut packet = vec![0u8; len];
        file.read_exact(&mut packet)?;
        packets.push(packet);

        offset += 4 + len as u64;
    }

    Ok(packets)
}

/// Reads capture metadata from a JSON file.
///
/// # Errors
///
/// Returns `CaptureError::Io` if the file cannot be read.
/// Returns `CaptureError::Json` if the JSON is invalid.
pub fn read_metadata(path: &Path) -> Result<CaptureMetadata> {
    let json = std::fs::read_to_string(path)?;
    let metadata: CaptureMetadata = serde_json::from_str(&json)?;
    Ok(metadata)
}
