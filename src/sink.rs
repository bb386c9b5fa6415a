//! Display and transmit sinks
//!
//! The consumer thread hands every rendered frame to each configured [`FrameSink`].
//! Sinks run on the consumer thread only, so a slow sink delays presentation but
//! never the bus.

use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::agc::NormalizedFrame;
use crate::colormap::{colorize, Palette, Rgb};
use crate::controller::LinkStatus;

/// Magic bytes opening every transmitted frame
pub const WIRE_MAGIC: [u8; 4] = *b"VSPI";

/// Bytes of wire header following the length prefix
pub const WIRE_HEADER_SIZE: usize = 4 + 2 + 2 + 2 + 2 + 1 + 1 + 8;

/// Errors raised by sinks
#[derive(Error, Debug)]
pub enum SinkError {
    /// Writing to the sink failed
    #[error("sink {sink} I/O error: {source}")]
    Io {
        /// Sink name
        sink: String,
        /// Underlying error
        source: std::io::Error,
    },

    /// The sink is not connected and could not reconnect
    #[error("sink {0} is disconnected")]
    Disconnected(String),

    /// The frame cannot be encoded for this sink
    #[error("frame too large to encode: {0}x{1}")]
    FrameTooLarge(usize, usize),
}

/// Result type alias for sink operations.
pub type Result<T> = std::result::Result<T, SinkError>;

/// A colourised frame ready for presentation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFrame {
    /// Pixels per row
    pub width: usize,
    /// Number of rows
    pub height: usize,
    /// One colour per pixel, row-major
    pub pixels: Vec<Rgb>,
    /// AGC lower bound the frame was mapped with
    pub min: u16,
    /// AGC upper bound the frame was mapped with
    pub max: u16,
    /// Palette the frame was rendered with
    pub palette: Palette,
    /// Capture sequence number of the source frame
    pub sequence: u64,
}

impl RenderedFrame {
    /// Colourise a normalized frame
    pub fn render(normalized: &NormalizedFrame, palette: Palette, sequence: u64) -> Self {
        Self {
            width: normalized.width,
            height: normalized.height,
            pixels: normalized
                .indices
                .iter()
                .map(|&index| colorize(index, palette))
                .collect(),
            min: normalized.min,
            max: normalized.max,
            palette,
            sequence,
        }
    }

    /// Pixel at (row, col), if in bounds
    pub fn pixel(&self, row: usize, col: usize) -> Option<Rgb> {
        if row >= self.height || col >= self.width {
            return None;
        }
        self.pixels.get(row * self.width + col).copied()
    }

    /// Nearest-neighbour upscale by an integer factor
    #[must_use]
    pub fn upscale(&self, factor: usize) -> Self {
        let factor = factor.max(1);
        let width = self.width * factor;
        let height = self.height * factor;

        let mut pixels = Vec::with_capacity(width * height);
        for y in 0..height {
            let src_row = &self.pixels[(y / factor) * self.width..][..self.width];
            for x in 0..width {
                pixels.push(src_row[x / factor]);
            }
        }

        Self {
            width,
            height,
            pixels,
            ..self.clone()
        }
    }

    /// Packed `RGBRGB...` bytes
    pub fn to_rgb_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|p| p.to_array()).collect()
    }
}

/// Output for rendered frames
pub trait FrameSink: Send {
    /// Sink name, used in logs
    fn name(&self) -> &str;

    /// Present one rendered frame
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if the frame could not be delivered.
    fn present(&mut self, frame: &RenderedFrame) -> Result<()>;

    /// Called whenever the link status changes
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if the status could not be delivered.
    fn status_changed(&mut self, _status: LinkStatus) -> Result<()> {
        Ok(())
    }

    /// Flush buffered output, if any
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if flushing fails.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: FrameSink + ?Sized> FrameSink for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn present(&mut self, frame: &RenderedFrame) -> Result<()> {
        (**self).present(frame)
    }

    fn status_changed(&mut self, status: LinkStatus) -> Result<()> {
        (**self).status_changed(status)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Sink that logs a one-line summary per frame
#[derive(Debug)]
pub struct LogSink {
    name: String,
    presented: u64,
}

impl LogSink {
    /// Create a new log sink
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            presented: 0,
        }
    }

    /// Frames presented so far
    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl FrameSink for LogSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn present(&mut self, frame: &RenderedFrame) -> Result<()> {
        self.presented += 1;
        log::debug!(
            "[{}] frame #{} {}x{} palette={} range={}..{}",
            self.name,
            frame.sequence,
            frame.width,
            frame.height,
            frame.palette,
            frame.min,
            frame.max
        );
        Ok(())
    }

    fn status_changed(&mut self, status: LinkStatus) -> Result<()> {
        match status {
            LinkStatus::NoSignal => log::warn!("[{}] no signal", self.name),
            other => log::info!("[{}] link {}", self.name, other),
        }
        Ok(())
    }
}

/// Sink that streams frames to a TCP peer
///
/// Each frame is sent as `[u32 LE: length][header][RGB bytes]` where the header is
/// `magic(4) width(2) height(2) min(2) max(2) palette(1) status(1) sequence(8)`,
/// all little-endian. A dropped connection is retried at most once per
/// `reconnect_interval`; frames presented while disconnected are skipped.
#[derive(Debug)]
pub struct TcpSink {
    name: String,
    addr: SocketAddr,
    stream: Option<TcpStream>,
    status: LinkStatus,
    reconnect_interval: Duration,
    last_attempt: Option<Instant>,
    sent: u64,
}

impl TcpSink {
    /// Connect to `addr`
    ///
    /// # Errors
    ///
    /// Returns `SinkError::Io` if the initial connection fails.
    pub fn connect(name: impl Into<String>, addr: SocketAddr) -> Result<Self> {
        let name = name.into();
        let stream = open_stream(addr).map_err(|source| SinkError::Io {
            sink: name.clone(),
            source,
        })?;
        log::info!("[{}] connected to {}", name, addr);

        Ok(Self {
            name,
            addr,
            stream: Some(stream),
            status: LinkStatus::Searching,
            reconnect_interval: Duration::from_secs(1),
            last_attempt: None,
            sent: 0,
        })
    }

    /// Frames delivered so far
    pub fn sent(&self) -> u64 {
        self.sent
    }

    fn ensure_connected(&mut self) -> Result<&mut TcpStream> {
        if self.stream.is_none() {
            let due = self
                .last_attempt
                .map_or(true, |t| t.elapsed() >= self.reconnect_interval);
            if !due {
                return Err(SinkError::Disconnected(self.name.clone()));
            }
            self.last_attempt = Some(Instant::now());
            match open_stream(self.addr) {
                Ok(stream) => {
                    log::info!("[{}] reconnected to {}", self.name, self.addr);
                    self.stream = Some(stream);
                }
                Err(e) => {
                    log::debug!("[{}] reconnect failed: {}", self.name, e);
                    return Err(SinkError::Disconnected(self.name.clone()));
                }
            }
        }
        self.stream
            .as_mut()
            .ok_or_else(|| SinkError::Disconnected(self.name.clone()))
    }
}

impl FrameSink for TcpSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn present(&mut self, frame: &RenderedFrame) -> Result<()> {
        let message = encode_frame(frame, self.status)?;
        let stream = self.ensure_connected()?;

        if let Err(source) = stream.write_all(&message) {
            log::warn!("[{}] send failed, dropping connection: {}", self.name, source);
            self.stream = None;
            self.last_attempt = Some(Instant::now());
            return Err(SinkError::Io {
                sink: self.name.clone(),
                source,
            });
        }
        self.sent += 1;
        Ok(())
    }

    fn status_changed(&mut self, status: LinkStatus) -> Result<()> {
        self.status = status;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream.flush().map_err(|source| SinkError::Io {
                sink: self.name.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

fn open_stream(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(&addr, Duration::from_secs(2))?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(Duration::from_millis(500)))?;
    Ok(stream)
}

/// Encode a frame in the length-prefixed wire format used by [`TcpSink`]
///
/// # Errors
///
/// Returns `SinkError::FrameTooLarge` if a dimension exceeds `u16`.
pub fn encode_frame(frame: &RenderedFrame, status: LinkStatus) -> Result<Vec<u8>> {
    let too_large = || SinkError::FrameTooLarge(frame.width, frame.height);
    let width = u16::try_from(frame.width).map_err(|_| too_large())?;
    let height = u16::try_from(frame.height).map_err(|_| too_large())?;
    let body_len = WIRE_HEADER_SIZE + frame.pixels.len() * 3;
    let len = u32::try_from(body_len).map_err(|_| too_large())?;

    let mut message = Vec::with_capacity(4 + body_len);
    message.extend_from_slice(&len.to_le_bytes());
    message.extend_from_slice(&WIRE_MAGIC);
    message.extend_from_slice(&width.to_le_bytes());
    message.extend_from_slice(&height.to_le_bytes());
    message.extend_from_slice(&frame.min.to_le_bytes());
    message.extend_from_slice(&frame.max.to_le_bytes());
    message.push(palette_code(frame.palette));
    message.push(status_code(status));
    message.extend_from_slice(&frame.sequence.to_le_bytes());
    message.extend(frame.pixels.iter().flat_map(|p| p.to_array()));
    Ok(message)
}

fn palette_code(palette: Palette) -> u8 {
    match palette {
        Palette::Iron => 0,
        Palette::Rainbow => 1,
        Palette::Grayscale => 2,
    }
}

fn status_code(status: LinkStatus) -> u8 {
    match status {
        LinkStatus::Searching => 0,
        LinkStatus::Streaming => 1,
        LinkStatus::NoSignal => 2,
    }
}

/// Sink that keeps everything it is given, for tests and embedding
///
/// Clones share the same storage, so keep one clone to inspect what a boxed
/// sink received.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    frames: Arc<Mutex<Vec<RenderedFrame>>>,
    statuses: Arc<Mutex<Vec<LinkStatus>>>,
}

impl MemorySink {
    /// Create an empty memory sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames presented so far
    pub fn frames(&self) -> Vec<RenderedFrame> {
        self.frames
            .lock()
            .map(|f| f.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Number of frames presented
    pub fn frame_count(&self) -> usize {
        self.frames
            .lock()
            .map(|f| f.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    /// Status changes observed so far, in order
    pub fn statuses(&self) -> Vec<LinkStatus> {
        self.statuses
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl FrameSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn present(&mut self, frame: &RenderedFrame) -> Result<()> {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(frame.clone());
        Ok(())
    }

    fn status_changed(&mut self, status: LinkStatus) -> Result<()> {
        self.statuses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(status);
        Ok(())
    }
}
