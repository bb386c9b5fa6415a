//! Stream controller: capture and consumption as two independently paced threads
//!
//! ```text
//!  capture thread (owns the bus)            consumer thread
//! ┌──────────────────────────────┐       ┌──────────────────────────────────┐
//! │ read_frame ──▶ try_enqueue ──┼──▶ FrameQueue ──▶ try_dequeue ──▶ AGC    │
//! │     │ error                  │       │     ──▶ colorize ──▶ sinks       │
//! │     ▼                        │       │ commands (mpsc) ◀── stdin, API   │
//! │ resync counter ─▶ backoff    │       │ pacing sleep                     │
//! └──────────────────────────────┘       └──────────────────────────────────┘
//! ```
//!
//! The only state both threads touch is the [`FrameQueue`], the [`CaptureStats`]
//! counters and the shutdown flag.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::agc::AgcNormalizer;
use crate::capture::CaptureState;
use crate::colormap::Palette;
use crate::config::StreamConfig;
use crate::frame_assembler::{Frame, FrameAssembler, FrameError};
use crate::frame_buffer::FrameQueue;
use crate::sink::{FrameSink, RenderedFrame};
use crate::snapshot::save_snapshot;
use crate::transport::{PacketTransport, TransportError};

/// Errors that end a streaming session
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The transport failed and capture could not continue
    #[error("capture stopped: {0}")]
    Transport(#[from] TransportError),

    /// The capture thread could not be started
    #[error("failed to spawn capture thread: {0}")]
    Spawn(std::io::Error),

    /// The capture thread panicked
    #[error("capture thread panicked")]
    CapturePanicked,
}

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// User commands routed to the consumer thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Stop both activities
    Quit,
    /// Save the most recently presented frame as a snapshot
    SaveFrame,
    /// Switch to the next palette
    CyclePalette,
}

impl Command {
    /// Parse one line of interactive input
    pub fn from_input(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "q" | "quit" | "exit" => Some(Command::Quit),
            "s" | "save" => Some(Command::SaveFrame),
            "c" | "palette" => Some(Command::CyclePalette),
            _ => None,
        }
    }
}

/// Link state as seen by the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkStatus {
    /// No frame yet, or lock recently lost
    #[default]
    Searching,
    /// Frames are arriving
    Streaming,
    /// Repeated backoffs without a single good frame
    NoSignal,
}

impl LinkStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkStatus::Streaming,
            2 => LinkStatus::NoSignal,
            _ => LinkStatus::Searching,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LinkStatus::Searching => 0,
            LinkStatus::Streaming => 1,
            LinkStatus::NoSignal => 2,
        }
    }
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LinkStatus::Searching => "searching",
            LinkStatus::Streaming => "streaming",
            LinkStatus::NoSignal => "no signal",
        })
    }
}

/// Counters written by the capture thread and read by anyone
#[derive(Debug, Default)]
pub struct CaptureStats {
    frames_captured: AtomicU64,
    lost_sync: AtomicU64,
    out_of_order: AtomicU64,
    checksum_errors: AtomicU64,
    link_idle: AtomicU64,
    no_frame_start: AtomicU64,
    backoffs: AtomicU64,
    status: AtomicU8,
}

/// Point-in-time copy of [`CaptureStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    /// Complete frames read off the bus
    pub frames_captured: u64,
    /// Frames abandoned on a mid-frame discard
    pub lost_sync: u64,
    /// Frames abandoned on an out-of-sequence line
    pub out_of_order: u64,
    /// Frames abandoned on a CRC mismatch
    pub checksum_errors: u64,
    /// Discard runs that exceeded the ceiling
    pub link_idle: u64,
    /// Sync attempts that ran out of packet budget
    pub no_frame_start: u64,
    /// Idle-backoffs performed
    pub backoffs: u64,
    /// Current link status
    pub status: LinkStatus,
}

impl CaptureStats {
    /// Current link status
    pub fn status(&self) -> LinkStatus {
        LinkStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: LinkStatus) {
        self.status.store(status.as_u8(), Ordering::Release);
    }

    /// Complete frames captured so far
    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    /// Copy every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            lost_sync: self.lost_sync.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
            link_idle: self.link_idle.load(Ordering::Relaxed),
            no_frame_start: self.no_frame_start.load(Ordering::Relaxed),
            backoffs: self.backoffs.load(Ordering::Relaxed),
            status: self.status(),
        }
    }

    fn record_error(&self, err: &FrameError) {
        let counter = match err {
            FrameError::LostSync { .. } => &self.lost_sync,
            FrameError::OutOfOrder { .. } => &self.out_of_order,
            FrameError::Checksum { .. } => &self.checksum_errors,
            FrameError::LinkIdle { .. } => &self.link_idle,
            FrameError::NoFrameStart { .. } => &self.no_frame_start,
            FrameError::Transport(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-run options that are not part of the persistent configuration
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop after presenting this many frames
    pub max_frames: Option<u64>,
}

/// What a finished session did
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Final capture counters
    pub stats: StatsSnapshot,
    /// Frames handed to the sinks
    pub frames_presented: u64,
    /// Frames lost to buffer overflow
    pub frames_dropped: u64,
    /// Snapshots written during the session
    pub snapshots: Vec<PathBuf>,
    /// Whether capture ended because a finite packet source ran out
    pub source_exhausted: bool,
}

/// Owns the shared hand-off state and runs a streaming session
pub struct StreamController {
    config: StreamConfig,
    queue: Arc<FrameQueue>,
    stats: Arc<CaptureStats>,
    shutdown: Arc<AtomicBool>,
    recorder: Option<Arc<CaptureState>>,
}

impl StreamController {
    /// Create a controller for a session
    pub fn new(config: StreamConfig) -> Self {
        let queue = FrameQueue::new(config.controller.queue_capacity, config.controller.overflow);
        Self {
            config,
            queue: Arc::new(queue),
            stats: Arc::new(CaptureStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            recorder: None,
        }
    }

    /// Use an externally owned shutdown flag (e.g. one set from a signal handler)
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Count assembled frames into a packet recording
    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<CaptureState>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Process-wide shutdown flag; setting it stops both threads
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Shared capture counters
    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    /// The hand-off queue
    pub fn queue(&self) -> Arc<FrameQueue> {
        Arc::clone(&self.queue)
    }

    /// Run a session until quit, shutdown, `max_frames`, or the transport ends
    ///
    /// A controller runs one session; the shutdown flag stays set afterwards.
    /// Capture runs on a scoped thread that takes ownership of `transport`; the
    /// consumer runs on the calling thread and drives `sinks`.
    ///
    /// # Errors
    ///
    /// Returns `ControllerError::Transport` if the bus failed (running out of a
    /// finite source is not an error), or `Spawn`/`CapturePanicked` if the capture
    /// thread could not run to completion.
    pub fn run<T>(
        &self,
        transport: T,
        mut sinks: Vec<Box<dyn FrameSink>>,
        commands: Receiver<Command>,
        options: RunOptions,
    ) -> Result<RunSummary>
    where
        T: PacketTransport + Send,
    {
        self.stats.set_status(LinkStatus::Searching);
        let capture_done = AtomicBool::new(false);

        let (capture_result, consumer) = thread::scope(|scope| {
            let capture = thread::Builder::new()
                .name("vospi-capture".to_string())
                .spawn_scoped(scope, || {
                    // Set on unwind too, so a panicking capture releases the consumer
                    let _done = DoneOnDrop(&capture_done);
                    self.capture_loop(transport)
                })
                .map_err(ControllerError::Spawn)?;

            let mut consumer = Consumer::new(&self.config, options);
            consumer.run(self, &mut sinks, &commands, &capture_done);
            // Capture may still be running after quit or max_frames
            self.shutdown.store(true, Ordering::Release);

            let result = capture.join().map_err(|_| ControllerError::CapturePanicked)?;
            Ok::<_, ControllerError>((result, consumer))
        })?;

        for sink in sinks.iter_mut() {
            if let Err(e) = sink.flush() {
                log::warn!("Failed to flush sink {}: {}", sink.name(), e);
            }
        }

        let source_exhausted = match capture_result {
            Ok(()) => false,
            Err(TransportError::Exhausted) => true,
            Err(e) => return Err(ControllerError::Transport(e)),
        };

        Ok(RunSummary {
            stats: self.stats.snapshot(),
            frames_presented: consumer.presented,
            frames_dropped: self.queue.dropped(),
            snapshots: consumer.snapshots,
            source_exhausted,
        })
    }

    /// Capture activity: the only code that touches the transport
    fn capture_loop<T: PacketTransport>(
        &self,
        mut transport: T,
    ) -> std::result::Result<(), TransportError> {
        let config = &self.config;
        let mut assembler = FrameAssembler::new(config.geometry, config.sync.clone());
        let mut consecutive_backoffs = 0u32;

        // The sensor needs the bus idle before it will sync the first time
        self.idle(Duration::from_millis(config.controller.startup_idle_ms));

        while !self.shutdown.load(Ordering::Acquire) {
            match assembler.read_frame(&mut transport) {
                Ok(frame) => {
                    assembler.synchronizer_mut().record_success();
                    consecutive_backoffs = 0;
                    self.stats.frames_captured.fetch_add(1, Ordering::Relaxed);
                    if self.stats.status() != LinkStatus::Streaming {
                        log::info!("Streaming");
                        self.stats.set_status(LinkStatus::Streaming);
                    }
                    if let Some(recorder) = &self.recorder {
                        recorder.record_frame();
                    }
                    if !self.queue.try_enqueue(frame) {
                        log::trace!("Consumer behind, frame dropped");
                    }
                }
                Err(FrameError::Transport(e)) => {
                    if matches!(e, TransportError::Exhausted) {
                        log::info!("Packet source exhausted");
                    } else {
                        log::error!("Transport failed: {}", e);
                    }
                    return Err(e);
                }
                Err(e) => {
                    self.stats.record_error(&e);
                    let failed_out = assembler.synchronizer_mut().record_failure();
                    if !failed_out && !matches!(e, FrameError::LinkIdle { .. }) {
                        continue;
                    }

                    consecutive_backoffs += 1;
                    self.stats.backoffs.fetch_add(1, Ordering::Relaxed);
                    if consecutive_backoffs >= config.controller.no_signal_after {
                        if self.stats.status() != LinkStatus::NoSignal {
                            log::warn!("No signal after {} resync attempts", consecutive_backoffs);
                            self.stats.set_status(LinkStatus::NoSignal);
                        }
                    } else if self.stats.status() == LinkStatus::Streaming {
                        self.stats.set_status(LinkStatus::Searching);
                    }

                    let backoff = assembler.synchronizer_mut().begin_backoff();
                    log::warn!("Resync ({}): idling bus for {} ms", e, backoff.as_millis());
                    self.idle(backoff);
                }
            }
        }

        Ok(())
    }

    /// Sleep with the bus idle, waking early on shutdown
    fn idle(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let step = Duration::from_millis(10);
        while !self.shutdown.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(step.min(deadline - now));
        }
    }
}

/// Raises a flag when dropped
struct DoneOnDrop<'a>(&'a AtomicBool);

impl Drop for DoneOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Consumption activity state, owned by the consumer thread
struct Consumer {
    agc: AgcNormalizer,
    palette: Palette,
    frame_budget: Duration,
    idle_poll: Duration,
    status_interval: Duration,
    snapshot_dir: PathBuf,
    max_frames: Option<u64>,
    last_frame: Option<Frame>,
    last_status: Option<LinkStatus>,
    presented: u64,
    snapshots: Vec<PathBuf>,
    interval_start: Instant,
    interval_frames: u64,
}

impl Consumer {
    fn new(config: &StreamConfig, options: RunOptions) -> Self {
        Self {
            agc: AgcNormalizer::new(&config.agc),
            palette: config.initial_palette,
            frame_budget: config.controller.frame_budget(),
            idle_poll: config.controller.idle_poll(),
            status_interval: config.controller.status_interval(),
            snapshot_dir: config.snapshot_dir.clone(),
            max_frames: options.max_frames,
            last_frame: None,
            last_status: None,
            presented: 0,
            snapshots: Vec::new(),
            interval_start: Instant::now(),
            interval_frames: 0,
        }
    }

    fn run(
        &mut self,
        controller: &StreamController,
        sinks: &mut [Box<dyn FrameSink>],
        commands: &Receiver<Command>,
        capture_done: &AtomicBool,
    ) {
        while !controller.shutdown.load(Ordering::Acquire) {
            if !self.drain_commands(commands) {
                log::info!("Quit requested");
                break;
            }

            self.publish_status(controller.stats.status(), sinks);
            self.log_interval(controller);

            let Some(frame) = controller.queue.try_dequeue() else {
                if capture_done.load(Ordering::Acquire) && controller.queue.is_empty() {
                    break;
                }
                thread::sleep(self.idle_poll);
                continue;
            };

            let started = Instant::now();
            self.present(frame, sinks);

            if self.max_frames.is_some_and(|max| self.presented >= max) {
                log::info!("Presented {} frames, stopping", self.presented);
                break;
            }

            let elapsed = started.elapsed();
            if elapsed < self.frame_budget {
                thread::sleep(self.frame_budget - elapsed);
            }
        }

        // Commands that arrived together with the final frame still take effect
        self.drain_commands(commands);
    }

    /// Apply every pending command in arrival order; `false` on quit
    fn drain_commands(&mut self, commands: &Receiver<Command>) -> bool {
        loop {
            match commands.try_recv() {
                Ok(Command::Quit) => return false,
                Ok(Command::SaveFrame) => self.save_frame(),
                Ok(Command::CyclePalette) => {
                    self.palette = self.palette.next();
                    log::info!("Palette: {}", self.palette);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    fn save_frame(&mut self) {
        let Some(frame) = &self.last_frame else {
            log::warn!("No frame to save yet");
            return;
        };
        match save_snapshot(frame, &self.snapshot_dir) {
            Ok(path) => self.snapshots.push(path),
            Err(e) => log::error!("Failed to save snapshot: {}", e),
        }
    }

    fn present(&mut self, frame: Frame, sinks: &mut [Box<dyn FrameSink>]) {
        let normalized = self.agc.update_and_map(&frame);
        let rendered = RenderedFrame::render(&normalized, self.palette, frame.sequence());

        for sink in sinks.iter_mut() {
            if let Err(e) = sink.present(&rendered) {
                log::warn!("Sink {} failed: {}", sink.name(), e);
            }
        }

        self.last_frame = Some(frame);
        self.presented += 1;
        self.interval_frames += 1;
    }

    fn publish_status(&mut self, status: LinkStatus, sinks: &mut [Box<dyn FrameSink>]) {
        if self.last_status == Some(status) {
            return;
        }
        self.last_status = Some(status);
        for sink in sinks.iter_mut() {
            if let Err(e) = sink.status_changed(status) {
                log::warn!("Sink {} rejected status: {}", sink.name(), e);
            }
        }
    }

    fn log_interval(&mut self, controller: &StreamController) {
        let elapsed = self.interval_start.elapsed();
        if elapsed < self.status_interval {
            return;
        }

        let fps = self.interval_frames as f64 / elapsed.as_secs_f64();
        let (min, max) = self.agc.bounds();
        let stats = controller.stats.snapshot();
        log::info!(
            "{:.1} fps | {} | range {}..{} | {} | captured {} dropped {}",
            fps,
            self.palette,
            min,
            max,
            stats.status,
            stats.frames_captured,
            controller.queue.dropped()
        );

        self.interval_start = Instant::now();
        self.interval_frames = 0;
    }
}
