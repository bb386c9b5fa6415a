//! `vospi-scope` - VoSPI frame reader and live viewer for line-scanned thermal sensors
//!
//! The sensor streams fixed-size packets over SPI with no acknowledgement of link
//! quality, so the host infers lock purely from packet content. The pipeline:
//!
//! ```text
//! PacketTransport → Synchronizer → FrameAssembler → FrameQueue
//!                                                     │
//!                        sinks ◀── colorize ◀── AGC ◀─┘
//! ```
//!
//! [`controller::StreamController`] runs capture and consumption on two threads;
//! [`run_session`] wires a controller to a bus or a recorded capture.

pub mod agc;
pub mod capture;
pub mod colormap;
pub mod config;
pub mod controller;
pub mod frame_assembler;
pub mod frame_buffer;
pub mod packet;
pub mod replay;
pub mod sink;
pub mod snapshot;
pub mod synchronizer;
pub mod test_utils;
pub mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::{CaptureError, CaptureMetadata, CaptureState, RecordingTransport};
use crate::config::StreamConfig;
use crate::controller::{Command, ControllerError, RunOptions, RunSummary, StreamController};
use crate::replay::{ReplayConfig, ReplayError, ReplayTransport};
use crate::sink::{FrameSink, LogSink, SinkError, TcpSink};
use crate::transport::PacketTransport;

/// Build information stamped in by `build.rs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInfo {
    /// Crate version
    pub version: String,
    /// Short git commit hash
    pub git_hash: String,
    /// UTC build timestamp
    pub build_time: String,
}

/// Get build information (version, git hash, build time)
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("BUILD_GIT_HASH").to_string(),
        build_time: env!("BUILD_TIMESTAMP").to_string(),
    }
}

/// Errors that prevent a session from starting or finishing
#[derive(Error, Debug)]
pub enum SessionError {
    /// The bus could not be opened
    #[error("failed to open bus: {0}")]
    Bus(#[from] transport::TransportError),

    /// Hardware capture requested in a build without bus support
    #[error("built without the `spidev` feature; use --replay to stream a recording")]
    NoBusSupport,

    /// The replay file could not be loaded
    #[error(transparent)]
    Replay(#[from] ReplayError),

    /// Recording could not be started or saved
    #[error("recording failed: {0}")]
    Capture(#[from] CaptureError),

    /// A sink could not be created
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The stream itself failed
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

/// Where packets come from and where frames go for one session
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Replay this recording instead of opening the bus
    pub replay: Option<PathBuf>,
    /// Loop the replay instead of stopping at its end
    pub loop_replay: bool,
    /// Record raw packets and save them here when the session ends
    pub record_dir: Option<PathBuf>,
    /// Stream rendered frames to this TCP peer
    pub transmit: Option<SocketAddr>,
    /// Stop after presenting this many frames
    pub max_frames: Option<u64>,
}

/// Result of a finished session
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Controller summary
    pub summary: RunSummary,
    /// Where the packet recording was written, if recording
    pub recording: Option<capture::CaptureResult>,
}

/// Run one streaming session
///
/// Opens the packet source (bus or replay), optionally wraps it in a recorder,
/// builds the sinks and runs a [`StreamController`] until it stops.
///
/// # Errors
///
/// Returns a [`SessionError`] if the record directory does not exist, the source
/// or a sink cannot be opened, the recording cannot be saved, or the transport
/// fails mid-stream. A stream failure takes precedence over a failed save.
pub fn run_session(
    config: &StreamConfig,
    options: &SessionOptions,
    commands: Receiver<Command>,
    shutdown: Arc<AtomicBool>,
) -> Result<SessionReport, SessionError> {
    // Fail before streaming rather than losing the whole recording at the end
    if let Some(dir) = &options.record_dir {
        if !dir.is_dir() {
            return Err(CaptureError::DirectoryNotFound(dir.display().to_string()).into());
        }
    }

    let source = open_source(config, options)?;

    let mut sinks: Vec<Box<dyn FrameSink>> = vec![Box::new(LogSink::new("log"))];
    if let Some(addr) = options.transmit {
        sinks.push(Box::new(TcpSink::connect("transmit", addr)?));
    }

    let mut controller = StreamController::new(config.clone()).with_shutdown(shutdown);
    let run_options = RunOptions {
        max_frames: options.max_frames,
    };

    let Some(dir) = &options.record_dir else {
        let summary = controller.run(source, sinks, commands, run_options)?;
        return Ok(SessionReport {
            summary,
            recording: None,
        });
    };

    let recorder = Arc::new(CaptureState::new());
    let mut metadata = CaptureMetadata::for_geometry(config.geometry);
    metadata.device = match &options.replay {
        Some(path) => path.display().to_string(),
        None => config.spi.device.clone(),
    };
    metadata.speed_hz = config.spi.speed_hz;
    recorder.start_capture(metadata)?;
    controller = controller.with_recorder(Arc::clone(&recorder));

    let transport = RecordingTransport::new(source, Arc::clone(&recorder));
    let outcome = controller.run(transport, sinks, commands, run_options);

    // Save whatever was captured, even if the stream failed
    let saved = recorder.stop_capture(dir);
    let summary = match outcome {
        Ok(summary) => summary,
        Err(e) => {
            match &saved {
                Ok(recording) => log::info!(
                    "Recording saved to {} before failure",
                    recording.packets_path.display()
                ),
                Err(save_err) => log::error!("Failed to save recording: {}", save_err),
            }
            return Err(e.into());
        }
    };
    Ok(SessionReport {
        summary,
        recording: Some(saved?),
    })
}

fn open_source(
    config: &StreamConfig,
    options: &SessionOptions,
) -> Result<Box<dyn PacketTransport + Send>, SessionError> {
    if let Some(path) = &options.replay {
        let replay_config = ReplayConfig {
            loop_playback: options.loop_replay,
            ..Default::default()
        };
        let replay = ReplayTransport::load(path, replay_config)?;
        if let Some(meta) = replay.metadata() {
            if meta.geometry() != config.geometry {
                log::warn!(
                    "Recording is {}x{} but configured geometry is {}x{}",
                    meta.width,
                    meta.height,
                    config.geometry.width,
                    config.geometry.height
                );
            }
        }
        return Ok(Box::new(replay));
    }

    open_bus(config)
}

#[cfg(all(feature = "spidev", target_os = "linux"))]
fn open_bus(config: &StreamConfig) -> Result<Box<dyn PacketTransport + Send>, SessionError> {
    Ok(Box::new(transport::open_spidev(&config.spi)?))
}

#[cfg(not(all(feature = "spidev", target_os = "linux")))]
fn open_bus(_config: &StreamConfig) -> Result<Box<dyn PacketTransport + Send>, SessionError> {
    Err(SessionError::NoBusSupport)
}
