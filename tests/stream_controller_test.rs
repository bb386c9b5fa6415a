//! Integration tests for the two-thread stream controller.
//!
//! Commands are injected from inside a sink's `present` so they arrive at a known
//! point in the stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;

use vospi_scope_lib::capture::{CaptureMetadata, CaptureState, RecordingTransport};
use vospi_scope_lib::colormap::Palette;
use vospi_scope_lib::config::StreamConfig;
use vospi_scope_lib::controller::{Command, RunOptions, StreamController};
use vospi_scope_lib::replay::{ReplayConfig, ReplayTransport};
use vospi_scope_lib::sink::{self, FrameSink, MemorySink, RenderedFrame};
use vospi_scope_lib::test_utils::PacketGenerator;

fn fast_config() -> StreamConfig {
    let mut config = StreamConfig::default();
    config.controller.target_fps = 1000;
    config.controller.startup_idle_ms = 0;
    config.controller.queue_capacity = 64;
    config.sync.backoff_ms = 1;
    config
}

/// Sends `command` once, after presenting frame number `after`
struct CommandingSink {
    commands: Sender<Command>,
    command: Command,
    after: u64,
    seen: u64,
}

impl FrameSink for CommandingSink {
    fn name(&self) -> &str {
        "commanding"
    }

    fn present(&mut self, _frame: &RenderedFrame) -> sink::Result<()> {
        self.seen += 1;
        if self.seen == self.after {
            let _ = self.commands.send(self.command);
        }
        Ok(())
    }
}

/// Raises a shutdown flag after `after` frames
struct StoppingSink {
    shutdown: Arc<AtomicBool>,
    after: u64,
    seen: u64,
}

impl FrameSink for StoppingSink {
    fn name(&self) -> &str {
        "stopping"
    }

    fn present(&mut self, _frame: &RenderedFrame) -> sink::Result<()> {
        self.seen += 1;
        if self.seen >= self.after {
            self.shutdown.store(true, Ordering::Release);
        }
        Ok(())
    }
}

#[test]
fn test_replay_presents_every_frame() {
    let gen = PacketGenerator::default();
    let transport = ReplayTransport::new(gen.stream(5, 3));
    let memory = MemorySink::new();
    let (_tx, rx) = mpsc::channel();

    let controller = StreamController::new(fast_config());
    let summary = controller
        .run(transport, vec![Box::new(memory.clone())], rx, RunOptions::default())
        .unwrap();

    assert!(summary.source_exhausted);
    assert_eq!(summary.frames_presented, 5);
    assert_eq!(summary.stats.frames_captured, 5);
    let frames = memory.frames();
    assert_eq!(frames.len(), 5);
    assert!(frames.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert!(frames.iter().all(|f| f.palette == Palette::Iron));
}

#[test]
fn test_save_frame_writes_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.snapshot_dir = dir.path().to_path_buf();

    let gen = PacketGenerator::default();
    let transport = ReplayTransport::new(gen.stream(2, 0));
    let (tx, rx) = mpsc::channel();
    let commanding = CommandingSink {
        commands: tx,
        command: Command::SaveFrame,
        after: 1,
        seen: 0,
    };

    let summary = StreamController::new(config)
        .run(transport, vec![Box::new(commanding)], rx, RunOptions::default())
        .unwrap();

    assert_eq!(summary.snapshots.len(), 1);
    let path = &summary.snapshots[0];
    assert_eq!(path.file_name().unwrap(), "STREAM_0000.pgm");

    // Gradient frame: offsets run 0..=4799
    let text = std::fs::read_to_string(path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("P2"));
    assert_eq!(lines.next(), Some("80 60"));
    assert_eq!(lines.next(), Some("4799"));
    assert_eq!(lines.count(), 60);
}

#[test]
fn test_cycle_palette_applies_to_later_frames() {
    let gen = PacketGenerator::default();
    let transport = ReplayTransport::new(gen.stream(4, 1));
    let memory = MemorySink::new();
    let (tx, rx) = mpsc::channel();
    let commanding = CommandingSink {
        commands: tx,
        command: Command::CyclePalette,
        after: 1,
        seen: 0,
    };

    StreamController::new(fast_config())
        .run(
            transport,
            vec![Box::new(commanding), Box::new(memory.clone())],
            rx,
            RunOptions::default(),
        )
        .unwrap();

    let palettes: Vec<Palette> = memory.frames().iter().map(|f| f.palette).collect();
    assert_eq!(
        palettes,
        vec![
            Palette::Iron,
            Palette::Rainbow,
            Palette::Rainbow,
            Palette::Rainbow
        ]
    );
}

#[test]
fn test_quit_command_stops_looping_replay() {
    let gen = PacketGenerator::default();
    let transport = ReplayTransport::with_config(
        gen.stream(1, 2),
        ReplayConfig {
            loop_playback: true,
            ..Default::default()
        },
    );
    let (tx, rx) = mpsc::channel();
    let commanding = CommandingSink {
        commands: tx,
        command: Command::Quit,
        after: 3,
        seen: 0,
    };

    let summary = StreamController::new(fast_config())
        .run(transport, vec![Box::new(commanding)], rx, RunOptions::default())
        .unwrap();

    assert!(!summary.source_exhausted);
    assert_eq!(summary.frames_presented, 3);
}

#[test]
fn test_external_shutdown_flag() {
    let gen = PacketGenerator::default();
    let transport = ReplayTransport::with_config(
        gen.stream(1, 0),
        ReplayConfig {
            loop_playback: true,
            ..Default::default()
        },
    );
    let shutdown = Arc::new(AtomicBool::new(false));
    let stopping = StoppingSink {
        shutdown: Arc::clone(&shutdown),
        after: 2,
        seen: 0,
    };
    let (_tx, rx) = mpsc::channel();

    let controller = StreamController::new(fast_config()).with_shutdown(Arc::clone(&shutdown));
    let summary = controller
        .run(transport, vec![Box::new(stopping)], rx, RunOptions::default())
        .unwrap();

    assert!(shutdown.load(Ordering::Acquire));
    assert!(!summary.source_exhausted);
    assert_eq!(summary.frames_presented, 2);
}

#[test]
fn test_recording_replays_identically() {
    let dir = tempfile::tempdir().unwrap();
    let gen = PacketGenerator::default();
    let source = ReplayTransport::new(gen.stream(3, 4));

    let recorder = Arc::new(CaptureState::new());
    let mut metadata = CaptureMetadata::for_geometry(gen.geometry());
    metadata.device = "synthetic".to_string();
    recorder.start_capture(metadata).unwrap();

    let first = MemorySink::new();
    let (_tx, rx) = mpsc::channel();
    let summary = StreamController::new(fast_config())
        .with_recorder(Arc::clone(&recorder))
        .run(
            RecordingTransport::new(source, Arc::clone(&recorder)),
            vec![Box::new(first.clone())],
            rx,
            RunOptions::default(),
        )
        .unwrap();
    assert_eq!(summary.frames_presented, 3);

    let recording = recorder.stop_capture(dir.path()).unwrap();
    assert_eq!(recording.metadata.total_frames, 3);
    assert_eq!(recording.metadata.total_packets, 3 * (4 + 60));
    assert_eq!(recording.metadata.discard_packets, 3 * 4);

    let replay = ReplayTransport::load(&recording.packets_path, ReplayConfig::default()).unwrap();
    assert_eq!(replay.metadata().map(|m| m.device.as_str()), Some("synthetic"));

    let second = MemorySink::new();
    let (_tx, rx) = mpsc::channel();
    StreamController::new(fast_config())
        .run(replay, vec![Box::new(second.clone())], rx, RunOptions::default())
        .unwrap();

    let original: Vec<Vec<u8>> = first.frames().iter().map(|f| f.to_rgb_bytes()).collect();
    let replayed: Vec<Vec<u8>> = second.frames().iter().map(|f| f.to_rgb_bytes()).collect();
    assert_eq!(original, replayed);
}
