//! `vospi-scope` command-line entry point
//!
//! Streams frames from the sensor (or a recording), with single-letter commands
//! read from stdin: `s` saves a snapshot, `c` cycles the palette, `q` quits.

use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;

use vospi_scope_lib::colormap::Palette;
use vospi_scope_lib::config::StreamConfig;
use vospi_scope_lib::controller::Command;
use vospi_scope_lib::{build_info, run_session, SessionOptions};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Synchronizing VoSPI frame reader and live viewer"
)]
struct Cli {
    /// JSON configuration file
    #[arg(long, env = "VOSPI_CONFIG")]
    config: Option<PathBuf>,

    /// SPI device node
    #[arg(long)]
    device: Option<String>,

    /// SPI clock rate in Hz
    #[arg(long)]
    speed_hz: Option<u32>,

    /// Presentation rate limit
    #[arg(long)]
    fps: Option<u32>,

    /// Starting palette (iron, rainbow, grayscale)
    #[arg(long, value_parser = parse_palette)]
    palette: Option<Palette>,

    /// Directory for saved snapshots
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// Stream a recorded packets file instead of the bus
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Restart the recording when it ends
    #[arg(long, requires = "replay")]
    loop_replay: bool,

    /// Record raw packets into this directory
    #[arg(long)]
    record: Option<PathBuf>,

    /// Send rendered frames to this TCP address
    #[arg(long)]
    transmit: Option<SocketAddr>,

    /// Stop after presenting this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_palette(value: &str) -> std::result::Result<Palette, String> {
    Palette::from_env_str(value).ok_or_else(|| format!("unknown palette '{}'", value))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    let info = build_info();
    log::info!(
        "vospi-scope {} ({}, built {})",
        info.version,
        info.git_hash,
        info.build_time
    );

    let config = load_config(&cli)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        signal_flag.store(true, Ordering::Release);
    })
    .context("failed to install Ctrl-C handler")?;

    let (commands_tx, commands_rx) = mpsc::channel();
    spawn_command_reader(commands_tx)?;

    let options = SessionOptions {
        replay: cli.replay,
        loop_replay: cli.loop_replay,
        record_dir: cli.record,
        transmit: cli.transmit,
        max_frames: cli.frames,
    };

    let report = run_session(&config, &options, commands_rx, shutdown)
        .context("streaming session failed")?;

    let summary = &report.summary;
    log::info!(
        "Session ended: {} captured, {} presented, {} dropped, {} lost sync, {} out of order, {} backoffs",
        summary.stats.frames_captured,
        summary.frames_presented,
        summary.frames_dropped,
        summary.stats.lost_sync,
        summary.stats.out_of_order,
        summary.stats.backoffs
    );
    for path in &summary.snapshots {
        log::info!("Snapshot: {}", path.display());
    }
    if let Some(recording) = &report.recording {
        log::info!(
            "Recording: {} ({} packets)",
            recording.packets_path.display(),
            recording.metadata.total_packets
        );
    }

    Ok(())
}

/// Defaults, then the config file, then `VOSPI_*` variables, then flags
fn load_config(cli: &Cli) -> Result<StreamConfig> {
    let mut config = match &cli.config {
        Some(path) => StreamConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => StreamConfig::default(),
    };
    config.apply_env();

    if let Some(device) = &cli.device {
        config.spi.device = device.clone();
    }
    if let Some(speed) = cli.speed_hz {
        config.spi.speed_hz = speed;
    }
    if let Some(fps) = cli.fps {
        config.controller.target_fps = fps;
    }
    if let Some(palette) = cli.palette {
        config.initial_palette = palette;
    }
    if let Some(dir) = &cli.snapshot_dir {
        config.snapshot_dir = dir.clone();
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Forward stdin lines as commands until stdin closes or a quit is sent
fn spawn_command_reader(commands: Sender<Command>) -> Result<()> {
    thread::Builder::new()
        .name("stdin-commands".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match Command::from_input(&line) {
                    Some(command) => {
                        if commands.send(command).is_err() || command == Command::Quit {
                            break;
                        }
                    }
                    None if line.trim().is_empty() => {}
                    None => log::warn!(
                        "Unknown command '{}' (s = save, c = palette, q = quit)",
                        line.trim()
                    ),
                }
            }
        })
        .context("failed to spawn command reader")?;
    Ok(())
}
