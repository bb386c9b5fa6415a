//! Raw frame snapshots as plain-text PGM
//!
//! A snapshot is the pre-colormap sample grid, offset by the frame minimum so the
//! full measured range survives losslessly:
//!
//! ```text
//! P2
//! <width> <height>
//! <max - min>
//! <v - min> <v - min> ...   (one line per row)
//! ```

use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::frame_assembler::Frame;

/// Highest snapshot index tried before giving up
const MAX_SNAPSHOT_INDEX: u32 = 9999;

/// Errors raised while saving a snapshot
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// Writing the file failed
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),

    /// Every `STREAM_NNNN.pgm` name in the directory is taken
    #[error("no free snapshot name in {0}")]
    NamesExhausted(PathBuf),

    /// The frame has no samples
    #[error("cannot snapshot an empty frame")]
    EmptyFrame,
}

/// Result type alias for snapshot operations.
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// File name for snapshot `index`
pub fn snapshot_name(index: u32) -> String {
    format!("STREAM_{:04}.pgm", index)
}

/// Serialize a frame as PGM text
///
/// # Errors
///
/// Returns `SnapshotError::EmptyFrame` for a frame without samples, or
/// `SnapshotError::Io` if the writer fails.
pub fn write_pgm<W: Write>(frame: &Frame, mut writer: W) -> Result<()> {
    if frame.samples().is_empty() {
        return Err(SnapshotError::EmptyFrame);
    }

    let (min, max) = frame.min_max();
    // PGM requires a positive maxval even for a flat scene
    let maxval = (max - min).max(1);

    writeln!(writer, "P2")?;
    writeln!(writer, "{} {}", frame.width(), frame.height())?;
    writeln!(writer, "{}", maxval)?;

    for row in 0..frame.height() {
        let line = frame
            .row(row)
            .iter()
            .map(|&v| (v - min).to_string())
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(writer, "{}", line)?;
    }

    writer.flush()?;
    Ok(())
}

/// Save a frame as the first unused `STREAM_NNNN.pgm` in `dir`
///
/// # Errors
///
/// Returns `SnapshotError::NamesExhausted` when indices 0..=9999 are all taken,
/// or `SnapshotError::Io` if the directory is not writable.
pub fn save_snapshot(frame: &Frame, dir: &Path) -> Result<PathBuf> {
    for index in 0..=MAX_SNAPSHOT_INDEX {
        let path = dir.join(snapshot_name(index));
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = write_pgm(frame, BufWriter::new(file)) {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        log::info!("Saved snapshot {}", path.display());
        return Ok(path);
    }

    Err(SnapshotError::NamesExhausted(dir.to_path_buf()))
}
