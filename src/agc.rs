//! Automatic gain control
//!
//! Raw samples span the full 16-bit range but a scene typically occupies a narrow
//! band of it. The normalizer tracks a smoothed (min, max) window across frames
//! and maps each sample into `0..=255` relative to that window.

use crate::config::AgcConfig;
use crate::frame_assembler::Frame;

/// Weight of the previous bound in the running average (out of `SMOOTHING_DIVISOR`)
const SMOOTHING_WEIGHT: u32 = 7;
const SMOOTHING_DIVISOR: u32 = 8;

/// A frame reduced to 8-bit intensity indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFrame {
    /// Samples per row
    pub width: usize,
    /// Number of rows
    pub height: usize,
    /// One index per sample, row-major
    pub indices: Vec<u8>,
    /// Lower bound used for the mapping
    pub min: u16,
    /// Upper bound used for the mapping
    pub max: u16,
}

/// Smoothed min/max tracker shared by every frame of a stream
#[derive(Debug, Clone)]
pub struct AgcNormalizer {
    min: u16,
    max: u16,
    min_range: u16,
}

impl Default for AgcNormalizer {
    fn default() -> Self {
        Self::new(&AgcConfig::default())
    }
}

impl AgcNormalizer {
    /// Start from the configured initial window
    pub fn new(config: &AgcConfig) -> Self {
        Self {
            min: config.initial_min,
            max: config.initial_max,
            min_range: config.min_range,
        }
    }

    /// Current (min, max) window
    pub fn bounds(&self) -> (u16, u16) {
        (self.min, self.max)
    }

    /// Fold one frame's extrema into the running window
    ///
    /// Each bound moves 1/8 of the way toward the frame's extremum, then the
    /// window is widened upward to at least `min_range` (downward when it would
    /// run past `u16::MAX`).
    pub fn update(&mut self, frame: &Frame) {
        let (frame_min, frame_max) = frame.min_max();
        if frame.samples().is_empty() {
            return;
        }

        self.min = smooth(self.min, frame_min);
        self.max = smooth(self.max, frame_max);

        if self.max.saturating_sub(self.min) < self.min_range {
            match self.min.checked_add(self.min_range) {
                Some(max) => self.max = max,
                None => {
                    self.max = u16::MAX;
                    self.min = u16::MAX - self.min_range;
                }
            }
        }
    }

    /// Map a raw sample to an intensity index with the current window
    ///
    /// Samples below the window map to 0 and samples above it to 255.
    #[inline]
    pub fn map(&self, value: u16) -> u8 {
        let range = u32::from(self.max.saturating_sub(self.min)).max(1);
        let offset = u32::from(value.saturating_sub(self.min));
        (offset * 255 / range).min(255) as u8
    }

    /// Update the window with `frame`, then map every sample
    pub fn update_and_map(&mut self, frame: &Frame) -> NormalizedFrame {
        self.update(frame);
        NormalizedFrame {
            width: frame.width(),
            height: frame.height(),
            indices: frame.samples().iter().map(|&v| self.map(v)).collect(),
            min: self.min,
            max: self.max,
        }
    }
}

fn smooth(previous: u16, observed: u16) -> u16 {
    let blended = (u32::from(previous) * SMOOTHING_WEIGHT + u32::from(observed)) / SMOOTHING_DIVISOR;
    // Weighted mean of two u16 values always fits
    u16::try_from(blended).unwrap_or(u16::MAX)
}
