use std::fmt::Display;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Region of the raw frame kept by the capture pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClipWindow {
    /// window of the given size around the sensor centre
    Centered { width: u32, height: u32 },
    Explicit { x: u32, y: u32, width: u32, height: u32 },
}

impl ClipWindow {
    /// Resolves the window to `[x, y, width, height]` on a sensor of the given size.
    ///
    /// `None` when the window is empty or does not fit.
    pub fn resolve(&self, sensor_width: u32, sensor_height: u32) -> Option<[u32; 4]> {
        let window = match *self {
            ClipWindow::Centered { width, height } => [
                sensor_width.checked_sub(width)? / 2,
                sensor_height.checked_sub(height)? / 2,
                width,
                height,
            ],
            ClipWindow::Explicit { x, y, width, height } => [x, y, width, height],
        };

        let [x, y, width, height] = window;
        if width == 0 || height == 0 {
            return None;
        }
        if x.checked_add(width)? > sensor_width || y.checked_add(height)? > sensor_height {
            return None;
        }
        Some(window)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ClipWindowError {
    #[error("clip window needs 2 or 4 values, got {0}")]
    ValueCount(usize),
    #[error("invalid clip window value: {0}")]
    Value(#[from] ParseIntError),
}

impl FromStr for ClipWindow {
    type Err = ClipWindowError;

    /// `width:height` or `x:y:width:height`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(':')
            .map(str::parse::<u32>)
            .collect::<Result<Vec<_>, _>>()?;

        match values[..] {
            [width, height] => Ok(ClipWindow::Centered { width, height }),
            [x, y, width, height] => Ok(ClipWindow::Explicit { x, y, width, height }),
            _ => Err(ClipWindowError::ValueCount(values.len())),
        }
    }
}

impl Display for ClipWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClipWindow::Centered { width, height } => write!(f, "{}:{}", width, height),
            ClipWindow::Explicit { x, y, width, height } => write!(f, "{}:{}:{}:{}", x, y, width, height),
        }
    }
}

/// Post-processing settings shared by all capture sequences of a session.
///
/// Binning operates on unpacked samples, so `bin_iterations > 0` always implies `demosaic`.
/// The setters keep that invariant by cascading into the dependent flag.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerState {
    clip_window: ClipWindow,
    demosaic: bool,
    bin_iterations: u32,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            clip_window: ClipWindow::Centered {
                width: 1500,
                height: 1500,
            },
            demosaic: false,
            bin_iterations: 0,
        }
    }
}

impl ServerState {
    pub fn new(clip_window: ClipWindow, demosaic: bool, bin_iterations: i64) -> Self {
        let mut state = Self {
            clip_window,
            ..Self::default()
        };
        state.set_demosaic(demosaic);
        state.set_bin_iterations(bin_iterations);
        state
    }

    pub fn clip_window(&self) -> ClipWindow {
        self.clip_window
    }

    pub fn demosaic(&self) -> bool {
        self.demosaic
    }

    pub fn bin_iterations(&self) -> u32 {
        self.bin_iterations
    }

    pub fn set_clip_window(&mut self, clip_window: ClipWindow) {
        self.clip_window = clip_window;
    }

    /// Disabling demosaic also disables binning.
    pub fn set_demosaic(&mut self, enabled: bool) {
        self.demosaic = enabled;
        if !enabled {
            self.bin_iterations = 0;
        }
    }

    /// Negative counts clamp to zero; any binning enables demosaic.
    pub fn set_bin_iterations(&mut self, iterations: i64) {
        self.bin_iterations = iterations.clamp(0, u32::MAX as i64) as u32;
        if self.bin_iterations > 0 {
            self.demosaic = true;
        }
    }
}

const TRUE_TOKENS: [&str; 5] = ["1", "true", "on", "yes", "y"];

/// Protocol boolean: `1/true/on/yes/y` in any case, everything else is false.
pub fn decode_bool(token: &str) -> bool {
    let token = token.to_lowercase();
    TRUE_TOKENS.contains(&token.as_str())
}
