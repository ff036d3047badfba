use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use server_common::camera::{CameraSource, SimulatedCameraConfig};
use server_common::state::{ClipWindow, ServerState};
use server_vision::convergence::{
    ConvergenceSettings, DEFAULT_HI_RATIO, DEFAULT_LO_RATIO, DEFAULT_MAX_TRIES, EXPOSURE_TIME_MAX_TRIES, Tolerance,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_address: String,
    pub port: u16,
    /// longest accepted request line, bytes
    pub max_message_length: usize,
    /// handler failures in a row that are still answered with `nak`
    pub max_consecutive_failures: u32,
    pub paths: PathsConfig,
    pub image: ImageConfig,
    pub convergence: ConvergenceConfig,
    pub camera: CameraSource,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            port: 5060,
            max_message_length: 1024,
            max_consecutive_failures: 3,
            paths: PathsConfig::default(),
            image: ImageConfig::default(),
            convergence: ConvergenceConfig::default(),
            camera: CameraSource::Simulated(SimulatedCameraConfig::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub ramdisk: PathBuf,
    pub sd_card: PathBuf,
    /// where capture sequences are stored
    pub images: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ramdisk: PathBuf::from("/media/ramdisk"),
            sd_card: PathBuf::from("/home/pi/Pictures/Captures"),
            images: PathBuf::from("/media/ramdisk/Captures"),
        }
    }
}

/// Post-processing applied to captured frames at startup, changeable over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub clip_window: ClipWindow,
    pub demosaic: bool,
    pub bin_iterations: i64,
}

impl Default for ImageConfig {
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

impl ImageConfig {
    pub fn server_state(&self) -> ServerState {
        ServerState::new(self.clip_window, self.demosaic, self.bin_iterations)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    pub lo_ratio: f64,
    pub hi_ratio: f64,
    pub exposure_tries: u32,
    pub default_tries: u32,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            lo_ratio: DEFAULT_LO_RATIO,
            hi_ratio: DEFAULT_HI_RATIO,
            exposure_tries: EXPOSURE_TIME_MAX_TRIES,
            default_tries: DEFAULT_MAX_TRIES,
        }
    }
}

impl ConvergenceConfig {
    pub fn settings(&self) -> ConvergenceSettings {
        ConvergenceSettings {
            tolerance: Tolerance {
                lo_ratio: self.lo_ratio,
                hi_ratio: self.hi_ratio,
            },
            exposure_tries: self.exposure_tries,
            default_tries: self.default_tries,
        }
    }
}

/// Loads the config, a missing file falls back to the defaults.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!("Config file not found, using defaults. path: {:?}", path);
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path).with_context(|| format!("reading config file {:?}", path))?;
    let config = ron::from_str(&content).with_context(|| format!("parsing config file {:?}", path))?;
    info!("Loaded config. path: {:?}", path);
    Ok(config)
}
