use chrono::DateTime;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Full-resolution sensor width in pixels.
pub const SENSOR_WIDTH: u32 = 4056;
/// Full-resolution sensor height in pixels.
pub const SENSOR_HEIGHT: u32 = 3040;
/// Bytes per row of a packed raw frame, `SENSOR_WIDTH * 1.5` aligned to 32.
pub const SENSOR_STRIDE: usize = 6112;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum CameraSource {
    Simulated(SimulatedCameraConfig),
    // TODO a libcamera backend for the HQ camera, same port trait.
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedCameraConfig {
    pub name: String,
    /// number of frames before a new control value shows up in the frame metadata
    pub settle_frames: u32,
    pub fps: f64,
    /// when set, every frame boundary sleeps for the frame duration
    pub realtime: bool,
}

impl Default for SimulatedCameraConfig {
    fn default() -> Self {
        Self {
            name: "PiCam2-Simulated".to_string(),
            settle_frames: 2,
            fps: 10.0,
            realtime: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorGeometry {
    pub width: u32,
    pub height: u32,
    /// bytes per row of the packed raw buffer, including alignment padding
    pub stride: usize,
}

impl Default for SensorGeometry {
    fn default() -> Self {
        Self {
            width: SENSOR_WIDTH,
            height: SENSOR_HEIGHT,
            stride: SENSOR_STRIDE,
        }
    }
}

/// Metadata reported by the camera alongside each frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// exposure time actually used for the frame, microseconds
    pub exposure_time: u32,
    /// frame duration, microseconds
    pub frame_duration: u32,
    pub analog_gain: f64,
    pub frame_timestamp: DateTime<chrono::Utc>,
}

/// A raw frame as delivered by the sensor: `height` rows of packed 12-bit samples.
pub struct CapturedFrame {
    pub pixels: Array2<u8>,
    pub metadata: FrameMetadata,
}

#[derive(Debug, Error)]
pub enum CameraError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("capture error: {0}")]
    Capture(String),
    #[error("invalid control value. control: {control}, value: {value}")]
    InvalidControl { control: &'static str, value: String },
}

pub type CameraResult<T> = Result<T, CameraError>;

/// Control surface of the still-image sensor.
///
/// Setters are applied asynchronously by the hardware; a new value may only show up in the
/// read-back after a few frames. Every getter waits for the next frame boundary.
pub trait CameraParameterPort {
    fn identify(&self) -> String;

    fn sensor_geometry(&self) -> SensorGeometry;

    /// `0` hands exposure control back to the auto-exposure loop.
    fn set_exposure_time(&mut self, micros: u32) -> CameraResult<()>;
    fn exposure_time(&mut self) -> CameraResult<u32>;

    fn set_analog_gain(&mut self, gain: f64) -> CameraResult<()>;
    fn analog_gain(&mut self) -> CameraResult<f64>;

    /// `[red, blue]` colour gains
    fn set_white_balance(&mut self, gains: [f64; 2]) -> CameraResult<()>;
    fn white_balance(&mut self) -> CameraResult<[f64; 2]>;

    /// `[x, y, width, height]` in sensor pixels
    fn set_crop_window(&mut self, window: [u32; 4]) -> CameraResult<()>;
    fn crop_window(&mut self) -> CameraResult<[u32; 4]>;

    fn set_frame_rate(&mut self, fps: f64) -> CameraResult<()>;
    fn frame_rate(&mut self) -> CameraResult<f64>;

    fn capture_frame(&mut self) -> CameraResult<CapturedFrame>;
}
