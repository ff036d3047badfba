use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use log::{debug, trace};
use ndarray::{Array2, s};
use server_common::camera::{
    CameraError, CameraParameterPort, CameraResult, CapturedFrame, FrameMetadata, SensorGeometry,
    SimulatedCameraConfig,
};

use crate::processing::{SATURATION_LEVEL, pack_12bit};

/// Exposure time reported before any exposure has been requested, microseconds.
const INITIAL_EXPOSURE_TIME: u32 = 10_000;

#[derive(Debug, Clone, Copy)]
enum Control {
    ExposureTime(u32),
    AnalogGain(f64),
    WhiteBalance([f64; 2]),
    CropWindow([u32; 4]),
    FrameDuration(u32),
}

#[derive(Debug, Clone, Copy)]
struct Controls {
    /// requested exposure, the effective one is clamped to the frame duration
    exposure_time: u32,
    analog_gain: f64,
    white_balance: [f64; 2],
    crop_window: [u32; 4],
    frame_duration: u32,
}

impl Controls {
    fn effective_exposure_time(&self) -> u32 {
        self.exposure_time.min(self.frame_duration)
    }

    fn apply(&mut self, control: Control) {
        match control {
            Control::ExposureTime(micros) => self.exposure_time = micros,
            Control::AnalogGain(gain) => self.analog_gain = gain,
            Control::WhiteBalance(gains) => self.white_balance = gains,
            Control::CropWindow(window) => self.crop_window = window,
            Control::FrameDuration(micros) => self.frame_duration = micros,
        }
    }
}

/// A deterministic stand-in for the HQ sensor.
///
/// Controls take `settle_frames` frames to show up in the read-back, like the real pipeline where
/// requests are queued behind frames already in flight.
pub struct SimulatedCamera {
    config: SimulatedCameraConfig,
    geometry: SensorGeometry,
    frame_number: u64,
    controls: Controls,
    pending: VecDeque<(u64, Control)>,
    requested_exposure_time: Option<u32>,
}

fn frame_duration_for(fps: f64) -> CameraResult<u32> {
    if !fps.is_finite() || fps <= 0.0 {
        return Err(CameraError::InvalidControl {
            control: "FrameRate",
            value: fps.to_string(),
        });
    }
    Ok((1_000_000.0 / fps).round().clamp(1.0, u32::MAX as f64) as u32)
}

impl SimulatedCamera {
    pub fn build(config: &SimulatedCameraConfig) -> CameraResult<Self> {
        Self::with_geometry(config, SensorGeometry::default())
    }

    pub fn with_geometry(config: &SimulatedCameraConfig, geometry: SensorGeometry) -> CameraResult<Self> {
        if geometry.width % 2 != 0 || geometry.stride < geometry.width as usize * 3 / 2 {
            return Err(CameraError::Hardware(format!(
                "unsupported sensor geometry. geometry: {:?}",
                geometry
            )));
        }

        let frame_duration = frame_duration_for(config.fps)?;
        let controls = Controls {
            exposure_time: INITIAL_EXPOSURE_TIME,
            analog_gain: 1.0,
            white_balance: [1.0, 1.0],
            crop_window: [0, 0, geometry.width, geometry.height],
            frame_duration,
        };

        Ok(Self {
            config: config.clone(),
            geometry,
            frame_number: 0,
            controls,
            pending: VecDeque::new(),
            requested_exposure_time: None,
        })
    }

    /// Last exposure time passed to `set_exposure_time`, whether or not it has been applied yet.
    pub fn requested_exposure_time(&self) -> Option<u32> {
        self.requested_exposure_time
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    fn queue(&mut self, control: Control) {
        let due = self.frame_number + u64::from(self.config.settle_frames);
        trace!("Queued control. control: {:?}, due_frame: {}", control, due);
        self.pending.push_back((due, control));
    }

    /// Waits for the next frame boundary and applies every control that is due.
    fn next_frame(&mut self) {
        if self.config.realtime {
            thread::sleep(Duration::from_micros(u64::from(self.controls.frame_duration)));
        }
        self.frame_number += 1;

        while let Some((due, control)) = self.pending.front().copied() {
            if due > self.frame_number {
                break;
            }
            self.pending.pop_front();
            self.controls.apply(control);
            debug!("Applied control. control: {:?}, frame_number: {}", control, self.frame_number);
        }
    }

    fn render(&self) -> CameraResult<Array2<u8>> {
        let width = self.geometry.width as usize;
        let height = self.geometry.height as usize;

        let level = f64::from(self.controls.effective_exposure_time()) * self.controls.analog_gain / 10.0;
        let samples = Array2::from_shape_fn((height, width), |(row, col)| {
            // a small gradient so neighbouring blocks differ
            let value = level + ((row + col) % 16) as f64;
            value.clamp(0.0, f64::from(SATURATION_LEVEL)) as u16
        });

        let packed = pack_12bit(samples.view()).map_err(|e| CameraError::Capture(e.to_string()))?;

        let mut pixels = Array2::<u8>::zeros((height, self.geometry.stride));
        pixels
            .slice_mut(s![.., ..packed.ncols()])
            .assign(&packed);
        Ok(pixels)
    }
}

impl CameraParameterPort for SimulatedCamera {
    fn identify(&self) -> String {
        self.config.name.clone()
    }

    fn sensor_geometry(&self) -> SensorGeometry {
        self.geometry
    }

    fn set_exposure_time(&mut self, micros: u32) -> CameraResult<()> {
        self.requested_exposure_time = Some(micros);
        if micros == 0 {
            // auto exposure keeps the current value in the simulation
            return Ok(());
        }
        self.queue(Control::ExposureTime(micros));
        Ok(())
    }

    fn exposure_time(&mut self) -> CameraResult<u32> {
        self.next_frame();
        Ok(self.controls.effective_exposure_time())
    }

    fn set_analog_gain(&mut self, gain: f64) -> CameraResult<()> {
        if !gain.is_finite() || gain < 1.0 {
            return Err(CameraError::InvalidControl {
                control: "AnalogueGain",
                value: gain.to_string(),
            });
        }
        self.queue(Control::AnalogGain(gain));
        Ok(())
    }

    fn analog_gain(&mut self) -> CameraResult<f64> {
        self.next_frame();
        Ok(self.controls.analog_gain)
    }

    fn set_white_balance(&mut self, gains: [f64; 2]) -> CameraResult<()> {
        if gains.iter().any(|gain| !gain.is_finite() || *gain < 0.0) {
            return Err(CameraError::InvalidControl {
                control: "ColourGains",
                value: format!("{:?}", gains),
            });
        }
        self.queue(Control::WhiteBalance(gains));
        Ok(())
    }

    fn white_balance(&mut self) -> CameraResult<[f64; 2]> {
        self.next_frame();
        Ok(self.controls.white_balance)
    }

    fn set_crop_window(&mut self, window: [u32; 4]) -> CameraResult<()> {
        let [x, y, width, height] = window;
        let fits = x.checked_add(width).is_some_and(|right| right <= self.geometry.width)
            && y.checked_add(height).is_some_and(|bottom| bottom <= self.geometry.height);
        if !fits {
            return Err(CameraError::InvalidControl {
                control: "ScalerCrop",
                value: format!("{:?}", window),
            });
        }
        self.queue(Control::CropWindow(window));
        Ok(())
    }

    fn crop_window(&mut self) -> CameraResult<[u32; 4]> {
        self.next_frame();
        Ok(self.controls.crop_window)
    }

    fn set_frame_rate(&mut self, fps: f64) -> CameraResult<()> {
        let frame_duration = frame_duration_for(fps)?;
        self.queue(Control::FrameDuration(frame_duration));
        Ok(())
    }

    fn frame_rate(&mut self) -> CameraResult<f64> {
        self.next_frame();
        Ok(1_000_000.0 / f64::from(self.controls.frame_duration))
    }

    fn capture_frame(&mut self) -> CameraResult<CapturedFrame> {
        self.next_frame();
        let pixels = self.render()?;
        let metadata = FrameMetadata {
            exposure_time: self.controls.effective_exposure_time(),
            frame_duration: self.controls.frame_duration,
            analog_gain: self.controls.analog_gain,
            frame_timestamp: Utc::now(),
        };
        Ok(CapturedFrame { pixels, metadata })
    }
}
