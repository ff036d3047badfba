//! Exposure-sequence capture.
//!
//! For every requested exposure time the sensor is converged, a burst of raw frames is taken, the
//! next exposure is pre-set so it can settle while the burst is processed, and every frame is
//! cropped, optionally unpacked and binned, then written to the store path.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use server_common::camera::{CameraError, CameraParameterPort, CapturedFrame, SensorGeometry};
use server_common::state::{ClipWindow, ServerState};
use thiserror::Error;

use crate::convergence::{ConvergenceResult, ConvergenceSettings, configure_exposure_time};
use crate::processing::{ProcessingError, check_unpack_alignment, process_frame};
use crate::storage::{CaptureLog, CaptureLogEntry, capture_log_file_name, frame_file_name, write_frame};

/// The burst of one exposure setting is held in memory until it is processed.
pub const MAX_FRAMES_PER_SETTING: u32 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSequenceRequest {
    pub prefix: String,
    pub store_path: PathBuf,
    /// microseconds, captured in this order
    pub exposure_times: Vec<u32>,
    pub frames_per_setting: u32,
    /// seconds, a frame taking longer to capture is reported
    pub max_capture_time: f64,
    pub save_log: bool,
}

#[derive(Debug)]
pub struct CaptureSummary {
    pub frames: Vec<PathBuf>,
    pub log_file: Option<PathBuf>,
    /// target exposure time and its convergence outcome, in capture order
    pub exposure_outcomes: Vec<(u32, ConvergenceResult<u32>)>,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no store path configured")]
    MissingStorePath,
    #[error("no exposure times requested")]
    NoExposureTimes,
    #[error("too many frames per setting. requested: {requested}, max: {max}")]
    TooManyFrames { requested: u32, max: u32 },
    #[error("clip window does not fit the sensor. window: {window}, sensor: {}x{}", .geometry.width, .geometry.height)]
    WindowOutOfBounds { window: ClipWindow, geometry: SensorGeometry },
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Processing(#[from] ProcessingError),
    #[error("i/o error. path: {path:?}, error: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CaptureError + '_ {
    move |source| CaptureError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub fn capture_exposure_sequence<C: CameraParameterPort + ?Sized>(
    camera: &mut C,
    state: &ServerState,
    request: &CaptureSequenceRequest,
    settings: &ConvergenceSettings,
) -> Result<CaptureSummary, CaptureError> {
    if request.store_path.as_os_str().is_empty() {
        return Err(CaptureError::MissingStorePath);
    }
    let Some(&first_exposure_time) = request.exposure_times.first() else {
        return Err(CaptureError::NoExposureTimes);
    };
    if request.frames_per_setting > MAX_FRAMES_PER_SETTING {
        return Err(CaptureError::TooManyFrames {
            requested: request.frames_per_setting,
            max: MAX_FRAMES_PER_SETTING,
        });
    }

    let geometry = camera.sensor_geometry();
    let window = state
        .clip_window()
        .resolve(geometry.width, geometry.height)
        .ok_or(CaptureError::WindowOutOfBounds {
            window: state.clip_window(),
            geometry,
        })?;
    if state.demosaic() {
        check_unpack_alignment(window)?;
    }

    fs::create_dir_all(&request.store_path).map_err(io_error(&request.store_path))?;

    info!(
        "Capture sequence started. prefix: {}, exposure_times: {:?}, frames_per_setting: {}, window: {:?}, demosaic: {}, bin_iterations: {}",
        request.prefix,
        request.exposure_times,
        request.frames_per_setting,
        window,
        state.demosaic(),
        state.bin_iterations()
    );
    let sequence_start = Instant::now();

    let mut log = CaptureLog::default();
    let mut summary = CaptureSummary {
        frames: Vec::new(),
        log_file: None,
        exposure_outcomes: Vec::with_capacity(request.exposure_times.len()),
    };

    for (setting_index, &exposure_time) in request.exposure_times.iter().enumerate() {
        // a timeout is not fatal, the frames are taken with whatever the sensor settled on
        let outcome = configure_exposure_time(camera, exposure_time, settings.tolerance, settings.exposure_tries)?;
        summary.exposure_outcomes.push((exposure_time, outcome));

        let mut burst: Vec<(CapturedFrame, Duration)> = Vec::new();
        for frame_index in 0..request.frames_per_setting {
            let capture_start = Instant::now();
            let frame = camera.capture_frame()?;
            let capture_duration = capture_start.elapsed();
            if capture_duration.as_secs_f64() > request.max_capture_time {
                warn!(
                    "Frame capture exceeded max time. exposure_time: {}, frame_index: {}, took: {:.3}s, max: {:.3}s",
                    exposure_time,
                    frame_index,
                    capture_duration.as_secs_f64(),
                    request.max_capture_time
                );
            }
            burst.push((frame, capture_duration));
        }

        if let Some(&next_exposure_time) = request.exposure_times.get(setting_index + 1) {
            camera.set_exposure_time(next_exposure_time)?;
            debug!("Pre-set next exposure time. exposure_time: {}", next_exposure_time);
        }

        for (frame_index, (frame, capture_duration)) in burst.into_iter().enumerate() {
            let processed = process_frame(
                frame.pixels.view(),
                window,
                state.demosaic(),
                state.bin_iterations(),
            )?;

            let path = request
                .store_path
                .join(frame_file_name(&request.prefix, exposure_time, frame_index as u32));
            let save_start = Instant::now();
            write_frame(&path, &processed).map_err(io_error(&path))?;
            let save_duration = save_start.elapsed();

            debug!(
                "Frame saved. path: {:?}, dim: {:?}, capture: {:.3}s, save: {:.3}s, exposure_time: {}, analog_gain: {:.2}, timestamp: {}",
                path,
                processed.dim(),
                capture_duration.as_secs_f64(),
                save_duration.as_secs_f64(),
                frame.metadata.exposure_time,
                frame.metadata.analog_gain,
                frame.metadata.frame_timestamp
            );

            if request.save_log {
                log.record(&CaptureLogEntry {
                    path: path.clone(),
                    capture_duration,
                    save_duration,
                    target_exposure_time: exposure_time,
                    actual_exposure_time: frame.metadata.exposure_time,
                    frame_duration: frame.metadata.frame_duration,
                });
            }
            summary.frames.push(path);
        }
    }

    // leave the sensor on the first (usually shortest) exposure for the next sequence
    camera.set_exposure_time(first_exposure_time)?;

    if request.save_log {
        let log_path = request
            .store_path
            .join(capture_log_file_name(&request.prefix));
        if log.is_empty() {
            warn!("No frames captured, capture log is empty. path: {:?}", log_path);
        }
        log.write_to(&log_path).map_err(io_error(&log_path))?;
        debug!("Capture log written. path: {:?}, lines: {}", log_path, log.len());
        summary.log_file = Some(log_path);
    }

    info!(
        "Capture sequence finished. prefix: {}, frames: {}, took: {:.3}s",
        request.prefix,
        summary.frames.len(),
        sequence_start.elapsed().as_secs_f64()
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use server_common::camera::{CameraResult, SimulatedCameraConfig};

    use super::*;
    use crate::simulated_capture::SimulatedCamera;

    fn camera() -> SimulatedCamera {
        let geometry = SensorGeometry {
            width: 400,
            height: 300,
            stride: 608,
        };
        SimulatedCamera::with_geometry(&SimulatedCameraConfig::default(), geometry).unwrap()
    }

    fn request(store_path: PathBuf) -> CaptureSequenceRequest {
        CaptureSequenceRequest {
            prefix: "demo".to_string(),
            store_path,
            exposure_times: vec![1000, 5000],
            frames_per_setting: 3,
            max_capture_time: 3.0,
            save_log: true,
        }
    }

    fn npy_header(path: &Path) -> String {
        let bytes = fs::read(path).unwrap();
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        String::from_utf8(bytes[10..10 + header_len].to_vec()).unwrap()
    }

    #[test]
    fn sequence_writes_frames_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = camera();
        let state = ServerState::new(ClipWindow::Centered { width: 100, height: 100 }, false, 0);

        let summary = capture_exposure_sequence(
            &mut camera,
            &state,
            &request(dir.path().to_path_buf()),
            &ConvergenceSettings::default(),
        )
        .unwrap();

        let mut expected = Vec::new();
        for exposure_time in [1000, 5000] {
            for index in 0..3 {
                expected.push(dir.path().join(format!("demo_ss={}_{:04}.raw", exposure_time, index)));
            }
        }
        assert_eq!(summary.frames, expected);
        for path in &expected {
            assert!(path.is_file(), "{:?}", path);
            assert!(npy_header(path).contains("'descr': '|u1', 'fortran_order': False, 'shape': (100, 150)"));
        }

        let log_path = dir.path().join("demo_SSCapture.log");
        assert_eq!(summary.log_file.as_ref(), Some(&log_path));
        let log = fs::read_to_string(&log_path).unwrap();
        let lines = log.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].contains(";sSS:1000;iSS:1000;FD:100000"));
        assert!(lines[5].contains(";sSS:5000;iSS:5000;FD:100000"));

        assert_eq!(camera.requested_exposure_time(), Some(1000));
        assert!(summary.exposure_outcomes.iter().all(|(_, outcome)| !outcome.timed_out));
    }

    #[test]
    fn binned_frames_are_written_as_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = camera();
        let state = ServerState::new(ClipWindow::Centered { width: 100, height: 100 }, true, 1);
        let request = CaptureSequenceRequest {
            exposure_times: vec![2000],
            frames_per_setting: 1,
            save_log: false,
            ..request(dir.path().to_path_buf())
        };

        let summary = capture_exposure_sequence(&mut camera, &state, &request, &ConvergenceSettings::default()).unwrap();

        assert_eq!(summary.frames.len(), 1);
        assert_eq!(summary.log_file, None);
        assert!(!dir.path().join("demo_SSCapture.log").exists());
        assert!(npy_header(&summary.frames[0]).contains("'descr': '<u2', 'fortran_order': False, 'shape': (50, 50)"));
    }

    #[test]
    fn missing_store_path_fails_before_capture() {
        let mut camera = camera();
        let state = ServerState::default();

        let result = capture_exposure_sequence(
            &mut camera,
            &state,
            &request(PathBuf::new()),
            &ConvergenceSettings::default(),
        );

        assert!(matches!(result, Err(CaptureError::MissingStorePath)));
        assert_eq!(camera.frame_number(), 0);
        assert_eq!(camera.requested_exposure_time(), None);
    }

    #[test]
    fn oversized_clip_window_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = camera();
        let state = ServerState::default();

        let result = capture_exposure_sequence(
            &mut camera,
            &state,
            &request(dir.path().to_path_buf()),
            &ConvergenceSettings::default(),
        );

        assert!(matches!(result, Err(CaptureError::WindowOutOfBounds { .. })));
        assert_eq!(camera.frame_number(), 0);
    }

    /// Records every exposure time handed to the sensor.
    struct RecordingCamera {
        inner: SimulatedCamera,
        exposure_times_set: Vec<u32>,
    }

    impl CameraParameterPort for RecordingCamera {
        fn identify(&self) -> String {
            self.inner.identify()
        }

        fn sensor_geometry(&self) -> SensorGeometry {
            self.inner.sensor_geometry()
        }

        fn set_exposure_time(&mut self, micros: u32) -> CameraResult<()> {
            self.exposure_times_set.push(micros);
            self.inner.set_exposure_time(micros)
        }

        fn exposure_time(&mut self) -> CameraResult<u32> {
            self.inner.exposure_time()
        }

        fn set_analog_gain(&mut self, gain: f64) -> CameraResult<()> {
            self.inner.set_analog_gain(gain)
        }

        fn analog_gain(&mut self) -> CameraResult<f64> {
            self.inner.analog_gain()
        }

        fn set_white_balance(&mut self, gains: [f64; 2]) -> CameraResult<()> {
            self.inner.set_white_balance(gains)
        }

        fn white_balance(&mut self) -> CameraResult<[f64; 2]> {
            self.inner.white_balance()
        }

        fn set_crop_window(&mut self, window: [u32; 4]) -> CameraResult<()> {
            self.inner.set_crop_window(window)
        }

        fn crop_window(&mut self) -> CameraResult<[u32; 4]> {
            self.inner.crop_window()
        }

        fn set_frame_rate(&mut self, fps: f64) -> CameraResult<()> {
            self.inner.set_frame_rate(fps)
        }

        fn frame_rate(&mut self) -> CameraResult<f64> {
            self.inner.frame_rate()
        }

        fn capture_frame(&mut self) -> CameraResult<CapturedFrame> {
            self.inner.capture_frame()
        }
    }

    #[test]
    fn next_exposure_is_set_right_after_the_burst() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = RecordingCamera {
            inner: camera(),
            exposure_times_set: Vec::new(),
        };
        let state = ServerState::new(ClipWindow::Centered { width: 100, height: 100 }, false, 0);
        let request = CaptureSequenceRequest {
            exposure_times: vec![1000, 5000, 3000],
            frames_per_setting: 1,
            save_log: false,
            ..request(dir.path().to_path_buf())
        };

        capture_exposure_sequence(&mut camera, &state, &request, &ConvergenceSettings::default()).unwrap();

        // converge, pre-set next, converge, pre-set next, converge, reset to first
        assert_eq!(camera.exposure_times_set, [1000, 5000, 5000, 3000, 3000, 1000]);
    }

    #[test]
    fn capture_continues_when_exposure_does_not_converge() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = camera();
        let state = ServerState::new(ClipWindow::Centered { width: 100, height: 100 }, false, 0);
        // longer than the 100ms frame duration, the sensor clamps it
        let request = CaptureSequenceRequest {
            exposure_times: vec![250_000],
            frames_per_setting: 2,
            ..request(dir.path().to_path_buf())
        };

        let summary = capture_exposure_sequence(&mut camera, &state, &request, &ConvergenceSettings::default()).unwrap();

        assert_eq!(summary.exposure_outcomes.len(), 1);
        let (target, outcome) = &summary.exposure_outcomes[0];
        assert_eq!(*target, 250_000);
        assert!(outcome.timed_out);

        assert_eq!(summary.frames.len(), 2);
        assert!(summary.frames.iter().all(|path| path.is_file()));
        let log = fs::read_to_string(dir.path().join("demo_SSCapture.log")).unwrap();
        let lines = log.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(";sSS:250000;iSS:100000;FD:100000"));
    }

    #[test]
    fn too_many_frames_per_setting_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = camera();
        let state = ServerState::new(ClipWindow::Centered { width: 100, height: 100 }, false, 0);
        let request = CaptureSequenceRequest {
            frames_per_setting: u32::MAX,
            ..request(dir.path().to_path_buf())
        };

        let result = capture_exposure_sequence(&mut camera, &state, &request, &ConvergenceSettings::default());

        assert!(matches!(
            result,
            Err(CaptureError::TooManyFrames {
                requested: u32::MAX,
                max: MAX_FRAMES_PER_SETTING
            })
        ));
        assert_eq!(camera.frame_number(), 0);
    }

    #[test]
    fn empty_exposure_list_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut camera = camera();
        let request = CaptureSequenceRequest {
            exposure_times: vec![],
            ..request(dir.path().to_path_buf())
        };

        let result = capture_exposure_sequence(&mut camera, &ServerState::default(), &request, &ConvergenceSettings::default());

        assert!(matches!(result, Err(CaptureError::NoExposureTimes)));
    }
}
