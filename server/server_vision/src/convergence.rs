//! Bounded polling of hardware controls.
//!
//! A control written to the sensor only shows up in the frame metadata a few frames later. The
//! routines here write a target once and then poll the read-back until every component of the
//! value has been seen within tolerance, or the try budget is used up.

use std::fmt::Debug;
use std::time::Instant;

use log::{info, warn};
use server_common::camera::{CameraParameterPort, CameraResult};

pub const DEFAULT_LO_RATIO: f64 = 0.95;
pub const DEFAULT_HI_RATIO: f64 = 1.05;
pub const DEFAULT_MAX_TRIES: u32 = 10;
pub const EXPOSURE_TIME_MAX_TRIES: u32 = 15;

/// A control value made of one or more numeric components.
pub trait Components: Clone + Debug {
    fn components(&self) -> Vec<f64>;
}

impl Components for u32 {
    fn components(&self) -> Vec<f64> {
        vec![f64::from(*self)]
    }
}

impl Components for f64 {
    fn components(&self) -> Vec<f64> {
        vec![*self]
    }
}

impl<const N: usize> Components for [f64; N] {
    fn components(&self) -> Vec<f64> {
        self.to_vec()
    }
}

impl<const N: usize> Components for [u32; N] {
    fn components(&self) -> Vec<f64> {
        self.iter()
            .copied()
            .map(f64::from)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub lo_ratio: f64,
    pub hi_ratio: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            lo_ratio: DEFAULT_LO_RATIO,
            hi_ratio: DEFAULT_HI_RATIO,
        }
    }
}

/// Tolerance and try budgets used by the configuration commands and the capture pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceSettings {
    pub tolerance: Tolerance,
    pub exposure_tries: u32,
    pub default_tries: u32,
}

impl Default for ConvergenceSettings {
    fn default() -> Self {
        Self {
            tolerance: Tolerance::default(),
            exposure_tries: EXPOSURE_TIME_MAX_TRIES,
            default_tries: DEFAULT_MAX_TRIES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvergenceRequest<T> {
    pub target: T,
    pub tolerance: Tolerance,
    pub max_tries: u32,
}

impl<T> ConvergenceRequest<T> {
    pub fn new(target: T, tolerance: Tolerance, max_tries: u32) -> Self {
        Self {
            target,
            tolerance,
            max_tries,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvergenceResult<T> {
    /// last value read back, `None` when no poll happened
    pub value: Option<T>,
    /// per component, whether it was seen in range on any poll
    pub achieved: Vec<bool>,
    pub polls: u32,
    pub timed_out: bool,
}

/// Writes `request.target` once via `set`, then polls `get` up to `max_tries` times.
///
/// A component counts as achieved once it has been observed inside
/// `[target * lo_ratio, target * hi_ratio]` on any poll, it is not re-checked on later polls.
/// Polling stops as soon as all components are achieved.
pub fn converge<C, T, E, S, G>(
    context: &mut C,
    request: &ConvergenceRequest<T>,
    set: S,
    mut get: G,
) -> Result<ConvergenceResult<T>, E>
where
    C: ?Sized,
    T: Components,
    S: FnOnce(&mut C, &T) -> Result<(), E>,
    G: FnMut(&mut C) -> Result<T, E>,
{
    set(context, &request.target)?;

    let targets = request.target.components();
    let mut achieved = vec![false; targets.len()];
    let mut value = None;
    let mut polls = 0;

    while polls < request.max_tries {
        let current = get(context)?;
        polls += 1;

        let readings = current.components();
        for (index, target) in targets.iter().enumerate() {
            let lo = target * request.tolerance.lo_ratio;
            let hi = target * request.tolerance.hi_ratio;
            if let Some(reading) = readings.get(index) {
                if *reading >= lo && *reading <= hi {
                    achieved[index] = true;
                }
            }
        }
        value = Some(current);

        if achieved.iter().all(|flag| *flag) {
            break;
        }
    }

    let timed_out = !achieved.iter().all(|flag| *flag);

    Ok(ConvergenceResult {
        value,
        achieved,
        polls,
        timed_out,
    })
}

fn log_outcome<T: Debug>(control: &str, target: &T, result: &ConvergenceResult<T>, started_at: Instant) {
    let elapsed = started_at.elapsed().as_secs_f64();
    if result.timed_out {
        warn!(
            "{}-Change timed out. target: {:?}, current: {:?}, polls: {}, took: {:.3}s",
            control, target, result.value, result.polls, elapsed
        );
    } else {
        info!(
            "{}-Change S:{:?}, I:{:?}, polls: {}, took: {:.3}s",
            control, target, result.value, result.polls, elapsed
        );
    }
}

pub fn configure_exposure_time<C: CameraParameterPort + ?Sized>(
    camera: &mut C,
    micros: u32,
    tolerance: Tolerance,
    max_tries: u32,
) -> CameraResult<ConvergenceResult<u32>> {
    let started_at = Instant::now();
    let request = ConvergenceRequest::new(micros, tolerance, max_tries);
    let result = converge(
        camera,
        &request,
        |camera, target| camera.set_exposure_time(*target),
        |camera| camera.exposure_time(),
    )?;
    log_outcome("SS", &micros, &result, started_at);
    Ok(result)
}

pub fn configure_analog_gain<C: CameraParameterPort + ?Sized>(
    camera: &mut C,
    gain: f64,
    tolerance: Tolerance,
    max_tries: u32,
) -> CameraResult<ConvergenceResult<f64>> {
    let started_at = Instant::now();
    let request = ConvergenceRequest::new(gain, tolerance, max_tries);
    let result = converge(
        camera,
        &request,
        |camera, target| camera.set_analog_gain(*target),
        |camera| camera.analog_gain(),
    )?;
    log_outcome("AG", &gain, &result, started_at);
    Ok(result)
}

pub fn configure_white_balance<C: CameraParameterPort + ?Sized>(
    camera: &mut C,
    gains: [f64; 2],
    tolerance: Tolerance,
    max_tries: u32,
) -> CameraResult<ConvergenceResult<[f64; 2]>> {
    let started_at = Instant::now();
    let request = ConvergenceRequest::new(gains, tolerance, max_tries);
    let result = converge(
        camera,
        &request,
        |camera, target| camera.set_white_balance(*target),
        |camera| camera.white_balance(),
    )?;
    log_outcome("AWB", &gains, &result, started_at);
    Ok(result)
}

pub fn configure_crop_window<C: CameraParameterPort + ?Sized>(
    camera: &mut C,
    window: [u32; 4],
    tolerance: Tolerance,
    max_tries: u32,
) -> CameraResult<ConvergenceResult<[u32; 4]>> {
    let started_at = Instant::now();
    let request = ConvergenceRequest::new(window, tolerance, max_tries);
    let result = converge(
        camera,
        &request,
        |camera, target| camera.set_crop_window(*target),
        |camera| camera.crop_window(),
    )?;
    log_outcome("ScalerCrop", &window, &result, started_at);
    Ok(result)
}

pub fn configure_frame_rate<C: CameraParameterPort + ?Sized>(
    camera: &mut C,
    fps: f64,
    tolerance: Tolerance,
    max_tries: u32,
) -> CameraResult<ConvergenceResult<f64>> {
    let started_at = Instant::now();
    let request = ConvergenceRequest::new(fps, tolerance, max_tries);
    let result = converge(
        camera,
        &request,
        |camera, target| camera.set_frame_rate(*target),
        |camera| camera.frame_rate(),
    )?;
    log_outcome("FrameRate", &fps, &result, started_at);
    Ok(result)
}
