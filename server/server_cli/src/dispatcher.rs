use log::{debug, info};
use server_common::camera::CameraParameterPort;
use server_common::state::ServerState;
use server_shared::commands::{CaptureSequenceArgs, Command, Reply};
use server_vision::capture::{CaptureSequenceRequest, capture_exposure_sequence};
use server_vision::convergence::{
    ConvergenceSettings, configure_analog_gain, configure_crop_window, configure_exposure_time, configure_frame_rate,
    configure_white_balance,
};

use crate::archive::archive_folder;
use crate::config::PathsConfig;

pub type BoxedCamera = Box<dyn CameraParameterPort + Send>;

/// Executes decoded commands against the camera and the session's image settings.
pub struct Dispatcher {
    camera: BoxedCamera,
    state: ServerState,
    paths: PathsConfig,
    convergence: ConvergenceSettings,
}

impl Dispatcher {
    pub fn new(camera: BoxedCamera, state: ServerState, paths: PathsConfig, convergence: ConvergenceSettings) -> Self {
        Self {
            camera,
            state,
            paths,
            convergence,
        }
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Blocks until the command has completed, hardware access included.
    pub fn handle(&mut self, command: &Command) -> anyhow::Result<Reply> {
        let ConvergenceSettings {
            tolerance,
            exposure_tries,
            default_tries,
        } = self.convergence;
        debug!("Handling command. identifier: {}", command.identifier());

        let reply = match command {
            Command::Identify => Reply::Value(self.camera.identify()),
            Command::Echo { payload } => Reply::Value(payload.join(" ")),
            Command::RamDiskPath => Reply::Value(self.paths.ramdisk.display().to_string()),
            Command::SdCardPath => Reply::Value(self.paths.sd_card.display().to_string()),
            Command::ImagePath => Reply::Value(self.paths.images.display().to_string()),
            Command::SetClipWindow { window } => match window {
                Some(window) => {
                    self.state.set_clip_window(*window);
                    Reply::Ack
                }
                None => Reply::Nak,
            },
            Command::SetDemosaic { enabled } => {
                self.state.set_demosaic(*enabled);
                Reply::Ack
            }
            Command::SetBinIterations { iterations } => {
                self.state.set_bin_iterations(*iterations);
                Reply::Ack
            }
            Command::ConfigureExposureTime { micros } => {
                configure_exposure_time(self.camera.as_mut(), *micros, tolerance, exposure_tries)?;
                Reply::Ack
            }
            Command::ConfigureAnalogGain { gain } => {
                configure_analog_gain(self.camera.as_mut(), *gain, tolerance, default_tries)?;
                Reply::Ack
            }
            Command::ConfigureWhiteBalance { gains } => {
                configure_white_balance(self.camera.as_mut(), *gains, tolerance, default_tries)?;
                Reply::Ack
            }
            Command::ConfigureScalerCrop { offset, size } => {
                let [width, height] = match size {
                    Some(size) => *size,
                    None => {
                        let geometry = self.camera.sensor_geometry();
                        [geometry.width, geometry.height]
                    }
                };
                let window = [offset[0], offset[1], width, height];
                configure_crop_window(self.camera.as_mut(), window, tolerance, default_tries)?;
                Reply::Ack
            }
            Command::ConfigureFrameRate { fps } => {
                configure_frame_rate(self.camera.as_mut(), *fps, tolerance, default_tries)?;
                Reply::Ack
            }
            Command::CaptureSequence(args) => {
                let request = self.capture_request(args);
                let summary = capture_exposure_sequence(self.camera.as_mut(), &self.state, &request, &self.convergence)?;
                debug!("Capture summary. frames: {:?}, log_file: {:?}", summary.frames, summary.log_file);
                Reply::Ack
            }
            Command::Archive(args) => {
                if archive_folder(args)? {
                    Reply::Ack
                } else {
                    Reply::Nak
                }
            }
            Command::Close => {
                info!("Close requested");
                Reply::Ack
            }
        };
        Ok(reply)
    }

    fn capture_request(&self, args: &CaptureSequenceArgs) -> CaptureSequenceRequest {
        CaptureSequenceRequest {
            prefix: args.prefix.clone(),
            store_path: self.paths.images.clone(),
            exposure_times: args.exposure_times.clone(),
            frames_per_setting: args.frames_per_setting,
            max_capture_time: args.max_capture_time,
            save_log: args.save_log,
        }
    }
}
