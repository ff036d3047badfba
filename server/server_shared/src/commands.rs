use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use server_common::state::{ClipWindow, ClipWindowError, decode_bool};
use thiserror::Error;

pub const IDENTIFY: &str = "IDN?";
pub const ECHO: &str = "SRV:ECHO";
pub const RAMDISK_PATH: &str = "SRV:PATH:RDDIR?";
pub const SD_CARD_PATH: &str = "SRV:PATH:SDDIR?";
pub const IMAGE_PATH: &str = "SRV:PATH:IMDIR?";
pub const CLIP_WINDOW: &str = "SRV:IMG:BCLP";
pub const DEMOSAIC: &str = "SRV:IMG:DBAY";
pub const SHRINK: &str = "SRV:IMG:SRNK";
pub const EXPOSURE_TIME: &str = "CAM:CONF:SS";
pub const FRAME_RATE: &str = "CAM:CONF:FR";
pub const ANALOG_GAIN: &str = "CAM:CONF:AG";
pub const WHITE_BALANCE: &str = "CAM:CONF:AWB";
pub const SCALER_CROP: &str = "CAM:CONF:SCLCRP";
pub const CAPTURE_SEQUENCE: &str = "CAP:SEQFET";
pub const ARCHIVE: &str = "SRV:ARCHV";
pub const CLOSE: &str = "SRV:CLOSE";

const IDENTIFIERS: [&str; 16] = [
    IDENTIFY,
    ECHO,
    RAMDISK_PATH,
    SD_CARD_PATH,
    IMAGE_PATH,
    CLIP_WINDOW,
    DEMOSAIC,
    SHRINK,
    EXPOSURE_TIME,
    FRAME_RATE,
    ANALOG_GAIN,
    WHITE_BALANCE,
    SCALER_CROP,
    CAPTURE_SEQUENCE,
    ARCHIVE,
    CLOSE,
];

/// A decoded protocol request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Identify,
    Echo { payload: Vec<String> },
    RamDiskPath,
    SdCardPath,
    ImagePath,
    /// `None` when the client sent a value list that is neither `w:h` nor `x:y:w:h`
    SetClipWindow { window: Option<ClipWindow> },
    SetDemosaic { enabled: bool },
    SetBinIterations { iterations: i64 },
    ConfigureExposureTime { micros: u32 },
    ConfigureAnalogGain { gain: f64 },
    ConfigureWhiteBalance { gains: [f64; 2] },
    /// `size` of `None` selects the full sensor
    ConfigureScalerCrop { offset: [u32; 2], size: Option<[u32; 2]> },
    ConfigureFrameRate { fps: f64 },
    CaptureSequence(CaptureSequenceArgs),
    Archive(ArchiveArgs),
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSequenceArgs {
    pub prefix: String,
    /// microseconds, in capture order
    pub exposure_times: Vec<u32>,
    pub frames_per_setting: u32,
    /// seconds a single frame capture is expected to take at most
    pub max_capture_time: f64,
    pub save_log: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveArgs {
    pub folder: PathBuf,
    pub archive_file: PathBuf,
    pub compress: bool,
    pub multicore: bool,
    pub suppress_parents: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandParseError {
    #[error("unknown command: {0:?}")]
    Unknown(String),
    #[error("missing argument. command: {command}, argument: {argument}")]
    MissingArgument { command: &'static str, argument: &'static str },
    #[error("invalid argument. command: {command}, argument: {argument}, value: {value:?}")]
    InvalidArgument {
        command: &'static str,
        argument: &'static str,
        value: String,
    },
}

impl Command {
    pub fn identifier(&self) -> &'static str {
        match self {
            Command::Identify => IDENTIFY,
            Command::Echo { .. } => ECHO,
            Command::RamDiskPath => RAMDISK_PATH,
            Command::SdCardPath => SD_CARD_PATH,
            Command::ImagePath => IMAGE_PATH,
            Command::SetClipWindow { .. } => CLIP_WINDOW,
            Command::SetDemosaic { .. } => DEMOSAIC,
            Command::SetBinIterations { .. } => SHRINK,
            Command::ConfigureExposureTime { .. } => EXPOSURE_TIME,
            Command::ConfigureAnalogGain { .. } => ANALOG_GAIN,
            Command::ConfigureWhiteBalance { .. } => WHITE_BALANCE,
            Command::ConfigureScalerCrop { .. } => SCALER_CROP,
            Command::ConfigureFrameRate { .. } => FRAME_RATE,
            Command::CaptureSequence(_) => CAPTURE_SEQUENCE,
            Command::Archive(_) => ARCHIVE,
            Command::Close => CLOSE,
        }
    }
}

impl FromStr for Command {
    type Err = CommandParseError;

    /// Whitespace separated tokens, the first one being the command identifier.
    fn from_str(message: &str) -> Result<Self, Self::Err> {
        let mut tokens = message.split_whitespace();
        let token = tokens.next().unwrap_or_default();
        let Some(identifier) = IDENTIFIERS
            .iter()
            .copied()
            .find(|identifier| *identifier == token)
        else {
            return Err(CommandParseError::Unknown(token.to_string()));
        };
        let mut args = Args {
            command: identifier,
            tokens,
        };

        let command = match identifier {
            IDENTIFY => Command::Identify,
            ECHO => Command::Echo {
                payload: args.tokens.by_ref().map(str::to_string).collect(),
            },
            RAMDISK_PATH => Command::RamDiskPath,
            SD_CARD_PATH => Command::SdCardPath,
            IMAGE_PATH => Command::ImagePath,
            CLIP_WINDOW => {
                let value = args.required("window")?;
                let window = match value.parse::<ClipWindow>() {
                    Ok(window) => Some(window),
                    Err(ClipWindowError::ValueCount(_)) => None,
                    Err(ClipWindowError::Value(_)) => return Err(args.invalid("window", value)),
                };
                Command::SetClipWindow { window }
            }
            DEMOSAIC => Command::SetDemosaic {
                enabled: decode_bool(args.required("enabled")?),
            },
            SHRINK => Command::SetBinIterations {
                iterations: args.parse("iterations")?,
            },
            EXPOSURE_TIME => Command::ConfigureExposureTime {
                micros: args.parse("exposure_time")?,
            },
            ANALOG_GAIN => Command::ConfigureAnalogGain {
                gain: args.parse_or("gain", 1.0)?,
            },
            WHITE_BALANCE => {
                let gains = match args.optional() {
                    Some(value) => args.parse_pair::<f64>("gains", value)?,
                    None => [1.0, 1.0],
                };
                Command::ConfigureWhiteBalance { gains }
            }
            SCALER_CROP => {
                let offset = match args.optional() {
                    Some(value) => args.parse_pair::<u32>("offset", value)?,
                    None => [0, 0],
                };
                let size = match args.optional() {
                    Some(value) => Some(args.parse_pair::<u32>("size", value)?),
                    None => None,
                };
                Command::ConfigureScalerCrop { offset, size }
            }
            FRAME_RATE => Command::ConfigureFrameRate {
                fps: args.parse_or("fps", 10.0)?,
            },
            CAPTURE_SEQUENCE => {
                let prefix = args.required("prefix")?.to_string();
                let exposure_times_arg = args.required("exposure_times")?;
                let exposure_times = exposure_times_arg
                    .split(':')
                    .map(str::parse::<u32>)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| args.invalid("exposure_times", exposure_times_arg))?;

                Command::CaptureSequence(CaptureSequenceArgs {
                    prefix,
                    exposure_times,
                    frames_per_setting: args.parse("frames")?,
                    max_capture_time: args.parse("max_time")?,
                    save_log: decode_bool(args.required("save_log")?),
                })
            }
            ARCHIVE => {
                Command::Archive(ArchiveArgs {
                    folder: PathBuf::from(args.required("folder")?),
                    archive_file: PathBuf::from(args.required("archive_file")?),
                    compress: decode_bool(args.required("compress")?),
                    multicore: decode_bool(args.required("multicore")?),
                    suppress_parents: decode_bool(args.required("suppress_parents")?),
                })
            }
            CLOSE => Command::Close,
            _ => return Err(CommandParseError::Unknown(token.to_string())),
        };

        Ok(command)
    }
}

struct Args<I> {
    command: &'static str,
    tokens: I,
}

impl<'a, I: Iterator<Item = &'a str>> Args<I> {
    fn optional(&mut self) -> Option<&'a str> {
        self.tokens.next()
    }

    fn required(&mut self, argument: &'static str) -> Result<&'a str, CommandParseError> {
        self.tokens
            .next()
            .ok_or(CommandParseError::MissingArgument {
                command: self.command,
                argument,
            })
    }

    fn parse<T: FromStr>(&mut self, argument: &'static str) -> Result<T, CommandParseError> {
        let value = self.required(argument)?;
        value
            .parse()
            .map_err(|_| self.invalid(argument, value))
    }

    fn parse_or<T: FromStr>(&mut self, argument: &'static str, default: T) -> Result<T, CommandParseError> {
        match self.optional() {
            Some(value) => value
                .parse()
                .map_err(|_| self.invalid(argument, value)),
            None => Ok(default),
        }
    }

    /// `a:b`
    fn parse_pair<T: FromStr>(&self, argument: &'static str, value: &str) -> Result<[T; 2], CommandParseError> {
        let Some((first, second)) = value.split_once(':') else {
            return Err(self.invalid(argument, value));
        };
        match (first.parse(), second.parse()) {
            (Ok(first), Ok(second)) => Ok([first, second]),
            _ => Err(self.invalid(argument, value)),
        }
    }

    fn invalid(&self, argument: &'static str, value: &str) -> CommandParseError {
        CommandParseError::InvalidArgument {
            command: self.command,
            argument,
            value: value.to_string(),
        }
    }
}

/// The single line sent back for every request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ack,
    Nak,
    UnknownCommand,
    Value(String),
}

impl Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Ack => f.write_str("ack"),
            Reply::Nak => f.write_str("nak"),
            Reply::UnknownCommand => f.write_str("unknown command"),
            Reply::Value(value) => f.write_str(value),
        }
    }
}
