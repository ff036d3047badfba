use std::path::PathBuf;

use clap::Parser;

/// Remote still-image sensor server
#[derive(Parser, Debug)]
#[command(
    name = "server_cli",
    version,
    about = "HQ camera - capture server"
)]
pub struct Args {
    /// Path to the config file
    #[arg(short = 'c', long = "config", value_name = "PATH", default_value_os = "config.ron")]
    pub config: PathBuf,

    /// Overrides the port from the config file
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Increase verbosity (-v, -vv)
    #[arg(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count
    )]
    pub verbosity_level: u8,
}

impl Args {
    pub fn log_filter(&self) -> &'static str {
        match self.verbosity_level {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
