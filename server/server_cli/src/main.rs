use std::fs;

use anyhow::Context;
use clap::Parser;
use log::info;
use server_common::camera::{CameraParameterPort, CameraSource};
use server_vision::simulated_capture::SimulatedCamera;
use tokio::net::TcpListener;
use tokio::{select, signal};

use crate::cli::Args;
use crate::dispatcher::{BoxedCamera, Dispatcher};
use crate::networking::SessionLimits;

mod archive;
mod cli;
mod config;
mod dispatcher;
mod networking;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.log_filter())).init();

    let mut config = config::load(&args.config)?;
    if let Some(port) = args.port {
        config.port = port;
    }

    fs::create_dir_all(&config.paths.images)
        .with_context(|| format!("creating image directory {:?}", config.paths.images))?;

    let camera = make_camera(&config.camera)?;
    info!("Camera: {}", camera.identify());

    let dispatcher = Dispatcher::new(
        camera,
        config.image.server_state(),
        config.paths.clone(),
        config.convergence.settings(),
    );
    let state = dispatcher.state();
    info!(
        "Image settings. clip_window: {}, demosaic: {}, bin_iterations: {}",
        state.clip_window(),
        state.demosaic(),
        state.bin_iterations()
    );

    let limits = SessionLimits {
        max_message_length: config.max_message_length,
        max_consecutive_failures: config.max_consecutive_failures,
    };

    let listener = TcpListener::bind((config.listen_address.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.listen_address, config.port))?;

    let session_handle = tokio::spawn(networking::serve(listener, dispatcher, limits));

    select! {
        result = session_handle => {
            let end = result??;
            info!("Server loop finished. reason: {:?}", end);
        }
        _ = signal::ctrl_c() => {
            info!("Shut down requested, exiting");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn make_camera(source: &CameraSource) -> anyhow::Result<BoxedCamera> {
    match source {
        CameraSource::Simulated(config) => Ok(Box::new(SimulatedCamera::build(config)?)),
        other => anyhow::bail!("Unsupported camera source: {:?}", other),
    }
}
