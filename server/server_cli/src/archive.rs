use std::ffi::OsString;
use std::process::Command;
use std::time::Instant;

use anyhow::Context;
use log::info;
use server_shared::commands::ArchiveArgs;

const TAR: &str = "tar";
const PIGZ: &str = "--use-compress-program=pigz";

/// Arguments for `tar` to archive `args.folder` into `args.archive_file`.
pub fn tar_args(args: &ArchiveArgs) -> Vec<OsString> {
    let mut tar_args: Vec<OsString> = Vec::new();
    if args.compress {
        let compressor = if args.multicore { PIGZ } else { "-z" };
        tar_args.push(compressor.into());
    }
    tar_args.push("-cf".into());
    tar_args.push(args.archive_file.clone().into());

    if args.suppress_parents {
        tar_args.push("-C".into());
        tar_args.push(args.folder.clone().into());
        tar_args.push(".".into());
    } else {
        tar_args.push(args.folder.clone().into());
    }
    tar_args
}

/// Runs `tar`, returns whether it exited successfully.
pub fn archive_folder(args: &ArchiveArgs) -> anyhow::Result<bool> {
    let started_at = Instant::now();
    let tar_args = tar_args(args);

    let status = Command::new(TAR)
        .args(&tar_args)
        .status()
        .with_context(|| format!("running {} {:?}", TAR, tar_args))?;

    info!(
        "Archiving{} finished. folder: {:?}, archive: {:?}, status: {}, took: {:.3}s",
        if args.compress { "+Compression" } else { "" },
        args.folder,
        args.archive_file,
        status,
        started_at.elapsed().as_secs_f64()
    );
    Ok(status.success())
}
