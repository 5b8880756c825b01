// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::{
    cli::generate,
    config::{DEFAULT_BLOCK_SIZE, DEFAULT_MIN_EXTENT_SIZE, DEFAULT_WRITE_CHUNK_SIZE},
};

/// Generate a shell script that rebuilds an image file from extracted files.
///
/// The file list is read from stdin (or --input), one path per line. The
/// generated script is self-contained POSIX sh: it copies matching ranges out
/// of the extracted files on the target machine and fills the rest from data
/// embedded in the script itself.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Path to the original image file.
    pub image: PathBuf,

    /// Read the file list from FILE instead of stdin.
    #[arg(short, long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// File list entries are NUL-separated (like find -print0).
    #[arg(short = '0', long = "null")]
    pub null: bool,

    /// Write the script to FILE instead of stdout.
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Block size for hashing and matching.
    #[arg(short, long, value_name = "BYTES", default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: u32,

    /// Minimum length of a match worth copying from an extracted file.
    #[arg(short, long, value_name = "BYTES", default_value_t = DEFAULT_MIN_EXTENT_SIZE)]
    pub min_extent_size: u64,

    /// Distance to skip forward after a failed match [default: the minimum
    /// extent size].
    #[arg(short, long, value_name = "BYTES")]
    pub step_size: Option<u64>,

    /// I/O buffer size for byte verification and script emission.
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_WRITE_CHUNK_SIZE)]
    pub write_chunk_size: u64,

    /// Do not record file ownership.
    #[arg(long)]
    pub no_ownership: bool,

    /// Do not record POSIX ACLs.
    #[arg(long)]
    pub no_acl: bool,

    /// Do not record MD5 checksums.
    #[arg(long)]
    pub no_md5: bool,

    /// Do not record SHA-256 checksums.
    #[arg(long)]
    pub no_sha256: bool,

    /// Allow writing the binary script payload to a terminal.
    #[arg(long)]
    pub force_terminal_output: bool,

    /// Enable debug logging output.
    #[arg(short, long)]
    pub verbose: bool,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "imgstitch=debug"
    } else {
        "imgstitch=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    // The script goes to stdout; logging must never mix with it.
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .with(filter)
        .init();
}

pub fn main(logging_initialized: &AtomicBool, cancel_signal: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);
    logging_initialized.store(true, Ordering::SeqCst);

    generate::generate_main(&cli, cancel_signal)
}
