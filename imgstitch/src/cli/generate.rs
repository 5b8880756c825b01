// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, BufReader, BufWriter, IsTerminal, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use anyhow::{Context, Result, bail};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::{
    cli::args::Cli,
    config::Config,
    extent::{Extent, ExtentFinder, FileExtents},
    filelist,
    index::ImageIndex,
    metadata::{self, FileMetadata, MetadataOptions},
    plan,
    script::{self, ScriptParams},
    stream::{self, HashingReader, PSeekFile, Reopen},
    util::{self, NumBytes},
};

/// Index the image and, unless disabled, checksum it in the same pass. An
/// image smaller than the minimum extent size can never contain a match, so
/// it isn't indexed at all.
fn build_index(
    image_path: &Path,
    image: &PSeekFile,
    image_size: u64,
    config: &Config,
    want_sha256: bool,
    cancel_signal: &AtomicBool,
) -> Result<(Option<ImageIndex>, Option<[u8; 32]>)> {
    let reader = image
        .reopen()
        .map(|f| BufReader::with_capacity(128 * 1024, f))
        .with_context(|| format!("Failed to open image: {image_path:?}"))?;

    if image_size < config.min_extent_size {
        debug!("Image is smaller than the minimum extent size; skipping indexing");

        let sha256 = if want_sha256 {
            let mut hasher = Sha256::new();

            stream::copy_n_inspect(
                reader,
                io::sink(),
                image_size,
                |buf| hasher.update(buf),
                cancel_signal,
            )
            .with_context(|| format!("Failed to checksum image: {image_path:?}"))?;

            Some(hasher.finalize().into())
        } else {
            None
        };

        return Ok((None, sha256));
    }

    if want_sha256 {
        let mut reader = HashingReader::new(reader, Sha256::new());
        let index = ImageIndex::build(
            image_path,
            &mut reader,
            image_size,
            config.block_size,
            cancel_signal,
        )?;

        // The index stops hashing at the last full block, but its reads have
        // already consumed the partial tail. Drain whatever might be left so
        // the digest covers every byte.
        io::copy(&mut reader, &mut io::sink())
            .with_context(|| format!("Failed to checksum image: {image_path:?}"))?;

        let (_, hasher) = reader.finish();

        Ok((Some(index), Some(hasher.finalize().into())))
    } else {
        let index = ImageIndex::build(
            image_path,
            reader,
            image_size,
            config.block_size,
            cancel_signal,
        )?;

        Ok((Some(index), None))
    }
}

fn read_file_list(cli: &Cli) -> Result<Vec<PathBuf>> {
    let paths = match &cli.input {
        Some(path) => {
            let reader = File::open(path)
                .map(BufReader::new)
                .with_context(|| format!("Failed to open file list: {path:?}"))?;

            filelist::read_file_list(reader, cli.null)
                .with_context(|| format!("Failed to read file list: {path:?}"))?
        }
        None => filelist::read_file_list(io::stdin().lock(), cli.null)
            .context("Failed to read file list from stdin")?,
    };

    Ok(paths)
}

pub fn generate_main(cli: &Cli, cancel_signal: &AtomicBool) -> Result<()> {
    let config = Config::new(
        cli.block_size,
        cli.min_extent_size,
        cli.step_size,
        cli.write_chunk_size,
    )
    .context("Invalid configuration")?;

    // The script ends in raw binary data. Never dump that onto a terminal
    // unless the user insists.
    if cli.output.is_none() && io::stdout().is_terminal() && !cli.force_terminal_output {
        bail!(
            "Refusing to write binary data to a terminal. Redirect stdout, \
             use -o, or pass --force-terminal-output."
        );
    }

    let image = File::open(&cli.image)
        .map(PSeekFile::new)
        .with_context(|| format!("Failed to open image: {:?}", cli.image))?;
    let image_size = image
        .len()
        .with_context(|| format!("Failed to stat image: {:?}", cli.image))?;

    let paths = read_file_list(cli)?;

    info!(
        "Indexing {:?} ({:?})",
        cli.image,
        NumBytes(image_size),
    );

    let (index, image_sha256) = build_index(
        &cli.image,
        &image,
        image_size,
        &config,
        !cli.no_sha256,
        cancel_signal,
    )?;

    let metadata_options = MetadataOptions {
        ownership: !cli.no_ownership,
        acl: !cli.no_acl,
        md5: !cli.no_md5,
        sha256: !cli.no_sha256,
    };

    info!("Scanning {} extracted files", paths.len());

    // Each file's discovery is independent. The plan builder sorts its inputs,
    // so the output doesn't depend on scheduling.
    let results = paths
        .par_iter()
        .map(|path| -> Result<(FileMetadata, Vec<Extent>)> {
            let (file_metadata, file) = metadata::collect(path, &metadata_options, cancel_signal)?;

            let extents = match &index {
                Some(index) => {
                    info!("Matching {path:?} ({:?})", NumBytes(file_metadata.size));

                    let finder = ExtentFinder::new(index, &cli.image, &image, config);
                    finder.discover(path, &file, file_metadata.size, cancel_signal)?
                }
                None => vec![],
            };

            Ok((file_metadata, extents))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut files = Vec::with_capacity(results.len());
    let mut file_extents = Vec::with_capacity(results.len());

    for (file_metadata, extents) in results {
        file_extents.push(FileExtents {
            path: file_metadata.path.clone(),
            extents,
        });
        files.push(file_metadata);
    }

    info!("Building reconstruction plan");

    let plan = plan::build(image_size, &file_extents);
    let files_used = plan
        .segments
        .iter()
        .filter_map(|s| match s {
            plan::Segment::Copy { path, .. } => Some(path),
            plan::Segment::Literal { .. } => None,
        })
        .collect::<std::collections::HashSet<_>>()
        .len();

    info!(
        "Plan has {} segments: {:?} copied from {} files, {:?} embedded",
        plan.segments.len(),
        NumBytes(plan.copied_bytes()),
        files_used,
        NumBytes(plan.literal_bytes()),
    );

    let image_name = cli
        .image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| cli.image.to_string_lossy().into_owned());
    let params = ScriptParams {
        image_name: &image_name,
        image_sha256,
        block_size: config.block_size,
    };

    match &cli.output {
        Some(path) => {
            info!("Writing script to {path:?}");

            let mut temp = NamedTempFile::new_in(util::parent_path(path))
                .with_context(|| format!("Failed to create temporary file for: {path:?}"))?;

            script::emit(
                BufWriter::new(temp.as_file_mut()),
                &cli.image,
                &image,
                &plan,
                &files,
                &params,
                cancel_signal,
            )?;

            #[cfg(unix)]
            {
                use std::{fs::Permissions, os::unix::fs::PermissionsExt};

                temp.as_file()
                    .set_permissions(Permissions::from_mode(0o755))
                    .with_context(|| format!("Failed to make script executable: {path:?}"))?;
            }

            temp.persist(path)
                .with_context(|| format!("Failed to move temporary file to: {path:?}"))?;
        }
        None => {
            let mut stdout = io::stdout().lock();

            script::emit(
                BufWriter::new(&mut stdout),
                &cli.image,
                &image,
                &plan,
                &files,
                &params,
                cancel_signal,
            )?;

            stdout.flush().context("Failed to flush stdout")?;
        }
    }

    info!("Processed {} files", paths.len());

    Ok(())
}
