// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Metadata collection for extracted files. The matching code never looks at
//! any of this; it is recorded at generation time and replayed verbatim by
//! the emitted script to verify and restore the files on the target machine.

use std::{
    fs::File,
    io::{self, BufReader},
    path::{Path, PathBuf},
    process::Command,
    sync::atomic::AtomicBool,
};

use md5::Md5;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::stream::{self, PSeekFile, Reopen};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to open file: {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to stat file: {path:?}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Not a regular file: {path:?}")]
    NotAFile { path: PathBuf },
    #[error("Failed to checksum file: {path:?}")]
    Checksum {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Which pieces of metadata to record. Everything not recorded is simply
/// absent from the emitted script.
#[derive(Clone, Copy, Debug)]
pub struct MetadataOptions {
    pub ownership: bool,
    pub acl: bool,
    pub md5: bool,
    pub sha256: bool,
}

impl Default for MetadataOptions {
    fn default() -> Self {
        Self {
            ownership: true,
            acl: true,
            md5: true,
            sha256: true,
        }
    }
}

/// Everything recorded about one extracted file. Passed through to the
/// script emitter untouched.
#[derive(Clone, Debug)]
pub struct FileMetadata {
    /// The path exactly as it appeared in the input list. The emitted script
    /// resolves it relative to its tree root at runtime.
    pub path: PathBuf,
    pub size: u64,
    pub mode: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    pub acl: Option<String>,
    pub md5: Option<[u8; 16]>,
    pub sha256: Option<[u8; 32]>,
}

/// Open `path` and record its metadata. The returned handle is the one the
/// checksums were computed from; discovery should read through it too so a
/// file swapped out mid-run shows up as a size mismatch instead of silently
/// producing a bad script.
pub fn collect(
    path: &Path,
    options: &MetadataOptions,
    cancel_signal: &AtomicBool,
) -> Result<(FileMetadata, PSeekFile)> {
    let file = File::open(path).map_err(|e| Error::Open {
        path: path.to_owned(),
        source: e,
    })?;
    let stat = file.metadata().map_err(|e| Error::Stat {
        path: path.to_owned(),
        source: e,
    })?;

    if !stat.is_file() {
        return Err(Error::NotAFile {
            path: path.to_owned(),
        });
    }

    let file = PSeekFile::new(file);
    let size = stat.len();

    #[cfg(unix)]
    let (mode, uid, gid, mtime_secs, mtime_nanos) = {
        use std::os::unix::fs::MetadataExt;

        (
            stat.mode() & 0o7777,
            options.ownership.then(|| stat.uid()),
            options.ownership.then(|| stat.gid()),
            stat.mtime(),
            stat.mtime_nsec() as u32,
        )
    };

    #[cfg(not(unix))]
    let (mode, uid, gid, mtime_secs, mtime_nanos) = {
        let mtime = stat
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .unwrap_or_default();

        (0o644u32, None, None, mtime.as_secs() as i64, mtime.subsec_nanos())
    };

    let (md5, sha256) = if options.md5 || options.sha256 {
        checksum(path, &file, size, options, cancel_signal)?
    } else {
        (None, None)
    };

    let acl = if options.acl { read_acl(path) } else { None };

    Ok((
        FileMetadata {
            path: path.to_owned(),
            size,
            mode,
            uid,
            gid,
            mtime_secs,
            mtime_nanos,
            acl,
            md5,
            sha256,
        },
        file,
    ))
}

/// Compute the requested whole-file digests in a single streaming pass.
fn checksum(
    path: &Path,
    file: &PSeekFile,
    size: u64,
    options: &MetadataOptions,
    cancel_signal: &AtomicBool,
) -> Result<(Option<[u8; 16]>, Option<[u8; 32]>)> {
    let reader = file
        .reopen()
        .map(|f| BufReader::with_capacity(128 * 1024, f))
        .map_err(|e| Error::Open {
            path: path.to_owned(),
            source: e,
        })?;

    let mut md5 = options.md5.then(Md5::new);
    let mut sha256 = options.sha256.then(Sha256::new);

    stream::copy_n_inspect(
        reader,
        io::sink(),
        size,
        |buf| {
            if let Some(h) = &mut md5 {
                h.update(buf);
            }
            if let Some(h) = &mut sha256 {
                h.update(buf);
            }
        },
        cancel_signal,
    )
    .map_err(|e| Error::Checksum {
        path: path.to_owned(),
        source: e,
    })?;

    Ok((
        md5.map(|h| h.finalize().into()),
        sha256.map(|h| h.finalize().into()),
    ))
}

/// Capture the file's POSIX ACL as text, in the form `setfacl --set-file=-`
/// accepts. A system without getfacl just doesn't get ACLs recorded; that's
/// not worth failing the run over.
fn read_acl(path: &Path) -> Option<String> {
    let output = match Command::new("getfacl")
        .arg("-c")
        .arg("--absolute-names")
        .arg("--")
        .arg(path)
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            debug!("getfacl unavailable; not recording ACL for {path:?}: {e}");
            return None;
        }
    };

    if !output.status.success() {
        warn!("getfacl failed for {path:?}; not recording ACL");
        return None;
    }

    let text = String::from_utf8(output.stdout).ok()?;
    let trimmed = text.trim();

    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}
