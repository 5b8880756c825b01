// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Index over the image's block hashes. Built once from a single sequential
//! pass over the image and read-only afterwards, so it can be shared freely
//! across worker threads.

use std::{
    collections::HashMap,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use thiserror::Error;

use crate::{
    hashing::{self, BlockHasher},
    stream,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to hash image: {path:?}")]
    Hash {
        path: PathBuf,
        #[source]
        source: hashing::Error,
    },
    #[error("Image {path:?} changed size: expected {expected} full blocks, found {actual}")]
    BlockCountMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("Failed to index image: {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Mapping from block hash to every image offset where a block with that hash
/// was observed. Duplicate hashes keep all of their offsets, in ascending
/// order. With 4 KiB blocks, a 10 GiB image costs a few million entries,
/// which is fine to keep in memory.
#[derive(Debug)]
pub struct ImageIndex {
    block_size: u32,
    image_size: u64,
    // Dense hash-by-block-number view, used for cheap hash comparisons while
    // extending a match.
    hashes: Vec<u128>,
    by_hash: HashMap<u128, Vec<u64>>,
}

impl ImageIndex {
    /// Build the index by hashing every full block of the image. `image_size`
    /// is the size reported when the image was opened; if the data on disk no
    /// longer matches it, this fails.
    pub fn build(
        path: &Path,
        reader: impl Read,
        image_size: u64,
        block_size: u32,
        cancel_signal: &AtomicBool,
    ) -> Result<Self> {
        let expected = image_size / u64::from(block_size);
        let mut hashes = Vec::with_capacity(expected as usize);
        let mut by_hash = HashMap::<u128, Vec<u64>>::new();
        let mut hasher = BlockHasher::new(reader, block_size);

        loop {
            stream::check_cancel(cancel_signal).map_err(|e| Error::Io {
                path: path.to_owned(),
                source: e,
            })?;

            let Some((offset, hash)) = hasher.next_hash().map_err(|e| Error::Hash {
                path: path.to_owned(),
                source: e,
            })?
            else {
                break;
            };

            hashes.push(hash);
            // The hasher emits in ascending offset order, so each per-hash
            // list stays sorted without an explicit sort.
            by_hash.entry(hash).or_default().push(offset);
        }

        if hashes.len() as u64 != expected {
            return Err(Error::BlockCountMismatch {
                path: path.to_owned(),
                expected,
                actual: hashes.len() as u64,
            });
        }

        Ok(Self {
            block_size,
            image_size,
            hashes,
            by_hash,
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    pub fn num_blocks(&self) -> u64 {
        self.hashes.len() as u64
    }

    /// All image offsets whose block hash equals `hash`, in ascending order.
    /// Every one of these is a candidate match that still needs byte
    /// verification.
    pub fn candidates(&self, hash: u128) -> &[u64] {
        self.by_hash.get(&hash).map_or(&[], Vec::as_slice)
    }

    /// The hash of the full block starting at `offset`, if `offset` is
    /// block-aligned and a full block exists there.
    pub fn hash_at(&self, offset: u64) -> Option<u128> {
        if offset % u64::from(self.block_size) != 0 {
            return None;
        }

        let block = offset / u64::from(self.block_size);

        self.hashes.get(block as usize).copied()
    }
}
