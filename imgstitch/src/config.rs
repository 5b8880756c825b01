// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const DEFAULT_MIN_EXTENT_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_WRITE_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error("Minimum extent size {min_extent_size} is smaller than block size {block_size}")]
    MinExtentTooSmall {
        min_extent_size: u64,
        block_size: u32,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Matching parameters, fixed for the lifetime of a run. There are no global
/// defaults baked into the matching code; everything is threaded through this
/// struct.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Size of the windows that are hashed and indexed. Matches can only begin
    /// at multiples of this within both the image and an extracted file.
    pub block_size: u32,
    /// Smallest match worth emitting as a copy. Anything shorter is cheaper to
    /// embed directly in the script.
    pub min_extent_size: u64,
    /// How far to skip forward in a file after a failed match attempt.
    pub step_size: u64,
    /// Read buffer size for byte verification and script emission.
    pub write_chunk_size: u64,
}

impl Config {
    pub fn new(
        block_size: u32,
        min_extent_size: u64,
        step_size: Option<u64>,
        write_chunk_size: u64,
    ) -> Result<Self> {
        let config = Self {
            block_size,
            min_extent_size,
            step_size: step_size.unwrap_or(min_extent_size),
            write_chunk_size,
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::NotPositive("Block size"));
        }
        if self.min_extent_size == 0 {
            return Err(Error::NotPositive("Minimum extent size"));
        }
        if self.step_size == 0 {
            return Err(Error::NotPositive("Step size"));
        }
        if self.write_chunk_size == 0 {
            return Err(Error::NotPositive("Write chunk size"));
        }
        if self.min_extent_size < u64::from(self.block_size) {
            return Err(Error::MinExtentTooSmall {
                min_extent_size: self.min_extent_size,
                block_size: self.block_size,
            });
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            min_extent_size: DEFAULT_MIN_EXTENT_SIZE,
            step_size: DEFAULT_MIN_EXTENT_SIZE,
            write_chunk_size: DEFAULT_WRITE_CHUNK_SIZE,
        }
    }
}
