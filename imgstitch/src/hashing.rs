// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Fixed-size block hashing. Both the image and every extracted file are
//! hashed the same way: disjoint blocks at multiples of the block size, each
//! reduced to a 128-bit MurmurHash3 digest. A trailing partial block is never
//! hashed; its bytes can only ever be emitted as literals.

use std::io::{self, Read};

use thiserror::Error;

/// Seed for all block hashes. Must be identical for the image and the
/// extracted files or no hash will ever match.
pub const HASH_SEED: u32 = 0;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read block at offset {offset}")]
    BlockRead {
        offset: u64,
        #[source]
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Hash a single full block.
pub fn hash_block(block: &[u8]) -> u128 {
    // Reading from an in-memory slice cannot fail.
    murmur3::murmur3_x64_128(&mut &block[..], HASH_SEED).unwrap()
}

/// Streaming block hasher over any reader. Yields `(offset, hash)` records in
/// ascending offset order and stops as soon as fewer bytes than a full block
/// remain.
pub struct BlockHasher<R> {
    inner: R,
    block_size: usize,
    offset: u64,
    buf: Vec<u8>,
    done: bool,
}

impl<R: Read> BlockHasher<R> {
    pub fn new(inner: R, block_size: u32) -> Self {
        let block_size = block_size as usize;

        Self {
            inner,
            block_size,
            offset: 0,
            buf: vec![0u8; block_size],
            done: false,
        }
    }

    /// Read the next full block and return its `(offset, hash)` record.
    /// Returns `None` at EOF or when only a partial block remains.
    pub fn next_hash(&mut self) -> Result<Option<(u64, u128)>> {
        if self.done {
            return Ok(None);
        }

        let mut filled = 0;

        while filled < self.block_size {
            let n = self
                .inner
                .read(&mut self.buf[filled..])
                .map_err(|e| Error::BlockRead {
                    offset: self.offset + filled as u64,
                    source: e,
                })?;
            if n == 0 {
                break;
            }

            filled += n;
        }

        if filled < self.block_size {
            self.done = true;
            return Ok(None);
        }

        let record = (self.offset, hash_block(&self.buf));
        self.offset += self.block_size as u64;

        Ok(Some(record))
    }
}

impl<R: Read> Iterator for BlockHasher<R> {
    type Item = Result<(u64, u128)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_hash().transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn hashes_of(data: &[u8], block_size: u32) -> Vec<(u64, u128)> {
        BlockHasher::new(Cursor::new(data), block_size)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn empty_input() {
        assert!(hashes_of(b"", 16).is_empty());
    }

    #[test]
    fn partial_tail_is_ignored() {
        let data = vec![0xaau8; 40];
        let records = hashes_of(&data, 16);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, 0);
        assert_eq!(records[1].0, 16);
    }

    #[test]
    fn input_smaller_than_block() {
        assert!(hashes_of(&[0u8; 15], 16).is_empty());
    }

    #[test]
    fn exact_multiple_of_block() {
        let records = hashes_of(&[0u8; 48], 16);
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn equal_blocks_hash_equal() {
        let mut data = vec![0x11u8; 16];
        data.extend_from_slice(&[0x22u8; 16]);
        data.extend_from_slice(&[0x11u8; 16]);

        let records = hashes_of(&data, 16);

        assert_eq!(records[0].1, records[2].1);
        assert_ne!(records[0].1, records[1].1);
    }

    #[test]
    fn matches_direct_hash() {
        let block = b"0123456789abcdef";
        let records = hashes_of(block, 16);

        assert_eq!(records[0].1, hash_block(block));
    }
}
