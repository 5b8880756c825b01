// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Extent discovery. For each extracted file, find the longest contiguous
//! byte ranges that also occur in the image, using the block hash index to
//! propose candidates and byte comparison to confirm them. Hash matches are
//! never trusted on their own; every byte of every reported extent has been
//! compared for equality.

use std::{
    io::{self, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    config::Config,
    hashing::{self, BlockHasher},
    index::ImageIndex,
    stream::{self, PSeekFile, Reopen},
    util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to hash file: {path:?}")]
    Hash {
        path: PathBuf,
        #[source]
        source: hashing::Error,
    },
    #[error("File {path:?} changed size: expected {expected} full blocks, found {actual}")]
    BlockCountMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("Short read in {path:?} at offset {offset}")]
    ShortRead { path: PathBuf, offset: u64 },
    #[error("Failed to read {path:?} at offset {offset}")]
    Read {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// A verified match: `length` bytes starting at `file_offset` in the
/// extracted file equal the bytes starting at `image_offset` in the image.
/// Both start offsets are block-aligned; the length need not be.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Extent {
    pub file_offset: u64,
    pub image_offset: u64,
    pub length: u64,
}

/// All verified extents for one extracted file, sorted by file offset and
/// non-overlapping in the file's offset space.
#[derive(Debug)]
pub struct FileExtents {
    pub path: PathBuf,
    pub extents: Vec<Extent>,
}

/// Shared discovery state. The index and config are read-only, so one finder
/// can serve any number of files, including concurrently.
pub struct ExtentFinder<'a> {
    index: &'a ImageIndex,
    image_path: &'a Path,
    image: &'a PSeekFile,
    config: Config,
}

impl<'a> ExtentFinder<'a> {
    pub fn new(
        index: &'a ImageIndex,
        image_path: &'a Path,
        image: &'a PSeekFile,
        config: Config,
    ) -> Self {
        Self {
            index,
            image_path,
            image,
            config,
        }
    }

    /// Find every extent of `file` that is worth copying from the target
    /// machine instead of embedding. Returns an empty list when nothing
    /// matches; that is an expected outcome, not an error.
    pub fn discover(
        &self,
        path: &Path,
        file: &PSeekFile,
        file_size: u64,
        cancel_signal: &AtomicBool,
    ) -> Result<Vec<Extent>> {
        let block_size = u64::from(self.config.block_size);
        let min_extent = self.config.min_extent_size;
        let image_size = self.index.image_size();

        if file_size < min_extent {
            return Ok(vec![]);
        }

        let file_hashes = self.hash_file(path, file, file_size, cancel_signal)?;

        let mut scan = FileScan::new(self, path, file, file_size)?;
        let mut extents = Vec::<Extent>::new();
        let mut file_pos = 0u64;
        let mut last_pct = 0u64;

        while file_pos + min_extent <= file_size {
            stream::check_cancel(cancel_signal).map_err(|e| Error::Read {
                path: path.to_owned(),
                offset: file_pos,
                source: e,
            })?;

            // Candidates only exist at block boundaries. After advancing past
            // a byte-ragged extent (or with an unaligned step size), skip
            // ahead to the next boundary.
            if file_pos % block_size != 0 {
                file_pos = util::round_up(file_pos, block_size);
                continue;
            }

            let pct = file_pos * 100 / file_size;
            if pct >= last_pct + 10 {
                trace!("{path:?}: {pct}% scanned");
                last_pct = pct;
            }

            let hash = file_hashes[(file_pos / block_size) as usize];
            let mut matched = None;

            for &image_offset in self.index.candidates(hash) {
                // Candidates are in ascending order, so once one is too close
                // to the end of the image to fit a minimum extent, they all
                // are.
                if image_offset + min_extent > image_size {
                    break;
                }

                let verified = scan.matching_prefix(file_pos, image_offset, min_extent)?;
                if verified == min_extent {
                    matched = Some(image_offset);
                    break;
                }
            }

            let Some(image_offset) = matched else {
                file_pos += self.config.step_size;
                continue;
            };

            let length = self.extend(&mut scan, &file_hashes, file_pos, image_offset)?;

            debug!(
                "{path:?}: extent at file offset {file_pos} matches image offset \
                 {image_offset} for {length} bytes",
            );

            extents.push(Extent {
                file_offset: file_pos,
                image_offset,
                length,
            });

            file_pos += length;
        }

        Ok(extents)
    }

    /// Hash every full block of the file into a dense vector indexed by block
    /// number.
    fn hash_file(
        &self,
        path: &Path,
        file: &PSeekFile,
        file_size: u64,
        cancel_signal: &AtomicBool,
    ) -> Result<Vec<u128>> {
        let reader = file
            .reopen()
            .map(|f| BufReader::with_capacity(128 * 1024, f))
            .map_err(|e| Error::Read {
                path: path.to_owned(),
                offset: 0,
                source: e,
            })?;

        let mut hasher = BlockHasher::new(reader, self.config.block_size);
        let mut hashes = vec![];

        loop {
            stream::check_cancel(cancel_signal).map_err(|e| Error::Read {
                path: path.to_owned(),
                offset: hashes.len() as u64 * u64::from(self.config.block_size),
                source: e,
            })?;

            let Some((_, hash)) = hasher.next_hash().map_err(|e| Error::Hash {
                path: path.to_owned(),
                source: e,
            })?
            else {
                break;
            };

            hashes.push(hash);
        }

        let expected = file_size / u64::from(self.config.block_size);
        if hashes.len() as u64 != expected {
            return Err(Error::BlockCountMismatch {
                path: path.to_owned(),
                expected,
                actual: hashes.len() as u64,
            });
        }

        Ok(hashes)
    }

    /// Grow a verified match forward as far as equality holds. The start
    /// offsets are fixed; only the length grows. Proceeds a block at a time
    /// while both cursors stay block-aligned (using the cached hashes to skip
    /// the byte comparison for blocks that cannot match), then byte-wise up
    /// to the first mismatch or either endpoint.
    fn extend(
        &self,
        scan: &mut FileScan,
        file_hashes: &[u128],
        file_offset: u64,
        image_offset: u64,
    ) -> Result<u64> {
        let block_size = u64::from(self.config.block_size);
        let image_size = self.index.image_size();
        let file_size = scan.file_size;
        let mut length = self.config.min_extent_size;

        while (file_offset + length) % block_size == 0
            && file_offset + length + block_size <= file_size
            && image_offset + length + block_size <= image_size
        {
            let file_hash = file_hashes[((file_offset + length) / block_size) as usize];
            let image_hash = self.index.hash_at(image_offset + length);

            if image_hash != Some(file_hash) {
                break;
            }

            // Equal hashes still require equal bytes. On a partial match
            // (hash collision), fall through to the byte-wise tail, which
            // will pick up the matching prefix of this block.
            let matched =
                scan.matching_prefix(file_offset + length, image_offset + length, block_size)?;
            if matched < block_size {
                break;
            }

            length += block_size;
        }

        let remaining = (file_size - (file_offset + length))
            .min(image_size - (image_offset + length));
        if remaining > 0 {
            length += scan.matching_prefix(file_offset + length, image_offset + length, remaining)?;
        }

        Ok(length)
    }
}

/// Per-file comparison state: private cursors into both sources and reusable
/// read buffers.
struct FileScan<'a> {
    image_path: &'a Path,
    file_path: &'a Path,
    image: PSeekFile,
    file: PSeekFile,
    file_size: u64,
    buf_image: Vec<u8>,
    buf_file: Vec<u8>,
}

impl<'a> FileScan<'a> {
    fn new(
        finder: &ExtentFinder<'a>,
        file_path: &'a Path,
        file: &PSeekFile,
        file_size: u64,
    ) -> Result<Self> {
        let reopen = |f: &PSeekFile, path: &Path| {
            f.reopen().map_err(|e| Error::Read {
                path: path.to_owned(),
                offset: 0,
                source: e,
            })
        };

        let buf_size = finder.config.write_chunk_size.min(file_size.max(1)) as usize;

        Ok(Self {
            image_path: finder.image_path,
            file_path,
            image: reopen(finder.image, finder.image_path)?,
            file: reopen(file, file_path)?,
            file_size,
            buf_image: vec![0u8; buf_size],
            buf_file: vec![0u8; buf_size],
        })
    }

    /// Compare up to `max_len` bytes of the file at `file_offset` against the
    /// image at `image_offset` and return the length of the equal prefix.
    /// Both ranges must lie within their sources' recorded sizes; running out
    /// of data early is a short read error.
    fn matching_prefix(
        &mut self,
        file_offset: u64,
        image_offset: u64,
        max_len: u64,
    ) -> Result<u64> {
        let mut matched = 0u64;

        while matched < max_len {
            let chunk = (max_len - matched).min(self.buf_file.len() as u64) as usize;

            read_exact_at(
                &mut self.file,
                self.file_path,
                file_offset + matched,
                &mut self.buf_file[..chunk],
            )?;
            read_exact_at(
                &mut self.image,
                self.image_path,
                image_offset + matched,
                &mut self.buf_image[..chunk],
            )?;

            if self.buf_file[..chunk] == self.buf_image[..chunk] {
                matched += chunk as u64;
            } else {
                let diff = self.buf_file[..chunk]
                    .iter()
                    .zip(&self.buf_image[..chunk])
                    .position(|(f, i)| f != i)
                    // The slices are unequal, so a differing pair exists.
                    .unwrap();

                matched += diff as u64;
                break;
            }
        }

        Ok(matched)
    }
}

fn read_exact_at(
    reader: &mut PSeekFile,
    path: &Path,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    let io = |e: io::Error| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::ShortRead {
                path: path.to_owned(),
                offset,
            }
        } else {
            Error::Read {
                path: path.to_owned(),
                offset,
                source: e,
            }
        }
    };

    reader.seek(SeekFrom::Start(offset)).map_err(io)?;
    reader.read_exact(buf).map_err(io)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{io::Write, sync::atomic::AtomicBool};

    use crate::index::ImageIndex;

    use super::*;

    const TEST_CONFIG: Config = Config {
        block_size: 16,
        min_extent_size: 64,
        step_size: 64,
        write_chunk_size: 16 * 1024 * 1024,
    };

    /// Deterministic junk that's extremely unlikely to contain repeated or
    /// all-zero blocks.
    fn test_bytes(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);

        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1103515245).wrapping_add(12345);
                (state >> 16) as u8
            })
            .collect()
    }

    fn pseek_file(data: &[u8]) -> PSeekFile {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(data).unwrap();

        PSeekFile::new(file)
    }

    fn build_index(data: &[u8]) -> ImageIndex {
        let cancel_signal = AtomicBool::new(false);

        ImageIndex::build(
            Path::new("image.img"),
            std::io::Cursor::new(data),
            data.len() as u64,
            TEST_CONFIG.block_size,
            &cancel_signal,
        )
        .unwrap()
    }

    fn discover(image_data: &[u8], file_data: &[u8]) -> Vec<Extent> {
        let cancel_signal = AtomicBool::new(false);
        let index = build_index(image_data);
        let image = pseek_file(image_data);
        let file = pseek_file(file_data);
        let finder = ExtentFinder::new(&index, Path::new("image.img"), &image, TEST_CONFIG);

        finder
            .discover(
                Path::new("file.bin"),
                &file,
                file_data.len() as u64,
                &cancel_signal,
            )
            .unwrap()
    }

    #[test]
    fn exact_overlay_in_middle() {
        let image = test_bytes(256, 1);
        let file = image[64..192].to_vec();

        assert_eq!(
            discover(&image, &file),
            vec![Extent {
                file_offset: 0,
                image_offset: 64,
                length: 128,
            }],
        );
    }

    #[test]
    fn no_match_anywhere() {
        let image = test_bytes(128, 2);
        let file = vec![0u8; 128];

        assert_eq!(discover(&image, &file), vec![]);
    }

    #[test]
    fn extension_past_minimum_with_byte_tail() {
        let image = test_bytes(512, 3);
        // Matches blocks 0..18 fully, then 12 more bytes of block 18.
        let file = image[..300].to_vec();

        assert_eq!(
            discover(&image, &file),
            vec![Extent {
                file_offset: 0,
                image_offset: 0,
                length: 300,
            }],
        );
    }

    #[test]
    fn misaligned_content_never_matches() {
        let image = test_bytes(256, 4);
        // Identical bytes, shifted by 5: no block-aligned hash can line up.
        let file = image[5..5 + 74].to_vec();

        assert_eq!(discover(&image, &file), vec![]);
    }

    #[test]
    fn multiple_extents_with_junk_between() {
        let image = test_bytes(256, 5);
        // Complementing the image's own bytes guarantees the filler differs
        // at every offset, so the first extent cannot extend into it.
        let filler = image[64..128].iter().map(|b| !b).collect::<Vec<_>>();
        let mut file = image[..64].to_vec();
        file.extend_from_slice(&filler);
        file.extend_from_slice(&image[192..256]);

        assert_eq!(
            discover(&image, &file),
            vec![
                Extent {
                    file_offset: 0,
                    image_offset: 0,
                    length: 64,
                },
                Extent {
                    file_offset: 128,
                    image_offset: 192,
                    length: 64,
                },
            ],
        );
    }

    #[test]
    fn step_advance_finds_later_match() {
        let image = test_bytes(256, 6);
        let mut file = vec![0u8; 64];
        file.extend_from_slice(&image[64..192]);

        assert_eq!(
            discover(&image, &file),
            vec![Extent {
                file_offset: 64,
                image_offset: 64,
                length: 128,
            }],
        );
    }

    #[test]
    fn file_smaller_than_minimum() {
        let image = test_bytes(256, 7);
        let file = image[..48].to_vec();

        assert_eq!(discover(&image, &file), vec![]);
    }

    #[test]
    fn extension_bounded_by_image_end() {
        let image = test_bytes(128, 8);
        // The file continues past where the image ends.
        let mut file = image.clone();
        file.extend_from_slice(&test_bytes(64, 9));

        assert_eq!(
            discover(&image, &file),
            vec![Extent {
                file_offset: 0,
                image_offset: 0,
                length: 128,
            }],
        );
    }

    #[test]
    fn earliest_image_offset_wins_for_duplicates() {
        // Image with the same 64-byte run at offsets 64 and 192.
        let mut image = test_bytes(64, 10);
        let repeated = test_bytes(64, 11);
        image.extend_from_slice(&repeated);
        image.extend_from_slice(&test_bytes(64, 12));
        image.extend_from_slice(&repeated);

        let extents = discover(&image, &repeated);

        assert_eq!(
            extents,
            vec![Extent {
                file_offset: 0,
                image_offset: 64,
                length: 64,
            }],
        );
    }
}
