// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Reconstruction plan. Merges the extents discovered across every extracted
//! file into a single ordered sequence of segments that covers each byte of
//! the image exactly once. Longer extents win conflicts because they displace
//! more embedded data from the script.

use std::{
    cmp::Reverse,
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::extent::{Extent, FileExtents};

/// One step of the reconstruction. Segment order is ascending image offset
/// with no gaps and no overlap.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Segment {
    /// Bytes that must be embedded in the script because no extracted file
    /// provides them.
    Literal { image_offset: u64, length: u64 },
    /// Bytes read out of an extracted file on the target machine at
    /// reconstruction time.
    Copy {
        path: PathBuf,
        file_offset: u64,
        image_offset: u64,
        length: u64,
    },
}

impl Segment {
    pub fn image_offset(&self) -> u64 {
        match self {
            Self::Literal { image_offset, .. } => *image_offset,
            Self::Copy { image_offset, .. } => *image_offset,
        }
    }

    pub fn length(&self) -> u64 {
        match self {
            Self::Literal { length, .. } => *length,
            Self::Copy { length, .. } => *length,
        }
    }
}

#[derive(Debug)]
pub struct Plan {
    pub image_size: u64,
    pub segments: Vec<Segment>,
}

impl Plan {
    /// Total bytes that end up embedded in the script.
    pub fn literal_bytes(&self) -> u64 {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal { .. }))
            .map(Segment::length)
            .sum()
    }

    /// Total bytes served by extracted files at reconstruction time.
    pub fn copied_bytes(&self) -> u64 {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Copy { .. }))
            .map(Segment::length)
            .sum()
    }
}

/// Sorted, non-overlapping interval list over image offsets with a
/// binary-search overlap check. Expected input sizes don't justify anything
/// fancier.
#[derive(Default)]
struct IntervalSet {
    // Half-open (start, end) ranges, sorted by start.
    ranges: Vec<(u64, u64)>,
}

impl IntervalSet {
    /// Insert `[start, end)` if it does not overlap an existing range.
    /// Returns whether the insert happened.
    fn try_insert(&mut self, start: u64, end: u64) -> bool {
        let idx = self.ranges.partition_point(|r| r.0 < start);

        if idx > 0 && self.ranges[idx - 1].1 > start {
            return false;
        }
        if idx < self.ranges.len() && self.ranges[idx].0 < end {
            return false;
        }

        self.ranges.insert(idx, (start, end));

        true
    }
}

/// Build the reconstruction plan for an image of `image_size` bytes from the
/// per-file extent lists. The output is fully determined by the inputs: ties
/// between equally long extents go to the lowest image offset, then the
/// lexicographically smallest path, so discovery order (including parallel
/// discovery) never affects the result.
pub fn build(image_size: u64, files: &[FileExtents]) -> Plan {
    let mut pool = files
        .iter()
        .flat_map(|f| f.extents.iter().map(move |e| (f.path.as_path(), e)))
        .collect::<Vec<_>>();

    pool.sort_by_key(|&(path, extent)| {
        (
            Reverse(extent.length),
            extent.image_offset,
            path,
            extent.file_offset,
        )
    });

    let mut claimed = IntervalSet::default();
    let mut accepted = Vec::<(&Path, &Extent)>::new();

    for (path, extent) in pool {
        debug_assert!(extent.image_offset + extent.length <= image_size);

        if claimed.try_insert(extent.image_offset, extent.image_offset + extent.length) {
            accepted.push((path, extent));
        } else {
            debug!(
                "Dropping extent of {path:?} at image offset {}: image range already covered",
                extent.image_offset,
            );
        }
    }

    accepted.sort_by_key(|&(_, extent)| extent.image_offset);

    let mut segments = Vec::<Segment>::new();
    let mut cursor = 0u64;

    for (path, extent) in accepted {
        if extent.image_offset > cursor {
            segments.push(Segment::Literal {
                image_offset: cursor,
                length: extent.image_offset - cursor,
            });
        }

        segments.push(Segment::Copy {
            path: path.to_owned(),
            file_offset: extent.file_offset,
            image_offset: extent.image_offset,
            length: extent.length,
        });

        cursor = extent.image_offset + extent.length;
    }

    if cursor < image_size {
        segments.push(Segment::Literal {
            image_offset: cursor,
            length: image_size - cursor,
        });
    }

    debug_assert_eq!(
        segments.iter().map(Segment::length).sum::<u64>(),
        image_size,
    );

    Plan {
        image_size,
        segments,
    }
}
