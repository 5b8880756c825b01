// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, path::Path};

use num_traits::PrimInt;

/// A small wrapper to format a number as a size in bytes.
#[derive(Clone, Copy)]
pub struct NumBytes<T: PrimInt>(pub T);

impl<T: PrimInt + fmt::Debug> fmt::Debug for NumBytes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == T::one() {
            write!(f, "<{:?} byte>", self.0)
        } else {
            write!(f, "<{:?} bytes>", self.0)
        }
    }
}

/// Get the non-empty parent of a path. If the path has no parent in the string,
/// then `.` is returned. This does not perform any filesystem operations.
pub fn parent_path(path: &Path) -> &Path {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            return parent;
        }
    }

    Path::new(".")
}

/// Round up to the next multiple of the page size.
pub fn round_up<N: PrimInt>(offset: N, page_size: N) -> N {
    let r = offset % page_size;
    if r == N::zero() {
        offset
    } else {
        offset + (page_size - r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_multiples() {
        assert_eq!(round_up(0u64, 4096), 0);
        assert_eq!(round_up(1u64, 4096), 4096);
        assert_eq!(round_up(4096u64, 4096), 4096);
        assert_eq!(round_up(4097u64, 4096), 8192);
    }

    #[test]
    fn parent_of_bare_filename() {
        assert_eq!(parent_path(Path::new("foo.sh")), Path::new("."));
        assert_eq!(parent_path(Path::new("a/b.sh")), Path::new("a"));
    }
}
