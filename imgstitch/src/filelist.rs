// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Reader for the list of extracted file paths, as produced by `find` (one
//! path per line) or `find -print0` (NUL-delimited).

use std::{
    io::{self, BufRead},
    path::PathBuf,
};

/// Read every path from `reader`. Empty entries are skipped. In newline mode,
/// a trailing carriage return is stripped so DOS-edited lists still work.
pub fn read_file_list(mut reader: impl BufRead, null_separated: bool) -> io::Result<Vec<PathBuf>> {
    let delimiter = if null_separated { b'\0' } else { b'\n' };
    let mut paths = vec![];
    let mut entry = vec![];

    loop {
        entry.clear();

        let n = reader.read_until(delimiter, &mut entry)?;
        if n == 0 {
            break;
        }

        if entry.last() == Some(&delimiter) {
            entry.pop();
        }
        if !null_separated && entry.last() == Some(&b'\r') {
            entry.pop();
        }

        if entry.is_empty() {
            continue;
        }

        #[cfg(unix)]
        let path = {
            use std::{ffi::OsStr, os::unix::ffi::OsStrExt};
            PathBuf::from(OsStr::from_bytes(&entry))
        };

        #[cfg(not(unix))]
        let path = PathBuf::from(String::from_utf8_lossy(&entry).into_owned());

        paths.push(path);
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn newline_separated() {
        let input = b"a/b.txt\nc d.bin\n\nlast\n";
        let paths = read_file_list(Cursor::new(&input[..]), false).unwrap();

        assert_eq!(
            paths,
            vec![
                PathBuf::from("a/b.txt"),
                PathBuf::from("c d.bin"),
                PathBuf::from("last"),
            ],
        );
    }

    #[test]
    fn newline_without_trailing_delimiter() {
        let paths = read_file_list(Cursor::new(&b"only"[..]), false).unwrap();

        assert_eq!(paths, vec![PathBuf::from("only")]);
    }

    #[test]
    fn crlf_line_endings() {
        let paths = read_file_list(Cursor::new(&b"a\r\nb\r\n"[..]), false).unwrap();

        assert_eq!(paths, vec![PathBuf::from("a"), PathBuf::from("b")]);
    }

    #[test]
    fn null_separated_preserves_newlines_in_names() {
        let input = b"with\nnewline\0plain\0";
        let paths = read_file_list(Cursor::new(&input[..]), true).unwrap();

        assert_eq!(
            paths,
            vec![PathBuf::from("with\nnewline"), PathBuf::from("plain")],
        );
    }

    #[test]
    fn empty_input() {
        assert!(read_file_list(Cursor::new(&b""[..]), false).unwrap().is_empty());
        assert!(read_file_list(Cursor::new(&b"\n\n"[..]), false).unwrap().is_empty());
    }
}
