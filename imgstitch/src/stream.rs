// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use num_traits::ToPrimitive;

/// Extensions for file-like types to reopen themselves.
pub trait Reopen: Sized {
    /// Open a new handle to the same file. The new handle is independently
    /// seekable and the file offset is initially set to 0.
    fn reopen(&self) -> io::Result<Self>;
}

/// A read-only file wrapper that uses a userspace file offset. A reopened
/// instance uses the same underlying kernel file descriptor, but a new
/// userspace file offset, initially set to 0. This allows any number of
/// readers to share one open file without coordinating seeks.
#[derive(Debug)]
pub struct PSeekFile {
    file: Arc<RwLock<File>>,
    offset: u64,
}

impl PSeekFile {
    pub fn new(file: File) -> Self {
        Self {
            file: Arc::new(RwLock::new(file)),
            offset: 0,
        }
    }

    pub fn len(&self) -> io::Result<u64> {
        let file_locked = self.file.read().unwrap();
        Ok(file_locked.metadata()?.len())
    }

    /// Read data from offset. The kernel's file position *will* be changed.
    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.read().unwrap().seek_read(buf, self.offset)
    }

    /// Read data from offset. The kernel's file position will *not* be changed.
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read().unwrap().read_at(buf, self.offset)
    }
}

impl Reopen for PSeekFile {
    fn reopen(&self) -> io::Result<Self> {
        Ok(Self {
            file: self.file.clone(),
            offset: 0,
        })
    }
}

impl Read for PSeekFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

impl Seek for PSeekFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.offset = match pos {
            SeekFrom::Start(o) => o,
            SeekFrom::End(o) => {
                let file_size = self.file.read().unwrap().metadata()?.len();
                file_size
                    .to_i64()
                    .and_then(|s| s.checked_add(o))
                    .and_then(|s| s.to_u64())
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "Offset would be before the start of the file",
                        )
                    })?
            }
            SeekFrom::Current(o) => self
                .offset
                .to_i64()
                .and_then(|s| s.checked_add(o))
                .and_then(|s| s.to_u64())
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "Offset would be before the start of the file",
                    )
                })?,
        };

        Ok(self.offset)
    }
}

/// A reader wrapper that hashes data as it's being read.
pub struct HashingReader<R, D> {
    inner: R,
    digest: D,
}

impl<R: Read, D: sha2::digest::Update> HashingReader<R, D> {
    pub fn new(inner: R, digest: D) -> Self {
        Self { inner, digest }
    }

    pub fn finish(self) -> (R, D) {
        (self.inner, self.digest)
    }
}

impl<R: Read, D: sha2::digest::Update> Read for HashingReader<R, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digest.update(&buf[..n]);
        Ok(n)
    }
}

/// Returns an I/O error with the [`io::ErrorKind::Interrupted`] type if
/// `cancel_signal` is true. This should be called frequently in I/O loops for
/// cancellation to be responsive.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

/// Copy exactly `size` bytes from `reader` to `writer`, invoking `inspect`
/// after every buffer read iteration. If either `reader` or `writer` reaches
/// EOF before `size` bytes are copied, an error is returned. The operation is
/// cancelled on the next loop iteration if `cancel_signal` is set to `true`.
pub fn copy_n_inspect(
    mut reader: impl Read,
    mut writer: impl Write,
    mut size: u64,
    mut inspect: impl FnMut(&[u8]),
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let mut buf = [0u8; 16384];

    while size > 0 {
        check_cancel(cancel_signal)?;

        let to_read = size.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..to_read])?;

        inspect(&buf[..to_read]);

        writer.write_all(&buf[..to_read])?;

        size -= to_read as u64;
    }

    Ok(())
}

/// Copy exactly `size` bytes from `reader` to `writer`.
pub fn copy_n(
    reader: impl Read,
    writer: impl Write,
    size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    copy_n_inspect(reader, writer, size, |_| {}, cancel_signal)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Cursor, Read, Seek, SeekFrom},
        sync::atomic::AtomicBool,
    };

    use super::*;

    #[test]
    fn pseek_file_independent_offsets() {
        let temp = tempfile::tempfile().unwrap();

        {
            use std::io::Write;
            let mut f = temp.try_clone().unwrap();
            f.write_all(b"0123456789").unwrap();
        }

        let mut a = PSeekFile::new(temp);
        let mut b = a.reopen().unwrap();

        let mut buf = [0u8; 4];
        a.seek(SeekFrom::Start(6)).unwrap();
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"6789");

        // The other handle still starts at 0.
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"0123");
    }

    #[test]
    fn copy_n_exact() {
        let cancel_signal = AtomicBool::new(false);
        let reader = Cursor::new(b"abcdefgh".to_vec());
        let mut writer = Cursor::new(Vec::new());

        copy_n(reader, &mut writer, 5, &cancel_signal).unwrap();
        assert_eq!(writer.into_inner(), b"abcde");
    }

    #[test]
    fn copy_n_eof() {
        let cancel_signal = AtomicBool::new(false);
        let reader = Cursor::new(b"abc".to_vec());
        let mut writer = Cursor::new(Vec::new());

        let err = copy_n(reader, &mut writer, 5, &cancel_signal).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
