// -*- coding: utf-8 -*-
//
// tsc-core - fake-capacity storage tester
//
// Copyright 2023 Mywk.Net
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.
//

//! Host-cache-bypass file I/O. Opens handles in a mode that forces reads
//! to reach the device and writes to be flushed through it, so
//! verification interrogates the device rather than RAM.

use std::alloc::{alloc, dealloc, Layout};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::ptr::NonNull;

/// A file handle opened to bypass the host page cache.
pub struct UnbufferedFile {
    file: File,
}

impl UnbufferedFile {
    /// Truncate-or-create a file for read+write, unbuffered and
    /// write-through. Used to start writing a fresh test file.
    pub fn create_new(path: &Path) -> io::Result<Self> {
        let file = open_for_write(path, true)?;
        Ok(UnbufferedFile { file })
    }

    /// Re-open an existing file for read+write, unbuffered and
    /// write-through, without touching its contents. Used by the
    /// early-detection sweep's close-then-reopen defense: some
    /// counterfeit controllers serve recently-written data from
    /// internal SRAM as long as the same descriptor stays open.
    pub fn reopen_for_write(path: &Path) -> io::Result<Self> {
        let file = open_for_write(path, false)?;
        Ok(UnbufferedFile { file })
    }

    /// Open an existing file read-only, unbuffered.
    pub fn open_read_only(path: &Path) -> io::Result<Self> {
        let file = open_for_read(path)?;
        Ok(UnbufferedFile { file })
    }

    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf)
    }

    /// Explicit flush/sync issued after every write, per the cache-bypass
    /// contract.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact(buf)
    }

    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    pub fn seek_start(&mut self, pos: u64) -> io::Result<u64> {
        self.file.seek(SeekFrom::Start(pos))
    }

    pub fn stream_position(&mut self) -> io::Result<u64> {
        self.file.stream_position()
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Rounds `n` down to the nearest multiple of `block_size`. Every I/O
/// length and offset passed to the OS must satisfy this.
pub fn round_down(n: u64, block_size: u64) -> u64 {
    if block_size == 0 {
        return n;
    }
    (n / block_size) * block_size
}

/// A block-aligned heap buffer. A plain `Vec<u8>` carries no alignment
/// guarantee, and `O_DIRECT`/`FILE_FLAG_NO_BUFFERING` reject unaligned
/// buffers at read/write time (not just at open time), so every buffer
/// handed to the cache-bypass read path goes through this instead.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    alignment: usize,
}

impl AlignedBuffer {
    pub fn new(len: usize, alignment: usize) -> io::Result<Self> {
        let alignment = alignment.max(1);
        if len == 0 {
            return Ok(AlignedBuffer { ptr: NonNull::dangling(), len: 0, alignment });
        }
        let layout = Layout::from_size_align(len, alignment)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let ptr = unsafe { alloc(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "aligned allocation failed"))?;
        Ok(AlignedBuffer { ptr, len, alignment })
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        let Ok(layout) = Layout::from_size_align(self.len, self.alignment) else {
            return;
        };
        unsafe {
            dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

unsafe impl Send for AlignedBuffer {}

#[cfg(unix)]
fn open_for_write(path: &Path, truncate: bool) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let build = |direct: bool| {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(truncate);
        if truncate {
            opts.truncate(true);
        }
        let mut flags = libc::O_SYNC;
        if direct {
            flags |= libc::O_DIRECT;
        }
        opts.custom_flags(flags);
        opts
    };

    match build(true).open(path) {
        Ok(f) => Ok(f),
        // Some filesystems (tmpfs among them) reject O_DIRECT outright.
        // Fall back to O_SYNC-only write-through; still bypasses the
        // write-back cache, just not the read cache on this fs.
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => build(false).open(path),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn open_for_read(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let build = |direct: bool| {
        let mut opts = OpenOptions::new();
        opts.read(true);
        opts.custom_flags(if direct { libc::O_DIRECT } else { 0 });
        opts
    };

    match build(true).open(path) {
        Ok(f) => Ok(f),
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => build(false).open(path),
        Err(e) => Err(e),
    }
}

#[cfg(windows)]
fn open_for_write(path: &Path, truncate: bool) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;
    use winapi::um::winbase::{FILE_FLAG_NO_BUFFERING, FILE_FLAG_WRITE_THROUGH};

    let mut opts = OpenOptions::new();
    opts.read(true).write(true).create(truncate);
    if truncate {
        opts.truncate(true);
    }
    opts.custom_flags(FILE_FLAG_NO_BUFFERING | FILE_FLAG_WRITE_THROUGH);
    opts.open(path)
}

#[cfg(windows)]
fn open_for_read(path: &Path) -> io::Result<File> {
    use std::os::windows::fs::OpenOptionsExt;
    use winapi::um::winbase::FILE_FLAG_NO_BUFFERING;

    let mut opts = OpenOptions::new();
    opts.read(true);
    opts.custom_flags(FILE_FLAG_NO_BUFFERING);
    opts.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_down_aligns_to_block_size() {
        assert_eq!(round_down(4096, 512), 4096);
        assert_eq!(round_down(4100, 512), 4096);
        assert_eq!(round_down(100, 512), 0);
        assert_eq!(round_down(100, 0), 100);
    }

    #[test]
    fn create_write_reopen_and_read_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("unbuffered.tsc");

        let mut w = UnbufferedFile::create_new(&path).unwrap();
        w.write_all(&[1, 2, 3, 4]).unwrap();
        w.sync().unwrap();
        drop(w);

        let mut r = UnbufferedFile::open_read_only(&path).unwrap();
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn reopen_for_write_preserves_existing_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("unbuffered2.tsc");

        let mut w = UnbufferedFile::create_new(&path).unwrap();
        w.write_all(&[9, 9, 9, 9]).unwrap();
        w.sync().unwrap();
        drop(w);

        let mut reopened = UnbufferedFile::reopen_for_write(&path).unwrap();
        assert_eq!(reopened.len().unwrap(), 4);
        let mut buf = [0u8; 4];
        reopened.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [9, 9, 9, 9]);
    }

    #[test]
    fn aligned_buffer_is_readable_and_writable_at_full_length() {
        let mut buf = AlignedBuffer::new(4096, 512).unwrap();
        assert_eq!(buf.as_slice().len(), 4096);
        buf.as_mut_slice().fill(0xAB);
        assert!(buf.as_slice().iter().all(|&b| b == 0xAB));
        assert_eq!(buf.ptr.as_ptr() as usize % 512, 0);
    }

    #[test]
    fn aligned_buffer_of_zero_length_does_not_allocate_or_panic() {
        let mut buf = AlignedBuffer::new(0, 4096).unwrap();
        assert!(buf.as_slice().is_empty());
        assert!(buf.as_mut_slice().is_empty());
    }
}

// vim: ts=4 sw=4 expandtab
