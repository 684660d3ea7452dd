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

//! Detects counterfeit fake-capacity storage by writing deterministic
//! data to a mounted filesystem and reading it back through paths that
//! bypass the host page cache, reporting the first offset at which
//! readback diverges from what was written.

mod driver;
mod error;
mod generator;
mod introspection;
mod progress;
mod test_file;
mod unbuffered_io;

pub use driver::{
    DriverState, NullProgressSink, ProgressSink, TestConfig, TestDriver, MAX_GEN_BUFFER, WRITE_CHUNK,
};
pub use error::TscError;
pub use introspection::{disk_space, is_disk_empty, is_drive_full};
pub use test_file::TestFileRecord;

/// Deterministically fills `buf` with pseudo-random bytes keyed by `key`.
/// Exposed for callers (e.g. the CLI) that want to inspect what the
/// driver would have written without running a full test.
pub fn generate(buf: &mut [u8], key: &str) {
    generator::generate(buf, key)
}

// vim: ts=4 sw=4 expandtab
