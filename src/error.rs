// -*- coding: utf-8 -*-
//
// tsc-core - fake-capacity storage tester
//
// Copyright 2020-2023 Michael Buesch <m@bues.ch>
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

use thiserror::Error;

/// Errors surfaced by the core. Per the propagation policy, these never
/// unwind out of `TestDriver::perform_test`/`force_stop`; they are used
/// internally by the fallible helpers and collapse into `DriverState::Error`
/// at the one point the driver allows.
#[derive(Debug, Error)]
pub enum TscError {
    /// Construction was attempted against the protected system volume.
    #[error("refusing to test the system volume")]
    SystemVolumeProtected,

    /// The target filesystem does not have enough free space for the
    /// requested capacity.
    #[error("insufficient free space on target filesystem")]
    InsufficientFreeSpace,

    /// A filesystem geometry/space query failed.
    #[error("filesystem query failed: {0}")]
    FilesystemQueryFailed(String),

    /// The working directory could not be created or removed.
    #[error("working directory unavailable: {0}")]
    WorkingDirectoryUnavailable(String),

    /// An OS-level I/O error occurred during open/read/write/flush/seek.
    #[error("I/O failure: {0}")]
    IoFailed(#[from] std::io::Error),

    /// Readback diverged from what was written. This is a diagnostic
    /// outcome, not a bug: it is the signature the tool exists to find.
    #[error("data mismatch at offset {0}")]
    DataMismatch(u64),

    /// The run was cancelled cooperatively via `force_stop`.
    #[error("test was cancelled")]
    Cancelled,
}

// vim: ts=4 sw=4 expandtab
