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

//! Command-line front-end. Not part of the core: a thin `clap` parser
//! and console progress sink wired to `tsc_core::TestDriver`.

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use tsc_core::{DriverState, ProgressSink};

#[derive(Parser, Debug)]
#[command(author, version, about = "Detects fake-capacity storage devices.", long_about = None)]
pub struct Args {
    /// Mounted path of the device to test (e.g. /media/usb-stick).
    pub mount: PathBuf,

    /// Megabytes to test. 0 (default) means "all currently free space".
    #[arg(long, default_value_t = 0)]
    pub capacity_mb: u64,

    /// Re-check every file's first block after each chunk written, to
    /// catch wrap-around corruption as early as possible.
    #[arg(long)]
    pub stop_on_first_error: bool,

    /// Keep the TSC_Files working directory instead of removing it.
    #[arg(long)]
    pub keep_files: bool,

    /// Write a human-readable TSC_Log_*.txt summary to the device.
    #[arg(long)]
    pub write_log: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Prints a line on every percent change and on every state transition.
pub struct ConsoleProgressSink {
    last_percent: AtomicI32,
}

impl ConsoleProgressSink {
    pub fn new() -> Self {
        ConsoleProgressSink { last_percent: AtomicI32::new(-1) }
    }
}

impl Default for ConsoleProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ConsoleProgressSink {
    fn notify(&self, state: DriverState, percent: i32, megabytes_written: i64) {
        let previous = self.last_percent.swap(percent, Ordering::Relaxed);
        if previous == percent && !matches!(state, DriverState::Success | DriverState::Error | DriverState::Aborted) {
            return;
        }
        tracing::info!(?state, percent, megabytes_written, "progress");
    }
}

// vim: ts=4 sw=4 expandtab
