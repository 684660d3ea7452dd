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

mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Args, ConsoleProgressSink};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tsc_core::{DriverState, TestConfig, TestDriver};

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match run(&args) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "could not start test");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<ExitCode> {
    let config = TestConfig::new(
        &args.mount,
        args.capacity_mb.saturating_mul(1024 * 1024),
        args.stop_on_first_error,
        !args.keep_files,
        args.write_log,
    )
    .context("invalid configuration")?;

    let driver = Arc::new(
        TestDriver::new(config, Box::new(ConsoleProgressSink::new()))
            .context("failed to construct test driver")?,
    );

    let stop_requested = Arc::new(AtomicBool::new(false));
    for sig in &[signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        if let Err(e) = signal_hook::flag::register(*sig, Arc::clone(&stop_requested)) {
            tracing::warn!(signal = *sig, error = %e, "failed to register signal handler");
        }
    }

    {
        let driver = Arc::clone(&driver);
        let stop_requested = Arc::clone(&stop_requested);
        std::thread::spawn(move || {
            while !stop_requested.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(200));
            }
            tracing::warn!("signal received, requesting cancellation");
            driver.force_stop();
        });
    }

    tracing::info!(mount = %args.mount.display(), "starting test");
    driver.perform_test();

    let code = match driver.get_state() {
        s if s == DriverState::Success as i32 => {
            tracing::info!(
                verified = driver.get_last_verified_position(),
                "device verified: every byte written came back unchanged"
            );
            ExitCode::SUCCESS
        }
        s if s == DriverState::Aborted as i32 => {
            tracing::warn!("test aborted");
            ExitCode::FAILURE
        }
        _ => {
            tracing::error!(
                verified_up_to = driver.get_last_verified_position(),
                "fake capacity detected: readback diverged from what was written"
            );
            ExitCode::FAILURE
        }
    };
    Ok(code)
}

// vim: ts=4 sw=4 expandtab
