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

//! Speed, progress and ETA accounting. The formulas here are
//! deliberately kept verbatim from the source tool, heuristics and all;
//! they exist to produce a stable percentage, not a precise benchmark.

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Updates the exponentially-smoothed (weight 1/2) moving averages for
/// write and read throughput, in MB/s. Leaves an average untouched when
/// its inputs aren't both positive yet.
pub fn recalc_speeds(
    bytes_written: u64,
    total_write_duration_ms: f64,
    bytes_verified: u64,
    total_read_duration_ms: f64,
    avg_write_mbs: &mut f64,
    avg_read_mbs: &mut f64,
) {
    if bytes_written > 0 && total_write_duration_ms > 0.0 {
        let now = (bytes_written as f64 / (total_write_duration_ms / 1000.0)) / BYTES_PER_MB;
        *avg_write_mbs = if *avg_write_mbs == 0.0 {
            now
        } else {
            (*avg_write_mbs + now) / 2.0
        };
    }

    if bytes_verified > 0 && total_read_duration_ms > 0.0 {
        let now = (bytes_verified as f64 / (total_read_duration_ms / 1000.0)) / BYTES_PER_MB;
        *avg_read_mbs = if *avg_read_mbs == 0.0 {
            now
        } else {
            (*avg_read_mbs + now) / 2.0
        };
    }
}

/// Percent complete across both the write and verify phases. Zero until
/// both phases have produced at least one byte.
pub fn calc_progress(
    bytes_written: u64,
    bytes_verified: u64,
    capacity_to_test_bytes: u64,
    bytes_to_verify: u64,
) -> i32 {
    if bytes_written == 0 || bytes_verified == 0 {
        return 0;
    }
    let total_to_process = capacity_to_test_bytes + bytes_to_verify;
    if total_to_process == 0 {
        return 0;
    }
    let total_processed = bytes_written + bytes_verified;
    ((total_processed as f64 / total_to_process as f64) * 100.0).floor() as i32
}

/// Estimated seconds remaining, write and read phases computed and summed
/// separately since fake devices rarely have symmetric read/write speeds.
pub fn time_remaining_s(
    capacity_to_test_bytes: u64,
    bytes_written: u64,
    avg_write_mbs: f64,
    bytes_to_verify: u64,
    bytes_verified: u64,
    avg_read_mbs: f64,
) -> u64 {
    let write_term = if avg_write_mbs > 0.0 {
        let write_remaining_mb = capacity_to_test_bytes.saturating_sub(bytes_written) as f64 / BYTES_PER_MB;
        write_remaining_mb / avg_write_mbs
    } else {
        0.0
    };

    let read_term = if avg_read_mbs > 0.0 {
        let read_remaining_mb = bytes_to_verify.saturating_sub(bytes_verified) as f64 / BYTES_PER_MB;
        read_remaining_mb / avg_read_mbs
    } else if avg_write_mbs > 0.0 {
        // Read speed isn't known yet; impute it as half the write speed.
        (capacity_to_test_bytes as f64 / BYTES_PER_MB) / (2.0 * avg_write_mbs)
    } else {
        0.0
    };

    (write_term + read_term).max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_zero_until_both_phases_have_bytes() {
        assert_eq!(calc_progress(0, 0, 100, 100), 0);
        assert_eq!(calc_progress(10, 0, 100, 100), 0);
        assert_eq!(calc_progress(0, 10, 100, 100), 0);
    }

    #[test]
    fn progress_is_floor_of_combined_fraction() {
        // 50 + 50 written+verified out of 100+100 planned => 50%.
        assert_eq!(calc_progress(50, 50, 100, 100), 50);
        // 99/200 => 49.5 floored to 49.
        assert_eq!(calc_progress(50, 49, 100, 100), 49);
    }

    #[test]
    fn recalc_speeds_seeds_then_smooths_by_half() {
        let mut avg_write = 0.0;
        let mut avg_read = 0.0;

        // First sample: 1 MiB written in 1000 ms => 1 MB/s.
        recalc_speeds(1024 * 1024, 1000.0, 0, 0.0, &mut avg_write, &mut avg_read);
        assert!((avg_write - 1.0).abs() < 1e-9);
        assert_eq!(avg_read, 0.0);

        // Second sample: 2 MiB in 1000 ms => 2 MB/s now; averaged with
        // the prior 1.0 MB/s gives 1.5 MB/s.
        recalc_speeds(2 * 1024 * 1024, 1000.0, 0, 0.0, &mut avg_write, &mut avg_read);
        assert!((avg_write - 1.5).abs() < 1e-9);
    }

    #[test]
    fn time_remaining_imputes_read_speed_from_write_when_unknown() {
        let secs = time_remaining_s(100 * 1024 * 1024, 100 * 1024 * 1024, 10.0, 0, 0, 0.0);
        // write_term is 0 (fully written); read_term = (100MB)/(2*10) = 5s.
        assert_eq!(secs, 5);
    }

    #[test]
    fn time_remaining_is_zero_with_no_speed_data() {
        assert_eq!(time_remaining_s(100, 0, 0.0, 100, 0, 0.0), 0);
    }
}

// vim: ts=4 sw=4 expandtab
