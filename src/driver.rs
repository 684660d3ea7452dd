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

//! Fill/verify orchestration: the test driver ties the generator, the
//! unbuffered I/O layer, test file records and disk introspection
//! together into the write-then-read pipeline that surfaces fake
//! capacity.

use crate::error::TscError;
use crate::generator;
use crate::introspection;
use crate::progress;
use crate::test_file::TestFileRecord;
use crate::unbuffered_io::{round_down, AlignedBuffer, UnbufferedFile};
use rand::Rng;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Upper bound on a single write issued by `write_and_verify_file`.
pub const WRITE_CHUNK: u64 = 512 * 1024 * 1024;
/// Upper bound on one generator buffer.
pub const MAX_GEN_BUFFER: u64 = 64 * 1024 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum DriverState {
    Waiting = 0,
    InProgress = 1,
    Verification = 2,
    Success = 3,
    Error = 4,
    Aborted = 5,
}

impl DriverState {
    fn from_i32(v: i32) -> Self {
        match v {
            0 => DriverState::Waiting,
            1 => DriverState::InProgress,
            2 => DriverState::Verification,
            3 => DriverState::Success,
            4 => DriverState::Error,
            5 => DriverState::Aborted,
            _ => DriverState::Waiting,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, DriverState::Success | DriverState::Error | DriverState::Aborted)
    }
}

struct AtomicDriverState(AtomicI32);

impl AtomicDriverState {
    fn new(s: DriverState) -> Self {
        AtomicDriverState(AtomicI32::new(s as i32))
    }

    fn load(&self) -> DriverState {
        DriverState::from_i32(self.0.load(Ordering::Acquire))
    }

    fn store(&self, s: DriverState) {
        self.0.store(s as i32, Ordering::Release)
    }
}

/// One-way progress notification. Implementations are expected to be
/// cheap: this is called at least once per chunk in both phases.
pub trait ProgressSink: Send + Sync {
    fn notify(&self, state: DriverState, percent: i32, megabytes_written: i64);
}

/// A `ProgressSink` that discards every event.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn notify(&self, _state: DriverState, _percent: i32, _megabytes_written: i64) {}
}

impl<T: ProgressSink + ?Sized> ProgressSink for Arc<T> {
    fn notify(&self, state: DriverState, percent: i32, megabytes_written: i64) {
        (**self).notify(state, percent, megabytes_written)
    }
}

/// Immutable once constructed.
pub struct TestConfig {
    pub mount_root: PathBuf,
    pub capacity_to_test_bytes: u64,
    pub stop_on_first_error: bool,
    pub delete_temp_files: bool,
    pub write_log_file: bool,
}

impl TestConfig {
    pub fn new(
        mount_root: impl Into<PathBuf>,
        capacity_to_test_bytes: u64,
        stop_on_first_error: bool,
        delete_temp_files: bool,
        write_log_file: bool,
    ) -> Result<Self, TscError> {
        let mount_root = mount_root.into();
        reject_system_volume(&mount_root)?;
        Ok(TestConfig {
            mount_root,
            capacity_to_test_bytes,
            stop_on_first_error,
            delete_temp_files,
            write_log_file,
        })
    }
}

fn reject_system_volume(mount_root: &Path) -> Result<(), TscError> {
    match mount_root.to_string_lossy().chars().next() {
        Some('C') | Some('c') => Err(TscError::SystemVolumeProtected),
        _ => Ok(()),
    }
}

/// Orchestrates one run of the fill-and-verify pipeline. Construct, call
/// `perform_test` at most once, then drop; dropping releases every
/// `TestFileRecord` along with the driver itself.
pub struct TestDriver {
    config: TestConfig,
    progress_sink: Box<dyn ProgressSink>,

    state: AtomicDriverState,
    running: AtomicBool,

    max_capacity_bytes: AtomicU64,
    data_block_size_bytes: AtomicU64,
    resolved_capacity_bytes: AtomicU64,
    bytes_to_verify: AtomicU64,
    bytes_written: AtomicU64,
    bytes_verified: AtomicU64,
    real_bytes_verified: AtomicU64,
    total_write_duration_ms: AtomicU64,
    total_read_duration_ms: AtomicU64,
    avg_write_mbs: AtomicU64,
    avg_read_mbs: AtomicU64,

    test_files: Mutex<Vec<TestFileRecord>>,

    /// Test-only seam: when set, overrides the data block size query so
    /// a zero-cluster-size filesystem can be simulated without one.
    #[cfg(test)]
    test_block_size_override: Mutex<Option<u64>>,
}

fn load_f64(a: &AtomicU64) -> f64 {
    f64::from_bits(a.load(Ordering::Relaxed))
}

fn store_f64(a: &AtomicU64, v: f64) {
    a.store(v.to_bits(), Ordering::Relaxed)
}

fn add_f64(a: &AtomicU64, delta: f64) {
    let mut cur = a.load(Ordering::Relaxed);
    loop {
        let new = f64::from_bits(cur) + delta;
        match a.compare_exchange_weak(cur, new.to_bits(), Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => cur = actual,
        }
    }
}

fn first_mismatch(a: &[u8], b: &[u8]) -> Option<u64> {
    a.iter().zip(b.iter()).position(|(x, y)| x != y).map(|p| p as u64)
}

fn generate_segment(path: &Path, seg: u64, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let key = format!("{}{}", path.display(), seg);
    generator::generate(&mut buf, &key);
    buf
}

impl TestDriver {
    pub fn new(config: TestConfig, progress_sink: Box<dyn ProgressSink>) -> Result<Self, TscError> {
        reject_system_volume(&config.mount_root)?;
        Ok(TestDriver {
            config,
            progress_sink,
            state: AtomicDriverState::new(DriverState::Waiting),
            running: AtomicBool::new(false),
            max_capacity_bytes: AtomicU64::new(0),
            data_block_size_bytes: AtomicU64::new(0),
            resolved_capacity_bytes: AtomicU64::new(0),
            bytes_to_verify: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_verified: AtomicU64::new(0),
            real_bytes_verified: AtomicU64::new(0),
            total_write_duration_ms: AtomicU64::new(0),
            total_read_duration_ms: AtomicU64::new(0),
            avg_write_mbs: AtomicU64::new(0),
            avg_read_mbs: AtomicU64::new(0),
            test_files: Mutex::new(Vec::new()),
            #[cfg(test)]
            test_block_size_override: Mutex::new(None),
        })
    }

    // --- Public operations ---------------------------------------------

    pub fn perform_test(&self) -> bool {
        if self.state.load() != DriverState::Waiting {
            return false;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let _span = tracing::info_span!("perform_test", mount_root = %self.config.mount_root.display()).entered();
        let result = self.run_inner();
        self.running.store(false, Ordering::Release);
        result
    }

    pub fn force_stop(&self) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        tracing::warn!("force_stop requested");
        self.state.store(DriverState::Aborted);
        self.running.store(false, Ordering::Release);
        true
    }

    /// Non-goal stub: destructive whole-device reformat is never
    /// implemented by this core.
    pub fn perform_destructive_test(&self) -> bool {
        false
    }

    pub fn get_state(&self) -> i32 {
        self.state.load() as i32
    }

    pub fn get_progress(&self) -> i32 {
        self.current_progress()
    }

    pub fn get_avg_read_mbs(&self) -> f64 {
        load_f64(&self.avg_read_mbs)
    }

    pub fn get_avg_write_mbs(&self) -> f64 {
        load_f64(&self.avg_write_mbs)
    }

    pub fn get_last_verified_position(&self) -> u64 {
        self.real_bytes_verified.load(Ordering::Relaxed)
    }

    pub fn get_time_remaining_s(&self) -> u64 {
        progress::time_remaining_s(
            self.resolved_capacity_bytes.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
            load_f64(&self.avg_write_mbs),
            self.bytes_to_verify.load(Ordering::Relaxed),
            self.bytes_verified.load(Ordering::Relaxed),
            load_f64(&self.avg_read_mbs),
        )
    }

    pub fn is_drive_full(&self) -> bool {
        introspection::is_drive_full(&self.config.mount_root, self.max_capacity_bytes.load(Ordering::Relaxed))
    }

    pub fn is_disk_empty(&self) -> bool {
        introspection::is_disk_empty(&self.config.mount_root)
    }

    // --- Internal orchestration ------------------------------------------

    fn run_inner(&self) -> bool {
        let working_dir = match self.create_working_dir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(error = %e, "failed to prepare working directory");
                self.state.store(DriverState::Error);
                return false;
            }
        };

        let (max_capacity, free_space) = match introspection::disk_space(&self.config.mount_root) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "disk space query failed");
                self.state.store(DriverState::Error);
                return false;
            }
        };
        self.max_capacity_bytes.store(max_capacity, Ordering::Relaxed);

        let queried_block_size = match introspection::data_block_size(&self.config.mount_root) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "data block size query failed");
                self.state.store(DriverState::Error);
                return false;
            }
        };
        #[cfg(test)]
        let block_size = self.test_block_size_override.lock().unwrap().unwrap_or(queried_block_size);
        #[cfg(not(test))]
        let block_size = queried_block_size;
        if block_size == 0 {
            // A filesystem reporting a zero cluster size leaves the
            // driver at Waiting, unresolved, rather than transitioning
            // to Error: a minor wart carried forward deliberately.
            tracing::warn!("filesystem reported a zero data block size");
            return false;
        }
        self.data_block_size_bytes.store(block_size, Ordering::Relaxed);

        self.transition(DriverState::InProgress);

        let mut capacity_to_test = self.config.capacity_to_test_bytes;
        if capacity_to_test == 0 {
            capacity_to_test = free_space;
        }
        if free_space < capacity_to_test {
            tracing::error!(free_space, capacity_to_test, "insufficient free space");
            self.state.store(DriverState::Error);
            return false;
        }
        self.resolved_capacity_bytes.store(capacity_to_test, Ordering::Relaxed);

        let bytes_to_verify = if self.config.stop_on_first_error {
            2 * capacity_to_test + (capacity_to_test / WRITE_CHUNK) * block_size
        } else {
            capacity_to_test + 3 * WRITE_CHUNK
        };
        self.bytes_to_verify.store(bytes_to_verify, Ordering::Relaxed);

        let mut ok = self.fill_phase(&working_dir, capacity_to_test, max_capacity, block_size);

        let aborted = self.state.load() == DriverState::Aborted;
        if ok && !aborted {
            self.transition(DriverState::Verification);
            ok = self.verification_phase(block_size);
        }

        let aborted = self.state.load() == DriverState::Aborted;

        if self.config.delete_temp_files {
            if let Err(e) = std::fs::remove_dir_all(&working_dir) {
                tracing::warn!(path = %working_dir.display(), error = %e, "failed to remove working directory");
            }
        }
        if self.config.write_log_file && self.config.delete_temp_files {
            self.write_log(ok, aborted);
        }

        if !aborted {
            self.transition(if ok { DriverState::Success } else { DriverState::Error });
        }

        ok && !aborted
    }

    fn fill_phase(&self, working_dir: &Path, capacity_to_test: u64, max_capacity: u64, block_size: u64) -> bool {
        let mut total_written = 0u64;
        let mut first_verification_done = false;

        while total_written < capacity_to_test {
            if self.state.load() == DriverState::Aborted {
                return false;
            }
            if introspection::is_drive_full(&self.config.mount_root, max_capacity) {
                break;
            }

            let remaining = capacity_to_test - total_written;
            let size = remaining.min(WRITE_CHUNK);

            let file_path = working_dir.join(generate_test_file_name());
            let mut record = TestFileRecord::new(file_path.clone(), size);

            let data_written =
                self.write_and_verify_file(&mut record, size, self.config.stop_on_first_error, block_size);

            if data_written < size {
                self.bytes_verified.store(data_written, Ordering::Relaxed);
                tracing::error!(path = %file_path.display(), data_written, size, "short write/verify, device likely full capacity");
                return false;
            }

            self.test_files.lock().unwrap().push(record);

            if !first_verification_done {
                first_verification_done = true;
                if !self.verify_file(&file_path, size, false, None, block_size) {
                    return false;
                }
            }

            if self.config.stop_on_first_error && !self.sweep_witnesses(block_size) {
                return false;
            }

            total_written += size;
        }

        true
    }

    fn sweep_witnesses(&self, block_size: u64) -> bool {
        let snapshot: Vec<(PathBuf, Vec<u8>)> = {
            let files = self.test_files.lock().unwrap();
            files
                .iter()
                .filter(|r| r.witness_size_bytes() > 0)
                .map(|r| (r.path.clone(), r.witness().to_vec()))
                .collect()
        };

        for (path, witness) in &snapshot {
            if self.state.load() == DriverState::Aborted {
                return false;
            }
            let witness_len = witness.len() as u64;
            if !self.verify_file(path, witness_len, false, Some(witness.as_slice()), block_size) {
                return false;
            }
        }
        true
    }

    fn verification_phase(&self, block_size: u64) -> bool {
        let snapshot: Vec<(PathBuf, u64)> = {
            let files = self.test_files.lock().unwrap();
            files.iter().map(|r| (r.path.clone(), r.total_size_bytes)).collect()
        };

        for (path, total_size) in snapshot {
            if self.state.load() == DriverState::Aborted {
                return false;
            }
            if !self.verify_file(&path, total_size, true, None, block_size) {
                return false;
            }
        }
        true
    }

    /// Writes `file_size` bytes of deterministic content to a fresh file,
    /// optionally self-checking against a stored witness after every
    /// chunk. Returns the number of bytes successfully written (less
    /// than `file_size` signals failure to the caller).
    ///
    /// One generator buffer is produced and written per chunk, so `seg`
    /// advances exactly once per chunk, the same cadence `verify_file`
    /// uses when it regenerates `path||seg` for comparison; the two sides
    /// must stay in lockstep or every chunk past the first looks like a
    /// mismatch on an otherwise honest device.
    fn write_and_verify_file(
        &self,
        record: &mut TestFileRecord,
        file_size: u64,
        early_detect: bool,
        block_size: u64,
    ) -> u64 {
        let mut handle = match UnbufferedFile::create_new(&record.path) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(path = %record.path.display(), error = %e, "failed to open test file for writing");
                return 0;
            }
        };

        if file_size == 0 {
            return 0;
        }

        let mut chunk_size = round_down(file_size.min(MAX_GEN_BUFFER), block_size);
        if chunk_size == 0 {
            chunk_size = file_size;
        }

        let mut seg: u64 = 0;
        let mut bytes_remaining = file_size;
        let mut bytes_written_here: u64 = 0;
        let mut first_iteration = true;

        while bytes_remaining > 0 && self.state.load() != DriverState::Aborted {
            if bytes_remaining < chunk_size {
                chunk_size = round_down(bytes_remaining, block_size);
                if chunk_size == 0 {
                    chunk_size = bytes_remaining;
                }
            }

            let gen_buf = generate_segment(&record.path, seg, chunk_size as usize);

            let write_start = Instant::now();
            let write_result = handle.write_all(&gen_buf);
            let write_elapsed_ms = write_start.elapsed().as_secs_f64() * 1000.0;

            if write_result.is_err() {
                tracing::error!(path = %record.path.display(), "write failed");
                return bytes_written_here;
            }

            add_f64(&self.total_write_duration_ms, write_elapsed_ms);
            self.bytes_written.fetch_add(chunk_size, Ordering::Relaxed);
            bytes_written_here += chunk_size;

            if handle.sync().is_err() {
                tracing::error!(path = %record.path.display(), "sync failed");
                return bytes_written_here;
            }

            if early_detect {
                if first_iteration {
                    let witness_len = (block_size.min(chunk_size)) as usize;
                    record.store_witness(&gen_buf[..witness_len]);
                    first_iteration = false;
                }

                match self.self_check_witness(&mut handle, record, block_size) {
                    Ok(None) => {
                        self.bytes_verified.fetch_add(record.witness_size_bytes(), Ordering::Relaxed);
                    }
                    Ok(Some(offset)) => {
                        let position = self.bytes_written.load(Ordering::Relaxed) + offset;
                        self.real_bytes_verified.store(position, Ordering::Relaxed);
                        tracing::error!(path = %record.path.display(), position, "self-check witness mismatch");
                        return 0;
                    }
                    Err(e) => {
                        tracing::error!(path = %record.path.display(), error = %e, "self-check reopen/read failed");
                        return 0;
                    }
                }
            }

            bytes_remaining -= chunk_size;
            seg += 1;

            self.recalc_and_emit(DriverState::InProgress);
        }

        bytes_written_here
    }

    /// Closes and reopens `handle` at `record.path`, reads back the
    /// witness-length prefix and compares it to the stored witness.
    /// `Ok(None)` on match, `Ok(Some(offset))` on the first differing
    /// byte, `Err` on I/O failure.
    fn self_check_witness(
        &self,
        handle: &mut UnbufferedFile,
        record: &TestFileRecord,
        block_size: u64,
    ) -> io::Result<Option<u64>> {
        let witness_len = record.witness_size_bytes() as usize;
        let saved_pos = handle.stream_position()?;

        *handle = UnbufferedFile::reopen_for_write(&record.path)?;
        handle.seek_start(0)?;

        let mut buf = AlignedBuffer::new(witness_len, block_size as usize)?;
        handle.read_exact(buf.as_mut_slice())?;

        if let Some(offset) = first_mismatch(buf.as_slice(), record.witness()) {
            return Ok(Some(offset));
        }

        handle.seek_start(saved_pos)?;
        Ok(None)
    }

    /// Reads back `path` and compares it to either a supplied witness
    /// (first chunk only) or regenerated content. `update_real_bytes`
    /// controls whether `real_bytes_verified` accumulates alongside
    /// `bytes_verified`.
    fn verify_file(
        &self,
        path: &Path,
        size_hint: u64,
        update_real_bytes: bool,
        witness: Option<&[u8]>,
        block_size: u64,
    ) -> bool {
        let mut handle = match UnbufferedFile::open_read_only(path) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to open test file for verification");
                return false;
            }
        };

        let total_size = if size_hint == 0 {
            match handle.len() {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "failed to query file size");
                    return false;
                }
            }
        } else {
            size_hint
        };

        let mut remaining = total_size;
        let mut seg: u64 = 0;
        let mut processed: u64 = 0;

        while remaining > 0 {
            if self.state.load() == DriverState::Aborted {
                return false;
            }

            let mut chunk_size = round_down(remaining.min(MAX_GEN_BUFFER), block_size);
            if chunk_size == 0 {
                chunk_size = remaining;
            }

            let is_witness_chunk = processed == 0 && witness.is_some();

            let mut buf = match AlignedBuffer::new(chunk_size as usize, block_size as usize) {
                Ok(b) => b,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "failed to allocate aligned read buffer");
                    return false;
                }
            };
            let read_start = Instant::now();
            let read_result = handle.read_exact(buf.as_mut_slice());
            let read_elapsed_ms = read_start.elapsed().as_secs_f64() * 1000.0;

            if read_result.is_err() {
                tracing::error!(path = %path.display(), "short read during verification");
                return false;
            }

            // Witness-sourced comparisons are policy overhead, not
            // representative throughput samples.
            if !is_witness_chunk {
                add_f64(&self.total_read_duration_ms, read_elapsed_ms);
            }

            let expected: Vec<u8> = if is_witness_chunk {
                witness.unwrap().to_vec()
            } else {
                generate_segment(path, seg, chunk_size as usize)
            };

            if let Some(offset) = first_mismatch(buf.as_slice(), &expected) {
                self.bytes_verified.fetch_add(offset, Ordering::Relaxed);
                if update_real_bytes {
                    self.real_bytes_verified.fetch_add(offset, Ordering::Relaxed);
                }
                tracing::error!(path = %path.display(), offset = processed + offset, "verification mismatch");
                return false;
            }

            self.bytes_verified.fetch_add(chunk_size, Ordering::Relaxed);
            if update_real_bytes {
                self.real_bytes_verified.fetch_add(chunk_size, Ordering::Relaxed);
            }

            remaining -= chunk_size;
            processed += chunk_size;
            seg += 1;

            let phase = if update_real_bytes {
                DriverState::Verification
            } else {
                DriverState::InProgress
            };
            self.recalc_and_emit(phase);
        }

        true
    }

    fn create_working_dir(&self) -> Result<PathBuf, TscError> {
        let dir = self.config.mount_root.join("TSC_Files");
        let _ = std::fs::remove_dir_all(&dir);

        let mut last_err = None;
        for attempt in 0..3 {
            match std::fs::create_dir(&dir) {
                Ok(()) => return Ok(dir),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "working directory creation attempt failed");
                    last_err = Some(e);
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
            }
        }
        Err(TscError::WorkingDirectoryUnavailable(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    fn write_log(&self, ok: bool, aborted: bool) {
        let result = if aborted {
            "Aborted"
        } else if ok {
            "Success"
        } else {
            "Failed"
        };

        let contents = format!(
            "Total Capacity:\t\t{}\nVerified Capacity:\t{}\nResult:\t\t\t\t{}\n",
            self.max_capacity_bytes.load(Ordering::Relaxed),
            self.real_bytes_verified.load(Ordering::Relaxed),
            result,
        );

        let log_path = self.config.mount_root.join(format!("TSC_Log_{}.txt", log_timestamp()));
        if let Err(e) = std::fs::write(&log_path, contents) {
            tracing::warn!(path = %log_path.display(), error = %e, "failed to write result log");
        }
    }

    fn current_progress(&self) -> i32 {
        progress::calc_progress(
            self.bytes_written.load(Ordering::Relaxed),
            self.bytes_verified.load(Ordering::Relaxed),
            self.resolved_capacity_bytes.load(Ordering::Relaxed),
            self.bytes_to_verify.load(Ordering::Relaxed),
        )
    }

    fn recalc_speeds(&self) {
        let bytes_written = self.bytes_written.load(Ordering::Relaxed);
        let bytes_verified = self.bytes_verified.load(Ordering::Relaxed);
        let total_write_ms = load_f64(&self.total_write_duration_ms);
        let total_read_ms = load_f64(&self.total_read_duration_ms);

        let mut avg_write = load_f64(&self.avg_write_mbs);
        let mut avg_read = load_f64(&self.avg_read_mbs);
        progress::recalc_speeds(bytes_written, total_write_ms, bytes_verified, total_read_ms, &mut avg_write, &mut avg_read);
        store_f64(&self.avg_write_mbs, avg_write);
        store_f64(&self.avg_read_mbs, avg_read);
    }

    fn transition(&self, new_state: DriverState) {
        self.state.store(new_state);
        self.emit(new_state);
    }

    fn recalc_and_emit(&self, state: DriverState) {
        self.recalc_speeds();
        self.emit(state);
    }

    fn emit(&self, state: DriverState) {
        let percent = self.current_progress();
        let mb_written = (self.bytes_written.load(Ordering::Relaxed) / (1024 * 1024)) as i64;
        self.progress_sink.notify(state, percent, mb_written);
    }
}

fn generate_test_file_name() -> String {
    let (year, month, day, hour, min, sec) = local_time_parts();
    let suffix: u32 = rand::thread_rng().gen_range(0..1000);
    format!("{}{}{}{}{}{}{:03}.tsc", year, month, day, hour, min, sec, suffix)
}

fn log_timestamp() -> String {
    let (year, month, day, hour, min, sec) = local_time_parts();
    format!("{}{}{}_{}{}{}", year, month, day, hour, min, sec)
}

#[cfg(unix)]
fn local_time_parts() -> (i32, i32, i32, i32, i32, i32) {
    unsafe {
        let now = libc::time(std::ptr::null_mut());
        let mut tm: libc::tm = std::mem::zeroed();
        libc::localtime_r(&now, &mut tm);
        (1900 + tm.tm_year, 1 + tm.tm_mon, tm.tm_mday, tm.tm_hour, tm.tm_min, tm.tm_sec)
    }
}

#[cfg(windows)]
fn local_time_parts() -> (i32, i32, i32, i32, i32, i32) {
    use winapi::um::minwinbase::SYSTEMTIME;
    use winapi::um::sysinfoapi::GetLocalTime;

    unsafe {
        let mut st: SYSTEMTIME = std::mem::zeroed();
        GetLocalTime(&mut st);
        (
            st.wYear as i32,
            st.wMonth as i32,
            st.wDay as i32,
            st.wHour as i32,
            st.wMinute as i32,
            st.wSecond as i32,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct RecordingSink {
        events: Mutex<Vec<(DriverState, i32, i64)>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            RecordingSink { events: Mutex::new(Vec::new()) }
        }
    }

    impl ProgressSink for RecordingSink {
        fn notify(&self, state: DriverState, percent: i32, megabytes_written: i64) {
            self.events.lock().unwrap().push((state, percent, megabytes_written));
        }
    }

    /// Stand-in for a counterfeit controller: bytes written past
    /// `real_capacity` silently alias back into the start of the backing
    /// buffer instead of landing on fresh flash. Used to build on-disk
    /// fixtures that exercise wrap-around detection without a real device.
    struct LyingFile {
        backing: Vec<u8>,
        real_capacity: usize,
        cursor: usize,
    }

    impl LyingFile {
        fn new(real_capacity: usize) -> Self {
            LyingFile { backing: vec![0u8; real_capacity], real_capacity, cursor: 0 }
        }

        fn write_all(&mut self, buf: &[u8]) {
            for &b in buf {
                let idx = self.cursor % self.real_capacity;
                self.backing[idx] = b;
                self.cursor += 1;
            }
        }

        /// Renders what a host would read back from a file of `len` bytes
        /// on this device: position `i` resolves to whatever this device
        /// actually holds at `i % real_capacity`.
        fn tile(&self, len: usize) -> Vec<u8> {
            (0..len).map(|i| self.backing[i % self.real_capacity]).collect()
        }
    }

    #[test]
    fn system_volume_is_rejected_at_construction() {
        let err = TestConfig::new("C:\\", 0, false, true, false).unwrap_err();
        assert!(matches!(err, TscError::SystemVolumeProtected));
    }

    #[test]
    fn honest_small_run_succeeds_and_reaches_full_verification() {
        let dir = tempdir().unwrap();
        let config = TestConfig::new(dir.path(), 2 * 1024 * 1024, true, true, false).unwrap();
        let driver = TestDriver::new(config, Box::new(NullProgressSink)).unwrap();

        let ok = driver.perform_test();
        assert!(ok, "expected a clean run on an honest filesystem");
        assert_eq!(driver.get_state(), DriverState::Success as i32);
        assert_eq!(driver.get_progress(), 100);
        assert!(!driver.running.load(Ordering::Relaxed));
    }

    #[test]
    fn second_perform_test_call_returns_false() {
        let dir = tempdir().unwrap();
        let config = TestConfig::new(dir.path(), 1024 * 1024, false, true, false).unwrap();
        let driver = TestDriver::new(config, Box::new(NullProgressSink)).unwrap();

        assert!(driver.perform_test());
        assert!(!driver.perform_test());
    }

    #[test]
    fn force_stop_before_running_is_a_no_op() {
        let dir = tempdir().unwrap();
        let config = TestConfig::new(dir.path(), 1024 * 1024, false, true, false).unwrap();
        let driver = TestDriver::new(config, Box::new(NullProgressSink)).unwrap();

        assert!(!driver.force_stop());
    }

    #[test]
    fn force_stop_after_success_is_a_no_op() {
        let dir = tempdir().unwrap();
        let config = TestConfig::new(dir.path(), 1024 * 1024, false, true, false).unwrap();
        let driver = TestDriver::new(config, Box::new(NullProgressSink)).unwrap();

        assert!(driver.perform_test());
        assert!(!driver.force_stop());
    }

    #[test]
    fn progress_events_are_emitted() {
        let dir = tempdir().unwrap();
        let config = TestConfig::new(dir.path(), 1024 * 1024, false, true, false).unwrap();
        let sink = Arc::new(RecordingSink::new());
        let driver = TestDriver::new(config, Box::new(sink.clone())).unwrap();

        assert!(driver.perform_test());
        let events = sink.events.lock().unwrap();
        assert!(!events.is_empty());
        assert!(events.iter().any(|(s, _, _)| *s == DriverState::Success));
    }

    #[test]
    fn destructive_test_is_an_unimplemented_stub() {
        let dir = tempdir().unwrap();
        let config = TestConfig::new(dir.path(), 1024 * 1024, false, true, false).unwrap();
        let driver = TestDriver::new(config, Box::new(NullProgressSink)).unwrap();

        assert!(!driver.perform_destructive_test());
    }

    #[test]
    fn zero_cluster_size_leaves_state_waiting_without_side_effects() {
        let dir = tempdir().unwrap();
        let config = TestConfig::new(dir.path(), 1024 * 1024, false, true, false).unwrap();
        let driver = TestDriver::new(config, Box::new(NullProgressSink)).unwrap();
        *driver.test_block_size_override.lock().unwrap() = Some(0);

        assert!(!driver.perform_test());
        assert_eq!(driver.get_state(), DriverState::Waiting as i32);
        assert!(!driver.running.load(Ordering::Relaxed));
    }

    #[test]
    fn write_then_verify_survives_multiple_generator_buffers() {
        // A file spanning more than one MAX_GEN_BUFFER worth of content
        // exercises the writer's segment handoff: `seg` must advance once
        // per generated buffer so `write_and_verify_file`'s keying lines
        // up with `verify_file`'s regeneration of the same `path||seg`.
        let dir = tempdir().unwrap();
        let config = TestConfig::new(dir.path(), 0, false, true, false).unwrap();
        let driver = TestDriver::new(config, Box::new(NullProgressSink)).unwrap();

        let block_size = 4096u64;
        let file_size = 2 * MAX_GEN_BUFFER + 3 * block_size;
        let path = dir.path().join("multi_segment.tsc");
        let mut record = TestFileRecord::new(path.clone(), file_size);

        let written = driver.write_and_verify_file(&mut record, file_size, false, block_size);
        assert_eq!(written, file_size, "an honest device should accept every byte");

        let ok = driver.verify_file(&path, file_size, false, None, block_size);
        assert!(ok, "a file spanning multiple generator buffers must verify cleanly on an honest device");
    }

    #[test]
    fn wraparound_corruption_is_detected_at_the_real_capacity_boundary() {
        let dir = tempdir().unwrap();
        let config = TestConfig::new(dir.path(), 4 * 1024 * 1024, false, true, false).unwrap();
        let driver = TestDriver::new(config, Box::new(NullProgressSink)).unwrap();

        let block_size = 4096u64;
        let real_capacity: usize = 2 * 1024 * 1024;
        let file_size: usize = 4 * 1024 * 1024;
        let path = dir.path().join("lying.tsc");

        // What an honest controller would have been asked to store.
        let mut expected_whole = vec![0u8; file_size];
        let gen_chunk = (MAX_GEN_BUFFER as usize).min(file_size);
        let mut seg = 0u64;
        let mut offset = 0usize;
        while offset < file_size {
            let take = gen_chunk.min(file_size - offset);
            let part = generate_segment(&path, seg, take);
            expected_whole[offset..offset + take].copy_from_slice(&part);
            offset += take;
            seg += 1;
        }

        // What the counterfeit device actually holds after wrapping.
        let mut lying = LyingFile::new(real_capacity);
        lying.write_all(&expected_whole);
        std::fs::write(&path, lying.tile(file_size)).unwrap();

        let mut record = TestFileRecord::new(path.clone(), file_size as u64);
        record.store_witness(&expected_whole[..block_size as usize]);
        driver.test_files.lock().unwrap().push(record);

        let ok = driver.verify_file(&path, file_size as u64, true, None, block_size);
        assert!(!ok, "wrap-around corruption past the real capacity must be detected");

        let verified = driver.get_last_verified_position();
        assert!(verified <= real_capacity as u64);
        assert!(verified >= real_capacity as u64 - WRITE_CHUNK.min(real_capacity as u64));
    }
}

// vim: ts=4 sw=4 expandtab
