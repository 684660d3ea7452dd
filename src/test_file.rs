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

use std::path::PathBuf;

/// One record per file written during a run. Created when a file is
/// first written, mutated only to store the first-block witness, and
/// never removed until the owning driver is dropped.
pub struct TestFileRecord {
    pub path: PathBuf,
    pub total_size_bytes: u64,
    first_block_witness: Vec<u8>,
}

impl TestFileRecord {
    pub fn new(path: PathBuf, total_size_bytes: u64) -> Self {
        TestFileRecord {
            path,
            total_size_bytes,
            first_block_witness: Vec::new(),
        }
    }

    /// Stores a copy of the first `data` as this file's witness. Called
    /// once, immediately after the first successful write to the file.
    pub fn store_witness(&mut self, data: &[u8]) {
        self.first_block_witness = data.to_vec();
    }

    pub fn witness(&self) -> &[u8] {
        &self.first_block_witness
    }

    pub fn witness_size_bytes(&self) -> u64 {
        self.first_block_witness.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn witness_starts_empty() {
        let rec = TestFileRecord::new(PathBuf::from("/mnt/TSC_Files/a.tsc"), 1024);
        assert_eq!(rec.witness_size_bytes(), 0);
        assert!(rec.witness().is_empty());
    }

    #[test]
    fn store_witness_copies_the_given_bytes() {
        let mut rec = TestFileRecord::new(PathBuf::from("/mnt/TSC_Files/a.tsc"), 1024);
        rec.store_witness(&[1, 2, 3, 4]);
        assert_eq!(rec.witness(), &[1, 2, 3, 4]);
        assert_eq!(rec.witness_size_bytes(), 4);
    }
}

// vim: ts=4 sw=4 expandtab
