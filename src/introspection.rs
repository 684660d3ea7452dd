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

//! Filesystem geometry and capacity queries.

use crate::error::TscError;
use std::path::Path;

/// Returns `(total_bytes, free_bytes)` for the filesystem containing `path`.
#[cfg(unix)]
pub fn disk_space(path: &Path) -> Result<(u64, u64), TscError> {
    let stat = statvfs(path)?;
    let total = stat.f_frsize as u64 * stat.f_blocks as u64;
    let free = stat.f_frsize as u64 * stat.f_bavail as u64;
    Ok((total, free))
}

/// Returns the filesystem's allocation block size, i.e. the I/O alignment
/// unit for this core. POSIX has no separate "sectors per cluster"
/// concept distinct from block size, so `f_frsize` (the fundamental
/// block size) is the direct analogue of Windows'
/// `sectorsPerCluster * bytesPerSector`.
#[cfg(unix)]
pub fn data_block_size(path: &Path) -> Result<u64, TscError> {
    let stat = statvfs(path)?;
    Ok(stat.f_frsize as u64)
}

#[cfg(unix)]
fn statvfs(path: &Path) -> Result<libc::statvfs, TscError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| TscError::FilesystemQueryFailed(e.to_string()))?;

    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return Err(TscError::FilesystemQueryFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        Ok(stat)
    }
}

#[cfg(windows)]
pub fn disk_space(path: &Path) -> Result<(u64, u64), TscError> {
    use std::os::windows::ffi::OsStrExt;
    use winapi::um::fileapi::GetDiskFreeSpaceExW;
    use winapi::um::winnt::ULARGE_INTEGER;

    let wide: Vec<u16> = path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    unsafe {
        let mut free_available: ULARGE_INTEGER = std::mem::zeroed();
        let mut total: ULARGE_INTEGER = std::mem::zeroed();
        let mut free: ULARGE_INTEGER = std::mem::zeroed();

        let ok = GetDiskFreeSpaceExW(
            wide.as_ptr(),
            &mut free_available,
            &mut total,
            &mut free,
        );
        if ok == 0 {
            return Err(TscError::FilesystemQueryFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        Ok((*total.QuadPart() as u64, *free.QuadPart() as u64))
    }
}

#[cfg(windows)]
pub fn data_block_size(path: &Path) -> Result<u64, TscError> {
    use std::os::windows::ffi::OsStrExt;
    use winapi::um::fileapi::GetDiskFreeSpaceW;

    let wide: Vec<u16> = path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    unsafe {
        let mut sectors_per_cluster = 0u32;
        let mut bytes_per_sector = 0u32;
        let mut free_clusters = 0u32;
        let mut total_clusters = 0u32;

        let ok = GetDiskFreeSpaceW(
            wide.as_ptr(),
            &mut sectors_per_cluster,
            &mut bytes_per_sector,
            &mut free_clusters,
            &mut total_clusters,
        );
        if ok == 0 {
            return Err(TscError::FilesystemQueryFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        Ok(sectors_per_cluster as u64 * bytes_per_sector as u64)
    }
}

/// True if the target is (reportedly) full: the filesystem's used space
/// has reached the size observed at the start of the run. A query
/// failure is treated as "full", the conservative choice.
pub fn is_drive_full(path: &Path, max_capacity_bytes: u64) -> bool {
    match disk_space(path) {
        Ok((total, free)) => total.saturating_sub(free) >= max_capacity_bytes,
        Err(_) => true,
    }
}

/// True iff `mount_root` contains no non-directory entry outside of a
/// `System Volume Information` path. Directories and that reserved
/// Windows folder's contents don't count against emptiness.
pub fn is_disk_empty(mount_root: &Path) -> bool {
    !contains_real_file(mount_root)
}

fn contains_real_file(dir: &Path) -> bool {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return false,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.to_string_lossy().contains("System Volume Information") {
            continue;
        }
        match entry.file_type() {
            Ok(ft) if ft.is_dir() => {
                if contains_real_file(&path) {
                    return true;
                }
            }
            Ok(_) => return true,
            Err(_) => continue,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_directory_is_empty() {
        let dir = tempdir().unwrap();
        assert!(is_disk_empty(dir.path()));
    }

    #[test]
    fn a_plain_file_makes_it_non_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("leftover.bin"), b"x").unwrap();
        assert!(!is_disk_empty(dir.path()));
    }

    #[test]
    fn system_volume_information_is_ignored() {
        let dir = tempdir().unwrap();
        let svi = dir.path().join("System Volume Information");
        std::fs::create_dir(&svi).unwrap();
        std::fs::write(svi.join("tracking.log"), b"x").unwrap();
        assert!(is_disk_empty(dir.path()));
    }

    #[test]
    fn empty_subdirectories_do_not_count_as_non_empty() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        assert!(is_disk_empty(dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn disk_space_reports_plausible_values() {
        let dir = tempdir().unwrap();
        let (total, free) = disk_space(dir.path()).unwrap();
        assert!(total > 0);
        assert!(free <= total);
    }

    #[cfg(unix)]
    #[test]
    fn data_block_size_is_nonzero() {
        let dir = tempdir().unwrap();
        assert!(data_block_size(dir.path()).unwrap() > 0);
    }
}

// vim: ts=4 sw=4 expandtab
