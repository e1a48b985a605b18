// This file is part of Vigil VRS, a multi-camera video recording supervisor.
// Copyright (C) 2024 The Vigil VRS Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Bounded on-disk storage: quota enforcement by age and glob scans.
//!
//! Writers (producer, actions) and the quota sweep share the same tree, so
//! every per-file operation here tolerates concurrent deletion or creation;
//! individual failures are logged and the pass continues.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use base::clock::{Clocks, TimerGuard};
use base::{err, strutil, Error};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Maintains one camera's storage root under a byte quota.
pub struct StorageManager {
    root: PathBuf,
    max_bytes: u64,
}

struct ScannedFile {
    path: PathBuf,
    len: u64,
    mtime: SystemTime,
}

impl StorageManager {
    /// Creates the manager, creating `root` if needed. A root that can't be
    /// created is fatal: recording has nowhere to go.
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, Error> {
        let root = root.into();
        force_create_dirs(&root)?;
        Ok(StorageManager { root, max_bytes })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deletes oldest-by-mtime files until the tree fits the quota, then
    /// prunes empty directories bottom-up. Returns the bytes deleted.
    pub fn enforce_quota<C: Clocks>(&self, clocks: &C) -> Result<u64, Error> {
        let _t = TimerGuard::new(clocks, || format!("quota sweep of {}", self.root.display()));
        let mut files = Vec::new();
        let mut total = 0u64;
        for entry in WalkDir::new(&self.root) {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(root = %self.root.display(), err = %e, "quota walk error");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let md = match entry.metadata() {
                Ok(md) => md,
                Err(e) => {
                    warn!(path = %entry.path().display(), err = %e, "can't stat");
                    continue;
                }
            };
            let mtime = md.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            total += md.len();
            files.push(ScannedFile {
                path: entry.into_path(),
                len: md.len(),
                mtime,
            });
        }
        if total <= self.max_bytes {
            return Ok(0);
        }
        debug!(
            root = %self.root.display(),
            total = %strutil::encode_size(total),
            max = %strutil::encode_size(self.max_bytes),
            "storage over quota, evicting"
        );

        // Newest first; everything past the quota boundary goes.
        files.sort_by(|a, b| b.mtime.cmp(&a.mtime));
        let mut cumsum = 0u64;
        let mut deleted = 0u64;
        for f in &files {
            cumsum += f.len;
            if cumsum <= self.max_bytes {
                continue;
            }
            match fs::remove_file(&f.path) {
                Ok(()) => {
                    info!(path = %f.path.display(), "removed old file");
                    deleted += f.len;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %f.path.display(), err = %e, "can't remove old file"),
            }
        }
        self.prune_empty_dirs();
        Ok(deleted)
    }

    fn prune_empty_dirs(&self) {
        for entry in WalkDir::new(&self.root).contents_first(true) {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_dir() || entry.path() == self.root {
                continue;
            }
            match fs::remove_dir(entry.path()) {
                Ok(()) => debug!(path = %entry.path().display(), "removed empty directory"),
                // Not empty (or already gone): leave it.
                Err(_) => {}
            }
        }
    }
}

/// Creates a directory and all its parents.
pub fn force_create_dirs(path: &Path) -> Result<(), Error> {
    fs::create_dir_all(path)
        .map_err(|e| err!(Unknown, msg("can't create {}", path.display()), source(e)))
}

/// Creates the parent directory of a file path.
pub fn force_create_parent(file: &Path) -> Result<(), Error> {
    match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => force_create_dirs(p),
        _ => Ok(()),
    }
}

/// Files matching `pattern`, oldest mtime first. Unreadable entries are
/// skipped.
pub fn list_files(pattern: &str) -> Vec<PathBuf> {
    let mut files: Vec<(SystemTime, PathBuf)> = match glob::glob(pattern) {
        Ok(paths) => paths
            .filter_map(|p| p.ok())
            .filter_map(|p| {
                let mtime = fs::metadata(&p).and_then(|md| md.modified()).ok()?;
                Some((mtime, p))
            })
            .collect(),
        Err(e) => {
            warn!(pattern, err = %e, "bad glob pattern");
            return Vec::new();
        }
    };
    files.sort();
    files.into_iter().map(|(_, p)| p).collect()
}

/// The single oldest file matching `pattern` whose mtime is at least
/// `min_mtime`, or `None`.
///
/// The mtime floor keeps callers from resurrecting frames that have already
/// outlived the object-detector timeout.
pub fn first_file(pattern: &str, min_mtime: Option<SystemTime>) -> Option<PathBuf> {
    let mut best: Option<(SystemTime, PathBuf)> = None;
    let paths = match glob::glob(pattern) {
        Ok(p) => p,
        Err(e) => {
            warn!(pattern, err = %e, "bad glob pattern");
            return None;
        }
    };
    for p in paths.filter_map(|p| p.ok()) {
        let Ok(mtime) = fs::metadata(&p).and_then(|md| md.modified()) else {
            continue;
        };
        if let Some(floor) = min_mtime {
            if mtime < floor {
                continue;
            }
        }
        if best.as_ref().map(|(t, _)| mtime < *t).unwrap_or(true) {
            best = Some((mtime, p));
        }
    }
    best.map(|(_, p)| p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::RealClocks;
    use std::time::Duration;

    fn write_with_mtime(path: &Path, len: usize, mtime: SystemTime) {
        fs::write(path, vec![0u8; len]).unwrap();
        let f = fs::File::options().write(true).open(path).unwrap();
        f.set_modified(mtime).unwrap();
    }

    #[test]
    fn quota_deletes_oldest_until_under_limit() {
        let dir = tempfile::tempdir().unwrap();
        let day = fs::canonicalize(dir.path()).unwrap().join("2024-03-01");
        fs::create_dir(&day).unwrap();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        // 20 files of 60 bytes = 1200 bytes total, quota 1000.
        for i in 0..20u64 {
            write_with_mtime(
                &day.join(format!("cam0_{i:02}.mp4")),
                60,
                base + Duration::from_secs(i),
            );
        }
        let sm = StorageManager::new(dir.path(), 1000).unwrap();
        let deleted = sm.enforce_quota(&RealClocks {}).unwrap();
        // Four oldest files must go: 1200 - 4*60 = 960 <= 1000.
        assert_eq!(deleted, 240);
        for i in 0..4u64 {
            assert!(!day.join(format!("cam0_{i:02}.mp4")).exists());
        }
        for i in 4..20u64 {
            assert!(day.join(format!("cam0_{i:02}.mp4")).exists());
        }

        // Idempotent: a second pass deletes nothing more.
        assert_eq!(sm.enforce_quota(&RealClocks {}).unwrap(), 0);
    }

    #[test]
    fn quota_prunes_emptied_directories() {
        let dir = tempfile::tempdir().unwrap();
        let old_day = dir.path().join("2024-02-01");
        let new_day = dir.path().join("2024-03-01");
        fs::create_dir_all(&old_day).unwrap();
        fs::create_dir_all(&new_day).unwrap();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        write_with_mtime(&old_day.join("a.mp4"), 500, base);
        write_with_mtime(&new_day.join("b.mp4"), 500, base + Duration::from_secs(60));

        let sm = StorageManager::new(dir.path(), 600).unwrap();
        sm.enforce_quota(&RealClocks {}).unwrap();
        assert!(!old_day.exists());
        assert!(new_day.join("b.mp4").exists());
    }

    #[test]
    fn first_file_honors_mtime_floor() {
        let dir = tempfile::tempdir().unwrap();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        write_with_mtime(&dir.path().join("cam0_1_1.rec"), 10, base);
        write_with_mtime(
            &dir.path().join("cam0_2_2.rec"),
            10,
            base + Duration::from_secs(30),
        );
        let pattern = format!("{}/cam0_*.rec", dir.path().display());

        let oldest = first_file(&pattern, None).unwrap();
        assert!(oldest.ends_with("cam0_1_1.rec"));

        let floored = first_file(&pattern, Some(base + Duration::from_secs(10))).unwrap();
        assert!(floored.ends_with("cam0_2_2.rec"));

        assert_eq!(first_file(&pattern, Some(base + Duration::from_secs(60))), None);
    }

    #[test]
    fn list_files_sorted_by_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        write_with_mtime(&dir.path().join("b.rec"), 1, base + Duration::from_secs(5));
        write_with_mtime(&dir.path().join("a.rec"), 1, base);
        let listed = list_files(&format!("{}/*.rec", dir.path().display()));
        assert_eq!(listed.len(), 2);
        assert!(listed[0].ends_with("a.rec"));
        assert!(listed[1].ends_with("b.rec"));
    }
}
