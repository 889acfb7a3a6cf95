//! Staleness detection and repair across the replicas of one logical file.
//!
//! A replica is stale when its modification time falls behind the newest
//! copy. Repair is whole-file: the newest replica's content is copied onto
//! every flagged replica, then its timestamps are stamped onto the rest so
//! a later scan sees the set as settled.

use crate::replica::ReplicaSet;
use crate::status::OpStatus;
use fuse3::FileType;
use log::{debug, warn};
use nix::sys::time::TimeSpec;
use std::fs;

fn mtime_of(stat: &nix::sys::stat::FileStat) -> (i64, i64) {
    (stat.st_mtime, stat.st_mtime_nsec)
}

/// Scans the set for the newest modification time. Replicas that fall
/// behind the newest are flagged `out_of_sync`; replicas that cannot be
/// stat-ed are skipped without a flag. Returns the index of the newest
/// replica, or `None` when every reachable replica carries the same time.
pub fn latest_modified(set: &mut ReplicaSet) -> Option<usize> {
    let mut latest: Option<(usize, (i64, i64))> = None;
    let mut all_equal = true;

    for idx in 0..set.len() {
        let stat = match set.get(idx).and_then(|h| h.metadata().ok()) {
            Some(stat) => stat,
            None => {
                debug!("latest_modified: replica {idx} unreadable, skipping");
                continue;
            }
        };
        let mtime = mtime_of(&stat);

        match latest {
            None => latest = Some((idx, mtime)),
            Some((seed_idx, seed_mtime)) => {
                if mtime > seed_mtime {
                    all_equal = false;
                    if let Some(handle) = set.get_mut(seed_idx) {
                        handle.out_of_sync = true;
                    }
                    latest = Some((idx, mtime));
                } else if mtime < seed_mtime {
                    all_equal = false;
                    if let Some(handle) = set.get_mut(idx) {
                        handle.out_of_sync = true;
                    }
                }
            }
        }
    }

    match latest {
        Some((idx, _)) if !all_equal => Some(idx),
        _ => None,
    }
}

/// Copies the newest replica's content onto every replica flagged
/// `out_of_sync`, then stamps the source's timestamps onto each repaired
/// replica. Directory replicas only take the timestamp pass. Best-effort:
/// a replica whose copy (or stamp) fails keeps its flag armed and its
/// timestamps untouched, so the divergence stays detectable, and the walk
/// continues to the remaining replicas.
pub fn integrity_check(set: &mut ReplicaSet, source_idx: usize) -> OpStatus {
    let source = match set.get(source_idx) {
        Some(handle) => handle,
        None => return OpStatus::NotConfigured,
    };
    let source_abs = match source.abs_path() {
        Ok(path) => path,
        Err(status) => return status,
    };
    let source_stat = match source.metadata() {
        Ok(stat) => stat,
        Err(status) => return status,
    };
    let is_dir =
        crate::util::file_type_from_mode(source_stat.st_mode) == FileType::Directory;
    let atime = TimeSpec::new(source_stat.st_atime, source_stat.st_atime_nsec);
    let mtime = TimeSpec::new(source_stat.st_mtime, source_stat.st_mtime_nsec);

    let mut worst = OpStatus::Ok;
    for idx in 0..set.len() {
        if idx == source_idx {
            if let Some(handle) = set.get_mut(idx) {
                handle.out_of_sync = false;
            }
            continue;
        }
        let (flagged, target) = match set.get(idx) {
            Some(handle) => match handle.abs_path() {
                Ok(path) => (handle.out_of_sync, path),
                Err(status) => {
                    worst = crate::status::aggregate([worst, status]);
                    continue;
                }
            },
            None => continue,
        };

        if flagged && !is_dir {
            if let Err(err) = fs::copy(&source_abs, &target) {
                warn!(
                    "integrity check: copy {} -> {} failed: {err}",
                    source_abs.display(),
                    target.display()
                );
                worst = crate::status::aggregate([worst, err.into()]);
                continue;
            }
            debug!(
                "integrity check: repaired {} from {}",
                target.display(),
                source_abs.display()
            );
        }

        if let Some(handle) = set.get_mut(idx) {
            let status = handle.set_times(Some(atime), Some(mtime));
            if status != OpStatus::Ok {
                warn!("time sync on replica {idx} failed: {status:?}");
                worst = crate::status::aggregate([worst, status]);
                continue;
            }
            handle.out_of_sync = false;
        }
    }
    worst
}

/// Stamps the master's access and modification times onto every other
/// replica.
pub fn synchronize_times(set: &mut ReplicaSet) -> OpStatus {
    match set.master_index() {
        Some(idx) => synchronize_times_from(set, idx),
        None => OpStatus::NotConfigured,
    }
}

/// Stamps the source replica's access and modification times onto every
/// other replica and clears all `out_of_sync` flags. Per-replica
/// `last_status` is left untouched so the caller's aggregation still
/// reflects the operation that triggered the sync.
pub fn synchronize_times_from(set: &mut ReplicaSet, source_idx: usize) -> OpStatus {
    let source_stat = match set.get(source_idx).map(|h| h.metadata()) {
        Some(Ok(stat)) => stat,
        Some(Err(status)) => return status,
        None => return OpStatus::NotConfigured,
    };
    let atime = TimeSpec::new(source_stat.st_atime, source_stat.st_atime_nsec);
    let mtime = TimeSpec::new(source_stat.st_mtime, source_stat.st_mtime_nsec);

    let mut worst = OpStatus::Ok;
    for idx in 0..set.len() {
        let Some(handle) = set.get_mut(idx) else {
            continue;
        };
        if idx != source_idx {
            let status = handle.set_times(Some(atime), Some(mtime));
            if status != OpStatus::Ok {
                warn!("time sync on replica {idx} failed: {status:?}");
                worst = crate::status::aggregate([worst, status]);
            }
        }
        handle.out_of_sync = false;
    }
    worst
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Registry;
    use filetime::{FileTime, set_file_mtime};
    use std::ffi::OsStr;
    use std::fs;

    fn three_replicas(name: &str, contents: [&[u8]; 3]) -> (Vec<tempfile::TempDir>, Registry) {
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let mut registry = Registry::new();
        for (dir, data) in dirs.iter().zip(contents) {
            fs::write(dir.path().join(name), data).unwrap();
            registry.add_root(dir.path().to_path_buf(), false).unwrap();
        }
        (dirs, registry)
    }

    fn set_mtime_secs(path: &std::path::Path, secs: i64) {
        set_file_mtime(path, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    #[test]
    fn all_equal_reports_no_staleness() {
        let (dirs, registry) = three_replicas("f", [b"x", b"x", b"x"]);
        for dir in &dirs {
            set_mtime_secs(&dir.path().join("f"), 1_000_000);
        }
        let mut set = ReplicaSet::new(&registry);
        set.resolve(OsStr::new("/f"), None);

        assert_eq!(latest_modified(&mut set), None);
        assert!(set.iter().all(|h| !h.out_of_sync));
    }

    #[test]
    fn older_first_seed_yields_to_newer_replica() {
        let (dirs, registry) = three_replicas("f", [b"old", b"new", b"new"]);
        set_mtime_secs(&dirs[0].path().join("f"), 1_000);
        set_mtime_secs(&dirs[1].path().join("f"), 2_000);
        set_mtime_secs(&dirs[2].path().join("f"), 2_000);
        let mut set = ReplicaSet::new(&registry);
        set.resolve(OsStr::new("/f"), None);

        assert_eq!(latest_modified(&mut set), Some(1));
        let flags: Vec<_> = set.iter().map(|h| h.out_of_sync).collect();
        assert_eq!(flags, vec![true, false, false]);
    }

    #[test]
    fn newer_seed_flags_later_stale_replicas() {
        let (dirs, registry) = three_replicas("f", [b"new", b"old", b"new"]);
        set_mtime_secs(&dirs[0].path().join("f"), 2_000);
        set_mtime_secs(&dirs[1].path().join("f"), 1_000);
        set_mtime_secs(&dirs[2].path().join("f"), 2_000);
        let mut set = ReplicaSet::new(&registry);
        set.resolve(OsStr::new("/f"), None);

        assert_eq!(latest_modified(&mut set), Some(0));
        let flags: Vec<_> = set.iter().map(|h| h.out_of_sync).collect();
        assert_eq!(flags, vec![false, true, false]);
    }

    #[test]
    fn unreadable_replica_is_skipped_without_flag() {
        let (dirs, registry) = three_replicas("f", [b"a", b"a", b"a"]);
        set_mtime_secs(&dirs[0].path().join("f"), 1_000);
        set_mtime_secs(&dirs[2].path().join("f"), 1_000);
        fs::remove_file(dirs[1].path().join("f")).unwrap();
        let mut set = ReplicaSet::new(&registry);
        set.resolve(OsStr::new("/f"), None);

        assert_eq!(latest_modified(&mut set), None);
        assert!(set.iter().all(|h| !h.out_of_sync));
    }

    #[test]
    fn integrity_check_repairs_content_and_times() {
        let (dirs, registry) = three_replicas("f", [b"fresh data", b"stale", b"fresh data"]);
        set_mtime_secs(&dirs[0].path().join("f"), 5_000);
        set_mtime_secs(&dirs[1].path().join("f"), 1_000);
        set_mtime_secs(&dirs[2].path().join("f"), 5_000);
        let mut set = ReplicaSet::new(&registry);
        set.resolve(OsStr::new("/f"), None);

        let newest = latest_modified(&mut set).unwrap();
        assert_eq!(newest, 0);
        assert_eq!(integrity_check(&mut set, newest), OpStatus::Ok);

        assert_eq!(fs::read(dirs[1].path().join("f")).unwrap(), b"fresh data");
        assert!(set.iter().all(|h| !h.out_of_sync));

        // Once repaired, a rescan sees the set as settled.
        assert_eq!(latest_modified(&mut set), None);
    }

    #[test]
    fn repair_source_can_differ_from_the_master() {
        // First entry is the fallback master but holds the stale copy; the
        // newest replica is the copy source.
        let (dirs, registry) = three_replicas("f", [b"stale", b"newest bytes", b"stale"]);
        set_mtime_secs(&dirs[0].path().join("f"), 1_000);
        set_mtime_secs(&dirs[1].path().join("f"), 9_000);
        set_mtime_secs(&dirs[2].path().join("f"), 1_000);
        let mut set = ReplicaSet::new(&registry);
        set.resolve(OsStr::new("/f"), None);
        assert_eq!(set.master_index(), Some(0));

        let newest = latest_modified(&mut set).unwrap();
        assert_eq!(newest, 1);
        assert_eq!(integrity_check(&mut set, newest), OpStatus::Ok);

        for dir in &dirs {
            assert_eq!(fs::read(dir.path().join("f")).unwrap(), b"newest bytes");
        }
    }

    #[test]
    fn failed_copy_keeps_the_flag_armed_and_repairs_the_rest() {
        // Replica 1 cannot take a whole-file copy (a directory sits where
        // the file should be); replica 2 is ordinary stale. The walk must
        // not stop at the failure.
        let dirs: Vec<_> = (0..3).map(|_| tempfile::tempdir().unwrap()).collect();
        let mut registry = Registry::new();
        fs::write(dirs[0].path().join("f"), b"fresh data").unwrap();
        fs::create_dir(dirs[1].path().join("f")).unwrap();
        fs::write(dirs[2].path().join("f"), b"stale").unwrap();
        for dir in &dirs {
            registry.add_root(dir.path().to_path_buf(), false).unwrap();
        }
        set_mtime_secs(&dirs[0].path().join("f"), 5_000);
        set_mtime_secs(&dirs[1].path().join("f"), 1_000);
        set_mtime_secs(&dirs[2].path().join("f"), 1_000);
        let mut set = ReplicaSet::new(&registry);
        set.resolve(OsStr::new("/f"), None);

        let newest = latest_modified(&mut set).unwrap();
        assert_eq!(newest, 0);
        assert_ne!(integrity_check(&mut set, newest), OpStatus::Ok);

        // The reachable stale replica was still repaired and cleared.
        assert_eq!(fs::read(dirs[2].path().join("f")).unwrap(), b"fresh data");
        let flags: Vec<_> = set.iter().map(|h| h.out_of_sync).collect();
        assert_eq!(flags, vec![false, true, false]);

        // The unrepaired replica's timestamp was not flattened, so a rescan
        // still sees the divergence.
        assert_eq!(latest_modified(&mut set), Some(0));
    }

    #[test]
    fn synchronize_times_stamps_master_times_everywhere() {
        let (dirs, registry) = three_replicas("f", [b"x", b"x", b"x"]);
        set_mtime_secs(&dirs[0].path().join("f"), 7_777);
        set_mtime_secs(&dirs[1].path().join("f"), 1);
        set_mtime_secs(&dirs[2].path().join("f"), 2);
        let mut set = ReplicaSet::new(&registry);
        set.resolve(OsStr::new("/f"), None);

        assert_eq!(synchronize_times(&mut set), OpStatus::Ok);
        for dir in &dirs {
            let meta = fs::metadata(dir.path().join("f")).unwrap();
            let mtime = FileTime::from_last_modification_time(&meta);
            assert_eq!(mtime.unix_seconds(), 7_777);
        }
    }
}
