use crate::status::OpStatus;
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use std::ffi::OsString;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;

/// Hard upper bound on configured backing roots, matching the small bounded
/// cardinality the replication model is designed for.
pub const MAX_BACKING_ROOTS: usize = 3;

/// One backing location. The root directory fd is opened once at
/// configuration time so every per-replica primitive can use `*at` syscalls
/// relative to it.
#[derive(Debug)]
pub struct BackingLocation {
    pub root: PathBuf,
    root_fd: OwnedFd,
    pub master: bool,
}

impl BackingLocation {
    fn open(root: PathBuf, master: bool) -> Result<Self, OpStatus> {
        let fd = open(
            &root,
            OFlag::O_RDONLY | OFlag::O_CLOEXEC | OFlag::O_DIRECTORY,
            Mode::empty(),
        )?;
        Ok(Self {
            root,
            root_fd: fd,
            master,
        })
    }

    pub fn root_fd(&self) -> BorrowedFd<'_> {
        self.root_fd.as_fd()
    }
}

/// Remaps a network-visible name prefix onto its local-mount equivalent
/// before backing paths are resolved.
#[derive(Debug, Clone, Default)]
pub struct PrefixMap {
    pub from: OsString,
    pub to: OsString,
}

/// Immutable snapshot of the configured backing set. Built once before the
/// mount starts processing requests and shared by `Arc` into every context;
/// never mutated afterwards.
#[derive(Debug, Default)]
pub struct Registry {
    locations: Vec<Arc<BackingLocation>>,
    prefix_map: Option<PrefixMap>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append-only, configuration time only. Only one root may carry the
    /// master flag; additional ones are rejected.
    pub fn add_root(&mut self, root: PathBuf, master: bool) -> Result<(), OpStatus> {
        if self.locations.len() >= MAX_BACKING_ROOTS {
            return Err(OpStatus::Io(libc::E2BIG));
        }
        if master && self.locations.iter().any(|loc| loc.master) {
            return Err(OpStatus::AlreadyExists);
        }
        self.locations.push(Arc::new(BackingLocation::open(root, master)?));
        Ok(())
    }

    pub fn set_prefix_map(&mut self, from: OsString, to: OsString) {
        self.prefix_map = Some(PrefixMap { from, to });
    }

    pub fn prefix_map(&self) -> Option<&PrefixMap> {
        self.prefix_map.as_ref()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BackingLocation>> {
        self.locations.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_more_than_max_roots() {
        let dirs: Vec<_> = (0..4).map(|_| tempfile::tempdir().unwrap()).collect();
        let mut registry = Registry::new();
        for dir in dirs.iter().take(MAX_BACKING_ROOTS) {
            registry.add_root(dir.path().to_path_buf(), false).unwrap();
        }
        let err = registry
            .add_root(dirs[3].path().to_path_buf(), false)
            .unwrap_err();
        assert_eq!(err, OpStatus::Io(libc::E2BIG));
        assert_eq!(registry.len(), MAX_BACKING_ROOTS);
    }

    #[test]
    fn rejects_second_master() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let mut registry = Registry::new();
        registry.add_root(a.path().to_path_buf(), true).unwrap();
        let err = registry.add_root(b.path().to_path_buf(), true).unwrap_err();
        assert_eq!(err, OpStatus::AlreadyExists);
    }

    #[test]
    fn master_flag_lands_on_the_right_root() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let mut registry = Registry::new();
        registry.add_root(a.path().to_path_buf(), true).unwrap();
        registry.add_root(b.path().to_path_buf(), false).unwrap();
        let masters: Vec<bool> = registry.iter().map(|loc| loc.master).collect();
        assert_eq!(masters, vec![true, false]);
    }

    #[test]
    fn missing_root_fails_open() {
        let mut registry = Registry::new();
        let err = registry
            .add_root(PathBuf::from("/nonexistent/mirrorfs-root"), false)
            .unwrap_err();
        assert_eq!(err, OpStatus::NotFound);
    }
}
