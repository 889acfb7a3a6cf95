use crate::config::{BackingLocation, PrefixMap, Registry};
use crate::status::{self, OpStatus};
use crate::util::{file_attr_from_stat, file_type_from_mode, retry_eintr};
use fuse3::FileType;
use fuse3::path::reply::FileAttr;
use nix::dir::Dir;
use nix::fcntl::{AtFlags, FcntlArg, OFlag, fcntl, openat, renameat};
use nix::sys::stat::{
    FchmodatFlags, FileStat, Mode, UtimensatFlags, fstat, fstatat, mkdirat, utimensat,
};
use nix::sys::statvfs::{Statvfs, fstatvfs};
use nix::sys::time::TimeSpec;
use nix::sys::uio::{pread, pwrite};
use nix::unistd::{UnlinkatFlags, fsync, ftruncate, unlinkat};
use std::ffi::{CStr, CString, OsStr, OsString};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a single-replica open should do. Directory opens go through
/// `mkdirat` first when creation is requested.
#[derive(Debug, Clone, Copy)]
pub struct OpenRequest {
    pub flags: OFlag,
    pub mode: Mode,
    pub directory: bool,
    pub create_dir: bool,
}

impl OpenRequest {
    pub fn file(flags: u32, mode: u32) -> Self {
        Self {
            flags: crate::util::oflag_from_bits(flags),
            mode: Mode::from_bits_truncate(mode & 0o777),
            directory: false,
            create_dir: false,
        }
    }

    pub fn directory() -> Self {
        Self {
            flags: OFlag::O_RDONLY,
            mode: Mode::empty(),
            directory: true,
            create_dir: false,
        }
    }

    pub fn create_directory(mode: u32) -> Self {
        Self {
            flags: OFlag::O_RDONLY,
            mode: Mode::from_bits_truncate(mode),
            directory: true,
            create_dir: true,
        }
    }
}

/// One logical directory entry, as enumerated from the master replica.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: OsString,
    pub kind: FileType,
    pub attr: Option<FileAttr>,
}

/// Rewrites the configured network-name prefix and strips the leading
/// separator so the result is relative to a backing root. The filesystem
/// root maps to ".".
fn resolve_rel(logical: &OsStr, prefix: Option<&PrefixMap>) -> PathBuf {
    let bytes = logical.as_bytes();
    let mut mapped: Vec<u8> = match prefix {
        Some(map) if bytes.starts_with(map.from.as_bytes()) => {
            let mut out = map.to.as_bytes().to_vec();
            out.extend_from_slice(&bytes[map.from.as_bytes().len()..]);
            out
        }
        _ => bytes.to_vec(),
    };
    while mapped.first() == Some(&b'/') {
        mapped.remove(0);
    }
    if mapped.is_empty() {
        mapped.extend_from_slice(b".");
    }
    PathBuf::from(OsString::from_vec(mapped))
}

/// One replica of the current logical file. Outlives individual operations;
/// scoped to one open-file context.
#[derive(Debug)]
pub struct ReplicaHandle {
    location: Arc<BackingLocation>,
    rel_path: Option<PathBuf>,
    file: Option<OwnedFd>,
    pub out_of_sync: bool,
    pub last_status: OpStatus,
    pub master: bool,
}

impl ReplicaHandle {
    fn new(location: Arc<BackingLocation>) -> Self {
        let master = location.master;
        Self {
            location,
            rel_path: None,
            file: None,
            out_of_sync: false,
            last_status: OpStatus::Ok,
            master,
        }
    }

    pub fn root(&self) -> &Path {
        &self.location.root
    }

    fn root_fd(&self) -> BorrowedFd<'_> {
        self.location.root_fd()
    }

    #[cfg(test)]
    pub fn has_handle(&self) -> bool {
        self.file.is_some()
    }

    /// Computes the backing-relative path once; later calls are no-ops.
    pub fn resolve(&mut self, logical: &OsStr, prefix: Option<&PrefixMap>) {
        if self.rel_path.is_none() {
            self.rel_path = Some(resolve_rel(logical, prefix));
        }
    }

    fn resolved(&self) -> Result<&Path, OpStatus> {
        self.rel_path.as_deref().ok_or(OpStatus::InvalidHandle)
    }

    pub fn abs_path(&self) -> Result<PathBuf, OpStatus> {
        let rel = self.resolved()?;
        if rel == Path::new(".") {
            Ok(self.location.root.clone())
        } else {
            Ok(self.location.root.join(rel))
        }
    }

    fn abs_cstring(&self) -> Result<CString, OpStatus> {
        let abs = self.abs_path()?;
        CString::new(abs.into_os_string().into_vec()).map_err(|_| OpStatus::Io(libc::EINVAL))
    }

    /// Opens (or creates) the backing file and keeps the fd on the handle.
    pub fn open(&mut self, req: &OpenRequest) -> OpStatus {
        let rel = match self.resolved() {
            Ok(rel) => rel.to_path_buf(),
            Err(status) => return status,
        };

        if req.directory {
            if req.create_dir {
                if let Err(err) = mkdirat(self.root_fd(), &rel, req.mode) {
                    return err.into();
                }
            }
            match openat(
                self.root_fd(),
                &rel,
                OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
                Mode::empty(),
            ) {
                Ok(fd) => {
                    self.file = Some(fd);
                    OpStatus::Ok
                }
                Err(err) => err.into(),
            }
        } else {
            match openat(self.root_fd(), &rel, req.flags | OFlag::O_CLOEXEC, req.mode) {
                Ok(fd) => {
                    self.file = Some(fd);
                    OpStatus::Ok
                }
                Err(err) => err.into(),
            }
        }
    }

    /// Reads through the cached fd, or a transient one scoped to this call
    /// when the handle was already cleaned up.
    pub fn read_at(&self, offset: u64, size: u32) -> Result<Vec<u8>, OpStatus> {
        let rel = self.resolved()?;
        let transient;
        let fd = match self.file.as_ref() {
            Some(fd) => fd.as_fd(),
            None => {
                transient = openat(
                    self.root_fd(),
                    rel,
                    OFlag::O_RDONLY | OFlag::O_CLOEXEC,
                    Mode::empty(),
                )?;
                transient.as_fd()
            }
        };

        let mut buf = vec![0u8; size as usize];
        let read_len = retry_eintr(|| pread(fd, &mut buf, offset as i64))?;
        buf.truncate(read_len);
        Ok(buf)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize, OpStatus> {
        let rel = self.resolved()?;
        let transient;
        let fd = match self.file.as_ref() {
            Some(fd) => fd.as_fd(),
            None => {
                transient = openat(
                    self.root_fd(),
                    rel,
                    OFlag::O_WRONLY | OFlag::O_CLOEXEC,
                    Mode::empty(),
                )?;
                transient.as_fd()
            }
        };

        Ok(retry_eintr(|| pwrite(fd, data, offset as i64))?)
    }

    /// Flushing an already cleaned-up handle is a success, as the backing
    /// store has nothing buffered for it.
    pub fn flush(&self) -> OpStatus {
        match self.file.as_ref() {
            Some(fd) => match fsync(fd.as_fd()) {
                Ok(()) => OpStatus::Ok,
                Err(err) => err.into(),
            },
            None => OpStatus::Ok,
        }
    }

    /// Stat by open handle, falling back to a by-path lookup when the handle
    /// is absent or refuses the query (the root pseudo-entry case).
    pub fn metadata(&self) -> Result<FileStat, OpStatus> {
        let rel = self.resolved()?;
        if let Some(fd) = self.file.as_ref() {
            if let Ok(stat) = fstat(fd.as_fd()) {
                return Ok(stat);
            }
        }
        Ok(fstatat(
            self.root_fd(),
            rel,
            AtFlags::AT_SYMLINK_NOFOLLOW,
        )?)
    }

    pub fn set_times(&self, atime: Option<TimeSpec>, mtime: Option<TimeSpec>) -> OpStatus {
        let rel = match self.resolved() {
            Ok(rel) => rel,
            Err(status) => return status,
        };
        let atime = atime.unwrap_or(TimeSpec::UTIME_OMIT);
        let mtime = mtime.unwrap_or(TimeSpec::UTIME_OMIT);
        match utimensat(
            self.root_fd(),
            rel,
            &atime,
            &mtime,
            UtimensatFlags::NoFollowSymlink,
        ) {
            Ok(()) => OpStatus::Ok,
            Err(err) => err.into(),
        }
    }

    pub fn set_mode(&self, mode: u32) -> OpStatus {
        let rel = match self.resolved() {
            Ok(rel) => rel,
            Err(status) => return status,
        };
        match nix::sys::stat::fchmodat(
            self.root_fd(),
            rel,
            Mode::from_bits_truncate(mode),
            FchmodatFlags::FollowSymlink,
        ) {
            Ok(()) => OpStatus::Ok,
            Err(err) => err.into(),
        }
    }

    pub fn delete_file(&self) -> OpStatus {
        let rel = match self.resolved() {
            Ok(rel) => rel,
            Err(status) => return status,
        };
        match fstatat(self.root_fd(), rel, AtFlags::AT_SYMLINK_NOFOLLOW) {
            Ok(stat) if file_type_from_mode(stat.st_mode) == FileType::Directory => {
                return OpStatus::IsDirectory;
            }
            _ => {}
        }
        match unlinkat(self.root_fd(), rel, UnlinkatFlags::NoRemoveDir) {
            Ok(()) => OpStatus::Ok,
            Err(err) => err.into(),
        }
    }

    pub fn delete_dir(&self) -> OpStatus {
        let rel = match self.resolved() {
            Ok(rel) => rel.to_path_buf(),
            Err(status) => return status,
        };
        let mut dir = match Dir::openat(
            self.root_fd(),
            &rel,
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        ) {
            Ok(dir) => dir,
            Err(err) => return err.into(),
        };
        for entry in dir.iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let name = entry.file_name().to_bytes();
            if name != b"." && name != b".." {
                return OpStatus::DirectoryNotEmpty;
            }
        }
        drop(dir);
        match unlinkat(self.root_fd(), &rel, UnlinkatFlags::RemoveDir) {
            Ok(()) => OpStatus::Ok,
            Err(err) => err.into(),
        }
    }

    /// Renames within this replica's backing root. The cached resolved path
    /// moves with the file on success, and only then.
    pub fn rename(&mut self, new_logical: &OsStr, prefix: Option<&PrefixMap>) -> OpStatus {
        let old_rel = match self.resolved() {
            Ok(rel) => rel.to_path_buf(),
            Err(status) => return status,
        };
        let new_rel = resolve_rel(new_logical, prefix);
        match renameat(self.root_fd(), &old_rel, self.root_fd(), &new_rel) {
            Ok(()) => {
                self.rel_path = Some(new_rel);
                OpStatus::Ok
            }
            Err(err) => err.into(),
        }
    }

    fn byte_range_lock(&self, lock_type: i32, offset: u64, len: u64) -> OpStatus {
        let Some(fd) = self.file.as_ref() else {
            return OpStatus::InvalidHandle;
        };
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = lock_type as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = offset as libc::off_t;
        fl.l_len = len as libc::off_t;
        match fcntl(fd.as_fd(), FcntlArg::F_SETLK(&fl)) {
            Ok(_) => OpStatus::Ok,
            Err(err) => err.into(),
        }
    }

    pub fn lock(&self, offset: u64, len: u64) -> OpStatus {
        self.byte_range_lock(libc::F_WRLCK, offset, len)
    }

    pub fn unlock(&self, offset: u64, len: u64) -> OpStatus {
        self.byte_range_lock(libc::F_UNLCK, offset, len)
    }

    pub fn truncate(&self, size: u64) -> OpStatus {
        let rel = match self.resolved() {
            Ok(rel) => rel,
            Err(status) => return status,
        };
        let transient;
        let fd = match self.file.as_ref() {
            Some(fd) => fd.as_fd(),
            None => {
                transient = match openat(
                    self.root_fd(),
                    rel,
                    OFlag::O_WRONLY | OFlag::O_CLOEXEC,
                    Mode::empty(),
                ) {
                    Ok(fd) => fd,
                    Err(err) => return err.into(),
                };
                transient.as_fd()
            }
        };
        match ftruncate(fd, size as i64) {
            Ok(()) => OpStatus::Ok,
            Err(err) => err.into(),
        }
    }

    /// Allocation-size semantics: only a shrink below the current file size
    /// changes anything; growing the allocation is a no-op.
    pub fn allocate(&self, alloc_size: u64) -> OpStatus {
        let stat = match self.metadata() {
            Ok(stat) => stat,
            Err(status) => return status,
        };
        if alloc_size < stat.st_size as u64 {
            self.truncate(alloc_size)
        } else {
            OpStatus::Ok
        }
    }

    pub fn close(&mut self) -> OpStatus {
        self.file = None;
        OpStatus::Ok
    }

    pub fn set_xattr(&self, name: &CStr, value: &[u8], flags: u32) -> OpStatus {
        let path = match self.abs_cstring() {
            Ok(path) => path,
            Err(status) => return status,
        };
        let res = unsafe {
            libc::lsetxattr(
                path.as_ptr(),
                name.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                flags as libc::c_int,
            )
        };
        if res < 0 {
            std::io::Error::last_os_error().into()
        } else {
            OpStatus::Ok
        }
    }

    pub fn get_xattr(&self, name: &CStr) -> Result<Vec<u8>, OpStatus> {
        let path = self.abs_cstring()?;
        let len = unsafe { libc::lgetxattr(path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0) };
        if len < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let mut buf = vec![0u8; len as usize];
        let res = unsafe {
            libc::lgetxattr(
                path.as_ptr(),
                name.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if res < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        buf.truncate(res as usize);
        Ok(buf)
    }

    pub fn remove_xattr(&self, name: &CStr) -> OpStatus {
        let path = match self.abs_cstring() {
            Ok(path) => path,
            Err(status) => return status,
        };
        let res = unsafe { libc::lremovexattr(path.as_ptr(), name.as_ptr()) };
        if res < 0 {
            std::io::Error::last_os_error().into()
        } else {
            OpStatus::Ok
        }
    }

    pub fn list_xattrs(&self) -> Result<Vec<u8>, OpStatus> {
        let path = self.abs_cstring()?;
        let len = unsafe { libc::llistxattr(path.as_ptr(), std::ptr::null_mut(), 0) };
        if len < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        let mut buf = vec![0u8; len as usize];
        let res = unsafe {
            libc::llistxattr(path.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
        };
        if res < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        buf.truncate(res as usize);
        Ok(buf)
    }

    pub fn list_dir(&self) -> Result<Vec<DirEntryInfo>, OpStatus> {
        let rel = self.resolved()?;
        let mut dir = Dir::openat(
            self.root_fd(),
            rel,
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;

        let dir_fd = dir.as_raw_fd();
        let mut entries = Vec::new();
        for entry in dir.iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let raw = entry.file_name().to_bytes();
            if raw == b"." || raw == b".." {
                continue;
            }
            let name = OsStr::from_bytes(raw).to_os_string();
            let borrowed = unsafe { BorrowedFd::borrow_raw(dir_fd) };
            let (kind, attr) =
                match fstatat(borrowed, name.as_os_str(), AtFlags::AT_SYMLINK_NOFOLLOW) {
                    Ok(stat) => (
                        file_type_from_mode(stat.st_mode),
                        Some(file_attr_from_stat(&stat)),
                    ),
                    Err(_) => (FileType::RegularFile, None),
                };
            entries.push(DirEntryInfo { name, kind, attr });
        }
        Ok(entries)
    }

    pub fn statvfs(&self) -> Result<Statvfs, OpStatus> {
        Ok(fstatvfs(self.root_fd())?)
    }

    pub fn access(&self, flags: nix::unistd::AccessFlags) -> OpStatus {
        let rel = match self.resolved() {
            Ok(rel) => rel,
            Err(status) => return status,
        };
        match nix::unistd::faccessat(self.root_fd(), rel, flags, AtFlags::empty()) {
            Ok(()) => OpStatus::Ok,
            Err(err) => err.into(),
        }
    }
}

/// Ordered set of replicas for one logical file, in bijection with the
/// registry after `synchronize`.
#[derive(Debug, Default)]
pub struct ReplicaSet {
    handles: Vec<ReplicaHandle>,
    master_idx: Option<usize>,
    pending_resync: bool,
}

impl ReplicaSet {
    pub fn new(registry: &Registry) -> Self {
        let mut set = Self::default();
        set.synchronize(registry);
        set
    }

    /// Reconciles the set against the registry: drops replicas whose root
    /// left, appends unopened replicas for new roots, recomputes the master.
    /// A call against an unchanged registry is a no-op.
    pub fn synchronize(&mut self, registry: &Registry) {
        self.handles
            .retain(|handle| registry.iter().any(|loc| loc.root == *handle.root()));
        for loc in registry.iter() {
            if !self.handles.iter().any(|handle| handle.root() == loc.root) {
                self.handles.push(ReplicaHandle::new(loc.clone()));
            }
        }
        self.update_master();
    }

    /// Rescans for the flagged master, falling back to the first entry. A
    /// detected change arms `pending_resync` so the next named mutation runs
    /// a full integrity check.
    pub fn update_master(&mut self) -> bool {
        let new_idx = self
            .handles
            .iter()
            .position(|handle| handle.master)
            .or(if self.handles.is_empty() { None } else { Some(0) });
        if new_idx == self.master_idx {
            return false;
        }
        let had_master = self.master_idx.is_some();
        self.master_idx = new_idx;
        if had_master {
            self.pending_resync = true;
            return true;
        }
        false
    }

    pub fn take_pending_resync(&mut self) -> bool {
        std::mem::take(&mut self.pending_resync)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn master_index(&self) -> Option<usize> {
        self.master_idx
    }

    pub fn master(&self) -> Option<&ReplicaHandle> {
        self.master_idx.and_then(|idx| self.handles.get(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicaHandle> {
        self.handles.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ReplicaHandle> {
        self.handles.iter_mut()
    }

    pub fn get(&self, idx: usize) -> Option<&ReplicaHandle> {
        self.handles.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut ReplicaHandle> {
        self.handles.get_mut(idx)
    }

    pub fn resolve(&mut self, logical: &OsStr, prefix: Option<&PrefixMap>) {
        for handle in &mut self.handles {
            handle.resolve(logical, prefix);
        }
    }

    /// Per-replica statuses of the last fan-out, in iteration order.
    pub fn statuses(&self) -> Vec<OpStatus> {
        self.handles.iter().map(|h| h.last_status).collect()
    }

    pub fn aggregate(&self) -> OpStatus {
        status::aggregate(self.handles.iter().map(|h| h.last_status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn registry(dirs: &[(&tempfile::TempDir, bool)]) -> Registry {
        let mut registry = Registry::new();
        for (dir, master) in dirs {
            registry
                .add_root(dir.path().to_path_buf(), *master)
                .unwrap();
        }
        registry
    }

    #[test]
    fn synchronize_is_bijective_and_idempotent() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let registry = registry(&[(&a, true), (&b, false)]);

        let mut set = ReplicaSet::new(&registry);
        assert_eq!(set.len(), registry.len());
        let roots: Vec<_> = set.iter().map(|h| h.root().to_path_buf()).collect();
        assert_eq!(roots, vec![a.path().to_path_buf(), b.path().to_path_buf()]);

        set.synchronize(&registry);
        assert_eq!(set.len(), 2);
        assert_eq!(set.master_index(), Some(0));
    }

    #[test]
    fn empty_registry_yields_empty_set() {
        let registry = Registry::new();
        let set = ReplicaSet::new(&registry);
        assert!(set.is_empty());
        assert_eq!(set.master_index(), None);
        assert_eq!(set.aggregate(), OpStatus::NotConfigured);
    }

    #[test]
    fn first_entry_serves_as_master_when_none_flagged() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let registry = registry(&[(&a, false), (&b, false)]);

        let set = ReplicaSet::new(&registry);
        assert_eq!(set.master_index(), Some(0));
        assert!(!set.master().unwrap().master);
    }

    #[test]
    fn flagged_master_wins_over_first_entry() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let registry = registry(&[(&a, false), (&b, true)]);

        let set = ReplicaSet::new(&registry);
        assert_eq!(set.master_index(), Some(1));
    }

    #[test]
    fn resolve_caches_and_substitutes_prefix() {
        let map = PrefixMap {
            from: OsString::from("/net/share"),
            to: OsString::from("/local"),
        };
        assert_eq!(
            resolve_rel(OsStr::new("/net/share/a.txt"), Some(&map)),
            PathBuf::from("local/a.txt")
        );
        assert_eq!(
            resolve_rel(OsStr::new("/plain.txt"), Some(&map)),
            PathBuf::from("plain.txt")
        );
        assert_eq!(resolve_rel(OsStr::new("/"), None), PathBuf::from("."));

        let a = tempfile::tempdir().unwrap();
        let registry = registry(&[(&a, true)]);
        let mut set = ReplicaSet::new(&registry);
        set.resolve(OsStr::new("/foo.txt"), None);
        let first = set.get(0).unwrap().abs_path().unwrap();
        // A later resolve against another name must not recompute the path.
        set.resolve(OsStr::new("/other.txt"), None);
        assert_eq!(set.get(0).unwrap().abs_path().unwrap(), first);
    }

    #[test]
    fn rename_moves_the_cached_path() {
        let a = tempfile::tempdir().unwrap();
        fs::write(a.path().join("old.txt"), b"payload").unwrap();
        let registry = registry(&[(&a, true)]);

        let mut set = ReplicaSet::new(&registry);
        set.resolve(OsStr::new("/old.txt"), None);
        let handle = set.get_mut(0).unwrap();
        assert_eq!(handle.rename(OsStr::new("/new.txt"), None), OpStatus::Ok);
        assert_eq!(handle.abs_path().unwrap(), a.path().join("new.txt"));
        assert!(a.path().join("new.txt").exists());
        assert!(!a.path().join("old.txt").exists());
    }

    #[test]
    fn failed_rename_keeps_the_cached_path() {
        let a = tempfile::tempdir().unwrap();
        let registry = registry(&[(&a, true)]);

        let mut set = ReplicaSet::new(&registry);
        set.resolve(OsStr::new("/missing.txt"), None);
        let handle = set.get_mut(0).unwrap();
        assert_eq!(
            handle.rename(OsStr::new("/new.txt"), None),
            OpStatus::NotFound
        );
        assert_eq!(handle.abs_path().unwrap(), a.path().join("missing.txt"));
    }

    #[test]
    fn lock_without_handle_is_invalid() {
        let a = tempfile::tempdir().unwrap();
        fs::write(a.path().join("f.txt"), b"x").unwrap();
        let registry = registry(&[(&a, true)]);

        let mut set = ReplicaSet::new(&registry);
        set.resolve(OsStr::new("/f.txt"), None);
        let handle = set.get_mut(0).unwrap();
        assert_eq!(handle.lock(0, 1), OpStatus::InvalidHandle);

        assert_eq!(
            handle.open(&OpenRequest::file(libc::O_RDWR as u32, 0)),
            OpStatus::Ok
        );
        assert_eq!(handle.lock(0, 1), OpStatus::Ok);
        assert_eq!(handle.unlock(0, 1), OpStatus::Ok);
    }

    #[test]
    fn delete_dir_refuses_non_empty() {
        let a = tempfile::tempdir().unwrap();
        fs::create_dir(a.path().join("d")).unwrap();
        fs::write(a.path().join("d/child"), b"x").unwrap();
        let registry = registry(&[(&a, true)]);

        let mut set = ReplicaSet::new(&registry);
        set.resolve(OsStr::new("/d"), None);
        let handle = set.get_mut(0).unwrap();
        assert_eq!(handle.delete_dir(), OpStatus::DirectoryNotEmpty);

        fs::remove_file(a.path().join("d/child")).unwrap();
        assert_eq!(handle.delete_dir(), OpStatus::Ok);
        assert!(!a.path().join("d").exists());
    }

    #[test]
    fn delete_file_refuses_directories() {
        let a = tempfile::tempdir().unwrap();
        fs::create_dir(a.path().join("d")).unwrap();
        let registry = registry(&[(&a, true)]);

        let mut set = ReplicaSet::new(&registry);
        set.resolve(OsStr::new("/d"), None);
        assert_eq!(set.get(0).unwrap().delete_file(), OpStatus::IsDirectory);
    }

    #[test]
    fn transient_read_write_round_trip() {
        let a = tempfile::tempdir().unwrap();
        fs::write(a.path().join("f.txt"), b"").unwrap();
        let registry = registry(&[(&a, true)]);

        let mut set = ReplicaSet::new(&registry);
        set.resolve(OsStr::new("/f.txt"), None);
        let handle = set.get(0).unwrap();
        assert!(!handle.has_handle());
        assert_eq!(handle.write_at(0, b"0123456789").unwrap(), 10);
        assert!(!handle.has_handle());
        assert_eq!(handle.read_at(0, 10).unwrap(), b"0123456789");
    }

    #[test]
    fn master_change_arms_pending_resync() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let registry_b_master = registry(&[(&a, false), (&b, true)]);
        let mut set = ReplicaSet::new(&registry_b_master);
        assert_eq!(set.master_index(), Some(1));
        assert!(!set.take_pending_resync());

        // Master root disappears from the registry; the first entry takes
        // over and the change is flagged for resync.
        let registry_a_only = registry(&[(&a, false)]);
        set.synchronize(&registry_a_only);
        assert_eq!(set.master_index(), Some(0));
        assert!(set.take_pending_resync());
        assert!(!set.take_pending_resync());
    }
}
