//! One entry point per filesystem operation. Every mutation is applied to
//! each configured backing location in registry order; queries that must
//! present a single authoritative view go to the master replica only.
//!
//! The final result of a fan-out is the worst per-replica status, so a
//! replica failure is never silently absorbed.

use crate::config::Registry;
use crate::context::ContextTable;
use crate::replica::{DirEntryInfo, OpenRequest, ReplicaSet};
use crate::status::OpStatus;
use crate::sync::{integrity_check, latest_modified, synchronize_times};
use crate::util::file_attr_from_stat;
use fuse3::path::reply::FileAttr;
use log::{debug, warn};
use nix::sys::statvfs::Statvfs;
use nix::sys::time::TimeSpec;
use std::ffi::{CStr, OsStr};
use std::sync::{Arc, Mutex};

pub struct Fanout {
    registry: Arc<Registry>,
    contexts: ContextTable,
}

impl Fanout {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
            contexts: ContextTable::new(),
        }
    }

    /// A set scoped to one operation, for ops that arrive without a handle.
    fn ephemeral(&self, logical: &OsStr) -> Result<ReplicaSet, OpStatus> {
        if self.registry.is_empty() {
            return Err(OpStatus::NotConfigured);
        }
        let mut set = ReplicaSet::new(&self.registry);
        set.resolve(logical, self.registry.prefix_map());
        Ok(set)
    }

    fn context(&self, fh: u64) -> Result<Arc<Mutex<ReplicaSet>>, OpStatus> {
        self.contexts.get(fh).ok_or(OpStatus::InvalidHandle)
    }

    /// Runs `op` against the handle's context when one exists, otherwise
    /// against an ephemeral set for the path.
    fn with_set<T>(
        &self,
        logical: &OsStr,
        fh: Option<u64>,
        op: impl FnOnce(&mut ReplicaSet) -> T,
    ) -> Result<T, OpStatus> {
        if let Some(fh) = fh {
            if let Ok(ctx) = self.context(fh) {
                let mut set = ctx.lock().unwrap_or_else(|e| e.into_inner());
                return Ok(op(&mut set));
            }
        }
        let mut set = self.ephemeral(logical)?;
        Ok(op(&mut set))
    }

    /// A master change leaves the set in doubt, so the next mutation pays
    /// for a full staleness scan and repair before touching anything.
    fn resync_if_pending(set: &mut ReplicaSet) {
        if set.take_pending_resync() {
            debug!("master changed, forcing integrity check");
            if let Some(newest) = latest_modified(set) {
                integrity_check(set, newest);
            }
        }
    }

    /// Opens the logical file on every replica and registers the context.
    /// Opening an existing file first repairs any replica that fell behind.
    pub fn open(&self, logical: &OsStr, req: &OpenRequest) -> Result<u64, OpStatus> {
        let mut set = self.ephemeral(logical)?;

        let creating = req.create_dir || req.flags.contains(nix::fcntl::OFlag::O_CREAT);
        // Directories are never repaired by copy, so only file opens pay for
        // the staleness scan. `O_CREAT` against an existing file still goes
        // through it: the scan is vacuous for genuinely new files, and
        // skipping it here would flatten timestamps over divergent content
        // before repair ever saw the evidence. Repair is best-effort; a
        // replica that cannot be repaired stays flagged and the open
        // proceeds.
        if !req.directory {
            if let Some(newest) = latest_modified(&mut set) {
                let status = integrity_check(&mut set, newest);
                if status != OpStatus::Ok {
                    warn!("repair of {logical:?} incomplete: {status:?}");
                }
            }
        }

        for handle in set.iter_mut() {
            handle.last_status = handle.open(req);
        }
        let worst = set.aggregate();
        if worst != OpStatus::Ok {
            debug!("open {logical:?} fan-out statuses: {:?}", set.statuses());
            return Err(worst);
        }
        if creating {
            synchronize_times(&mut set);
        }
        Ok(self.contexts.insert(set))
    }

    pub fn release(&self, fh: u64) -> OpStatus {
        match self.contexts.remove(fh) {
            Some(ctx) => {
                let mut set = ctx.lock().unwrap_or_else(|e| e.into_inner());
                synchronize_times(&mut set);
                for handle in set.iter_mut() {
                    handle.last_status = handle.close();
                }
                OpStatus::Ok
            }
            None => OpStatus::InvalidHandle,
        }
    }

    /// Attributes always come from the master replica.
    pub fn getattr(&self, logical: &OsStr, fh: Option<u64>) -> Result<FileAttr, OpStatus> {
        self.with_set(logical, fh, |set| {
            let master = set.master().ok_or(OpStatus::NotConfigured)?;
            let stat = master.metadata()?;
            Ok(file_attr_from_stat(&stat))
        })?
    }

    /// Reads from every replica, keeping the bytes of the last replica that
    /// answered. A replica failure fails the whole read.
    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, OpStatus> {
        let ctx = self.context(fh)?;
        let mut set = ctx.lock().unwrap_or_else(|e| e.into_inner());

        let mut data = None;
        for handle in set.iter_mut() {
            match handle.read_at(offset, size) {
                Ok(buf) => {
                    handle.last_status = OpStatus::Ok;
                    data = Some(buf);
                }
                Err(status) => handle.last_status = status,
            }
        }
        let worst = set.aggregate();
        if worst != OpStatus::Ok {
            return Err(worst);
        }
        data.ok_or(OpStatus::NotConfigured)
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, OpStatus> {
        let ctx = self.context(fh)?;
        let mut set = ctx.lock().unwrap_or_else(|e| e.into_inner());
        Self::resync_if_pending(&mut set);

        let mut written = 0usize;
        for handle in set.iter_mut() {
            match handle.write_at(offset, data) {
                Ok(len) => {
                    handle.last_status = OpStatus::Ok;
                    written = len;
                }
                Err(status) => handle.last_status = status,
            }
        }
        let worst = set.aggregate();
        if worst != OpStatus::Ok {
            return Err(worst);
        }
        synchronize_times(&mut set);
        Ok(written as u32)
    }

    pub fn flush(&self, fh: u64) -> OpStatus {
        let ctx = match self.context(fh) {
            Ok(ctx) => ctx,
            Err(status) => return status,
        };
        let mut set = ctx.lock().unwrap_or_else(|e| e.into_inner());
        for handle in set.iter_mut() {
            handle.last_status = handle.flush();
        }
        set.aggregate()
    }

    pub fn truncate(&self, logical: &OsStr, fh: Option<u64>, size: u64) -> OpStatus {
        let result = self.with_set(logical, fh, |set| {
            Self::resync_if_pending(set);
            for handle in set.iter_mut() {
                handle.last_status = handle.truncate(size);
            }
            let worst = set.aggregate();
            if worst == OpStatus::Ok {
                synchronize_times(set);
            }
            worst
        });
        result.unwrap_or_else(|status| status)
    }

    pub fn allocate(&self, fh: u64, offset: u64, length: u64) -> OpStatus {
        let ctx = match self.context(fh) {
            Ok(ctx) => ctx,
            Err(status) => return status,
        };
        // The kernel controls both values; saturate rather than trust them
        // to stay below u64::MAX together.
        let alloc_size = offset.saturating_add(length);
        let mut set = ctx.lock().unwrap_or_else(|e| e.into_inner());
        Self::resync_if_pending(&mut set);
        for handle in set.iter_mut() {
            handle.last_status = handle.allocate(alloc_size);
        }
        let worst = set.aggregate();
        if worst == OpStatus::Ok {
            synchronize_times(&mut set);
        }
        worst
    }

    /// The requested times land on every replica identically, which already
    /// leaves the set settled without a trailing sync pass.
    pub fn set_times(
        &self,
        logical: &OsStr,
        fh: Option<u64>,
        atime: Option<TimeSpec>,
        mtime: Option<TimeSpec>,
    ) -> OpStatus {
        let result = self.with_set(logical, fh, |set| {
            for handle in set.iter_mut() {
                handle.last_status = handle.set_times(atime, mtime);
            }
            set.aggregate()
        });
        result.unwrap_or_else(|status| status)
    }

    pub fn set_mode(&self, logical: &OsStr, fh: Option<u64>, mode: u32) -> OpStatus {
        let result = self.with_set(logical, fh, |set| {
            for handle in set.iter_mut() {
                handle.last_status = handle.set_mode(mode);
            }
            set.aggregate()
        });
        result.unwrap_or_else(|status| status)
    }

    pub fn unlink(&self, logical: &OsStr) -> OpStatus {
        let mut set = match self.ephemeral(logical) {
            Ok(set) => set,
            Err(status) => return status,
        };
        for handle in set.iter_mut() {
            handle.last_status = handle.delete_file();
        }
        set.aggregate()
    }

    pub fn rmdir(&self, logical: &OsStr) -> OpStatus {
        let mut set = match self.ephemeral(logical) {
            Ok(set) => set,
            Err(status) => return status,
        };
        for handle in set.iter_mut() {
            handle.last_status = handle.delete_dir();
        }
        set.aggregate()
    }

    pub fn rename(&self, old: &OsStr, new: &OsStr) -> OpStatus {
        let mut set = match self.ephemeral(old) {
            Ok(set) => set,
            Err(status) => return status,
        };
        let prefix = self.registry.prefix_map().cloned();
        for handle in set.iter_mut() {
            handle.last_status = handle.rename(new, prefix.as_ref());
        }
        set.aggregate()
    }

    /// Enumeration is master-only so replicas never produce phantom or
    /// duplicate entries.
    pub fn read_dir(&self, logical: &OsStr) -> Result<Vec<DirEntryInfo>, OpStatus> {
        let set = self.ephemeral(logical)?;
        let master = set.master().ok_or(OpStatus::NotConfigured)?;
        master.list_dir()
    }

    pub fn statfs(&self, logical: &OsStr) -> Result<Statvfs, OpStatus> {
        let set = self.ephemeral(logical)?;
        let master = set.master().ok_or(OpStatus::NotConfigured)?;
        master.statvfs()
    }

    pub fn set_xattr(&self, logical: &OsStr, name: &CStr, value: &[u8], flags: u32) -> OpStatus {
        let mut set = match self.ephemeral(logical) {
            Ok(set) => set,
            Err(status) => return status,
        };
        for handle in set.iter_mut() {
            handle.last_status = handle.set_xattr(name, value, flags);
        }
        set.aggregate()
    }

    pub fn remove_xattr(&self, logical: &OsStr, name: &CStr) -> OpStatus {
        let mut set = match self.ephemeral(logical) {
            Ok(set) => set,
            Err(status) => return status,
        };
        for handle in set.iter_mut() {
            handle.last_status = handle.remove_xattr(name);
        }
        set.aggregate()
    }

    pub fn get_xattr(&self, logical: &OsStr, name: &CStr) -> Result<Vec<u8>, OpStatus> {
        let set = self.ephemeral(logical)?;
        let master = set.master().ok_or(OpStatus::NotConfigured)?;
        master.get_xattr(name)
    }

    pub fn list_xattrs(&self, logical: &OsStr) -> Result<Vec<u8>, OpStatus> {
        let set = self.ephemeral(logical)?;
        let master = set.master().ok_or(OpStatus::NotConfigured)?;
        master.list_xattrs()
    }

    pub fn access(&self, logical: &OsStr, flags: nix::unistd::AccessFlags) -> OpStatus {
        let set = match self.ephemeral(logical) {
            Ok(set) => set,
            Err(status) => return status,
        };
        match set.master() {
            Some(master) => master.access(flags),
            None => OpStatus::NotConfigured,
        }
    }

    pub fn lock(&self, fh: u64, offset: u64, len: u64) -> OpStatus {
        let ctx = match self.context(fh) {
            Ok(ctx) => ctx,
            Err(status) => return status,
        };
        let mut set = ctx.lock().unwrap_or_else(|e| e.into_inner());
        for handle in set.iter_mut() {
            handle.last_status = handle.lock(offset, len);
        }
        set.aggregate()
    }

    pub fn unlock(&self, fh: u64, offset: u64, len: u64) -> OpStatus {
        let ctx = match self.context(fh) {
            Ok(ctx) => ctx,
            Err(status) => return status,
        };
        let mut set = ctx.lock().unwrap_or_else(|e| e.into_inner());
        for handle in set.iter_mut() {
            handle.last_status = handle.unlock(offset, len);
        }
        set.aggregate()
    }
}
