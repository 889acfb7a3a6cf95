use crate::fanout::Fanout;
use crate::replica::OpenRequest;
use crate::status::OpStatus;
use crate::util::{access_mask_from_bits, make_child_path};
use bytes::Bytes;
use fuse3::path::prelude::*;
use fuse3::path::reply::{DirectoryEntryPlus, ReplyXAttr};
use fuse3::{FileType, SetAttr};
use log::debug;
use nix::sys::time::TimeSpec;
use std::ffi::{CString, OsStr, OsString};
use std::num::NonZeroU32;

const ATTR_TTL: std::time::Duration = std::time::Duration::from_secs(1);

fn xattr_name_to_cstring(name: &OsStr) -> Result<CString, fuse3::Errno> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(name.as_bytes()).map_err(|_| fuse3::Errno::from(libc::EINVAL))
}

fn check(status: OpStatus) -> Result<(), fuse3::Errno> {
    if status.is_ok() {
        Ok(())
    } else {
        Err(status.into())
    }
}

/// FUSE surface over the replication core. Every callback forwards to the
/// matching [`Fanout`] entry point; nothing filesystem-shaped happens here.
pub struct MirrorFs {
    fanout: Fanout,
    max_write: NonZeroU32,
}

impl MirrorFs {
    pub fn new(fanout: Fanout, max_write_kb: u32) -> Self {
        let bytes = max_write_kb.saturating_mul(1024).max(4096);
        let max_write = NonZeroU32::new(bytes).unwrap_or_else(|| NonZeroU32::new(4096).unwrap());
        Self { fanout, max_write }
    }

    fn attr_reply(&self, path: &OsStr, fh: Option<u64>) -> Result<ReplyAttr, fuse3::Errno> {
        let attr = self.fanout.getattr(path, fh)?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr,
        })
    }
}

impl PathFilesystem for MirrorFs {
    async fn init(&self, _req: Request) -> Result<ReplyInit, fuse3::Errno> {
        Ok(ReplyInit {
            max_write: self.max_write,
        })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let path = make_child_path(parent, name);
        let attr = self.fanout.getattr(&path, None)?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        _flags: u32,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        let path = path.unwrap_or_else(|| OsStr::new("/"));
        self.attr_reply(path, fh)
    }

    async fn setattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        let path = path.ok_or_else(fuse3::Errno::new_not_exist)?;

        if let Some(mode) = set_attr.mode {
            check(self.fanout.set_mode(path, fh, mode))?;
        }

        // Ownership is not replicated; the backing locations keep whatever
        // owner they were created with.
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            debug!("ignoring chown on {path:?}");
        }

        if let Some(size) = set_attr.size {
            check(self.fanout.truncate(path, fh, size))?;
        }

        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            let atime = set_attr.atime.map(|t| TimeSpec::new(t.sec, t.nsec as _));
            let mtime = set_attr.mtime.map(|t| TimeSpec::new(t.sec, t.nsec as _));
            check(self.fanout.set_times(path, fh, atime, mtime))?;
        }

        self.attr_reply(path, fh)
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let path = make_child_path(parent, name);
        let fh = self.fanout.open(&path, &OpenRequest::create_directory(mode))?;
        let attr = self.fanout.getattr(&path, Some(fh))?;
        self.fanout.release(fh);
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn unlink(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        let path = make_child_path(parent, name);
        check(self.fanout.unlink(&path))
    }

    async fn rmdir(&self, _req: Request, parent: &OsStr, name: &OsStr) -> Result<(), fuse3::Errno> {
        let path = make_child_path(parent, name);
        check(self.fanout.rmdir(&path))
    }

    async fn rename(
        &self,
        _req: Request,
        origin_parent: &OsStr,
        origin_name: &OsStr,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        let from = make_child_path(origin_parent, origin_name);
        let to = make_child_path(parent, name);
        if from == "/" || to == "/" {
            return Err(fuse3::Errno::from(libc::EFAULT));
        }
        check(self.fanout.rename(&from, &to))
    }

    async fn open(
        &self,
        _req: Request,
        path: &OsStr,
        flags: u32,
    ) -> Result<ReplyOpen, fuse3::Errno> {
        let fh = self.fanout.open(path, &OpenRequest::file(flags, 0))?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn create(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> Result<ReplyCreated, fuse3::Errno> {
        let path = make_child_path(parent, name);
        let req = OpenRequest::file(flags | libc::O_CREAT as u32, mode);
        let fh = self.fanout.open(&path, &req)?;
        let attr = self.fanout.getattr(&path, Some(fh))?;
        Ok(ReplyCreated {
            ttl: ATTR_TTL,
            attr,
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn read(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<ReplyData, fuse3::Errno> {
        let buf = self.fanout.read(fh, offset, size)?;
        Ok(Bytes::from(buf).into())
    }

    async fn write(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> Result<ReplyWrite, fuse3::Errno> {
        let written = self.fanout.write(fh, offset, data)?;
        Ok(ReplyWrite { written })
    }

    async fn release(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> Result<(), fuse3::Errno> {
        self.fanout.release(fh);
        Ok(())
    }

    async fn fsync(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _datasync: bool,
    ) -> Result<(), fuse3::Errno> {
        check(self.fanout.flush(fh))
    }

    async fn flush(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _lock_owner: u64,
    ) -> Result<(), fuse3::Errno> {
        check(self.fanout.flush(fh))
    }

    async fn fallocate(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        length: u64,
        _mode: u32,
    ) -> Result<(), fuse3::Errno> {
        check(self.fanout.allocate(fh, offset, length))
    }

    async fn setxattr(
        &self,
        _req: Request,
        path: &OsStr,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        position: u32,
    ) -> Result<(), fuse3::Errno> {
        if position != 0 {
            return Err(fuse3::Errno::from(libc::EINVAL));
        }
        let name = xattr_name_to_cstring(name)?;
        check(self.fanout.set_xattr(path, &name, value, flags))
    }

    async fn getxattr(
        &self,
        _req: Request,
        path: &OsStr,
        name: &OsStr,
        size: u32,
    ) -> Result<ReplyXAttr, fuse3::Errno> {
        let name = xattr_name_to_cstring(name)?;
        let data = self.fanout.get_xattr(path, &name)?;
        if size == 0 {
            return Ok(ReplyXAttr::Size(data.len() as u32));
        }
        if data.len() > size as usize {
            return Err(fuse3::Errno::from(libc::ERANGE));
        }
        Ok(ReplyXAttr::Data(data.into()))
    }

    async fn listxattr(
        &self,
        _req: Request,
        path: &OsStr,
        size: u32,
    ) -> Result<ReplyXAttr, fuse3::Errno> {
        let data = self.fanout.list_xattrs(path)?;
        if size == 0 {
            return Ok(ReplyXAttr::Size(data.len() as u32));
        }
        if data.len() > size as usize {
            return Err(fuse3::Errno::from(libc::ERANGE));
        }
        Ok(ReplyXAttr::Data(data.into()))
    }

    async fn removexattr(
        &self,
        _req: Request,
        path: &OsStr,
        name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        let name = xattr_name_to_cstring(name)?;
        check(self.fanout.remove_xattr(path, &name))
    }

    async fn access(&self, _req: Request, path: &OsStr, mask: u32) -> Result<(), fuse3::Errno> {
        check(self.fanout.access(path, access_mask_from_bits(mask)))
    }

    async fn opendir(
        &self,
        _req: Request,
        path: &OsStr,
        flags: u32,
    ) -> Result<ReplyOpen, fuse3::Errno> {
        let fh = self.fanout.open(path, &OpenRequest::directory())?;
        Ok(ReplyOpen { fh, flags })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _path: &OsStr,
        fh: u64,
        _flags: u32,
    ) -> Result<(), fuse3::Errno> {
        self.fanout.release(fh);
        Ok(())
    }

    type DirEntryStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;
    type DirEntryPlusStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        _fh: u64,
        offset: i64,
    ) -> Result<ReplyDirectory<Self::DirEntryStream<'a>>, fuse3::Errno> {
        let listed = self.fanout.read_dir(path)?;
        let mut entries: Vec<fuse3::Result<DirectoryEntry>> = Vec::with_capacity(listed.len() + 2);

        let mut idx: i64 = 0;
        entries.push(Ok(DirectoryEntry {
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: idx + 1,
        }));
        idx += 1;
        entries.push(Ok(DirectoryEntry {
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: idx + 1,
        }));
        idx += 1;

        for entry in listed {
            idx += 1;
            entries.push(Ok(DirectoryEntry {
                kind: entry.kind,
                name: entry.name,
                offset: idx,
            }));
        }

        let skip = offset.max(0) as usize;
        let entries: Vec<_> = entries.into_iter().skip(skip).collect();
        let stream = futures_util::stream::iter(entries);
        Ok(ReplyDirectory { entries: stream })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        parent: &'a OsStr,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>, fuse3::Errno> {
        let listed = self.fanout.read_dir(parent)?;
        let dir_attr = self.fanout.getattr(parent, None)?;
        let mut entries: Vec<fuse3::Result<DirectoryEntryPlus>> =
            Vec::with_capacity(listed.len() + 2);

        let mut idx: i64 = 0;
        entries.push(Ok(DirectoryEntryPlus {
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: idx + 1,
            attr: dir_attr,
            entry_ttl: ATTR_TTL,
            attr_ttl: ATTR_TTL,
        }));
        idx += 1;
        entries.push(Ok(DirectoryEntryPlus {
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: idx + 1,
            attr: dir_attr,
            entry_ttl: ATTR_TTL,
            attr_ttl: ATTR_TTL,
        }));
        idx += 1;

        for entry in listed {
            idx += 1;
            let attr = match entry.attr {
                Some(attr) => attr,
                None => {
                    let child = make_child_path(parent, &entry.name);
                    match self.fanout.getattr(&child, None) {
                        Ok(attr) => attr,
                        Err(status) => {
                            entries.push(Err(status.into()));
                            continue;
                        }
                    }
                }
            };
            entries.push(Ok(DirectoryEntryPlus {
                kind: entry.kind,
                name: entry.name,
                offset: idx,
                attr,
                entry_ttl: ATTR_TTL,
                attr_ttl: ATTR_TTL,
            }));
        }

        let skip = offset as usize;
        let entries: Vec<_> = entries.into_iter().skip(skip).collect();
        let stream = futures_util::stream::iter(entries);
        Ok(ReplyDirectoryPlus { entries: stream })
    }

    async fn statfs(&self, _req: Request, path: &OsStr) -> Result<ReplyStatFs, fuse3::Errno> {
        let stats = self.fanout.statfs(path)?;
        Ok(ReplyStatFs {
            blocks: stats.blocks(),
            bfree: stats.blocks_free(),
            bavail: stats.blocks_available(),
            files: stats.files(),
            ffree: stats.files_free(),
            bsize: stats.block_size() as u32,
            namelen: stats.name_max() as u32,
            frsize: stats.fragment_size() as u32,
        })
    }
}
