use std::io;

/// Outcome of a single-replica primitive, recorded on the replica and
/// aggregated across the set after a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Ok,
    /// No backing locations configured; nothing to fan out to.
    NotConfigured,
    NotFound,
    AccessDenied,
    AlreadyExists,
    IsDirectory,
    NotDirectory,
    DirectoryNotEmpty,
    InvalidHandle,
    BufferOverflow,
    /// Any other backing-store failure, carrying the raw errno.
    Io(i32),
}

impl OpStatus {
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            0 => OpStatus::Ok,
            libc::ENOENT => OpStatus::NotFound,
            libc::EACCES | libc::EPERM => OpStatus::AccessDenied,
            libc::EEXIST => OpStatus::AlreadyExists,
            libc::EISDIR => OpStatus::IsDirectory,
            libc::ENOTDIR => OpStatus::NotDirectory,
            libc::ENOTEMPTY => OpStatus::DirectoryNotEmpty,
            libc::EBADF => OpStatus::InvalidHandle,
            libc::ERANGE => OpStatus::BufferOverflow,
            other => OpStatus::Io(other),
        }
    }

    pub fn to_errno(self) -> i32 {
        match self {
            OpStatus::Ok => 0,
            OpStatus::NotConfigured => libc::ENXIO,
            OpStatus::NotFound => libc::ENOENT,
            OpStatus::AccessDenied => libc::EACCES,
            OpStatus::AlreadyExists => libc::EEXIST,
            OpStatus::IsDirectory => libc::EISDIR,
            OpStatus::NotDirectory => libc::ENOTDIR,
            OpStatus::DirectoryNotEmpty => libc::ENOTEMPTY,
            OpStatus::InvalidHandle => libc::EBADF,
            OpStatus::BufferOverflow => libc::ERANGE,
            OpStatus::Io(errno) => errno,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, OpStatus::Ok)
    }

    /// Rank used by the worst-status-wins aggregation policy. Higher means
    /// worse. `AlreadyExists` ranks just above success: a collision on an
    /// open-or-create is information, not damage.
    fn severity(self) -> u8 {
        match self {
            OpStatus::Ok => 0,
            OpStatus::AlreadyExists => 1,
            OpStatus::DirectoryNotEmpty => 2,
            OpStatus::NotDirectory => 3,
            OpStatus::IsDirectory => 3,
            OpStatus::BufferOverflow => 4,
            OpStatus::NotFound => 5,
            OpStatus::InvalidHandle => 6,
            OpStatus::AccessDenied => 7,
            OpStatus::Io(_) => 8,
            OpStatus::NotConfigured => 9,
        }
    }
}

impl From<nix::Error> for OpStatus {
    fn from(err: nix::Error) -> Self {
        OpStatus::from_errno(err as i32)
    }
}

impl From<io::Error> for OpStatus {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => OpStatus::from_errno(errno),
            None => OpStatus::Io(libc::EIO),
        }
    }
}

impl From<OpStatus> for fuse3::Errno {
    fn from(status: OpStatus) -> Self {
        fuse3::Errno::from(status.to_errno())
    }
}

/// Worst status wins, first occurrence breaking ties. An empty fan-out means
/// nothing was configured to run.
pub fn aggregate<I>(statuses: I) -> OpStatus
where
    I: IntoIterator<Item = OpStatus>,
{
    let mut worst = None::<OpStatus>;
    for status in statuses {
        match worst {
            None => worst = Some(status),
            Some(current) if status.severity() > current.severity() => worst = Some(status),
            Some(_) => {}
        }
    }
    worst.unwrap_or(OpStatus::NotConfigured)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_status_wins_over_later_success() {
        let agg = aggregate([OpStatus::NotFound, OpStatus::Ok, OpStatus::Ok]);
        assert_eq!(agg, OpStatus::NotFound);
    }

    #[test]
    fn io_outranks_not_found() {
        let agg = aggregate([OpStatus::NotFound, OpStatus::Io(libc::EIO)]);
        assert_eq!(agg, OpStatus::Io(libc::EIO));
    }

    #[test]
    fn collision_is_nearly_success() {
        let agg = aggregate([OpStatus::AlreadyExists, OpStatus::Ok]);
        assert_eq!(agg, OpStatus::AlreadyExists);
        assert_eq!(aggregate([OpStatus::AlreadyExists, OpStatus::NotFound]), OpStatus::NotFound);
    }

    #[test]
    fn empty_fanout_is_not_configured() {
        assert_eq!(aggregate([]), OpStatus::NotConfigured);
    }

    #[test]
    fn errno_round_trip() {
        for status in [
            OpStatus::NotFound,
            OpStatus::AccessDenied,
            OpStatus::AlreadyExists,
            OpStatus::IsDirectory,
            OpStatus::NotDirectory,
            OpStatus::DirectoryNotEmpty,
            OpStatus::InvalidHandle,
            OpStatus::BufferOverflow,
        ] {
            assert_eq!(OpStatus::from_errno(status.to_errno()), status);
        }
    }
}
