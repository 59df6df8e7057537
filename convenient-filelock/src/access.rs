//! Byte-range locking and I/O on the two regions of a lock file.

use crate::error::Result;
use crate::info::{INFORMATION_REGION_SIZE, LockInfo};
use crate::state::{LockState, LockStateSerializer};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, fcntl};
use nix::libc;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy)]
enum RangeLock {
    Shared,
    Exclusive,
    Unlock,
}

/// An open lock file.
///
/// Locks are open file description locks: they belong to this handle rather
/// than the process, so two handles on the same file exclude each other even
/// inside one process. Closing the handle releases everything it holds.
pub(crate) struct LockFileAccess {
    file: File,
    path: PathBuf,
    serializer: Box<dyn LockStateSerializer>,
}

impl LockFileAccess {
    pub(crate) fn open(path: &Path, serializer: Box<dyn LockStateSerializer>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            serializer,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn information_region_start(&self) -> u64 {
        self.serializer.size()
    }

    pub(crate) fn try_lock_state(&self, shared: bool) -> Result<bool> {
        let kind = if shared {
            RangeLock::Shared
        } else {
            RangeLock::Exclusive
        };
        self.set_lock(kind, 0, self.serializer.size())
    }

    pub(crate) fn try_lock_info(&self, shared: bool) -> Result<bool> {
        let kind = if shared {
            RangeLock::Shared
        } else {
            RangeLock::Exclusive
        };
        self.set_lock(kind, self.information_region_start(), INFORMATION_REGION_SIZE)
    }

    pub(crate) fn unlock_info(&self) -> Result<()> {
        let _ = self.set_lock(
            RangeLock::Unlock,
            self.information_region_start(),
            INFORMATION_REGION_SIZE,
        )?;
        Ok(())
    }

    /// Read the state, writing the initial one if the file is new.
    /// Requires the exclusive state lock.
    pub(crate) fn ensure_lock_state(&self) -> Result<LockState> {
        if self.file.metadata()?.len() < self.serializer.size() {
            let initial = self.serializer.create_initial_state();
            self.write_state(&initial)?;
            return Ok(initial);
        }
        self.read_lock_state()
    }

    /// Read the state; a file nobody has written yet is in the initial state.
    pub(crate) fn read_lock_state(&self) -> Result<LockState> {
        let size = self.serializer.size();
        if self.file.metadata()?.len() < size {
            return Ok(self.serializer.create_initial_state());
        }
        let mut buffer = vec![0u8; usize::try_from(size).unwrap_or(0)];
        self.file.read_exact_at(&mut buffer, 0)?;
        self.serializer.read(&mut buffer.as_slice())
    }

    pub(crate) fn write_state(&self, state: &LockState) -> Result<()> {
        let mut buffer = Vec::new();
        self.serializer.write(&mut buffer, state)?;
        self.file.write_all_at(&buffer, 0)?;
        Ok(())
    }

    /// Requires the exclusive information lock.
    pub(crate) fn write_lock_info(&self, info: &LockInfo) -> Result<()> {
        let mut buffer = Vec::new();
        info.write(&mut buffer)?;
        let start = self.information_region_start();
        self.file.write_all_at(&buffer, start)?;
        self.file.set_len(start + buffer.len() as u64)?;
        Ok(())
    }

    /// Owner details, or defaults while no owner has published any.
    /// Requires a lock on the information region.
    pub(crate) fn read_lock_info(&self) -> Result<LockInfo> {
        let start = self.information_region_start();
        let length = self.file.metadata()?.len();
        if length <= start {
            return Ok(LockInfo::default());
        }
        let mut buffer = vec![0u8; usize::try_from(length - start).unwrap_or(0)];
        self.file.read_exact_at(&mut buffer, start)?;
        LockInfo::read(&mut buffer.as_slice())
    }

    /// Requires the exclusive information lock.
    pub(crate) fn clear_lock_info(&self) -> Result<()> {
        self.file.set_len(self.information_region_start())?;
        Ok(())
    }

    #[allow(clippy::cast_possible_wrap)]
    fn set_lock(&self, kind: RangeLock, start: u64, length: u64) -> Result<bool> {
        let l_type = match kind {
            RangeLock::Shared => libc::F_RDLCK,
            RangeLock::Exclusive => libc::F_WRLCK,
            RangeLock::Unlock => libc::F_UNLCK,
        };
        let request = libc::flock {
            l_type: l_type as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: start as libc::off_t,
            l_len: length as libc::off_t,
            l_pid: 0,
        };
        match fcntl(self.file.as_raw_fd(), FcntlArg::F_OFD_SETLK(&request)) {
            Ok(_) => Ok(true),
            Err(Errno::EAGAIN | Errno::EACCES) => Ok(false),
            Err(errno) => Err(io::Error::from(errno).into()),
        }
    }
}
