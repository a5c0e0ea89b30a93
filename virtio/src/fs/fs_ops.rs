// Copyright (c) 2022 SparrowVM Authors. All rights reserved.
//
// SparrowVM is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! The host-provided filesystem backend behind the virtio-fs device.
//! Mandatory operations are required trait methods; optional ones default
//! to `ENOSYS`, which the device surfaces to the guest unchanged.

use super::fuse_msg::{FuseAttr, FuseEntryOut, FuseFileLock, FuseKstatfs};

/// Backend results carry a positive errno on failure; the device negates
/// it into the FUSE reply.
pub type FsResult<T> = std::result::Result<T, i32>;

/// What the backend contributes to the INIT response.
#[derive(Debug, Default, Copy, Clone)]
pub struct FsInitInfo {
    pub flags: u32,
    /// Largest WRITE payload the backend accepts; 0 means the default.
    pub max_write: u32,
}

/// One directory entry, with `offset` naming the position after it for
/// readdir resumption.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    pub offset: u64,
    pub type_: u32,
    pub name: String,
}

/// SETATTR fields after the device resolved validity bits and time
/// sentinels into concrete values.
#[derive(Debug, Default, Copy, Clone)]
pub struct SetattrValues {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    /// Seconds and nanoseconds, already resolved from NOW sentinels.
    pub atime: Option<(u64, u32)>,
    pub mtime: Option<(u64, u32)>,
}

/// The pluggable filesystem behind the device. Node ids are opaque here;
/// id 1 is the root by convention. Calls run on the request-processing
/// thread and must not block indefinitely; lock acquisition in particular
/// reports `EAGAIN` instead of waiting.
pub trait FileSystemOps: Send {
    fn init(&mut self) -> FsResult<FsInitInfo>;

    fn lookup(&mut self, parent: u64, name: &str) -> FsResult<FuseEntryOut>;

    fn get_attr(&mut self, nodeid: u64) -> FsResult<FuseAttr>;

    fn open(&mut self, nodeid: u64, flags: u32) -> FsResult<u64>;

    fn release(&mut self, nodeid: u64, fh: u64) -> FsResult<()>;

    fn read(&mut self, nodeid: u64, fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>>;

    fn readdir(&mut self, nodeid: u64, fh: u64, offset: u64) -> FsResult<Vec<DirEntry>>;

    fn statfs(&mut self, nodeid: u64) -> FsResult<FuseKstatfs>;

    fn destroy(&mut self) {}

    fn forget(&mut self, _nodeid: u64, _nlookup: u64) {}

    fn create(
        &mut self,
        _parent: u64,
        _name: &str,
        _mode: u32,
        _flags: u32,
        _umask: u32,
    ) -> FsResult<(FuseEntryOut, u64)> {
        Err(libc::ENOSYS)
    }

    fn write(&mut self, _nodeid: u64, _fh: u64, _offset: u64, _data: &[u8]) -> FsResult<u32> {
        Err(libc::ENOSYS)
    }

    fn mkdir(&mut self, _parent: u64, _name: &str, _mode: u32, _umask: u32) -> FsResult<FuseEntryOut> {
        Err(libc::ENOSYS)
    }

    fn mknod(
        &mut self,
        _parent: u64,
        _name: &str,
        _mode: u32,
        _rdev: u32,
        _umask: u32,
    ) -> FsResult<FuseEntryOut> {
        Err(libc::ENOSYS)
    }

    fn opendir(&mut self, _nodeid: u64, _flags: u32) -> FsResult<u64> {
        Err(libc::ENOSYS)
    }

    fn releasedir(&mut self, _nodeid: u64, _fh: u64) -> FsResult<()> {
        Err(libc::ENOSYS)
    }

    fn symlink(&mut self, _parent: u64, _name: &str, _target: &str) -> FsResult<FuseEntryOut> {
        Err(libc::ENOSYS)
    }

    fn readlink(&mut self, _nodeid: u64) -> FsResult<Vec<u8>> {
        Err(libc::ENOSYS)
    }

    fn link(&mut self, _nodeid: u64, _newparent: u64, _newname: &str) -> FsResult<FuseEntryOut> {
        Err(libc::ENOSYS)
    }

    fn rename(
        &mut self,
        _parent: u64,
        _name: &str,
        _newparent: u64,
        _newname: &str,
        _flags: u32,
    ) -> FsResult<()> {
        Err(libc::ENOSYS)
    }

    fn unlink(&mut self, _parent: u64, _name: &str) -> FsResult<()> {
        Err(libc::ENOSYS)
    }

    fn rmdir(&mut self, _parent: u64, _name: &str) -> FsResult<()> {
        Err(libc::ENOSYS)
    }

    fn set_attr(&mut self, _nodeid: u64, _values: &SetattrValues) -> FsResult<FuseAttr> {
        Err(libc::ENOSYS)
    }

    fn setxattr(&mut self, _nodeid: u64, _name: &str, _value: &[u8], _flags: u32) -> FsResult<()> {
        Err(libc::ENOSYS)
    }

    fn getxattr(&mut self, _nodeid: u64, _name: &str) -> FsResult<Vec<u8>> {
        Err(libc::ENOSYS)
    }

    /// NUL-separated attribute names.
    fn listxattr(&mut self, _nodeid: u64) -> FsResult<Vec<u8>> {
        Err(libc::ENOSYS)
    }

    fn removexattr(&mut self, _nodeid: u64, _name: &str) -> FsResult<()> {
        Err(libc::ENOSYS)
    }

    fn lseek(&mut self, _nodeid: u64, _fh: u64, _offset: u64, _whence: u32) -> FsResult<u64> {
        Err(libc::ENOSYS)
    }

    fn fallocate(
        &mut self,
        _nodeid: u64,
        _fh: u64,
        _offset: u64,
        _length: u64,
        _mode: u32,
    ) -> FsResult<()> {
        Err(libc::ENOSYS)
    }

    fn getlk(
        &mut self,
        _nodeid: u64,
        _fh: u64,
        _owner: u64,
        _lock: &FuseFileLock,
    ) -> FsResult<FuseFileLock> {
        Err(libc::ENOSYS)
    }

    /// Apply or remove a lock. Never blocks: a conflicting lock yields
    /// `EAGAIN` even when `blocking` is set, and the device defers the
    /// reply instead.
    fn setlk(
        &mut self,
        _nodeid: u64,
        _fh: u64,
        _owner: u64,
        _lock: &FuseFileLock,
        _blocking: bool,
    ) -> FsResult<()> {
        Err(libc::ENOSYS)
    }

    fn flush(&mut self, _nodeid: u64, _fh: u64, _lock_owner: u64) -> FsResult<()> {
        Err(libc::ENOSYS)
    }
}
