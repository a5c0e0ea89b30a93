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

//! The FUSE wire format (protocol 7.31 subset), little endian with
//! byte-exact field offsets. Every struct here moves through guest memory
//! unchanged.

use util::byte_code::ByteCode;

pub const FUSE_KERNEL_VERSION: u32 = 7;
pub const FUSE_KERNEL_MINOR_VERSION: u32 = 31;

pub const FUSE_LOOKUP: u32 = 1;
pub const FUSE_FORGET: u32 = 2;
pub const FUSE_GETATTR: u32 = 3;
pub const FUSE_SETATTR: u32 = 4;
pub const FUSE_READLINK: u32 = 5;
pub const FUSE_SYMLINK: u32 = 6;
pub const FUSE_MKNOD: u32 = 8;
pub const FUSE_MKDIR: u32 = 9;
pub const FUSE_UNLINK: u32 = 10;
pub const FUSE_RMDIR: u32 = 11;
pub const FUSE_RENAME: u32 = 12;
pub const FUSE_LINK: u32 = 13;
pub const FUSE_OPEN: u32 = 14;
pub const FUSE_READ: u32 = 15;
pub const FUSE_WRITE: u32 = 16;
pub const FUSE_STATFS: u32 = 17;
pub const FUSE_RELEASE: u32 = 18;
pub const FUSE_FSYNC: u32 = 20;
pub const FUSE_SETXATTR: u32 = 21;
pub const FUSE_GETXATTR: u32 = 22;
pub const FUSE_LISTXATTR: u32 = 23;
pub const FUSE_REMOVEXATTR: u32 = 24;
pub const FUSE_FLUSH: u32 = 25;
pub const FUSE_INIT: u32 = 26;
pub const FUSE_OPENDIR: u32 = 27;
pub const FUSE_READDIR: u32 = 28;
pub const FUSE_RELEASEDIR: u32 = 29;
pub const FUSE_FSYNCDIR: u32 = 30;
pub const FUSE_GETLK: u32 = 31;
pub const FUSE_SETLK: u32 = 32;
pub const FUSE_SETLKW: u32 = 33;
pub const FUSE_ACCESS: u32 = 34;
pub const FUSE_CREATE: u32 = 35;
pub const FUSE_INTERRUPT: u32 = 36;
pub const FUSE_BMAP: u32 = 37;
pub const FUSE_DESTROY: u32 = 38;
pub const FUSE_IOCTL: u32 = 39;
pub const FUSE_POLL: u32 = 40;
pub const FUSE_FALLOCATE: u32 = 43;
pub const FUSE_READDIRPLUS: u32 = 44;
pub const FUSE_RENAME2: u32 = 45;
pub const FUSE_LSEEK: u32 = 46;

// INIT contract values.
pub const FUSE_MAX_READAHEAD: u32 = 128 * 1024;
pub const FUSE_DEFAULT_MAX_WRITE: u32 = 128 * 1024;
pub const FUSE_MAX_BACKGROUND: u16 = 16;
pub const FUSE_CONGESTION_THRESHOLD: u16 = 32;
pub const FUSE_TIME_GRAN: u32 = 1;

// Bits of fuse_setattr_in.valid.
pub const FATTR_MODE: u32 = 1 << 0;
pub const FATTR_UID: u32 = 1 << 1;
pub const FATTR_GID: u32 = 1 << 2;
pub const FATTR_SIZE: u32 = 1 << 3;
pub const FATTR_ATIME: u32 = 1 << 4;
pub const FATTR_MTIME: u32 = 1 << 5;
pub const FATTR_FH: u32 = 1 << 6;
pub const FATTR_ATIME_NOW: u32 = 1 << 7;
pub const FATTR_MTIME_NOW: u32 = 1 << 8;
pub const FATTR_LOCKOWNER: u32 = 1 << 9;
pub const FATTR_CTIME: u32 = 1 << 10;

/// Sentinel nsec values in utimensat-style timestamps.
pub const UTIME_NOW: u32 = 0x3fff_ffff;
pub const UTIME_OMIT: u32 = 0x3fff_fffe;

// POSIX lock types carried in FuseFileLock.
pub const F_RDLCK: u32 = 0;
pub const F_WRLCK: u32 = 1;
pub const F_UNLCK: u32 = 2;

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseInHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    /// Length of the extension block (protocol >= 7.38), zero before.
    pub total_extlen: u16,
    pub padding: u16,
}

impl ByteCode for FuseInHeader {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseOutHeader {
    /// Total response length, the header included.
    pub len: u32,
    /// 0 or a negated errno.
    pub error: i32,
    pub unique: u64,
}

impl ByteCode for FuseOutHeader {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FuseAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub flags: u32,
}

impl ByteCode for FuseAttr {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseEntryOut {
    pub nodeid: u64,
    pub generation: u64,
    pub entry_valid: u64,
    pub attr_valid: u64,
    pub entry_valid_nsec: u32,
    pub attr_valid_nsec: u32,
    pub attr: FuseAttr,
}

impl ByteCode for FuseEntryOut {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseAttrOut {
    pub attr_valid: u64,
    pub attr_valid_nsec: u32,
    pub dummy: u32,
    pub attr: FuseAttr,
}

impl ByteCode for FuseAttrOut {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseInitIn {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

impl ByteCode for FuseInitIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseInitOut {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
    pub time_gran: u32,
    pub max_pages: u16,
    pub map_alignment: u16,
    pub flags2: u32,
    pub unused: [u32; 7],
}

impl ByteCode for FuseInitOut {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseGetattrIn {
    pub getattr_flags: u32,
    pub dummy: u32,
    pub fh: u64,
}

impl ByteCode for FuseGetattrIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseSetattrIn {
    pub valid: u32,
    pub padding: u32,
    pub fh: u64,
    pub size: u64,
    pub lock_owner: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub unused4: u32,
    pub uid: u32,
    pub gid: u32,
    pub unused5: u32,
}

impl ByteCode for FuseSetattrIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseOpenIn {
    pub flags: u32,
    pub open_flags: u32,
}

impl ByteCode for FuseOpenIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseOpenOut {
    pub fh: u64,
    pub open_flags: u32,
    pub padding: u32,
}

impl ByteCode for FuseOpenOut {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseReleaseIn {
    pub fh: u64,
    pub flags: u32,
    pub release_flags: u32,
    pub lock_owner: u64,
}

impl ByteCode for FuseReleaseIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseFlushIn {
    pub fh: u64,
    pub unused: u32,
    pub padding: u32,
    pub lock_owner: u64,
}

impl ByteCode for FuseFlushIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseReadIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub read_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

impl ByteCode for FuseReadIn {}

/// The write header; `size` payload bytes follow, possibly after padding
/// the device skips by computing the payload start from the request tail.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseWriteIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub write_flags: u32,
    pub lock_owner: u64,
}

impl ByteCode for FuseWriteIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseWriteOut {
    pub size: u32,
    pub padding: u32,
}

impl ByteCode for FuseWriteOut {}

/// Canonical statfs layout: five u64 counters, then bsize, namelen and
/// frsize, then spare words.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FuseKstatfs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
    pub padding: u32,
    pub spare: [u32; 6],
}

impl ByteCode for FuseKstatfs {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseGetxattrIn {
    pub size: u32,
    pub padding: u32,
}

impl ByteCode for FuseGetxattrIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseGetxattrOut {
    pub size: u32,
    pub padding: u32,
}

impl ByteCode for FuseGetxattrOut {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseSetxattrIn {
    pub size: u32,
    pub flags: u32,
}

impl ByteCode for FuseSetxattrIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FuseFileLock {
    pub start: u64,
    pub end: u64,
    pub lock_type: u32,
    pub pid: u32,
}

impl ByteCode for FuseFileLock {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseLkIn {
    pub fh: u64,
    pub owner: u64,
    pub lock: FuseFileLock,
    pub lk_flags: u32,
    pub padding: u32,
}

impl ByteCode for FuseLkIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseLkOut {
    pub lock: FuseFileLock,
}

impl ByteCode for FuseLkOut {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseLseekIn {
    pub fh: u64,
    pub offset: u64,
    pub whence: u32,
    pub padding: u32,
}

impl ByteCode for FuseLseekIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseLseekOut {
    pub offset: u64,
}

impl ByteCode for FuseLseekOut {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseFallocateIn {
    pub fh: u64,
    pub offset: u64,
    pub length: u64,
    pub mode: u32,
    pub padding: u32,
}

impl ByteCode for FuseFallocateIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseMknodIn {
    pub mode: u32,
    pub rdev: u32,
    pub umask: u32,
    pub padding: u32,
}

impl ByteCode for FuseMknodIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseMkdirIn {
    pub mode: u32,
    pub umask: u32,
}

impl ByteCode for FuseMkdirIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseRenameIn {
    pub newdir: u64,
}

impl ByteCode for FuseRenameIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseRename2In {
    pub newdir: u64,
    pub flags: u32,
    pub padding: u32,
}

impl ByteCode for FuseRename2In {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseLinkIn {
    pub oldnodeid: u64,
}

impl ByteCode for FuseLinkIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseCreateIn {
    pub flags: u32,
    pub mode: u32,
    pub umask: u32,
    pub open_flags: u32,
}

impl ByteCode for FuseCreateIn {}

#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseForgetIn {
    pub nlookup: u64,
}

impl ByteCode for FuseForgetIn {}

/// Directory entry header; the name follows, zero padded so the next entry
/// starts 8-byte aligned.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct FuseDirent {
    pub ino: u64,
    pub off: u64,
    pub namelen: u32,
    pub type_: u32,
}

impl ByteCode for FuseDirent {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;
    use util::offset_of;

    #[test]
    fn test_header_sizes() {
        assert_eq!(size_of::<FuseInHeader>(), 40);
        assert_eq!(size_of::<FuseOutHeader>(), 16);
        assert_eq!(size_of::<FuseAttr>(), 88);
        assert_eq!(size_of::<FuseEntryOut>(), 128);
        assert_eq!(size_of::<FuseAttrOut>(), 104);
        assert_eq!(size_of::<FuseInitIn>(), 16);
        assert_eq!(size_of::<FuseInitOut>(), 64);
        assert_eq!(size_of::<FuseWriteIn>(), 32);
        assert_eq!(size_of::<FuseReadIn>(), 40);
        assert_eq!(size_of::<FuseKstatfs>(), 80);
        assert_eq!(size_of::<FuseSetattrIn>(), 88);
        assert_eq!(size_of::<FuseLkIn>(), 48);
        assert_eq!(size_of::<FuseDirent>(), 24);
    }

    #[test]
    fn test_setattr_field_offsets() {
        // Offsets are measured from the start of a request, i.e. 40 bytes
        // of input header followed by the setattr payload.
        const HDR: usize = 40;
        assert_eq!(HDR + offset_of!(FuseSetattrIn, size), 56);
        assert_eq!(HDR + offset_of!(FuseSetattrIn, atime), 72);
        assert_eq!(HDR + offset_of!(FuseSetattrIn, mtime), 80);
        assert_eq!(HDR + offset_of!(FuseSetattrIn, atimensec), 96);
        assert_eq!(HDR + offset_of!(FuseSetattrIn, mtimensec), 100);
        assert_eq!(HDR + offset_of!(FuseSetattrIn, mode), 108);
        assert_eq!(HDR + offset_of!(FuseSetattrIn, uid), 116);
        assert_eq!(HDR + offset_of!(FuseSetattrIn, gid), 120);
    }

    #[test]
    fn test_in_header_offsets() {
        assert_eq!(offset_of!(FuseInHeader, opcode), 4);
        assert_eq!(offset_of!(FuseInHeader, unique), 8);
        assert_eq!(offset_of!(FuseInHeader, nodeid), 16);
        assert_eq!(offset_of!(FuseInHeader, total_extlen), 36);
        assert_eq!(offset_of!(FuseOutHeader, error), 4);
        assert_eq!(offset_of!(FuseOutHeader, unique), 8);
    }

    #[test]
    fn test_kstatfs_canonical_order() {
        assert_eq!(offset_of!(FuseKstatfs, ffree), 32);
        assert_eq!(offset_of!(FuseKstatfs, bsize), 40);
        assert_eq!(offset_of!(FuseKstatfs, namelen), 44);
        assert_eq!(offset_of!(FuseKstatfs, frsize), 48);
    }

    #[test]
    fn test_round_trip_header() {
        let header = FuseInHeader {
            len: 48,
            opcode: FUSE_LOOKUP,
            unique: 0x1122_3344_5566_7788,
            nodeid: 1,
            uid: 1000,
            gid: 1000,
            pid: 4242,
            total_extlen: 0,
            padding: 0,
        };
        let bytes = header.as_bytes().to_vec();
        let back = FuseInHeader::from_bytes(&bytes).unwrap();
        assert_eq!(back.opcode, FUSE_LOOKUP);
        assert_eq!(back.unique, header.unique);
        assert!(FuseInHeader::from_bytes(&bytes[..39]).is_none());
    }
}
