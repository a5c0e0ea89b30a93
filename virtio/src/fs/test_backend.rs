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

//! In-memory filesystem backend for tests: enough POSIX behavior to
//! exercise every dispatch path, including a byte-range lock table.

use std::collections::{BTreeMap, HashMap};

use super::fs_ops::{DirEntry, FileSystemOps, FsInitInfo, FsResult, SetattrValues};
use super::fuse_msg::{FuseAttr, FuseEntryOut, FuseFileLock, FuseKstatfs, F_UNLCK, F_WRLCK};

const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;

#[derive(Debug, Clone)]
struct LockRec {
    owner: u64,
    lock_type: u32,
    start: u64,
    end: u64,
}

struct Node {
    parent: u64,
    name: String,
    attr: FuseAttr,
    data: Vec<u8>,
    xattrs: BTreeMap<String, Vec<u8>>,
    locks: Vec<LockRec>,
}

pub struct MemFs {
    nodes: HashMap<u64, Node>,
    next_ino: u64,
    next_fh: u64,
    pub lseek_calls: u32,
}

impl MemFs {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            1,
            Node {
                parent: 1,
                name: "/".to_string(),
                attr: FuseAttr {
                    ino: 1,
                    mode: S_IFDIR | 0o755,
                    nlink: 2,
                    blksize: 4096,
                    ..Default::default()
                },
                data: Vec::new(),
                xattrs: BTreeMap::new(),
                locks: Vec::new(),
            },
        );
        MemFs {
            nodes,
            next_ino: 2,
            next_fh: 1,
            lseek_calls: 0,
        }
    }

    pub fn add_file(&mut self, parent: u64, name: &str, content: &[u8]) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(
            ino,
            Node {
                parent,
                name: name.to_string(),
                attr: FuseAttr {
                    ino,
                    size: content.len() as u64,
                    mode: S_IFREG | 0o644,
                    nlink: 1,
                    blksize: 4096,
                    ..Default::default()
                },
                data: content.to_vec(),
                xattrs: BTreeMap::new(),
                locks: Vec::new(),
            },
        );
        ino
    }

    pub fn file_content(&self, nodeid: u64) -> Vec<u8> {
        self.nodes[&nodeid].data.clone()
    }

    pub fn attr_of(&self, nodeid: u64) -> FuseAttr {
        self.nodes[&nodeid].attr
    }

    fn entry_out(attr: FuseAttr) -> FuseEntryOut {
        FuseEntryOut {
            nodeid: attr.ino,
            generation: 0,
            entry_valid: 1,
            attr_valid: 1,
            entry_valid_nsec: 0,
            attr_valid_nsec: 0,
            attr,
        }
    }

    fn node(&self, nodeid: u64) -> FsResult<&Node> {
        self.nodes.get(&nodeid).ok_or(libc::ENOENT)
    }

    fn node_mut(&mut self, nodeid: u64) -> FsResult<&mut Node> {
        self.nodes.get_mut(&nodeid).ok_or(libc::ENOENT)
    }

    fn overlaps(rec: &LockRec, lock: &FuseFileLock) -> bool {
        rec.start <= lock.end && lock.start <= rec.end
    }
}

impl FileSystemOps for MemFs {
    fn init(&mut self) -> FsResult<FsInitInfo> {
        Ok(FsInitInfo {
            flags: 0,
            max_write: 0,
        })
    }

    fn lookup(&mut self, parent: u64, name: &str) -> FsResult<FuseEntryOut> {
        self.node(parent)?;
        self.nodes
            .values()
            .find(|node| node.parent == parent && node.name == name && node.attr.ino != parent)
            .map(|node| Self::entry_out(node.attr))
            .ok_or(libc::ENOENT)
    }

    fn get_attr(&mut self, nodeid: u64) -> FsResult<FuseAttr> {
        Ok(self.node(nodeid)?.attr)
    }

    fn open(&mut self, nodeid: u64, _flags: u32) -> FsResult<u64> {
        self.node(nodeid)?;
        let fh = self.next_fh;
        self.next_fh += 1;
        Ok(fh)
    }

    fn release(&mut self, nodeid: u64, _fh: u64) -> FsResult<()> {
        self.node(nodeid)?;
        Ok(())
    }

    fn read(&mut self, nodeid: u64, _fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let node = self.node(nodeid)?;
        let start = std::cmp::min(offset as usize, node.data.len());
        let end = std::cmp::min(start + size as usize, node.data.len());
        Ok(node.data[start..end].to_vec())
    }

    fn readdir(&mut self, nodeid: u64, _fh: u64, offset: u64) -> FsResult<Vec<DirEntry>> {
        self.node(nodeid)?;
        let mut names: Vec<(&String, &FuseAttr)> = self
            .nodes
            .values()
            .filter(|node| node.parent == nodeid && node.attr.ino != nodeid)
            .map(|node| (&node.name, &node.attr))
            .collect();
        names.sort_by_key(|(name, _)| name.clone());
        Ok(names
            .into_iter()
            .enumerate()
            .skip(offset as usize)
            .map(|(index, (name, attr))| DirEntry {
                ino: attr.ino,
                offset: index as u64 + 1,
                type_: (attr.mode >> 12) & 0xf,
                name: name.clone(),
            })
            .collect())
    }

    fn statfs(&mut self, _nodeid: u64) -> FsResult<FuseKstatfs> {
        Ok(FuseKstatfs {
            blocks: 1024,
            bfree: 512,
            bavail: 512,
            files: 64,
            ffree: 32,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
            padding: 0,
            spare: [0; 6],
        })
    }

    fn create(
        &mut self,
        parent: u64,
        name: &str,
        mode: u32,
        _flags: u32,
        _umask: u32,
    ) -> FsResult<(FuseEntryOut, u64)> {
        self.node(parent)?;
        let ino = self.add_file(parent, name, &[]);
        let node = self.node_mut(ino)?;
        node.attr.mode = S_IFREG | (mode & 0o7777);
        let entry = Self::entry_out(node.attr);
        let fh = self.next_fh;
        self.next_fh += 1;
        Ok((entry, fh))
    }

    fn write(&mut self, nodeid: u64, _fh: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        let node = self.node_mut(nodeid)?;
        let end = offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(data);
        node.attr.size = node.data.len() as u64;
        Ok(data.len() as u32)
    }

    fn mkdir(&mut self, parent: u64, name: &str, mode: u32, _umask: u32) -> FsResult<FuseEntryOut> {
        self.node(parent)?;
        let ino = self.add_file(parent, name, &[]);
        let node = self.node_mut(ino)?;
        node.attr.mode = S_IFDIR | (mode & 0o7777);
        Ok(Self::entry_out(node.attr))
    }

    fn opendir(&mut self, nodeid: u64, _flags: u32) -> FsResult<u64> {
        self.node(nodeid)?;
        let fh = self.next_fh;
        self.next_fh += 1;
        Ok(fh)
    }

    fn releasedir(&mut self, nodeid: u64, _fh: u64) -> FsResult<()> {
        self.node(nodeid)?;
        Ok(())
    }

    fn unlink(&mut self, parent: u64, name: &str) -> FsResult<()> {
        let ino = self.lookup(parent, name)?.nodeid;
        self.nodes.remove(&ino);
        Ok(())
    }

    fn set_attr(&mut self, nodeid: u64, values: &SetattrValues) -> FsResult<FuseAttr> {
        let node = self.node_mut(nodeid)?;
        if let Some(mode) = values.mode {
            node.attr.mode = (node.attr.mode & !0o7777) | (mode & 0o7777);
        }
        if let Some(uid) = values.uid {
            node.attr.uid = uid;
        }
        if let Some(gid) = values.gid {
            node.attr.gid = gid;
        }
        if let Some(size) = values.size {
            node.data.resize(size as usize, 0);
            node.attr.size = size;
        }
        if let Some((secs, nsecs)) = values.atime {
            node.attr.atime = secs;
            node.attr.atimensec = nsecs;
        }
        if let Some((secs, nsecs)) = values.mtime {
            node.attr.mtime = secs;
            node.attr.mtimensec = nsecs;
        }
        Ok(node.attr)
    }

    fn setxattr(&mut self, nodeid: u64, name: &str, value: &[u8], _flags: u32) -> FsResult<()> {
        let node = self.node_mut(nodeid)?;
        node.xattrs.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn getxattr(&mut self, nodeid: u64, name: &str) -> FsResult<Vec<u8>> {
        self.node(nodeid)?
            .xattrs
            .get(name)
            .cloned()
            .ok_or(libc::ENODATA)
    }

    fn listxattr(&mut self, nodeid: u64) -> FsResult<Vec<u8>> {
        let mut names = Vec::new();
        for name in self.node(nodeid)?.xattrs.keys() {
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }
        Ok(names)
    }

    fn removexattr(&mut self, nodeid: u64, name: &str) -> FsResult<()> {
        self.node_mut(nodeid)?
            .xattrs
            .remove(name)
            .map(|_| ())
            .ok_or(libc::ENODATA)
    }

    fn lseek(&mut self, nodeid: u64, _fh: u64, offset: u64, _whence: u32) -> FsResult<u64> {
        self.lseek_calls += 1;
        self.node(nodeid)?;
        Ok(offset)
    }

    fn fallocate(
        &mut self,
        nodeid: u64,
        _fh: u64,
        offset: u64,
        length: u64,
        _mode: u32,
    ) -> FsResult<()> {
        let node = self.node_mut(nodeid)?;
        let end = (offset + length) as usize;
        if node.data.len() < end {
            node.data.resize(end, 0);
            node.attr.size = end as u64;
        }
        Ok(())
    }

    fn getlk(
        &mut self,
        nodeid: u64,
        _fh: u64,
        owner: u64,
        lock: &FuseFileLock,
    ) -> FsResult<FuseFileLock> {
        let node = self.node(nodeid)?;
        for rec in node.locks.iter() {
            if rec.owner != owner
                && Self::overlaps(rec, lock)
                && (rec.lock_type == F_WRLCK || lock.lock_type == F_WRLCK)
            {
                return Ok(FuseFileLock {
                    start: rec.start,
                    end: rec.end,
                    lock_type: rec.lock_type,
                    pid: 0,
                });
            }
        }
        Ok(FuseFileLock {
            start: 0,
            end: 0,
            lock_type: F_UNLCK,
            pid: 0,
        })
    }

    fn setlk(
        &mut self,
        nodeid: u64,
        _fh: u64,
        owner: u64,
        lock: &FuseFileLock,
        _blocking: bool,
    ) -> FsResult<()> {
        let node = self.node_mut(nodeid)?;
        if lock.lock_type == F_UNLCK {
            node.locks
                .retain(|rec| !(rec.owner == owner && Self::overlaps(rec, lock)));
            return Ok(());
        }
        for rec in node.locks.iter() {
            if rec.owner != owner
                && Self::overlaps(rec, lock)
                && (rec.lock_type == F_WRLCK || lock.lock_type == F_WRLCK)
            {
                return Err(libc::EAGAIN);
            }
        }
        node.locks.push(LockRec {
            owner,
            lock_type: lock.lock_type,
            start: lock.start,
            end: lock.end,
        });
        Ok(())
    }

    fn flush(&mut self, nodeid: u64, _fh: u64, _lock_owner: u64) -> FsResult<()> {
        self.node(nodeid)?;
        Ok(())
    }
}
