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

//! Per-opcode FUSE request dispatch: parse the request buffer, call the
//! backend, serialize the reply. Malformed requests surface as errors so
//! the device abandons them; backend failures become error replies.

use std::cmp::min;
use std::mem::size_of;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};

use util::byte_code::ByteCode;
use util::num_ops::round_up;

use super::fs_ops::{FileSystemOps, SetattrValues};
use super::fuse_msg::*;
use crate::error::VirtioError;

const IN_HEADER_LEN: usize = size_of::<FuseInHeader>();
const OUT_HEADER_LEN: usize = size_of::<FuseOutHeader>();
/// A WRITE request is at least the input header plus the write header;
/// guests may pad between that and the payload.
const WRITE_MIN_LEN: usize = IN_HEADER_LEN + size_of::<FuseWriteIn>();

/// Outcome of one dispatched request.
pub enum FuseReqResult {
    /// The reply occupies this many leading bytes of the response buffer
    /// (zero for reply-less operations).
    Reply(usize),
    /// A blocking lock could not be granted; the caller defers the reply.
    WouldBlock,
}

fn reply(
    resp: &mut [u8],
    unique: u64,
    errno: i32,
    payload: &[&[u8]],
) -> Result<FuseReqResult> {
    let payload_len: usize = payload.iter().map(|part| part.len()).sum();
    let total = OUT_HEADER_LEN + payload_len;
    if resp.len() < total {
        return Err(anyhow!(VirtioError::RequestMalformed(
            "response buffer too small"
        )));
    }
    let header = FuseOutHeader {
        len: total as u32,
        error: -errno,
        unique,
    };
    resp[..OUT_HEADER_LEN].copy_from_slice(header.as_bytes());
    let mut pos = OUT_HEADER_LEN;
    for part in payload {
        resp[pos..pos + part.len()].copy_from_slice(part);
        pos += part.len();
    }
    Ok(FuseReqResult::Reply(total))
}

fn reply_ok(resp: &mut [u8], unique: u64, payload: &[&[u8]]) -> Result<FuseReqResult> {
    reply(resp, unique, 0, payload)
}

fn reply_err(resp: &mut [u8], unique: u64, errno: i32) -> Result<FuseReqResult> {
    reply(resp, unique, errno, &[])
}

fn reply_obj<T: ByteCode>(
    resp: &mut [u8],
    unique: u64,
    result: std::result::Result<T, i32>,
) -> Result<FuseReqResult> {
    match result {
        Ok(obj) => reply_ok(resp, unique, &[obj.as_bytes()]),
        Err(errno) => reply_err(resp, unique, errno),
    }
}

fn reply_unit(
    resp: &mut [u8],
    unique: u64,
    result: std::result::Result<(), i32>,
) -> Result<FuseReqResult> {
    match result {
        Ok(()) => reply_ok(resp, unique, &[]),
        Err(errno) => reply_err(resp, unique, errno),
    }
}

fn parse_obj<T: ByteCode>(body: &[u8]) -> Result<T> {
    T::from_bytes(body).ok_or_else(|| anyhow!(VirtioError::RequestMalformed("request body too short")))
}

fn tail(body: &[u8], offset: usize) -> Result<&[u8]> {
    body.get(offset..)
        .ok_or_else(|| anyhow!(VirtioError::RequestMalformed("request body too short")))
}

/// Parse one NUL-terminated name; returns the name and the bytes consumed
/// including the terminator.
fn parse_name(bytes: &[u8]) -> Result<(&str, usize)> {
    let nul = bytes
        .iter()
        .position(|byte| *byte == 0)
        .ok_or_else(|| anyhow!(VirtioError::RequestMalformed("name not NUL terminated")))?;
    let name = std::str::from_utf8(&bytes[..nul])
        .map_err(|_| anyhow!(VirtioError::RequestMalformed("name is not valid utf-8")))?;
    if name.is_empty() {
        return Err(anyhow!(VirtioError::RequestMalformed("empty name")));
    }
    Ok((name, nul + 1))
}

fn attr_out(attr: FuseAttr) -> FuseAttrOut {
    FuseAttrOut {
        attr_valid: 1,
        attr_valid_nsec: 0,
        dummy: 0,
        attr,
    }
}

fn wallclock_now() -> (u64, u32) {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| (d.as_secs(), d.subsec_nanos()))
        .unwrap_or((0, 0))
}

/// Dispatch one framed request against the backend. `req` is the
/// concatenated device-readable half of the chain, `resp` the scratch the
/// reply is serialized into.
pub fn do_fuse_request(
    backend: &mut dyn FileSystemOps,
    req: &[u8],
    resp: &mut [u8],
) -> Result<FuseReqResult> {
    let header: FuseInHeader = parse_obj(req)?;
    if log_enabled!(log::Level::Debug) {
        debug!(
            "fuse request: opcode {} unique {} nodeid {} len {}",
            header.opcode, header.unique, header.nodeid, header.len
        );
    }
    let body = tail(req, IN_HEADER_LEN)?;

    match header.opcode {
        FUSE_INIT => do_init(backend, &header, body, resp),
        FUSE_DESTROY => {
            backend.destroy();
            reply_ok(resp, header.unique, &[])
        }
        FUSE_LOOKUP => {
            let (name, _) = parse_name(body)?;
            reply_obj(resp, header.unique, backend.lookup(header.nodeid, name))
        }
        FUSE_FORGET => {
            let forget_in: FuseForgetIn = parse_obj(body)?;
            backend.forget(header.nodeid, forget_in.nlookup);
            // FORGET never gets a reply.
            Ok(FuseReqResult::Reply(0))
        }
        FUSE_GETATTR => {
            let _getattr_in: FuseGetattrIn = parse_obj(body)?;
            reply_obj(
                resp,
                header.unique,
                backend.get_attr(header.nodeid).map(attr_out),
            )
        }
        FUSE_SETATTR => do_setattr(backend, &header, body, resp),
        FUSE_READLINK => match backend.readlink(header.nodeid) {
            Ok(target) => reply_ok(resp, header.unique, &[&target]),
            Err(errno) => reply_err(resp, header.unique, errno),
        },
        FUSE_SYMLINK => {
            let (name, consumed) = parse_name(body)?;
            let (target, _) = parse_name(tail(body, consumed)?)?;
            reply_obj(
                resp,
                header.unique,
                backend.symlink(header.nodeid, name, target),
            )
        }
        FUSE_MKNOD => {
            let mknod_in: FuseMknodIn = parse_obj(body)?;
            let (name, _) = parse_name(tail(body, size_of::<FuseMknodIn>())?)?;
            reply_obj(
                resp,
                header.unique,
                backend.mknod(header.nodeid, name, mknod_in.mode, mknod_in.rdev, mknod_in.umask),
            )
        }
        FUSE_MKDIR => {
            let mkdir_in: FuseMkdirIn = parse_obj(body)?;
            let (name, _) = parse_name(tail(body, size_of::<FuseMkdirIn>())?)?;
            reply_obj(
                resp,
                header.unique,
                backend.mkdir(header.nodeid, name, mkdir_in.mode, mkdir_in.umask),
            )
        }
        FUSE_UNLINK => {
            let (name, _) = parse_name(body)?;
            reply_unit(resp, header.unique, backend.unlink(header.nodeid, name))
        }
        FUSE_RMDIR => {
            let (name, _) = parse_name(body)?;
            reply_unit(resp, header.unique, backend.rmdir(header.nodeid, name))
        }
        FUSE_RENAME => {
            let rename_in: FuseRenameIn = parse_obj(body)?;
            let names = tail(body, size_of::<FuseRenameIn>())?;
            let (name, consumed) = parse_name(names)?;
            let (newname, _) = parse_name(tail(names, consumed)?)?;
            reply_unit(
                resp,
                header.unique,
                backend.rename(header.nodeid, name, rename_in.newdir, newname, 0),
            )
        }
        FUSE_RENAME2 => {
            let rename_in: FuseRename2In = parse_obj(body)?;
            let names = tail(body, size_of::<FuseRename2In>())?;
            let (name, consumed) = parse_name(names)?;
            let (newname, _) = parse_name(tail(names, consumed)?)?;
            reply_unit(
                resp,
                header.unique,
                backend.rename(header.nodeid, name, rename_in.newdir, newname, rename_in.flags),
            )
        }
        FUSE_LINK => {
            let link_in: FuseLinkIn = parse_obj(body)?;
            let (name, _) = parse_name(tail(body, size_of::<FuseLinkIn>())?)?;
            reply_obj(
                resp,
                header.unique,
                backend.link(link_in.oldnodeid, header.nodeid, name),
            )
        }
        FUSE_OPEN => {
            let open_in: FuseOpenIn = parse_obj(body)?;
            reply_obj(
                resp,
                header.unique,
                backend.open(header.nodeid, open_in.flags).map(|fh| FuseOpenOut {
                    fh,
                    open_flags: 0,
                    padding: 0,
                }),
            )
        }
        FUSE_READ => do_read(backend, &header, body, resp),
        FUSE_WRITE => do_write(backend, &header, req, resp),
        FUSE_STATFS => reply_obj(resp, header.unique, backend.statfs(header.nodeid)),
        FUSE_RELEASE => {
            let release_in: FuseReleaseIn = parse_obj(body)?;
            reply_unit(
                resp,
                header.unique,
                backend.release(header.nodeid, release_in.fh),
            )
        }
        FUSE_FLUSH => {
            let flush_in: FuseFlushIn = parse_obj(body)?;
            reply_unit(
                resp,
                header.unique,
                backend.flush(header.nodeid, flush_in.fh, flush_in.lock_owner),
            )
        }
        FUSE_OPENDIR => {
            let open_in: FuseOpenIn = parse_obj(body)?;
            reply_obj(
                resp,
                header.unique,
                backend
                    .opendir(header.nodeid, open_in.flags)
                    .map(|fh| FuseOpenOut {
                        fh,
                        open_flags: 0,
                        padding: 0,
                    }),
            )
        }
        FUSE_READDIR => do_readdir(backend, &header, body, resp),
        FUSE_RELEASEDIR => {
            let release_in: FuseReleaseIn = parse_obj(body)?;
            reply_unit(
                resp,
                header.unique,
                backend.releasedir(header.nodeid, release_in.fh),
            )
        }
        FUSE_CREATE => {
            let create_in: FuseCreateIn = parse_obj(body)?;
            let (name, _) = parse_name(tail(body, size_of::<FuseCreateIn>())?)?;
            match backend.create(
                header.nodeid,
                name,
                create_in.mode,
                create_in.flags,
                create_in.umask,
            ) {
                Ok((entry, fh)) => {
                    let open_out = FuseOpenOut {
                        fh,
                        open_flags: 0,
                        padding: 0,
                    };
                    reply_ok(
                        resp,
                        header.unique,
                        &[entry.as_bytes(), open_out.as_bytes()],
                    )
                }
                Err(errno) => reply_err(resp, header.unique, errno),
            }
        }
        FUSE_SETXATTR => do_setxattr(backend, &header, body, resp),
        FUSE_GETXATTR => do_getxattr(backend, &header, body, resp),
        FUSE_LISTXATTR => do_listxattr(backend, &header, body, resp),
        FUSE_REMOVEXATTR => {
            let (name, _) = parse_name(body)?;
            reply_unit(resp, header.unique, backend.removexattr(header.nodeid, name))
        }
        FUSE_GETLK => {
            let lk_in: FuseLkIn = parse_obj(body)?;
            reply_obj(
                resp,
                header.unique,
                backend
                    .getlk(header.nodeid, lk_in.fh, lk_in.owner, &lk_in.lock)
                    .map(|lock| FuseLkOut { lock }),
            )
        }
        FUSE_SETLK => do_setlk(backend, &header, body, resp, false),
        FUSE_SETLKW => do_setlk(backend, &header, body, resp, true),
        FUSE_LSEEK => do_lseek(backend, &header, body, resp),
        FUSE_FALLOCATE => do_fallocate(backend, &header, body, resp),
        _ => {
            // IOCTL, POLL and anything unknown answer ENOSYS.
            reply_err(resp, header.unique, libc::ENOSYS)
        }
    }
}

fn do_init(
    backend: &mut dyn FileSystemOps,
    header: &FuseInHeader,
    body: &[u8],
    resp: &mut [u8],
) -> Result<FuseReqResult> {
    let init_in: FuseInitIn = parse_obj(body)?;
    if init_in.major != FUSE_KERNEL_VERSION {
        // Unknown major: answer with the supported version only and let
        // the driver restart negotiation.
        let out = FuseInitOut {
            major: FUSE_KERNEL_VERSION,
            minor: FUSE_KERNEL_MINOR_VERSION,
            ..Default::default()
        };
        return reply_ok(resp, header.unique, &[out.as_bytes()]);
    }
    match backend.init() {
        Ok(info) => {
            let max_write = if info.max_write == 0 {
                FUSE_DEFAULT_MAX_WRITE
            } else {
                info.max_write
            };
            let out = FuseInitOut {
                major: FUSE_KERNEL_VERSION,
                minor: FUSE_KERNEL_MINOR_VERSION,
                max_readahead: FUSE_MAX_READAHEAD,
                flags: info.flags,
                max_background: FUSE_MAX_BACKGROUND,
                congestion_threshold: FUSE_CONGESTION_THRESHOLD,
                max_write,
                time_gran: FUSE_TIME_GRAN,
                ..Default::default()
            };
            reply_ok(resp, header.unique, &[out.as_bytes()])
        }
        Err(errno) => reply_err(resp, header.unique, errno),
    }
}

fn do_setattr(
    backend: &mut dyn FileSystemOps,
    header: &FuseInHeader,
    body: &[u8],
    resp: &mut [u8],
) -> Result<FuseReqResult> {
    let setattr_in: FuseSetattrIn = parse_obj(body)?;
    let valid = setattr_in.valid;

    let mut values = SetattrValues::default();
    if valid & FATTR_MODE != 0 {
        values.mode = Some(setattr_in.mode);
    }
    if valid & FATTR_UID != 0 {
        values.uid = Some(setattr_in.uid);
    }
    if valid & FATTR_GID != 0 {
        values.gid = Some(setattr_in.gid);
    }
    if valid & FATTR_SIZE != 0 {
        values.size = Some(setattr_in.size);
    }
    if valid & FATTR_ATIME != 0 {
        values.atime = if valid & FATTR_ATIME_NOW != 0 || setattr_in.atimensec == UTIME_NOW {
            Some(wallclock_now())
        } else if setattr_in.atimensec == UTIME_OMIT {
            None
        } else {
            Some((setattr_in.atime, setattr_in.atimensec))
        };
    }
    if valid & FATTR_MTIME != 0 {
        values.mtime = if valid & FATTR_MTIME_NOW != 0 || setattr_in.mtimensec == UTIME_NOW {
            Some(wallclock_now())
        } else if setattr_in.mtimensec == UTIME_OMIT {
            None
        } else {
            Some((setattr_in.mtime, setattr_in.mtimensec))
        };
    }

    reply_obj(
        resp,
        header.unique,
        backend.set_attr(header.nodeid, &values).map(attr_out),
    )
}

fn do_read(
    backend: &mut dyn FileSystemOps,
    header: &FuseInHeader,
    body: &[u8],
    resp: &mut [u8],
) -> Result<FuseReqResult> {
    let read_in: FuseReadIn = parse_obj(body)?;
    let capacity = resp.len().saturating_sub(OUT_HEADER_LEN);
    let size = min(read_in.size as usize, capacity) as u32;
    match backend.read(header.nodeid, read_in.fh, read_in.offset, size) {
        Ok(mut data) => {
            data.truncate(size as usize);
            reply_ok(resp, header.unique, &[&data])
        }
        Err(errno) => reply_err(resp, header.unique, errno),
    }
}

fn do_write(
    backend: &mut dyn FileSystemOps,
    header: &FuseInHeader,
    req: &[u8],
    resp: &mut [u8],
) -> Result<FuseReqResult> {
    let write_in: FuseWriteIn = parse_obj(tail(req, IN_HEADER_LEN)?)?;
    let size = write_in.size as usize;
    // Guests may pad between the headers and the payload; the payload is
    // pinned to the request tail.
    let payload_start = req
        .len()
        .checked_sub(size)
        .ok_or_else(|| anyhow!(VirtioError::RequestMalformed("write payload exceeds request")))?;
    if payload_start < WRITE_MIN_LEN {
        return Err(anyhow!(VirtioError::RequestMalformed(
            "write payload overlaps the headers"
        )));
    }
    let data = &req[payload_start..];
    reply_obj(
        resp,
        header.unique,
        backend
            .write(header.nodeid, write_in.fh, write_in.offset, data)
            .map(|written| FuseWriteOut {
                size: written,
                padding: 0,
            }),
    )
}

fn do_readdir(
    backend: &mut dyn FileSystemOps,
    header: &FuseInHeader,
    body: &[u8],
    resp: &mut [u8],
) -> Result<FuseReqResult> {
    let read_in: FuseReadIn = parse_obj(body)?;
    let entries = match backend.readdir(header.nodeid, read_in.fh, read_in.offset) {
        Ok(entries) => entries,
        Err(errno) => return reply_err(resp, header.unique, errno),
    };

    let limit = min(
        read_in.size as usize,
        resp.len().saturating_sub(OUT_HEADER_LEN),
    );
    let mut dirents = Vec::new();
    for entry in entries {
        let ent_len = size_of::<FuseDirent>() + entry.name.len();
        let padded_len = round_up(ent_len as u64, 8).unwrap_or(ent_len as u64) as usize;
        if dirents.len() + padded_len > limit {
            break;
        }
        let dirent = FuseDirent {
            ino: entry.ino,
            off: entry.offset,
            namelen: entry.name.len() as u32,
            type_: entry.type_,
        };
        dirents.extend_from_slice(dirent.as_bytes());
        dirents.extend_from_slice(entry.name.as_bytes());
        let target = round_up(dirents.len() as u64, 8).unwrap_or(dirents.len() as u64) as usize;
        dirents.resize(target, 0);
    }
    reply_ok(resp, header.unique, &[&dirents])
}

fn do_setxattr(
    backend: &mut dyn FileSystemOps,
    header: &FuseInHeader,
    body: &[u8],
    resp: &mut [u8],
) -> Result<FuseReqResult> {
    let setxattr_in: FuseSetxattrIn = parse_obj(body)?;
    let rest = tail(body, size_of::<FuseSetxattrIn>())?;
    let (name, consumed) = parse_name(rest)?;
    let value = rest
        .get(consumed..consumed + setxattr_in.size as usize)
        .ok_or_else(|| anyhow!(VirtioError::RequestMalformed("xattr value truncated")))?;
    reply_unit(
        resp,
        header.unique,
        backend.setxattr(header.nodeid, name, value, setxattr_in.flags),
    )
}

/// Shared GETXATTR/LISTXATTR size semantics: size 0 asks for the required
/// length, a too-small size is `ERANGE`, never a truncation.
fn reply_xattr_value(
    resp: &mut [u8],
    unique: u64,
    asked_size: u32,
    result: std::result::Result<Vec<u8>, i32>,
) -> Result<FuseReqResult> {
    match result {
        Ok(value) => {
            if asked_size == 0 {
                let out = FuseGetxattrOut {
                    size: value.len() as u32,
                    padding: 0,
                };
                reply_ok(resp, unique, &[out.as_bytes()])
            } else if value.len() > asked_size as usize {
                reply_err(resp, unique, libc::ERANGE)
            } else {
                reply_ok(resp, unique, &[&value])
            }
        }
        Err(errno) => reply_err(resp, unique, errno),
    }
}

fn do_getxattr(
    backend: &mut dyn FileSystemOps,
    header: &FuseInHeader,
    body: &[u8],
    resp: &mut [u8],
) -> Result<FuseReqResult> {
    let getxattr_in: FuseGetxattrIn = parse_obj(body)?;
    let (name, _) = parse_name(tail(body, size_of::<FuseGetxattrIn>())?)?;
    let result = backend.getxattr(header.nodeid, name);
    reply_xattr_value(resp, header.unique, getxattr_in.size, result)
}

fn do_listxattr(
    backend: &mut dyn FileSystemOps,
    header: &FuseInHeader,
    body: &[u8],
    resp: &mut [u8],
) -> Result<FuseReqResult> {
    let getxattr_in: FuseGetxattrIn = parse_obj(body)?;
    let result = backend.listxattr(header.nodeid);
    reply_xattr_value(resp, header.unique, getxattr_in.size, result)
}

fn do_setlk(
    backend: &mut dyn FileSystemOps,
    header: &FuseInHeader,
    body: &[u8],
    resp: &mut [u8],
    blocking: bool,
) -> Result<FuseReqResult> {
    let lk_in: FuseLkIn = parse_obj(body)?;
    match backend.setlk(header.nodeid, lk_in.fh, lk_in.owner, &lk_in.lock, blocking) {
        Ok(()) => reply_ok(resp, header.unique, &[]),
        Err(errno) if blocking && errno == libc::EAGAIN => Ok(FuseReqResult::WouldBlock),
        Err(errno) => reply_err(resp, header.unique, errno),
    }
}

fn do_lseek(
    backend: &mut dyn FileSystemOps,
    header: &FuseInHeader,
    body: &[u8],
    resp: &mut [u8],
) -> Result<FuseReqResult> {
    let lseek_in: FuseLseekIn = parse_obj(body)?;
    // SEEK_HOLE/SEEK_DATA semantics: a negative offset can never match.
    if (lseek_in.offset as i64) < 0 {
        return reply_err(resp, header.unique, libc::ENXIO);
    }
    reply_obj(
        resp,
        header.unique,
        backend
            .lseek(header.nodeid, lseek_in.fh, lseek_in.offset, lseek_in.whence)
            .map(|offset| FuseLseekOut { offset }),
    )
}

fn do_fallocate(
    backend: &mut dyn FileSystemOps,
    header: &FuseInHeader,
    body: &[u8],
    resp: &mut [u8],
) -> Result<FuseReqResult> {
    let fallocate_in: FuseFallocateIn = parse_obj(body)?;
    if (fallocate_in.offset as i64) < 0 || (fallocate_in.length as i64) < 0 {
        return reply_err(resp, header.unique, libc::EINVAL);
    }
    reply_unit(
        resp,
        header.unique,
        backend.fallocate(
            header.nodeid,
            fallocate_in.fh,
            fallocate_in.offset,
            fallocate_in.length,
            fallocate_in.mode,
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::super::test_backend::MemFs;
    use super::*;

    const ROOT_ID: u64 = 1;

    fn build_req(opcode: u32, unique: u64, nodeid: u64, body: &[u8]) -> Vec<u8> {
        let header = FuseInHeader {
            len: (IN_HEADER_LEN + body.len()) as u32,
            opcode,
            unique,
            nodeid,
            uid: 0,
            gid: 0,
            pid: 1,
            total_extlen: 0,
            padding: 0,
        };
        let mut req = header.as_bytes().to_vec();
        req.extend_from_slice(body);
        req
    }

    fn dispatch(fs: &mut MemFs, req: &[u8]) -> (FuseOutHeader, Vec<u8>) {
        let mut resp = vec![0_u8; 8192];
        match do_fuse_request(fs, req, &mut resp).unwrap() {
            FuseReqResult::Reply(total) => {
                let header = FuseOutHeader::from_bytes(&resp).unwrap();
                assert_eq!(header.len as usize, total);
                (header, resp[OUT_HEADER_LEN..total].to_vec())
            }
            FuseReqResult::WouldBlock => panic!("Unexpected deferral"),
        }
    }

    fn name_body(name: &str) -> Vec<u8> {
        let mut body = name.as_bytes().to_vec();
        body.push(0);
        body
    }

    #[test]
    fn test_init_contract() {
        let mut fs = MemFs::new();
        let init_in = FuseInitIn {
            major: 7,
            minor: 31,
            max_readahead: 0,
            flags: 0,
        };
        let req = build_req(FUSE_INIT, 1, 0, init_in.as_bytes());
        let (header, payload) = dispatch(&mut fs, &req);
        assert_eq!(header.error, 0);
        assert_eq!(header.unique, 1);
        let out = FuseInitOut::from_bytes(&payload).unwrap();
        assert_eq!(out.major, 7);
        assert_eq!(out.minor, 31);
        assert_eq!(out.max_readahead, 128 * 1024);
        assert_eq!(out.max_background, 16);
        assert_eq!(out.congestion_threshold, 32);
        assert_eq!(out.max_write, 128 * 1024);
        assert_eq!(out.time_gran, 1);
    }

    #[test]
    fn test_lookup_missing_enoent() {
        let mut fs = MemFs::new();
        let req = build_req(FUSE_LOOKUP, 7, ROOT_ID, &name_body("missing"));
        let (header, payload) = dispatch(&mut fs, &req);
        assert_eq!(header.len, 16);
        assert_eq!(header.error, -libc::ENOENT);
        assert_eq!(header.error, -2);
        assert_eq!(header.unique, 7);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_create_write_read_release_round_trip() {
        let mut fs = MemFs::new();

        let create_in = FuseCreateIn {
            flags: 0,
            mode: 0o644,
            umask: 0,
            open_flags: 0,
        };
        let mut body = create_in.as_bytes().to_vec();
        body.extend_from_slice(&name_body("note.txt"));
        let (header, payload) = dispatch(&mut fs, &build_req(FUSE_CREATE, 2, ROOT_ID, &body));
        assert_eq!(header.error, 0);
        let entry = FuseEntryOut::from_bytes(&payload).unwrap();
        let open_out = FuseOpenOut::from_bytes(&payload[128..]).unwrap();
        let node = entry.nodeid;
        let fh = open_out.fh;

        let payload_bytes = b"all work and no play".to_vec();
        let write_in = FuseWriteIn {
            fh,
            offset: 0,
            size: payload_bytes.len() as u32,
            write_flags: 0,
            lock_owner: 0,
        };
        let mut body = write_in.as_bytes().to_vec();
        body.extend_from_slice(&payload_bytes);
        let (header, payload) = dispatch(&mut fs, &build_req(FUSE_WRITE, 3, node, &body));
        assert_eq!(header.error, 0);
        let write_out = FuseWriteOut::from_bytes(&payload).unwrap();
        assert_eq!(write_out.size, payload_bytes.len() as u32);

        let read_in = FuseReadIn {
            fh,
            offset: 0,
            size: 64,
            read_flags: 0,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        let (header, payload) =
            dispatch(&mut fs, &build_req(FUSE_READ, 4, node, read_in.as_bytes()));
        assert_eq!(header.error, 0);
        assert_eq!(payload, payload_bytes);
        assert_eq!(header.len as usize, 16 + payload_bytes.len());

        let release_in = FuseReleaseIn {
            fh,
            flags: 0,
            release_flags: 0,
            lock_owner: 0,
        };
        let (header, _) =
            dispatch(&mut fs, &build_req(FUSE_RELEASE, 5, node, release_in.as_bytes()));
        assert_eq!(header.error, 0);
    }

    #[test]
    fn test_write_with_prepayload_padding() {
        let mut fs = MemFs::new();
        let node = fs.add_file(ROOT_ID, "data.bin", &[]);
        let fh = fs.open(node, 0).unwrap();

        let data = vec![0xab_u8; 1024];
        let write_in = FuseWriteIn {
            fh,
            offset: 0,
            size: 1024,
            write_flags: 0,
            lock_owner: 0,
        };
        let mut body = write_in.as_bytes().to_vec();
        // Eight bytes of padding between the headers and the payload.
        body.extend_from_slice(&[0_u8; 8]);
        body.extend_from_slice(&data);
        let req = build_req(FUSE_WRITE, 9, node, &body);
        assert_eq!(req.len(), 40 + 32 + 8 + 1024);

        let (header, payload) = dispatch(&mut fs, &req);
        assert_eq!(header.error, 0);
        let write_out = FuseWriteOut::from_bytes(&payload).unwrap();
        assert_eq!(write_out.size, 1024);
        assert_eq!(fs.file_content(node), data);
    }

    #[test]
    fn test_write_payload_overlapping_headers_rejected() {
        let mut fs = MemFs::new();
        let node = fs.add_file(ROOT_ID, "data.bin", &[]);
        let fh = fs.open(node, 0).unwrap();

        let write_in = FuseWriteIn {
            fh,
            offset: 0,
            // Claims more payload than the request carries past the headers.
            size: 40,
            write_flags: 0,
            lock_owner: 0,
        };
        let mut body = write_in.as_bytes().to_vec();
        body.extend_from_slice(&[0_u8; 8]);
        let req = build_req(FUSE_WRITE, 10, node, &body);
        let mut resp = vec![0_u8; 256];
        assert!(do_fuse_request(&mut fs, &req, &mut resp).is_err());
    }

    #[test]
    fn test_getxattr_size_semantics() {
        let mut fs = MemFs::new();
        let node = fs.add_file(ROOT_ID, "tagged", b"x");
        fs.setxattr(node, "user.color", b"burgundy", 0).unwrap();

        let ask = |fs: &mut MemFs, size: u32| {
            let getxattr_in = FuseGetxattrIn { size, padding: 0 };
            let mut body = getxattr_in.as_bytes().to_vec();
            body.extend_from_slice(&name_body("user.color"));
            dispatch(fs, &build_req(FUSE_GETXATTR, 11, node, &body))
        };

        // size == 0: length-only reply, 8 byte payload.
        let (header, payload) = ask(&mut fs, 0);
        assert_eq!(header.error, 0);
        assert_eq!(header.len, 16 + 8);
        let out = FuseGetxattrOut::from_bytes(&payload).unwrap();
        assert_eq!(out.size, 8);

        // Too small: ERANGE, never truncation.
        let (header, payload) = ask(&mut fs, 4);
        assert_eq!(header.error, -libc::ERANGE);
        assert!(payload.is_empty());

        // Large enough: the value itself.
        let (header, payload) = ask(&mut fs, 64);
        assert_eq!(header.error, 0);
        assert_eq!(payload, b"burgundy");
    }

    #[test]
    fn test_lseek_negative_skips_backend() {
        let mut fs = MemFs::new();
        let node = fs.add_file(ROOT_ID, "sparse", &[0_u8; 64]);
        let fh = fs.open(node, 0).unwrap();

        let lseek_in = FuseLseekIn {
            fh,
            offset: (-1_i64) as u64,
            whence: 3,
            padding: 0,
        };
        let (header, _) =
            dispatch(&mut fs, &build_req(FUSE_LSEEK, 12, node, lseek_in.as_bytes()));
        assert_eq!(header.error, -libc::ENXIO);
        assert_eq!(fs.lseek_calls, 0);

        let lseek_in = FuseLseekIn {
            fh,
            offset: 8,
            whence: 3,
            padding: 0,
        };
        let (header, payload) =
            dispatch(&mut fs, &build_req(FUSE_LSEEK, 13, node, lseek_in.as_bytes()));
        assert_eq!(header.error, 0);
        assert_eq!(fs.lseek_calls, 1);
        assert_eq!(FuseLseekOut::from_bytes(&payload).unwrap().offset, 8);
    }

    #[test]
    fn test_fallocate_negative_einval() {
        let mut fs = MemFs::new();
        let node = fs.add_file(ROOT_ID, "file", &[]);
        let fh = fs.open(node, 0).unwrap();

        let fallocate_in = FuseFallocateIn {
            fh,
            offset: (-4096_i64) as u64,
            length: 4096,
            mode: 0,
            padding: 0,
        };
        let (header, _) = dispatch(
            &mut fs,
            &build_req(FUSE_FALLOCATE, 14, node, fallocate_in.as_bytes()),
        );
        assert_eq!(header.error, -libc::EINVAL);
    }

    #[test]
    fn test_setattr_resolves_time_sentinels() {
        let mut fs = MemFs::new();
        let node = fs.add_file(ROOT_ID, "file", b"abc");

        let setattr_in = FuseSetattrIn {
            valid: FATTR_SIZE | FATTR_ATIME | FATTR_MTIME,
            size: 1,
            atime: 0,
            atimensec: UTIME_NOW,
            mtime: 11,
            mtimensec: UTIME_OMIT,
            ..Default::default()
        };
        let before_mtime = fs.attr_of(node).mtime;
        let (header, payload) = dispatch(
            &mut fs,
            &build_req(FUSE_SETATTR, 15, node, setattr_in.as_bytes()),
        );
        assert_eq!(header.error, 0);
        let out = FuseAttrOut::from_bytes(&payload).unwrap();
        assert_eq!(out.attr.size, 1);
        // atime resolved to wall clock, mtime omitted.
        assert_ne!(out.attr.atimensec, UTIME_NOW);
        assert_eq!(out.attr.mtime, before_mtime);
    }

    #[test]
    fn test_unknown_opcodes_enosys() {
        let mut fs = MemFs::new();
        for opcode in [FUSE_IOCTL, FUSE_POLL, 999] {
            let (header, payload) = dispatch(&mut fs, &build_req(opcode, 21, ROOT_ID, &[0_u8; 64]));
            assert_eq!(header.error, -libc::ENOSYS);
            assert!(payload.is_empty());
        }
    }

    #[test]
    fn test_forget_has_no_reply() {
        let mut fs = MemFs::new();
        let forget_in = FuseForgetIn { nlookup: 1 };
        let req = build_req(FUSE_FORGET, 22, ROOT_ID, forget_in.as_bytes());
        let mut resp = vec![0_u8; 64];
        match do_fuse_request(&mut fs, &req, &mut resp).unwrap() {
            FuseReqResult::Reply(total) => assert_eq!(total, 0),
            FuseReqResult::WouldBlock => panic!("Unexpected deferral"),
        }
    }

    #[test]
    fn test_readdir_pads_to_eight() {
        let mut fs = MemFs::new();
        fs.add_file(ROOT_ID, "a", b"");
        fs.add_file(ROOT_ID, "longer_name", b"");
        let fh = fs.opendir(ROOT_ID, 0).unwrap();

        let read_in = FuseReadIn {
            fh,
            offset: 0,
            size: 4096,
            read_flags: 0,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        let (header, payload) =
            dispatch(&mut fs, &build_req(FUSE_READDIR, 23, ROOT_ID, read_in.as_bytes()));
        assert_eq!(header.error, 0);

        // First entry: 24-byte header + "a", padded to 32.
        let first = FuseDirent::from_bytes(&payload).unwrap();
        assert_eq!(first.namelen, 1);
        assert_eq!(&payload[24..25], b"a");
        let second = FuseDirent::from_bytes(&payload[32..]).unwrap();
        assert_eq!(second.namelen, 11);
        assert_eq!(payload.len() % 8, 0);
    }

    #[test]
    fn test_setlk_vs_setlkw_on_conflict() {
        let mut fs = MemFs::new();
        let node = fs.add_file(ROOT_ID, "locked", b"");
        let fh = fs.open(node, 0).unwrap();
        let lock = FuseFileLock {
            start: 0,
            end: 100,
            lock_type: F_WRLCK,
            pid: 1,
        };
        fs.setlk(node, fh, 0xaaaa, &lock, false).unwrap();

        let lk_in = FuseLkIn {
            fh,
            owner: 0xbbbb,
            lock,
            lk_flags: 0,
            padding: 0,
        };
        // Non-blocking flavour answers EAGAIN.
        let (header, _) = dispatch(&mut fs, &build_req(FUSE_SETLK, 24, node, lk_in.as_bytes()));
        assert_eq!(header.error, -libc::EAGAIN);

        // Blocking flavour defers.
        let req = build_req(FUSE_SETLKW, 25, node, lk_in.as_bytes());
        let mut resp = vec![0_u8; 64];
        assert!(matches!(
            do_fuse_request(&mut fs, &req, &mut resp).unwrap(),
            FuseReqResult::WouldBlock
        ));
    }

    #[test]
    fn test_statfs_layout() {
        let mut fs = MemFs::new();
        let (header, payload) = dispatch(&mut fs, &build_req(FUSE_STATFS, 26, ROOT_ID, &[]));
        assert_eq!(header.error, 0);
        assert_eq!(payload.len(), 80);
        let st = FuseKstatfs::from_bytes(&payload).unwrap();
        assert_eq!(st.namelen, 255);
        assert_eq!(st.bsize, 4096);
    }

    #[test]
    fn test_response_buffer_too_small_abandons() {
        let mut fs = MemFs::new();
        let getattr_in = FuseGetattrIn::default();
        let req = build_req(FUSE_GETATTR, 27, ROOT_ID, getattr_in.as_bytes());
        // A 104-byte attr reply cannot fit 32 bytes.
        let mut resp = vec![0_u8; 32];
        assert!(do_fuse_request(&mut fs, &req, &mut resp).is_err());
    }
}
