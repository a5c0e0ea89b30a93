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

use anyhow::{Context, Result};

use crate::error::AddressSpaceError;
use crate::GuestAddress;

/// One contiguous range of guest-physical memory backed by an anonymous
/// host mapping.
#[derive(Debug)]
pub struct HostMemMapping {
    guest_addr: GuestAddress,
    size: u64,
    host_addr: u64,
}

// SAFETY: the mapping is owned exclusively by this struct for its whole
// lifetime; concurrent byte access from guest and device is the nature of
// shared virtio memory and is synchronized at the protocol level.
unsafe impl Send for HostMemMapping {}
unsafe impl Sync for HostMemMapping {}

impl HostMemMapping {
    /// Map `size` bytes of zeroed anonymous memory to back the guest range
    /// starting at `guest_addr`.
    pub fn new(guest_addr: GuestAddress, size: u64) -> Result<HostMemMapping> {
        // SAFETY: anonymous private mapping, no fd, checked return value.
        let host_addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size as libc::size_t,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if host_addr == libc::MAP_FAILED {
            return Err(AddressSpaceError::Mmap(std::io::Error::last_os_error()))
                .with_context(|| format!("Failed to map {} bytes of guest ram", size));
        }

        Ok(HostMemMapping {
            guest_addr,
            size,
            host_addr: host_addr as u64,
        })
    }

    /// Start address of the range in guest physical address space.
    pub fn start_address(&self) -> GuestAddress {
        self.guest_addr
    }

    /// Size of the range in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// First address past the end of the range.
    pub fn end_address(&self) -> GuestAddress {
        self.guest_addr.unchecked_add(self.size)
    }

    /// Host virtual address the range is mapped at.
    pub fn host_address(&self) -> u64 {
        self.host_addr
    }

    /// Whether `[addr, addr + count)` lies fully inside this range.
    pub fn contains_range(&self, addr: GuestAddress, count: u64) -> bool {
        addr >= self.start_address()
            && addr
                .checked_add(count)
                .map_or(false, |end| end <= self.end_address())
    }
}

impl Drop for HostMemMapping {
    fn drop(&mut self) {
        // SAFETY: unmaps exactly what new() mapped.
        unsafe {
            libc::munmap(self.host_addr as *mut libc::c_void, self.size as libc::size_t);
        }
    }
}
