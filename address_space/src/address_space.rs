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

use std::mem::size_of;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};

use util::byte_code::ByteCode;

use crate::error::AddressSpaceError;
use crate::{GuestAddress, HostMemMapping};

/// The guest memory gateway: a set of registered `HostMemMapping` regions
/// and byte-granular access on top of them.
///
/// Every ring pointer and buffer address a device receives from the guest is
/// resolved through this type; nothing else may turn a `GuestAddress` into a
/// host pointer.
#[derive(Default)]
pub struct AddressSpace {
    regions: RwLock<Vec<Arc<HostMemMapping>>>,
}

impl AddressSpace {
    pub fn new() -> Arc<AddressSpace> {
        Arc::new(AddressSpace {
            regions: RwLock::new(Vec::new()),
        })
    }

    /// Register a memory region. Regions must not overlap.
    pub fn register_region(&self, mapping: Arc<HostMemMapping>) -> Result<()> {
        let mut regions = self.regions.write().unwrap();
        for r in regions.iter() {
            if mapping.start_address() < r.end_address() && r.start_address() < mapping.end_address()
            {
                return Err(AddressSpaceError::RegionOverlap(
                    mapping.start_address().raw_value(),
                    mapping.end_address().raw_value(),
                )
                .into());
            }
        }
        debug!(
            "Registered memory region 0x{:x}~0x{:x}",
            mapping.start_address().raw_value(),
            mapping.end_address().raw_value()
        );
        regions.push(mapping);
        regions.sort_by_key(|r| r.start_address());
        Ok(())
    }

    /// Whether `[addr, addr + count)` is fully contained in mapped memory.
    pub fn address_in_memory(&self, addr: GuestAddress, count: u64) -> bool {
        self.find_mapping(addr, count).is_some()
    }

    fn find_mapping(&self, addr: GuestAddress, count: u64) -> Option<Arc<HostMemMapping>> {
        let regions = self.regions.read().unwrap();
        regions
            .iter()
            .find(|r| r.contains_range(addr, count))
            .cloned()
    }

    /// Resolve a guest range into an immutable host byte view.
    fn host_view(&self, addr: GuestAddress, count: u64) -> Result<&[u8]> {
        let mapping = self.find_mapping(addr, count).ok_or_else(|| {
            AddressSpaceError::AddrNotMapped(addr.raw_value(), count)
        })?;
        let offset = addr.offset_from(mapping.start_address());
        // SAFETY: contains_range() above guarantees the slice is inside the
        // live mapping; the mapping outlives self.regions entries.
        Ok(unsafe {
            std::slice::from_raw_parts(
                (mapping.host_address() + offset) as *const u8,
                count as usize,
            )
        })
    }

    /// Resolve a guest range into a mutable host byte view.
    #[allow(clippy::mut_from_ref)]
    fn host_view_mut(&self, addr: GuestAddress, count: u64) -> Result<&mut [u8]> {
        let mapping = self.find_mapping(addr, count).ok_or_else(|| {
            AddressSpaceError::AddrNotMapped(addr.raw_value(), count)
        })?;
        let offset = addr.offset_from(mapping.start_address());
        // SAFETY: as host_view(); the guest and device race on these bytes
        // by design, ring-index protocol ordering makes the data race benign.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(
                (mapping.host_address() + offset) as *mut u8,
                count as usize,
            )
        })
    }

    /// Copy `count` bytes of guest memory at `addr` into `dst`.
    pub fn read(&self, dst: &mut dyn std::io::Write, addr: GuestAddress, count: u64) -> Result<()> {
        let view = self.host_view(addr, count)?;
        dst.write_all(view).with_context(|| {
            format!("Failed to read {} bytes from guest address 0x{:x}", count, addr.raw_value())
        })?;
        Ok(())
    }

    /// Copy `count` bytes out of `src` into guest memory at `addr`.
    pub fn write(&self, src: &mut dyn std::io::Read, addr: GuestAddress, count: u64) -> Result<()> {
        let view = self.host_view_mut(addr, count)?;
        src.read_exact(view).with_context(|| {
            format!("Failed to write {} bytes to guest address 0x{:x}", count, addr.raw_value())
        })?;
        Ok(())
    }

    /// Read one POD object out of guest memory.
    pub fn read_object<T: ByteCode>(&self, addr: GuestAddress) -> Result<T> {
        let view = self.host_view(addr, size_of::<T>() as u64)?;
        let mut obj = T::default();
        obj.as_mut_bytes().copy_from_slice(view);
        Ok(obj)
    }

    /// Write one POD object into guest memory.
    pub fn write_object<T: ByteCode>(&self, data: &T, addr: GuestAddress) -> Result<()> {
        let view = self.host_view_mut(addr, size_of::<T>() as u64)?;
        view.copy_from_slice(data.as_bytes());
        Ok(())
    }

    /// Host virtual address for a mapped guest address, for callers that
    /// need a raw pointer (never to be held across a descriptor boundary).
    pub fn get_host_address(&self, addr: GuestAddress) -> Option<u64> {
        self.find_mapping(addr, 1)
            .map(|m| m.host_address() + addr.offset_from(m.start_address()))
    }

    /// Total bytes of mapped guest ram.
    pub fn memory_size(&self) -> u64 {
        self.regions.read().unwrap().iter().map(|r| r.size()).sum()
    }
}
