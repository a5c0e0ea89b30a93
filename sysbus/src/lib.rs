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

//! # SysBus
//!
//! This mod offers the system-bus scaffolding MMIO devices hang off:
//!
//! 1. `SysBusDevOps`: the trap-dispatch trait a device implements.
//! 2. `SysRes`: the MMIO base/size and IRQ line assigned to a device.
//! 3. `SysBus`: a contiguous window of fixed-size transport slots.
//! 4. Template descriptors the machine uses to advertise a device to the
//!    guest (device-tree node, kernel command line, ACPI record) and the
//!    per-architecture IRQ encoding.

#[macro_use]
extern crate log;

mod dev_template;

pub use dev_template::{encode_irq, AmlMmioRecord, Architecture, MmioTemplate};

use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use vmm_sys_util::eventfd::EventFd;

use address_space::GuestAddress;

/// Default size of one transport slot on the bus.
pub const MMIO_SLOT_SIZE: u64 = 512;

/// MMIO resources assigned to a device on the system bus.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SysRes {
    pub region_base: u64,
    pub region_size: u64,
    pub irq: i32,
}

/// Operations a device on the system bus must support.
///
/// `read`/`write` are invoked on whichever vCPU thread trapped; they must
/// complete in bounded time and never suspend. A `false` return records a
/// fault to the caller without disturbing device state.
pub trait SysBusDevOps: Send {
    /// Read from the device register window. `offset` is relative to the
    /// device's region base.
    fn read(&mut self, data: &mut [u8], base: GuestAddress, offset: u64) -> bool;

    /// Write to the device register window.
    fn write(&mut self, data: &[u8], base: GuestAddress, offset: u64) -> bool;

    /// EventFd asserted towards the guest IRQ line, if the device has one.
    fn interrupt_evt(&self) -> Option<&EventFd> {
        None
    }

    fn get_sys_resource(&mut self) -> Option<&mut SysRes> {
        None
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A contiguous guest-physical window divided into fixed-size transport
/// slots. A read to an empty slot returns all zero bytes so a guest probe
/// of the slot terminates cleanly; a write to an empty slot is discarded.
pub struct SysBus {
    region_base: u64,
    slot_size: u64,
    slots: Vec<Option<Arc<Mutex<dyn SysBusDevOps>>>>,
    free_irqs: (i32, i32),
    next_irq: i32,
}

impl SysBus {
    /// Build a bus with `slot_count` slots of `slot_size` bytes starting at
    /// `region_base`, handing out IRQ lines from the `free_irqs` range.
    pub fn new(region_base: u64, slot_size: u64, slot_count: usize, free_irqs: (i32, i32)) -> SysBus {
        assert!(slot_size != 0 && slot_count != 0);
        SysBus {
            region_base,
            slot_size,
            slots: (0..slot_count).map(|_| None).collect(),
            free_irqs,
            next_irq: free_irqs.0,
        }
    }

    pub fn region_base(&self) -> u64 {
        self.region_base
    }

    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    /// Allocate the next free slot and IRQ line for a device.
    pub fn alloc_sys_res(&mut self) -> Result<SysRes> {
        let index = match self.slots.iter().position(|s| s.is_none()) {
            Some(i) => i,
            None => bail!("No free slot on the system bus"),
        };
        if self.next_irq > self.free_irqs.1 {
            bail!("No free irq line on the system bus");
        }
        let res = SysRes {
            region_base: self.region_base + index as u64 * self.slot_size,
            region_size: self.slot_size,
            irq: self.next_irq,
        };
        self.next_irq += 1;
        Ok(res)
    }

    /// Attach a device to the slot its resources were allocated from.
    pub fn attach_device(&mut self, dev: Arc<Mutex<dyn SysBusDevOps>>, res: &SysRes) -> Result<()> {
        let index = self.slot_index(res.region_base)?;
        if res.region_size != self.slot_size {
            bail!(
                "Device region size 0x{:x} does not match slot size 0x{:x}",
                res.region_size,
                self.slot_size
            );
        }
        if self.slots[index].is_some() {
            bail!("Slot {} is already occupied", index);
        }
        self.slots[index] = Some(dev);
        Ok(())
    }

    fn slot_index(&self, addr: u64) -> Result<usize> {
        if addr < self.region_base {
            bail!("Address 0x{:x} is below the bus window", addr);
        }
        let index = ((addr - self.region_base) / self.slot_size) as usize;
        if index >= self.slots.len() {
            bail!("Address 0x{:x} is above the bus window", addr);
        }
        Ok(index)
    }

    /// Dispatch a guest MMIO read. Devices see the absolute base they were
    /// configured with; the bus does not subtract the slot base for them.
    pub fn mmio_read(&mut self, addr: u64, data: &mut [u8]) -> bool {
        let index = match self.slot_index(addr) {
            Ok(i) => i,
            Err(e) => {
                warn!("Mmio read outside the bus window: {:?}", e);
                return false;
            }
        };
        let slot_base = self.region_base + index as u64 * self.slot_size;
        match &self.slots[index] {
            Some(dev) => dev
                .lock()
                .unwrap()
                .read(data, GuestAddress(slot_base), addr - slot_base),
            None => {
                for byte in data.iter_mut() {
                    *byte = 0;
                }
                true
            }
        }
    }

    /// Dispatch a guest MMIO write.
    pub fn mmio_write(&mut self, addr: u64, data: &[u8]) -> bool {
        let index = match self.slot_index(addr) {
            Ok(i) => i,
            Err(e) => {
                warn!("Mmio write outside the bus window: {:?}", e);
                return false;
            }
        };
        let slot_base = self.region_base + index as u64 * self.slot_size;
        match &self.slots[index] {
            Some(dev) => dev
                .lock()
                .unwrap()
                .write(data, GuestAddress(slot_base), addr - slot_base),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubDev {
        last_offset: u64,
        res: SysRes,
    }

    impl SysBusDevOps for StubDev {
        fn read(&mut self, data: &mut [u8], _base: GuestAddress, offset: u64) -> bool {
            self.last_offset = offset;
            for byte in data.iter_mut() {
                *byte = 0xee;
            }
            true
        }

        fn write(&mut self, _data: &[u8], _base: GuestAddress, offset: u64) -> bool {
            self.last_offset = offset;
            true
        }

        fn get_sys_resource(&mut self) -> Option<&mut SysRes> {
            Some(&mut self.res)
        }
    }

    #[test]
    fn test_empty_slot_reads_zero() {
        let mut bus = SysBus::new(0x0800_0000, MMIO_SLOT_SIZE, 4, (5, 15));
        let mut data = [0xff_u8; 4];
        assert!(bus.mmio_read(0x0800_0000, &mut data));
        assert_eq!(data, [0_u8; 4]);
        assert!(bus.mmio_write(0x0800_0200, &[1, 2, 3, 4]));
        // Out of window.
        assert!(!bus.mmio_read(0x0800_0000 + 4 * MMIO_SLOT_SIZE, &mut data));
        assert!(!bus.mmio_read(0x0700_0000, &mut data));
    }

    #[test]
    fn test_attach_and_dispatch() {
        let mut bus = SysBus::new(0x0800_0000, MMIO_SLOT_SIZE, 2, (5, 15));
        let res = bus.alloc_sys_res().unwrap();
        assert_eq!(res.region_base, 0x0800_0000);
        assert_eq!(res.irq, 5);

        let dev = Arc::new(Mutex::new(StubDev {
            last_offset: 0,
            res,
        }));
        bus.attach_device(dev.clone(), &res).unwrap();

        let mut data = [0_u8; 4];
        assert!(bus.mmio_read(0x0800_0010, &mut data));
        assert_eq!(data, [0xee_u8; 4]);
        assert_eq!(dev.lock().unwrap().last_offset, 0x10);

        // Second slot allocation advances base and irq.
        let res2 = bus.alloc_sys_res().unwrap();
        assert_eq!(res2.region_base, 0x0800_0000 + MMIO_SLOT_SIZE);
        assert_eq!(res2.irq, 6);

        // Re-attaching to an occupied slot fails.
        let dev2 = Arc::new(Mutex::new(StubDev {
            last_offset: 0,
            res,
        }));
        assert!(bus.attach_device(dev2, &res).is_err());
    }
}
