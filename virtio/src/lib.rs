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

//! # Virtio
//!
//! This mod is used for virtio device.
//!
//! ## Design
//!
//! This module offers support for:
//! 1. Some Spec specified const variable used by virtio device.
//! 2. Virtio Device trait and the split virtqueue.
//! 3. The MMIO transport (with a PCI alternative) and the console, block
//!    and filesystem devices behind it.
//!
//! ## Platform Support
//!
//! - `x86_64`
//! - `aarch64`
#[macro_use]
extern crate log;

mod block;
mod console;
pub mod fs;
mod queue;
mod virtio_mmio;
mod virtio_pci;

pub mod error;

pub use anyhow::Result;
pub use block::{Block, BlockState, VirtioBlkConfig};
pub use console::{
    CommunicatInInterface, CommunicatOutInterface, Console, VirtioConsoleConfig,
    VirtioConsoleState,
};
pub use error::VirtioError;
pub use fs::{VirtioFs, VirtioFsState};
pub use queue::*;
pub use virtio_mmio::{VirtioMmioDevice, VirtioMmioState};
pub use virtio_pci::{VirtioPciCommonConfig, VirtioPciDevice};

use std::sync::{Arc, Mutex};

use anyhow::bail;

use address_space::AddressSpace;
use util::num_ops::write_u32;

/// Check if the bit of features is configured.
pub fn virtio_has_feature(feature: u64, fbit: u32) -> bool {
    feature & (1 << fbit) != 0
}

/// Identifier of different virtio device, refer to Virtio Spec.
pub const VIRTIO_TYPE_NET: u32 = 1;
pub const VIRTIO_TYPE_BLOCK: u32 = 2;
pub const VIRTIO_TYPE_CONSOLE: u32 = 3;
pub const VIRTIO_TYPE_GPU: u32 = 16;
pub const VIRTIO_TYPE_VSOCK: u32 = 19;
pub const VIRTIO_TYPE_FS: u32 = 26;

// The Status of Virtio Device.
pub const CONFIG_STATUS_ACKNOWLEDGE: u32 = 0x01;
pub const CONFIG_STATUS_DRIVER: u32 = 0x02;
pub const CONFIG_STATUS_DRIVER_OK: u32 = 0x04;
pub const CONFIG_STATUS_FEATURES_OK: u32 = 0x08;
pub const CONFIG_STATUS_NEEDS_RESET: u32 = 0x40;
pub const CONFIG_STATUS_FAILED: u32 = 0x80;

/// Feature Bits, refer to Virtio Spec.
/// This feature enables the used_event and the avail_event fields.
pub const VIRTIO_F_RING_EVENT_IDX: u32 = 29;
/// Indicates compliance with Virtio Spec.
pub const VIRTIO_F_VERSION_1: u32 = 32;
/// This feature indicates that the device can be used on a platform
/// where device access to data in memory is limited and/or translated.
pub const VIRTIO_F_ACCESS_PLATFORM: u32 = 33;

/// Configuration cols and rows are valid.
pub const VIRTIO_CONSOLE_F_SIZE: u64 = 0;
/// Maximum size of any single segment is in size_max.
pub const VIRTIO_BLK_F_SIZE_MAX: u32 = 1;
/// Maximum number of segments in a request is in seg_max.
pub const VIRTIO_BLK_F_SEG_MAX: u32 = 2;
/// Legacy geometry available.
pub const VIRTIO_BLK_F_GEOMETRY: u32 = 4;
/// Device is read-only.
pub const VIRTIO_BLK_F_RO: u32 = 5;
/// Block size of disk is available.
pub const VIRTIO_BLK_F_BLK_SIZE: u32 = 6;
/// Cache flush command support.
pub const VIRTIO_BLK_F_FLUSH: u32 = 9;

/// The IO type of virtio block, refer to Virtio Spec.
/// Read.
pub const VIRTIO_BLK_T_IN: u32 = 0;
/// Write.
pub const VIRTIO_BLK_T_OUT: u32 = 1;
/// Flush.
pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
/// Device id
pub const VIRTIO_BLK_T_GET_ID: u32 = 8;
/// Device id length
pub const VIRTIO_BLK_ID_BYTES: u32 = 20;
/// Success
pub const VIRTIO_BLK_S_OK: u8 = 0;
/// IO Error.
pub const VIRTIO_BLK_S_IOERR: u8 = 1;
/// Unsupported request.
pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

/// Interrupt status: Used Buffer Notification
pub const VIRTIO_MMIO_INT_VRING: u32 = 0x01;
/// Interrupt status: Configuration Change Notification
pub const VIRTIO_MMIO_INT_CONFIG: u32 = 0x02;

/// The offset between notify reg's address and base MMIO address
/// Guest OS uses notify reg to notify the VMM.
pub const NOTIFY_REG_OFFSET: u32 = 0x50;

/// Device-specific config space starts here inside the register window.
pub const CONFIG_SPACE_OFFSET: u64 = 0x100;

/// Config-space helpers accept both window-absolute and config-relative
/// offsets, so the register dispatch path and adapter wrappers can share
/// them.
pub fn cfg_space_offset(offset: u64) -> u64 {
    if offset >= CONFIG_SPACE_OFFSET {
        offset - CONFIG_SPACE_OFFSET
    } else {
        offset
    }
}

#[derive(Debug)]
pub enum VirtioInterruptType {
    Config,
    Vring,
}

pub type VirtioInterrupt =
    Box<dyn Fn(&VirtioInterruptType, Option<&Queue>) -> Result<()> + Send + Sync>;

/// The trait for virtio device operations.
pub trait VirtioDevice: Send {
    /// Realize low level device.
    fn realize(&mut self) -> Result<()>;

    /// Unrealize low level device
    fn unrealize(&mut self) -> Result<()> {
        bail!("Unrealize of the virtio device is not implemented");
    }

    /// Get the virtio device type, refer to Virtio Spec.
    fn device_type(&self) -> u32;

    /// Get the count of virtio device queues.
    fn queue_num(&self) -> usize;

    /// Get the queue size of virtio device.
    fn queue_size(&self) -> u16;

    /// Get device features from host.
    fn get_device_features(&self, features_select: u32) -> u32;

    /// Get checked driver features before set the value at the page.
    fn checked_driver_features(&mut self, page: u32, value: u32) -> u64 {
        let mut v = value;
        let unsupported_features = value & !self.get_device_features(page);
        if unsupported_features != 0 {
            warn!(
                "Receive acknowlege request with unknown feature: {:x}",
                write_u32(value, page)
            );
            v &= !unsupported_features;
        }
        if page == 0 {
            (u64::from(self.get_driver_features(1)) << 32) | u64::from(v)
        } else {
            (u64::from(v) << 32) | u64::from(self.get_driver_features(0))
        }
    }

    /// Set driver features by guest.
    fn set_driver_features(&mut self, page: u32, value: u32);

    /// Get driver features by guest.
    fn get_driver_features(&self, features_select: u32) -> u32;

    /// Read data of config from guest.
    fn read_config(&self, offset: u64, data: &mut [u8]) -> Result<()>;

    /// Write data to config from guest.
    fn write_config(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Activate the virtio device, this function is called by vcpu thread when frontend
    /// virtio driver is ready and write `DRIVER_OK` to backend.
    ///
    /// # Arguments
    ///
    /// * `mem_space` - System mem.
    /// * `interrupt_cb` - The callback used to send interrupt to guest.
    /// * `queues` - The virtio queues.
    fn activate(
        &mut self,
        mem_space: Arc<AddressSpace>,
        interrupt_cb: Arc<VirtioInterrupt>,
        queues: &[Arc<Mutex<Queue>>],
    ) -> Result<()>;

    /// Handle a queue-notify trap for `queue_index`, synchronously on the
    /// vCPU thread that trapped. Must complete in bounded time; long work
    /// happens on background threads or returns quickly after enqueueing.
    fn notify_queue(&mut self, queue_index: u16) -> Result<()>;

    /// Deactivate virtio device: drop the activation-time resources, so a
    /// later activation starts from a clean slate.
    fn deactivate(&mut self) -> Result<()> {
        bail!(
            "Reset this device is not supported, virtio dev type is {}",
            self.device_type()
        );
    }

    /// Reset virtio device.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}
