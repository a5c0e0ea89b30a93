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

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use vmm_sys_util::eventfd::EventFd;

use address_space::{AddressSpace, GuestAddress};
use sysbus::{Architecture, SysBus, SysBusDevOps, SysRes};
use util::byte_code::ByteCode;
use util::num_ops::set_u32;

use crate::error::VirtioError;
use crate::{
    cfg_space_offset, Queue, QueueConfig, VirtioDevice, VirtioInterrupt, VirtioInterruptType,
    CONFIG_SPACE_OFFSET, CONFIG_STATUS_ACKNOWLEDGE, CONFIG_STATUS_DRIVER, CONFIG_STATUS_DRIVER_OK,
    CONFIG_STATUS_FAILED, CONFIG_STATUS_FEATURES_OK, QUEUE_TYPE_SPLIT_VRING,
    VIRTIO_MMIO_INT_CONFIG, VIRTIO_MMIO_INT_VRING,
};

/// Magic value: "virt", little endian.
const MAGIC_VALUE: u32 = 0x7472_6976;
/// Modern MMIO transport version.
const MMIO_VERSION: u32 = 2;
const VENDOR_ID: u32 = 0;

/// Upper bound of queues a single transport carries.
pub const MAXIMUM_NR_QUEUES: usize = 8;

// The standardized MMIO register layout (version 2).
const MAGIC_VALUE_REG: u64 = 0x00;
const VERSION_REG: u64 = 0x04;
const DEVICE_ID_REG: u64 = 0x08;
const VENDOR_ID_REG: u64 = 0x0c;
const DEVICE_FEATURES_REG: u64 = 0x10;
const DEVICE_FEATURES_SEL_REG: u64 = 0x14;
const DRIVER_FEATURES_REG: u64 = 0x20;
const DRIVER_FEATURES_SEL_REG: u64 = 0x24;
const QUEUE_SEL_REG: u64 = 0x30;
const QUEUE_NUM_MAX_REG: u64 = 0x34;
const QUEUE_NUM_REG: u64 = 0x38;
const QUEUE_READY_REG: u64 = 0x44;
const QUEUE_NOTIFY_REG: u64 = 0x50;
const INTERRUPT_STATUS_REG: u64 = 0x60;
const INTERRUPT_ACK_REG: u64 = 0x64;
const STATUS_REG: u64 = 0x70;
const QUEUE_DESC_LOW_REG: u64 = 0x80;
const QUEUE_DESC_HIGH_REG: u64 = 0x84;
const QUEUE_AVAIL_LOW_REG: u64 = 0x90;
const QUEUE_AVAIL_HIGH_REG: u64 = 0x94;
const QUEUE_USED_LOW_REG: u64 = 0xa0;
const QUEUE_USED_HIGH_REG: u64 = 0xa4;
const CONFIG_GENERATION_REG: u64 = 0xfc;

/// Snapshot of the transport's register state.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct VirtioMmioState {
    pub arch_tag: u32,
    pub region_base: u64,
    pub region_size: u64,
    pub encoded_irq: u32,
    pub device_activated: bool,
    pub features_select: u32,
    pub acked_features_select: u32,
    pub device_status: u32,
    pub config_generation: u32,
    pub queue_select: u32,
    pub interrupt_status: u32,
    pub queue_type: u16,
    pub queue_num: u16,
    pub queues_config: [QueueConfig; MAXIMUM_NR_QUEUES],
}

impl ByteCode for VirtioMmioState {}

/// The modern virtio MMIO transport: a 512-byte register window bound to
/// one `VirtioDevice`, driving the device-status state machine and queue
/// configuration on behalf of the guest driver.
pub struct VirtioMmioDevice {
    /// The entity of low level device.
    pub device: Arc<Mutex<dyn VirtioDevice>>,
    device_activated: bool,
    mem_space: Arc<AddressSpace>,
    interrupt_evt: Arc<EventFd>,
    interrupt_status: Arc<AtomicU32>,
    interrupt_cb: Option<Arc<VirtioInterrupt>>,
    features_select: u32,
    acked_features_select: u32,
    device_status: u32,
    config_generation: Arc<AtomicU32>,
    queue_select: u32,
    queue_type: u16,
    queues_config: Vec<QueueConfig>,
    queues: Vec<Arc<Mutex<Queue>>>,
    res: SysRes,
}

impl VirtioMmioDevice {
    /// Bind a transport to `device`. Panics if the device declares no
    /// queues or a zero queue size; such a device can never be driven.
    pub fn new(mem_space: Arc<AddressSpace>, device: Arc<Mutex<dyn VirtioDevice>>) -> Self {
        let (queue_num, queue_size) = {
            let locked_device = device.lock().unwrap();
            (locked_device.queue_num(), locked_device.queue_size())
        };
        assert!(queue_num > 0 && queue_num <= MAXIMUM_NR_QUEUES);
        assert!(queue_size > 0);

        VirtioMmioDevice {
            device,
            device_activated: false,
            mem_space,
            interrupt_evt: Arc::new(EventFd::new(libc::EFD_NONBLOCK).unwrap()),
            interrupt_status: Arc::new(AtomicU32::new(0)),
            interrupt_cb: None,
            features_select: 0,
            acked_features_select: 0,
            device_status: 0,
            config_generation: Arc::new(AtomicU32::new(0)),
            queue_select: 0,
            queue_type: QUEUE_TYPE_SPLIT_VRING,
            queues_config: vec![QueueConfig::new(queue_size); queue_num],
            queues: Vec::new(),
            res: SysRes::default(),
        }
    }

    /// Realize the low level device and attach the transport to a slot on
    /// the system bus.
    pub fn realize(mut self, sysbus: &mut SysBus, res: SysRes) -> Result<Arc<Mutex<Self>>> {
        self.device
            .lock()
            .unwrap()
            .realize()
            .with_context(|| "Failed to realize virtio device")?;
        self.res = res;
        self.assign_interrupt_cb();

        let dev = Arc::new(Mutex::new(self));
        sysbus
            .attach_device(dev.clone(), &res)
            .with_context(|| "Failed to attach the virtio mmio transport")?;
        Ok(dev)
    }

    pub fn sys_res(&self) -> SysRes {
        self.res
    }

    fn assign_interrupt_cb(&mut self) {
        let interrupt_status = self.interrupt_status.clone();
        let interrupt_evt = self.interrupt_evt.clone();
        let config_generation = self.config_generation.clone();
        let cb = Arc::new(Box::new(
            move |int_type: &VirtioInterruptType, _queue: Option<&Queue>| {
                let status = match int_type {
                    VirtioInterruptType::Config => {
                        config_generation.fetch_add(1, Ordering::SeqCst);
                        VIRTIO_MMIO_INT_CONFIG
                    }
                    VirtioInterruptType::Vring => VIRTIO_MMIO_INT_VRING,
                };
                interrupt_status.fetch_or(status, Ordering::SeqCst);
                interrupt_evt
                    .write(1)
                    .map_err(|_| anyhow!(VirtioError::EventFdWrite))?;
                Ok(())
            },
        ) as VirtioInterrupt);
        self.interrupt_cb = Some(cb);
    }

    /// `set` bits must all be present in the status and `clr` bits absent.
    fn check_device_status(&self, set: u32, clr: u32) -> bool {
        self.device_status & (set | clr) == set
    }

    fn selected_queue(&self) -> Option<&QueueConfig> {
        self.queues_config.get(self.queue_select as usize)
    }

    fn selected_queue_mut(&mut self) -> Option<&mut QueueConfig> {
        self.queues_config.get_mut(self.queue_select as usize)
    }

    fn activate_device(&mut self) -> Result<()> {
        let mut queues = Vec::with_capacity(self.queues_config.len());
        for config in self.queues_config.iter() {
            let queue = Queue::new(*config, self.queue_type)?;
            if config.ready && !queue.is_valid(&self.mem_space) {
                bail!("Failed to activate device: invalid ring layout");
            }
            queues.push(Arc::new(Mutex::new(queue)));
        }
        self.queues = queues;

        let cb = self
            .interrupt_cb
            .clone()
            .ok_or_else(|| anyhow!("Interrupt callback is not assigned"))?;
        self.device
            .lock()
            .unwrap()
            .activate(self.mem_space.clone(), cb, &self.queues)
    }

    fn update_driver_status(&mut self, value: u32) -> bool {
        if value == 0 {
            if let Err(e) = self.do_reset() {
                error!("Failed to reset device on status write: {:?}", e);
                return false;
            }
            return true;
        }

        if value & CONFIG_STATUS_FEATURES_OK != 0 && value & CONFIG_STATUS_DRIVER == 0 {
            warn!("Driver wrote FEATURES_OK before DRIVER: 0x{:x}", value);
        }
        self.device_status = value;

        if !self.device_activated
            && self.check_device_status(
                CONFIG_STATUS_ACKNOWLEDGE
                    | CONFIG_STATUS_DRIVER
                    | CONFIG_STATUS_FEATURES_OK
                    | CONFIG_STATUS_DRIVER_OK,
                CONFIG_STATUS_FAILED,
            )
        {
            match self.activate_device() {
                Ok(()) => self.device_activated = true,
                Err(e) => {
                    error!("Failed to activate virtio device: {:?}", e);
                    return false;
                }
            }
        }
        true
    }

    /// Reset everything the driver ever wrote; only `max_size` survives in
    /// each queue config.
    fn do_reset(&mut self) -> Result<()> {
        self.features_select = 0;
        self.acked_features_select = 0;
        self.queue_select = 0;
        self.device_status = 0;
        self.interrupt_status.store(0, Ordering::SeqCst);
        for config in self.queues_config.iter_mut() {
            config.reset();
        }
        self.queues.clear();

        if self.device_activated {
            self.device_activated = false;
            let mut locked_dev = self.device.lock().unwrap();
            locked_dev
                .deactivate()
                .with_context(|| "Failed to deactivate device on reset")?;
            locked_dev
                .reset()
                .with_context(|| "Failed to reset device")?;
        }
        Ok(())
    }

    fn read_common_reg(&self, offset: u64) -> Result<u32> {
        let value = match offset {
            MAGIC_VALUE_REG => MAGIC_VALUE,
            VERSION_REG => MMIO_VERSION,
            DEVICE_ID_REG => self.device.lock().unwrap().device_type(),
            VENDOR_ID_REG => VENDOR_ID,
            DEVICE_FEATURES_REG => self
                .device
                .lock()
                .unwrap()
                .get_device_features(self.features_select),
            QUEUE_NUM_MAX_REG => self
                .selected_queue()
                .map_or(0, |config| u32::from(config.max_size)),
            QUEUE_READY_REG => self.selected_queue().map_or(0, |config| config.ready as u32),
            INTERRUPT_STATUS_REG => self.interrupt_status.load(Ordering::SeqCst),
            STATUS_REG => self.device_status,
            CONFIG_GENERATION_REG => self.config_generation.load(Ordering::SeqCst),
            _ => {
                // Unmapped registers read as zero.
                warn!("Read of unknown virtio mmio register 0x{:x}", offset);
                0
            }
        };
        Ok(value)
    }

    fn write_common_reg(&mut self, offset: u64, value: u32) -> Result<()> {
        match offset {
            DEVICE_FEATURES_SEL_REG => self.features_select = value,
            DRIVER_FEATURES_REG => {
                if self.check_device_status(
                    CONFIG_STATUS_ACKNOWLEDGE | CONFIG_STATUS_DRIVER,
                    CONFIG_STATUS_FEATURES_OK | CONFIG_STATUS_FAILED,
                ) {
                    let page = self.acked_features_select;
                    self.device
                        .lock()
                        .unwrap()
                        .set_driver_features(page, value);
                } else {
                    return Err(anyhow!(VirtioError::DevStatErr(self.device_status)));
                }
            }
            DRIVER_FEATURES_SEL_REG => self.acked_features_select = value,
            QUEUE_SEL_REG => self.queue_select = value,
            QUEUE_NUM_REG => {
                let max = self.selected_queue().map_or(0, |c| c.max_size);
                let size = value as u16;
                if size == 0 || size > max || size & (size - 1) != 0 {
                    return Err(anyhow!(VirtioError::QueueIndex(size, max)));
                }
                if let Some(config) = self.selected_queue_mut() {
                    config.size = size;
                }
            }
            QUEUE_READY_REG => match value {
                0 => {
                    if let Some(config) = self.selected_queue_mut() {
                        config.ready = false;
                    }
                }
                1 => {
                    let size = self.selected_queue().map_or(0, |c| c.size);
                    if size == 0 {
                        return Err(anyhow!(VirtioError::QueueNotEnabled));
                    }
                    if let Some(config) = self.selected_queue_mut() {
                        config.ready = true;
                    }
                }
                _ => {
                    warn!("Invalid QueueReady write: {}", value);
                }
            },
            QUEUE_NOTIFY_REG => {
                if !self.check_device_status(CONFIG_STATUS_DRIVER_OK, 0) {
                    return Err(anyhow!(VirtioError::DevStatErr(self.device_status)));
                }
                self.device
                    .lock()
                    .unwrap()
                    .notify_queue(value as u16)
                    .with_context(|| "Failed to handle queue notify")?;
            }
            INTERRUPT_ACK_REG => {
                self.interrupt_status.fetch_and(!value, Ordering::SeqCst);
            }
            STATUS_REG => {
                if !self.update_driver_status(value) {
                    return Err(anyhow!(VirtioError::DevStatErr(value)));
                }
            }
            QUEUE_DESC_LOW_REG | QUEUE_DESC_HIGH_REG | QUEUE_AVAIL_LOW_REG
            | QUEUE_AVAIL_HIGH_REG | QUEUE_USED_LOW_REG | QUEUE_USED_HIGH_REG => {
                if !self.check_device_status(
                    CONFIG_STATUS_ACKNOWLEDGE | CONFIG_STATUS_DRIVER,
                    CONFIG_STATUS_DRIVER_OK | CONFIG_STATUS_FAILED,
                ) {
                    return Err(anyhow!(VirtioError::DevStatErr(self.device_status)));
                }
                let page = u32::from(offset & 0x4 != 0);
                if let Some(config) = self.selected_queue_mut() {
                    match offset {
                        QUEUE_DESC_LOW_REG | QUEUE_DESC_HIGH_REG => {
                            config.desc_table =
                                GuestAddress(set_u32(config.desc_table.raw_value(), value, page));
                        }
                        QUEUE_AVAIL_LOW_REG | QUEUE_AVAIL_HIGH_REG => {
                            config.avail_ring =
                                GuestAddress(set_u32(config.avail_ring.raw_value(), value, page));
                        }
                        _ => {
                            config.used_ring =
                                GuestAddress(set_u32(config.used_ring.raw_value(), value, page));
                        }
                    }
                }
            }
            _ => {
                // Writes to unmapped registers are dropped.
                warn!("Write of unknown virtio mmio register 0x{:x}", offset);
            }
        }
        Ok(())
    }

    /// Capture the transport state for a snapshot.
    pub fn state(&self, arch: Architecture) -> VirtioMmioState {
        let mut state = VirtioMmioState {
            arch_tag: match arch {
                Architecture::X86_64 => 0,
                Architecture::AArch64 => 1,
            },
            region_base: self.res.region_base,
            region_size: self.res.region_size,
            encoded_irq: sysbus::encode_irq(arch, self.res.irq),
            device_activated: self.device_activated,
            features_select: self.features_select,
            acked_features_select: self.acked_features_select,
            device_status: self.device_status,
            config_generation: self.config_generation.load(Ordering::SeqCst),
            queue_select: self.queue_select,
            interrupt_status: self.interrupt_status.load(Ordering::SeqCst),
            queue_type: self.queue_type,
            queue_num: self.queues_config.len() as u16,
            queues_config: Default::default(),
        };
        for (i, config) in self.queues_config.iter().enumerate() {
            state.queues_config[i] = *config;
        }
        state
    }

    /// Rebind the transport to the saved base, size and register state.
    /// Queue state is re-established by the guest via the init handshake.
    pub fn set_state(&mut self, state: &VirtioMmioState) {
        self.res.region_base = state.region_base;
        self.res.region_size = state.region_size;
        self.device_activated = false;
        self.features_select = state.features_select;
        self.acked_features_select = state.acked_features_select;
        self.device_status = state.device_status;
        self.config_generation
            .store(state.config_generation, Ordering::SeqCst);
        self.queue_select = state.queue_select;
        self.interrupt_status
            .store(state.interrupt_status, Ordering::SeqCst);
        self.queue_type = state.queue_type;
        let num = std::cmp::min(state.queue_num as usize, self.queues_config.len());
        self.queues_config[..num].copy_from_slice(&state.queues_config[..num]);
    }
}

impl SysBusDevOps for VirtioMmioDevice {
    fn read(&mut self, data: &mut [u8], _base: GuestAddress, offset: u64) -> bool {
        if offset < CONFIG_SPACE_OFFSET {
            if data.len() != 4 {
                warn!(
                    "Invalid virtio mmio read: offset 0x{:x}, len {}",
                    offset,
                    data.len()
                );
                return false;
            }
            match self.read_common_reg(offset) {
                Ok(v) => {
                    LittleEndian::write_u32(data, v);
                    true
                }
                Err(e) => {
                    error!("Failed to read mmio register 0x{:x}: {:?}", offset, e);
                    false
                }
            }
        } else {
            match self
                .device
                .lock()
                .unwrap()
                .read_config(cfg_space_offset(offset), data)
            {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to read virtio config at 0x{:x}: {:?}", offset, e);
                    false
                }
            }
        }
    }

    fn write(&mut self, data: &[u8], _base: GuestAddress, offset: u64) -> bool {
        if offset < CONFIG_SPACE_OFFSET {
            if data.len() != 4 {
                warn!(
                    "Invalid virtio mmio write: offset 0x{:x}, len {}",
                    offset,
                    data.len()
                );
                return false;
            }
            let value = LittleEndian::read_u32(data);
            match self.write_common_reg(offset, value) {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to write mmio register 0x{:x}: {:?}", offset, e);
                    false
                }
            }
        } else {
            match self
                .device
                .lock()
                .unwrap()
                .write_config(cfg_space_offset(offset), data)
            {
                Ok(()) => true,
                Err(e) => {
                    error!("Failed to write virtio config at 0x{:x}: {:?}", offset, e);
                    false
                }
            }
        }
    }

    fn interrupt_evt(&self) -> Option<&EventFd> {
        Some(self.interrupt_evt.as_ref())
    }

    fn get_sys_resource(&mut self) -> Option<&mut SysRes> {
        Some(&mut self.res)
    }

    fn reset(&mut self) -> Result<()> {
        self.do_reset()
    }
}
