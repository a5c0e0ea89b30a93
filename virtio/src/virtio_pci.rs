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

//! The PCI flavour of the virtio transport. The device-facing contract is
//! the same as the MMIO transport; the guest-facing surface is the modern
//! capability layout: a common config structure, a notify region, an ISR
//! byte and the device config region, each living in a BAR. Interrupts are
//! delivered through a host-provided MSI-X signal; there is deliberately no
//! INTx fallback path wired here.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};

use address_space::{AddressSpace, GuestAddress};
use util::byte_code::ByteCode;
use util::num_ops::set_u32;

use crate::error::VirtioError;
use crate::{
    Queue, QueueConfig, VirtioDevice, VirtioInterrupt, VirtioInterruptType,
    CONFIG_STATUS_ACKNOWLEDGE, CONFIG_STATUS_DRIVER, CONFIG_STATUS_DRIVER_OK,
    CONFIG_STATUS_FAILED, CONFIG_STATUS_FEATURES_OK, QUEUE_TYPE_SPLIT_VRING,
    VIRTIO_MMIO_INT_CONFIG, VIRTIO_MMIO_INT_VRING,
};

/// Capability type: the common configuration structure.
pub const VIRTIO_PCI_CAP_COMMON_CFG: u8 = 1;
/// Capability type: the notification region.
pub const VIRTIO_PCI_CAP_NOTIFY_CFG: u8 = 2;
/// Capability type: the ISR status byte.
pub const VIRTIO_PCI_CAP_ISR_CFG: u8 = 3;
/// Capability type: the device-specific configuration.
pub const VIRTIO_PCI_CAP_DEVICE_CFG: u8 = 4;

const PCI_CAP_ID_VNDR: u8 = 0x09;
/// Queue notify addresses are `notify_off * multiplier` into the region.
pub const NOTIFY_OFF_MULTIPLIER: u32 = 4;

/// No MSI-X vector assigned.
pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xffff;

// Register layout of the common configuration structure.
const COMMON_DFSELECT_REG: u64 = 0x00;
const COMMON_DF_REG: u64 = 0x04;
const COMMON_GFSELECT_REG: u64 = 0x08;
const COMMON_GF_REG: u64 = 0x0c;
const COMMON_MSIX_REG: u64 = 0x10;
const COMMON_NUMQ_REG: u64 = 0x12;
const COMMON_STATUS_REG: u64 = 0x14;
const COMMON_CFGGENERATION_REG: u64 = 0x15;
const COMMON_Q_SELECT_REG: u64 = 0x16;
const COMMON_Q_SIZE_REG: u64 = 0x18;
const COMMON_Q_MSIX_REG: u64 = 0x1a;
const COMMON_Q_ENABLE_REG: u64 = 0x1c;
const COMMON_Q_NOFF_REG: u64 = 0x1e;
const COMMON_Q_DESCLO_REG: u64 = 0x20;
const COMMON_Q_DESCHI_REG: u64 = 0x24;
const COMMON_Q_AVAILLO_REG: u64 = 0x28;
const COMMON_Q_AVAILHI_REG: u64 = 0x2c;
const COMMON_Q_USEDLO_REG: u64 = 0x30;
const COMMON_Q_USEDHI_REG: u64 = 0x34;

/// A vendor-specific PCI capability locating one virtio structure.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct VirtioPciCap {
    pub cap_vndr: u8,
    pub cap_next: u8,
    pub cap_len: u8,
    pub cfg_type: u8,
    pub bar: u8,
    padding: [u8; 3],
    pub offset: u32,
    pub length: u32,
}

impl ByteCode for VirtioPciCap {}

impl VirtioPciCap {
    pub fn new(cfg_type: u8, bar: u8, offset: u32, length: u32) -> Self {
        VirtioPciCap {
            cap_vndr: PCI_CAP_ID_VNDR,
            cap_next: 0,
            cap_len: std::mem::size_of::<VirtioPciCap>() as u8,
            cfg_type,
            bar,
            padding: [0; 3],
            offset,
            length,
        }
    }
}

/// The notify capability carries the notify-offset multiplier on top.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct VirtioPciNotifyCap {
    pub cap: VirtioPciCap,
    pub notify_off_multiplier: u32,
}

impl ByteCode for VirtioPciNotifyCap {}

/// The common configuration registers shared by every modern virtio PCI
/// device. Device-facing semantics match the MMIO transport register for
/// register; only the guest-facing layout differs.
pub struct VirtioPciCommonConfig {
    features_select: u32,
    acked_features_select: u32,
    msix_config: u16,
    device_status: u32,
    config_generation: u32,
    queue_select: u16,
    queues_config: Vec<QueueConfig>,
}

impl VirtioPciCommonConfig {
    pub fn new(queue_num: usize, queue_size: u16) -> Self {
        VirtioPciCommonConfig {
            features_select: 0,
            acked_features_select: 0,
            msix_config: VIRTIO_MSI_NO_VECTOR,
            device_status: 0,
            config_generation: 0,
            queue_select: 0,
            queues_config: vec![QueueConfig::new(queue_size); queue_num],
        }
    }

    fn check_device_status(&self, set: u32, clr: u32) -> bool {
        self.device_status & (set | clr) == set
    }

    fn selected_queue(&self) -> Option<&QueueConfig> {
        self.queues_config.get(self.queue_select as usize)
    }

    fn selected_queue_mut(&mut self) -> Option<&mut QueueConfig> {
        self.queues_config.get_mut(self.queue_select as usize)
    }

    pub fn reset(&mut self) {
        self.features_select = 0;
        self.acked_features_select = 0;
        self.msix_config = VIRTIO_MSI_NO_VECTOR;
        self.device_status = 0;
        self.queue_select = 0;
        for config in self.queues_config.iter_mut() {
            config.reset();
            config.vector = VIRTIO_MSI_NO_VECTOR;
        }
    }

    pub fn read_common_config(
        &self,
        device: &Arc<Mutex<dyn VirtioDevice>>,
        offset: u64,
    ) -> Result<u32> {
        let value = match offset {
            COMMON_DFSELECT_REG => self.features_select,
            COMMON_DF_REG => device
                .lock()
                .unwrap()
                .get_device_features(self.features_select),
            COMMON_GFSELECT_REG => self.acked_features_select,
            COMMON_GF_REG => device
                .lock()
                .unwrap()
                .get_driver_features(self.acked_features_select),
            COMMON_MSIX_REG => u32::from(self.msix_config),
            COMMON_NUMQ_REG => self.queues_config.len() as u32,
            COMMON_STATUS_REG => self.device_status,
            COMMON_CFGGENERATION_REG => self.config_generation,
            COMMON_Q_SELECT_REG => u32::from(self.queue_select),
            COMMON_Q_SIZE_REG => self
                .selected_queue()
                .map_or(0, |config| u32::from(config.size)),
            COMMON_Q_MSIX_REG => self
                .selected_queue()
                .map_or(u32::from(VIRTIO_MSI_NO_VECTOR), |config| {
                    u32::from(config.vector)
                }),
            COMMON_Q_ENABLE_REG => self.selected_queue().map_or(0, |config| config.ready as u32),
            COMMON_Q_NOFF_REG => u32::from(self.queue_select),
            COMMON_Q_DESCLO_REG => self
                .selected_queue()
                .map_or(0, |config| config.desc_table.raw_value() as u32),
            COMMON_Q_DESCHI_REG => self
                .selected_queue()
                .map_or(0, |config| (config.desc_table.raw_value() >> 32) as u32),
            COMMON_Q_AVAILLO_REG => self
                .selected_queue()
                .map_or(0, |config| config.avail_ring.raw_value() as u32),
            COMMON_Q_AVAILHI_REG => self
                .selected_queue()
                .map_or(0, |config| (config.avail_ring.raw_value() >> 32) as u32),
            COMMON_Q_USEDLO_REG => self
                .selected_queue()
                .map_or(0, |config| config.used_ring.raw_value() as u32),
            COMMON_Q_USEDHI_REG => self
                .selected_queue()
                .map_or(0, |config| (config.used_ring.raw_value() >> 32) as u32),
            _ => return Err(anyhow!(VirtioError::MmioRegErr(offset))),
        };
        Ok(value)
    }

    pub fn write_common_config(
        &mut self,
        device: &Arc<Mutex<dyn VirtioDevice>>,
        offset: u64,
        value: u32,
    ) -> Result<()> {
        match offset {
            COMMON_DFSELECT_REG => self.features_select = value,
            COMMON_GFSELECT_REG => self.acked_features_select = value,
            COMMON_GF_REG => {
                if self.check_device_status(
                    CONFIG_STATUS_ACKNOWLEDGE | CONFIG_STATUS_DRIVER,
                    CONFIG_STATUS_FEATURES_OK | CONFIG_STATUS_FAILED,
                ) {
                    let page = self.acked_features_select;
                    device.lock().unwrap().set_driver_features(page, value);
                } else {
                    return Err(anyhow!(VirtioError::DevStatErr(self.device_status)));
                }
            }
            COMMON_MSIX_REG => self.msix_config = value as u16,
            COMMON_STATUS_REG => self.device_status = value,
            COMMON_Q_SELECT_REG => self.queue_select = value as u16,
            COMMON_Q_SIZE_REG => {
                let max = self.selected_queue().map_or(0, |c| c.max_size);
                let size = value as u16;
                if size == 0 || size > max || size & (size - 1) != 0 {
                    return Err(anyhow!(VirtioError::QueueIndex(size, max)));
                }
                if let Some(config) = self.selected_queue_mut() {
                    config.size = size;
                }
            }
            COMMON_Q_MSIX_REG => {
                if let Some(config) = self.selected_queue_mut() {
                    config.vector = value as u16;
                }
            }
            COMMON_Q_ENABLE_REG => {
                if value == 1 {
                    let size = self.selected_queue().map_or(0, |c| c.size);
                    if size == 0 {
                        return Err(anyhow!(VirtioError::QueueNotEnabled));
                    }
                    if let Some(config) = self.selected_queue_mut() {
                        config.ready = true;
                    }
                } else if let Some(config) = self.selected_queue_mut() {
                    config.ready = false;
                }
            }
            COMMON_Q_DESCLO_REG | COMMON_Q_DESCHI_REG | COMMON_Q_AVAILLO_REG
            | COMMON_Q_AVAILHI_REG | COMMON_Q_USEDLO_REG | COMMON_Q_USEDHI_REG => {
                let page = u32::from(offset & 0x4 != 0);
                if let Some(config) = self.selected_queue_mut() {
                    match offset {
                        COMMON_Q_DESCLO_REG | COMMON_Q_DESCHI_REG => {
                            config.desc_table =
                                GuestAddress(set_u32(config.desc_table.raw_value(), value, page));
                        }
                        COMMON_Q_AVAILLO_REG | COMMON_Q_AVAILHI_REG => {
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
            _ => return Err(anyhow!(VirtioError::MmioRegErr(offset))),
        }
        Ok(())
    }
}

/// The modern virtio PCI transport. The host bridge routes BAR accesses to
/// the structure handlers below; MSI-X delivery happens through the signal
/// closure the machine provides.
pub struct VirtioPciDevice {
    pub device: Arc<Mutex<dyn VirtioDevice>>,
    device_activated: bool,
    mem_space: Arc<AddressSpace>,
    common_config: VirtioPciCommonConfig,
    interrupt_status: Arc<AtomicU32>,
    msix_signal: Arc<dyn Fn(u16) -> Result<()> + Send + Sync>,
    interrupt_cb: Option<Arc<VirtioInterrupt>>,
    queues: Vec<Arc<Mutex<Queue>>>,
}

impl VirtioPciDevice {
    pub fn new(
        mem_space: Arc<AddressSpace>,
        device: Arc<Mutex<dyn VirtioDevice>>,
        msix_signal: Arc<dyn Fn(u16) -> Result<()> + Send + Sync>,
    ) -> Self {
        let (queue_num, queue_size) = {
            let locked_device = device.lock().unwrap();
            (locked_device.queue_num(), locked_device.queue_size())
        };
        assert!(queue_num > 0);
        assert!(queue_size > 0);

        VirtioPciDevice {
            device,
            device_activated: false,
            mem_space,
            common_config: VirtioPciCommonConfig::new(queue_num, queue_size),
            interrupt_status: Arc::new(AtomicU32::new(0)),
            msix_signal,
            interrupt_cb: None,
            queues: Vec::new(),
        }
    }

    /// The capability chain to splice into PCI configuration space; the
    /// caller assigns `cap_next` links when placing them.
    pub fn build_capabilities(&self, bar: u8) -> (Vec<VirtioPciCap>, VirtioPciNotifyCap) {
        let common = VirtioPciCap::new(VIRTIO_PCI_CAP_COMMON_CFG, bar, 0x0, 0x38);
        let isr = VirtioPciCap::new(VIRTIO_PCI_CAP_ISR_CFG, bar, 0x1000, 0x1);
        let device_cfg = VirtioPciCap::new(VIRTIO_PCI_CAP_DEVICE_CFG, bar, 0x2000, 0x1000);
        let notify = VirtioPciNotifyCap {
            cap: VirtioPciCap::new(
                VIRTIO_PCI_CAP_NOTIFY_CFG,
                bar,
                0x3000,
                NOTIFY_OFF_MULTIPLIER * self.common_config.queues_config.len() as u32,
            ),
            notify_off_multiplier: NOTIFY_OFF_MULTIPLIER,
        };
        (vec![common, isr, device_cfg], notify)
    }

    fn assign_interrupt_cb(&mut self) {
        let interrupt_status = self.interrupt_status.clone();
        let msix_signal = self.msix_signal.clone();
        let msix_config = self.common_config.msix_config;
        let queue_vectors: Vec<u16> = self
            .common_config
            .queues_config
            .iter()
            .map(|config| config.vector)
            .collect();
        let cb = Arc::new(Box::new(
            move |int_type: &VirtioInterruptType, queue: Option<&Queue>| {
                let (status, vector) = match int_type {
                    VirtioInterruptType::Config => (VIRTIO_MMIO_INT_CONFIG, msix_config),
                    VirtioInterruptType::Vring => {
                        let vector = queue
                            .map(|q| q.vring.get_queue_config().vector)
                            .unwrap_or_else(|| queue_vectors.first().copied().unwrap_or(0));
                        (VIRTIO_MMIO_INT_VRING, vector)
                    }
                };
                interrupt_status.fetch_or(status, Ordering::SeqCst);
                if vector != VIRTIO_MSI_NO_VECTOR {
                    msix_signal(vector)?;
                }
                Ok(())
            },
        ) as VirtioInterrupt);
        self.interrupt_cb = Some(cb);
    }

    fn activate_device(&mut self) -> Result<()> {
        self.assign_interrupt_cb();

        let mut queues = Vec::with_capacity(self.common_config.queues_config.len());
        for config in self.common_config.queues_config.iter() {
            let queue = Queue::new(*config, QUEUE_TYPE_SPLIT_VRING)?;
            if config.ready && !queue.is_valid(&self.mem_space) {
                bail!("Failed to activate pci device: invalid ring layout");
            }
            queues.push(Arc::new(Mutex::new(queue)));
        }
        self.queues = queues;

        let cb = self.interrupt_cb.clone().unwrap();
        self.device
            .lock()
            .unwrap()
            .activate(self.mem_space.clone(), cb, &self.queues)
    }

    fn do_reset(&mut self) -> Result<()> {
        self.common_config.reset();
        self.interrupt_status.store(0, Ordering::SeqCst);
        self.queues.clear();
        if self.device_activated {
            self.device_activated = false;
            let mut locked_dev = self.device.lock().unwrap();
            locked_dev.deactivate()?;
            locked_dev.reset()?;
        }
        Ok(())
    }

    /// Handler for the common configuration structure.
    pub fn common_config_read(&self, offset: u64) -> Result<u32> {
        self.common_config.read_common_config(&self.device, offset)
    }

    /// Handler for the common configuration structure. Status transitions
    /// drive activation and reset exactly as on the MMIO transport.
    pub fn common_config_write(&mut self, offset: u64, value: u32) -> Result<()> {
        if offset == COMMON_STATUS_REG && value == 0 {
            return self.do_reset();
        }
        self.common_config
            .write_common_config(&self.device, offset, value)?;

        if offset == COMMON_STATUS_REG
            && !self.device_activated
            && self.common_config.check_device_status(
                CONFIG_STATUS_ACKNOWLEDGE
                    | CONFIG_STATUS_DRIVER
                    | CONFIG_STATUS_FEATURES_OK
                    | CONFIG_STATUS_DRIVER_OK,
                CONFIG_STATUS_FAILED,
            )
        {
            self.activate_device()
                .with_context(|| "Failed to activate pci virtio device")?;
            self.device_activated = true;
        }
        Ok(())
    }

    /// Handler for the notify region: the write offset selects the queue.
    pub fn notify_write(&mut self, offset: u64) -> Result<()> {
        if !self
            .common_config
            .check_device_status(CONFIG_STATUS_DRIVER_OK, 0)
        {
            return Err(anyhow!(VirtioError::DevStatErr(
                self.common_config.device_status
            )));
        }
        let queue_index = (offset / u64::from(NOTIFY_OFF_MULTIPLIER)) as u16;
        self.device.lock().unwrap().notify_queue(queue_index)
    }

    /// Handler for the ISR status byte; reading clears it.
    pub fn isr_read(&mut self) -> u32 {
        self.interrupt_status.swap(0, Ordering::SeqCst)
    }

    /// Handler for the device configuration region.
    pub fn device_config_read(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        self.device.lock().unwrap().read_config(offset, data)
    }

    /// Handler for the device configuration region.
    pub fn device_config_write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.device.lock().unwrap().write_config(offset, data)
    }
}
