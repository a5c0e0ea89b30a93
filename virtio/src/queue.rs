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

use std::cmp::min;
use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use address_space::{AddressSpace, GuestAddress};
use util::byte_code::ByteCode;

use crate::error::VirtioError;
use crate::{virtio_has_feature, VIRTIO_F_RING_EVENT_IDX};

/// Split virtqueue.
pub const QUEUE_TYPE_SPLIT_VRING: u16 = 1;

/// This marks a descriptor as continuing via the next field.
pub const VIRTQ_DESC_F_NEXT: u16 = 0x1;
/// This marks a descriptor as device write-only (otherwise device read-only).
pub const VIRTQ_DESC_F_WRITE: u16 = 0x2;
/// This means the descriptor contains a table of descriptors.
pub const VIRTQ_DESC_F_INDIRECT: u16 = 0x4;

/// The driver does not want interrupts while buffers are consumed.
const VRING_AVAIL_F_NO_INTERRUPT: u16 = 0x1;

/// Max size any virtqueue can declare.
pub const VIRTQUEUE_MAX_SIZE: u16 = 32768;

const DESC_ELEMENT_LEN: u64 = 16;
const AVAILELEM_LEN: u64 = 2;
const USEDELEM_LEN: u64 = 8;
/// flags: u16 and idx: u16 lead both the avail ring and the used ring.
const VRING_FLAGS_AND_IDX_LEN: u64 = 4;
const VRING_IDX_POSITION: u64 = 2;

/// Alignment the rings must satisfy.
const DESC_TABLE_ALIGN: u64 = 16;
const AVAIL_RING_ALIGN: u64 = 2;
const USED_RING_ALIGN: u64 = 4;

/// Configuration of one virtqueue, written by the driver through the
/// transport registers before the queue is armed.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Guest physical address of the descriptor table.
    pub desc_table: GuestAddress,
    /// Guest physical address of the available ring.
    pub avail_ring: GuestAddress,
    /// Guest physical address of the used ring.
    pub used_ring: GuestAddress,
    /// The maximal size in elements offered by the device.
    pub max_size: u16,
    /// The queue size set by the driver.
    pub size: u16,
    /// Whether the queue is armed.
    pub ready: bool,
    /// MSI-X vector for the queue (PCI transport only).
    pub vector: u16,
}

impl ByteCode for QueueConfig {}

impl QueueConfig {
    /// Create a config with the given max size; everything else zero.
    pub fn new(max_size: u16) -> Self {
        QueueConfig {
            desc_table: GuestAddress(0),
            avail_ring: GuestAddress(0),
            used_ring: GuestAddress(0),
            max_size,
            size: 0,
            ready: false,
            vector: 0,
        }
    }

    /// Revert all driver-set fields to zero, keeping `max_size`.
    pub fn reset(&mut self) {
        let max_size = self.max_size;
        *self = QueueConfig::new(max_size);
    }
}

/// One guest buffer segment referenced by a descriptor.
#[derive(Debug, Copy, Clone)]
pub struct ElemIovec {
    pub addr: GuestAddress,
    pub len: u32,
}

/// A descriptor chain popped off the available ring, split into the
/// device-readable and device-writable halves.
#[derive(Debug, Default)]
pub struct Element {
    /// Index of the chain head in the descriptor table.
    pub index: u16,
    /// Number of descriptors in the chain.
    pub desc_num: u16,
    /// Device-readable buffers, in chain order.
    pub out_iovec: Vec<ElemIovec>,
    /// Device-writable buffers, in chain order.
    pub in_iovec: Vec<ElemIovec>,
}

impl Element {
    fn new(index: u16) -> Self {
        Element {
            index,
            desc_num: 0,
            out_iovec: Vec::new(),
            in_iovec: Vec::new(),
        }
    }

    /// Total byte length described by an iovec list.
    pub fn iovec_size(iovec: &[ElemIovec]) -> u64 {
        iovec.iter().map(|iov| u64::from(iov.len)).sum()
    }
}

/// Gather up to `buf.len()` bytes out of device-readable segments.
/// Returns the number of bytes copied.
pub fn iov_to_buf(
    sys_mem: &Arc<AddressSpace>,
    iovec: &[ElemIovec],
    buf: &mut [u8],
) -> Result<usize> {
    let mut copied = 0_usize;
    for iov in iovec {
        if copied == buf.len() {
            break;
        }
        let cnt = min(buf.len() - copied, iov.len as usize);
        let mut slice = &mut buf[copied..copied + cnt];
        sys_mem
            .read(&mut slice, iov.addr, cnt as u64)
            .with_context(|| "Failed to gather iovec into buffer")?;
        copied += cnt;
    }
    Ok(copied)
}

/// Scatter `buf` into device-writable segments, stopping early when the
/// source runs out. Returns the number of bytes written.
pub fn iov_from_buf(
    sys_mem: &Arc<AddressSpace>,
    iovec: &[ElemIovec],
    buf: &[u8],
) -> Result<usize> {
    let mut copied = 0_usize;
    for iov in iovec {
        if copied == buf.len() {
            break;
        }
        let cnt = min(buf.len() - copied, iov.len as usize);
        let mut slice = &buf[copied..copied + cnt];
        sys_mem
            .write(&mut slice, iov.addr, cnt as u64)
            .with_context(|| "Failed to scatter buffer into iovec")?;
        copied += cnt;
    }
    Ok(copied)
}

/// One entry of the descriptor table.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SplitVringDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl ByteCode for SplitVringDesc {}

impl SplitVringDesc {
    /// Read and validate the descriptor at `index` of the table.
    fn new(
        sys_mem: &Arc<AddressSpace>,
        desc_table: GuestAddress,
        queue_size: u16,
        index: u16,
    ) -> Result<Self> {
        if index >= queue_size {
            return Err(anyhow!(VirtioError::QueueIndex(index, queue_size)));
        }
        let desc_addr = desc_table
            .checked_add(u64::from(index) * DESC_ELEMENT_LEN)
            .ok_or_else(|| {
                anyhow!(VirtioError::ReadObjectErr("descriptor", desc_table.raw_value()))
            })?;
        let desc = sys_mem
            .read_object::<SplitVringDesc>(desc_addr)
            .with_context(|| "Failed to read descriptor")?;
        if !desc.is_valid(sys_mem) {
            return Err(anyhow!(VirtioError::QueueDescInvalid));
        }
        Ok(desc)
    }

    fn addr(&self) -> GuestAddress {
        GuestAddress(self.addr)
    }

    fn is_valid(&self, sys_mem: &Arc<AddressSpace>) -> bool {
        sys_mem.address_in_memory(self.addr(), u64::from(self.len))
    }

    fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    fn write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }

    fn is_indirect(&self) -> bool {
        self.flags & VIRTQ_DESC_F_INDIRECT != 0
    }
}

/// One entry of the used ring.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct UsedElem {
    id: u32,
    len: u32,
}

impl ByteCode for UsedElem {}

/// Operations a vring implementation offers the device handler. Only the
/// split layout is implemented; the packed layout is not supported.
pub trait VringOps {
    /// Whether the driver armed the queue.
    fn is_enabled(&self) -> bool;

    /// Whether the armed queue's geometry and ring addresses are usable.
    fn is_valid(&self, sys_mem: &Arc<AddressSpace>) -> bool;

    /// Pop the next available descriptor chain. An element with
    /// `desc_num == 0` means the ring is empty.
    fn pop_avail(&mut self, sys_mem: &Arc<AddressSpace>, features: u64) -> Result<Element>;

    /// Record one used element for chain head `index` with `len` written
    /// bytes, and publish the new used index to the guest.
    fn add_used(&mut self, sys_mem: &Arc<AddressSpace>, index: u16, len: u32) -> Result<()>;

    /// Whether the device should interrupt the driver after the used
    /// entries recorded so far.
    fn should_notify(&mut self, sys_mem: &Arc<AddressSpace>, features: u64) -> bool;

    /// Number of chains the driver has published and the device has not
    /// consumed yet.
    fn avail_ring_len(&self, sys_mem: &Arc<AddressSpace>) -> Result<u16>;

    /// The queue size in effect.
    fn actual_size(&self) -> u16;

    fn get_queue_config(&self) -> QueueConfig;
}

/// The split virtqueue: descriptor table, available ring, used ring, and
/// the host-side cursors into them.
pub struct SplitVring {
    desc_table: GuestAddress,
    avail_ring: GuestAddress,
    used_ring: GuestAddress,
    max_size: u16,
    size: u16,
    ready: bool,
    vector: u16,
    /// Host cursor into the available ring.
    next_avail: Wrapping<u16>,
    /// Host cursor into the used ring, mirrored to guest memory after each
    /// element is written.
    next_used: Wrapping<u16>,
    /// Used index at the time of the last delivered interrupt.
    last_signal_used: Wrapping<u16>,
}

impl SplitVring {
    pub fn new(config: QueueConfig) -> Self {
        SplitVring {
            desc_table: config.desc_table,
            avail_ring: config.avail_ring,
            used_ring: config.used_ring,
            max_size: config.max_size,
            size: config.size,
            ready: config.ready,
            vector: config.vector,
            next_avail: Wrapping(0),
            next_used: Wrapping(0),
            last_signal_used: Wrapping(0),
        }
    }

    fn get_avail_flags_and_idx(&self, sys_mem: &Arc<AddressSpace>) -> Result<(u16, u16)> {
        // flags and idx are adjacent u16s, fetched with one access.
        let word = sys_mem
            .read_object::<u32>(self.avail_ring)
            .with_context(|| "Failed to read avail flags and idx")?;
        Ok((word as u16, (word >> 16) as u16))
    }

    fn get_avail_idx(&self, sys_mem: &Arc<AddressSpace>) -> Result<u16> {
        let (_, idx) = self.get_avail_flags_and_idx(sys_mem)?;
        Ok(idx)
    }

    /// `used_event` lives past the available ring entries.
    fn get_used_event(&self, sys_mem: &Arc<AddressSpace>) -> Result<u16> {
        let addr = self
            .avail_ring
            .unchecked_add(VRING_FLAGS_AND_IDX_LEN + AVAILELEM_LEN * u64::from(self.actual_size()));
        sys_mem
            .read_object::<u16>(addr)
            .with_context(|| "Failed to read used_event")
    }

    /// Mirror the next expected avail index into `avail_event` so an
    /// event-idx driver knows when to kick again.
    fn set_avail_event(&self, sys_mem: &Arc<AddressSpace>) -> Result<()> {
        let addr = self
            .used_ring
            .unchecked_add(VRING_FLAGS_AND_IDX_LEN + USEDELEM_LEN * u64::from(self.actual_size()));
        sys_mem
            .write_object(&self.next_avail.0, addr)
            .with_context(|| "Failed to write avail_event")
    }

    fn get_desc_chain(
        &self,
        sys_mem: &Arc<AddressSpace>,
        head: u16,
    ) -> Result<Element> {
        let mut element = Element::new(head);
        let size = self.actual_size();
        let mut index = head;

        loop {
            // The chain is a linked list in guest memory; the cap below
            // bounds work and breaks guest-constructed cycles.
            if element.desc_num >= size {
                return Err(anyhow!(VirtioError::DescChainOverflow(size)));
            }
            let desc = SplitVringDesc::new(sys_mem, self.desc_table, size, index)?;
            if desc.is_indirect() {
                return Err(anyhow!(VirtioError::DescIndirect));
            }

            let iov = ElemIovec {
                addr: desc.addr(),
                len: desc.len,
            };
            if desc.write_only() {
                element.in_iovec.push(iov);
            } else {
                if !element.in_iovec.is_empty() {
                    return Err(anyhow!(VirtioError::DescOrderInvalid));
                }
                element.out_iovec.push(iov);
            }
            element.desc_num += 1;

            if desc.has_next() {
                index = desc.next;
            } else {
                break;
            }
        }
        Ok(element)
    }
}

impl VringOps for SplitVring {
    fn is_enabled(&self) -> bool {
        self.ready
    }

    fn is_valid(&self, sys_mem: &Arc<AddressSpace>) -> bool {
        let size = u64::from(self.actual_size());
        if !self.ready {
            error!("The queue is not ready");
            return false;
        }
        if self.size == 0 || self.size > self.max_size || self.size & (self.size - 1) != 0 {
            error!(
                "Queue size {} is zero, too big or not a power of 2, max is {}",
                self.size, self.max_size
            );
            return false;
        }
        if self.desc_table.raw_value() == 0
            || self.avail_ring.raw_value() == 0
            || self.used_ring.raw_value() == 0
        {
            error!("Queue ring addresses are not all set");
            return false;
        }
        if !self.desc_table.is_aligned(DESC_TABLE_ALIGN)
            || !self.avail_ring.is_aligned(AVAIL_RING_ALIGN)
            || !self.used_ring.is_aligned(USED_RING_ALIGN)
        {
            error!("Queue ring addresses are not properly aligned");
            return false;
        }
        if !sys_mem.address_in_memory(self.desc_table, DESC_ELEMENT_LEN * size)
            || !sys_mem.address_in_memory(
                self.avail_ring,
                VRING_FLAGS_AND_IDX_LEN + AVAILELEM_LEN * size,
            )
            || !sys_mem.address_in_memory(
                self.used_ring,
                VRING_FLAGS_AND_IDX_LEN + USEDELEM_LEN * size,
            )
        {
            error!("Queue rings are out of guest memory");
            return false;
        }
        true
    }

    fn pop_avail(&mut self, sys_mem: &Arc<AddressSpace>, features: u64) -> Result<Element> {
        if !self.is_enabled() {
            return Err(anyhow!(VirtioError::QueueNotEnabled));
        }
        let avail_idx = self.get_avail_idx(sys_mem)?;
        if self.next_avail.0 == avail_idx {
            return Ok(Element::new(0));
        }
        // Make sure the descriptor data published before idx is visible.
        fence(Ordering::Acquire);

        let index_addr = self.avail_ring.unchecked_add(
            VRING_FLAGS_AND_IDX_LEN
                + AVAILELEM_LEN * u64::from(self.next_avail.0 % self.actual_size()),
        );
        let head: u16 = sys_mem
            .read_object(index_addr)
            .with_context(|| "Failed to read the head of the available chain")?;

        let element = self.get_desc_chain(sys_mem, head)?;
        self.next_avail += Wrapping(1);

        if virtio_has_feature(features, VIRTIO_F_RING_EVENT_IDX) {
            if let Err(e) = self.set_avail_event(sys_mem) {
                warn!("Failed to update avail_event: {:?}", e);
            }
        }
        Ok(element)
    }

    fn add_used(&mut self, sys_mem: &Arc<AddressSpace>, index: u16, len: u32) -> Result<()> {
        let size = self.actual_size();
        if index >= size {
            return Err(anyhow!(VirtioError::QueueIndex(index, size)));
        }

        let elem_addr = self.used_ring.unchecked_add(
            VRING_FLAGS_AND_IDX_LEN + USEDELEM_LEN * u64::from(self.next_used.0 % size),
        );
        let elem = UsedElem {
            id: u32::from(index),
            len,
        };
        sys_mem
            .write_object(&elem, elem_addr)
            .with_context(|| "Failed to write the used element")?;

        self.next_used += Wrapping(1);
        // The element must be visible before the index that publishes it.
        fence(Ordering::Release);
        sys_mem
            .write_object(
                &self.next_used.0,
                self.used_ring.unchecked_add(VRING_IDX_POSITION),
            )
            .with_context(|| "Failed to publish the used index")?;
        Ok(())
    }

    fn should_notify(&mut self, sys_mem: &Arc<AddressSpace>, features: u64) -> bool {
        if virtio_has_feature(features, VIRTIO_F_RING_EVENT_IDX) {
            let used_event = match self.get_used_event(sys_mem) {
                Ok(v) => Wrapping(v),
                Err(e) => {
                    warn!("Failed to read used_event, notifying anyway: {:?}", e);
                    return true;
                }
            };
            let new = self.next_used;
            let old = self.last_signal_used;
            self.last_signal_used = new;
            (new - used_event - Wrapping(1)).0 < (new - old).0
        } else {
            match self.get_avail_flags_and_idx(sys_mem) {
                Ok((flags, _)) => flags & VRING_AVAIL_F_NO_INTERRUPT == 0,
                Err(e) => {
                    warn!("Failed to read avail flags, notifying anyway: {:?}", e);
                    true
                }
            }
        }
    }

    fn avail_ring_len(&self, sys_mem: &Arc<AddressSpace>) -> Result<u16> {
        let avail_idx = Wrapping(self.get_avail_idx(sys_mem)?);
        Ok((avail_idx - self.next_avail).0)
    }

    fn actual_size(&self) -> u16 {
        min(self.size, self.max_size)
    }

    fn get_queue_config(&self) -> QueueConfig {
        QueueConfig {
            desc_table: self.desc_table,
            avail_ring: self.avail_ring,
            used_ring: self.used_ring,
            max_size: self.max_size,
            size: self.size,
            ready: self.ready,
            vector: self.vector,
        }
    }
}

/// A virtqueue a device processes requests from.
pub struct Queue {
    pub vring: Box<dyn VringOps + Send>,
}

impl Queue {
    pub fn new(config: QueueConfig, queue_type: u16) -> Result<Self> {
        match queue_type {
            QUEUE_TYPE_SPLIT_VRING => Ok(Queue {
                vring: Box::new(SplitVring::new(config)),
            }),
            _ => Err(anyhow!("Unsupported queue type {}", queue_type)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.vring.is_enabled()
    }

    pub fn is_valid(&self, sys_mem: &Arc<AddressSpace>) -> bool {
        self.vring.is_valid(sys_mem)
    }
}
