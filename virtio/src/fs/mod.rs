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

//! # Virtio-fs
//!
//! FUSE-protocol filesystem device: a high-priority queue and a request
//! queue carry framed FUSE requests against a pluggable backend. Blocking
//! locks are taken off the ring and their replies deferred until a later
//! request releases the conflicting lock.

pub mod fuse_msg;
pub mod fuse_req;

mod buffer;
mod fs_ops;
#[cfg(test)]
mod test_backend;

pub use self::buffer::BufferPool;
pub use self::fs_ops::{DirEntry, FileSystemOps, FsInitInfo, FsResult, SetattrValues};

use std::cmp::min;
use std::mem::size_of;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};

use address_space::AddressSpace;
use machine_manager::config::{ConfigCheck, FsDeviceConfig, MAX_TAG_LENGTH};
use util::byte_code::ByteCode;
use util::num_ops::read_u32;

use crate::error::VirtioError;
use crate::{
    cfg_space_offset, iov_from_buf, iov_to_buf, ElemIovec, Element, Queue, VirtioDevice,
    VirtioInterrupt, VirtioInterruptType, VIRTIO_F_VERSION_1, VIRTIO_TYPE_FS,
};
use self::fuse_msg::{FuseInHeader, FUSE_FORGET};
use self::fuse_req::{do_fuse_request, FuseReqResult};

/// High-priority queue plus one request queue.
const QUEUE_NUM_FS: usize = 2;
const QUEUE_SIZE_FS: u16 = 128;

/// Virtio-fs config space: the mount tag and the request queue count.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct VirtioFsConfig {
    tag: [u8; MAX_TAG_LENGTH],
    num_request_queues: u32,
}

impl Default for VirtioFsConfig {
    fn default() -> Self {
        VirtioFsConfig {
            tag: [0; MAX_TAG_LENGTH],
            num_request_queues: 0,
        }
    }
}

impl ByteCode for VirtioFsConfig {}

/// State of the fs device for a snapshot; the tag travels inside the
/// config image.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct VirtioFsState {
    pub device_features: u64,
    pub driver_features: u64,
    pub config: VirtioFsConfig,
}

impl ByteCode for VirtioFsState {}

/// A blocking-lock request taken off the ring: the cached request bytes
/// and the response descriptors its reply will eventually fill.
struct DeferredReq {
    queue_index: u16,
    index: u16,
    req: Vec<u8>,
    in_iovec: Vec<ElemIovec>,
}

/// The virtio-fs device.
pub struct VirtioFs {
    fs_cfg: FsDeviceConfig,
    config: VirtioFsConfig,
    backend: Arc<Mutex<dyn FileSystemOps>>,
    device_features: u64,
    driver_features: u64,
    mem_space: Option<Arc<AddressSpace>>,
    interrupt_cb: Option<Arc<VirtioInterrupt>>,
    queues: Vec<Arc<Mutex<Queue>>>,
    deferred: Vec<DeferredReq>,
    pool: BufferPool,
}

impl VirtioFs {
    pub fn new(fs_cfg: FsDeviceConfig, backend: Arc<Mutex<dyn FileSystemOps>>) -> Self {
        VirtioFs {
            fs_cfg,
            config: VirtioFsConfig::default(),
            backend,
            device_features: 0,
            driver_features: 0,
            mem_space: None,
            interrupt_cb: None,
            queues: Vec::new(),
            deferred: Vec::new(),
            pool: BufferPool::new(),
        }
    }

    pub fn state(&self) -> VirtioFsState {
        VirtioFsState {
            device_features: self.device_features,
            driver_features: self.driver_features,
            config: self.config,
        }
    }

    pub fn set_state(&mut self, state: &VirtioFsState) {
        self.device_features = state.device_features;
        self.driver_features = state.driver_features;
        self.config = state.config;
    }

    fn process_queue(&mut self, queue_index: u16) -> Result<()> {
        let queue = self
            .queues
            .get(queue_index as usize)
            .cloned()
            .ok_or_else(|| anyhow!(VirtioError::QueueIndex(queue_index, QUEUE_NUM_FS as u16)))?;
        let mem_space = self
            .mem_space
            .clone()
            .ok_or_else(|| anyhow!(VirtioError::DeviceNotActivated("virtio-fs".to_string())))?;

        let mut queue_lock = queue.lock().unwrap();
        if !queue_lock.is_enabled() {
            return Ok(());
        }

        // Deferred replies get a chance before and after every head, so a
        // lock released by any request completes its waiters promptly.
        let mut used_count = self.retry_deferred(&mem_space, &mut queue_lock, queue_index)?;
        loop {
            let elem = queue_lock
                .vring
                .pop_avail(&mem_space, self.driver_features)?;
            if elem.desc_num == 0 {
                break;
            }
            match self.handle_request(&mem_space, &mut queue_lock, queue_index, &elem) {
                Ok(true) => {
                    used_count += 1;
                    used_count += self.retry_deferred(&mem_space, &mut queue_lock, queue_index)?;
                }
                Ok(false) => {}
                Err(e) => {
                    // Abandoned: no used entry for this head, the queue
                    // keeps flowing.
                    error!("Abandoned malformed fs request: {:?}", e);
                }
            }
        }

        if used_count > 0
            && queue_lock
                .vring
                .should_notify(&mem_space, self.driver_features)
        {
            if let Some(cb) = &self.interrupt_cb {
                cb(&VirtioInterruptType::Vring, Some(&queue_lock))
                    .with_context(|| VirtioError::InterruptTrigger("virtio-fs"))?;
            }
        }
        Ok(())
    }

    /// Returns whether a used entry was recorded; `Ok(false)` means the
    /// reply was deferred.
    fn handle_request(
        &mut self,
        mem_space: &Arc<AddressSpace>,
        queue: &mut Queue,
        queue_index: u16,
        elem: &Element,
    ) -> Result<bool> {
        let req_len = Element::iovec_size(&elem.out_iovec) as usize;
        let resp_len = Element::iovec_size(&elem.in_iovec) as usize;
        if req_len < size_of::<FuseInHeader>() {
            return Err(anyhow!(VirtioError::RequestMalformed(
                "fuse request shorter than the input header"
            )));
        }

        let mut req_buf = self.pool.borrow_buf(req_len);
        if let Err(e) = iov_to_buf(mem_space, &elem.out_iovec, &mut req_buf) {
            self.pool.return_buf(req_buf);
            return Err(e);
        }

        let opcode = FuseInHeader::from_bytes(&req_buf)
            .map(|header| header.opcode)
            .unwrap_or(0);
        if resp_len == 0 && opcode != FUSE_FORGET {
            self.pool.return_buf(req_buf);
            return Err(anyhow!(VirtioError::RequestMalformed(
                "empty fuse response chain"
            )));
        }

        let mut resp_buf = self.pool.borrow_buf(resp_len);
        let result = do_fuse_request(&mut *self.backend.lock().unwrap(), &req_buf, &mut resp_buf);

        let mut recorded = false;
        let mut failure = None;
        match result {
            Ok(FuseReqResult::Reply(total)) => {
                let fill = if total > 0 {
                    iov_from_buf(mem_space, &elem.in_iovec, &resp_buf[..total]).map(|_| ())
                } else {
                    Ok(())
                };
                match fill.and_then(|_| queue.vring.add_used(mem_space, elem.index, total as u32))
                {
                    Ok(()) => recorded = true,
                    Err(e) => failure = Some(e),
                }
            }
            Ok(FuseReqResult::WouldBlock) => {
                self.deferred.push(DeferredReq {
                    queue_index,
                    index: elem.index,
                    req: req_buf.clone(),
                    in_iovec: elem.in_iovec.clone(),
                });
            }
            Err(e) => failure = Some(e),
        }

        self.pool.return_buf(req_buf);
        self.pool.return_buf(resp_buf);
        match failure {
            Some(e) => Err(e),
            None => Ok(recorded),
        }
    }

    /// Re-dispatch every deferred record against a fresh response buffer;
    /// records that stay blocked are requeued. Returns the number of used
    /// entries recorded.
    fn retry_deferred(
        &mut self,
        mem_space: &Arc<AddressSpace>,
        queue: &mut Queue,
        queue_index: u16,
    ) -> Result<u32> {
        if self.deferred.is_empty() {
            return Ok(0);
        }
        let mut completed = 0_u32;
        let records = std::mem::take(&mut self.deferred);
        for rec in records {
            if rec.queue_index != queue_index {
                self.deferred.push(rec);
                continue;
            }
            let resp_len = Element::iovec_size(&rec.in_iovec) as usize;
            let mut resp_buf = self.pool.borrow_buf(resp_len);
            let result =
                do_fuse_request(&mut *self.backend.lock().unwrap(), &rec.req, &mut resp_buf);
            match result {
                Ok(FuseReqResult::Reply(total)) => {
                    let fill = if total > 0 {
                        iov_from_buf(mem_space, &rec.in_iovec, &resp_buf[..total]).map(|_| ())
                    } else {
                        Ok(())
                    };
                    match fill
                        .and_then(|_| queue.vring.add_used(mem_space, rec.index, total as u32))
                    {
                        Ok(()) => completed += 1,
                        Err(e) => error!("Abandoned deferred fs request: {:?}", e),
                    }
                }
                Ok(FuseReqResult::WouldBlock) => self.deferred.push(rec),
                Err(e) => error!("Abandoned deferred fs request: {:?}", e),
            }
            self.pool.return_buf(resp_buf);
        }
        Ok(completed)
    }
}

impl VirtioDevice for VirtioFs {
    fn realize(&mut self) -> Result<()> {
        self.fs_cfg
            .check()
            .with_context(|| "Invalid virtio-fs config")?;

        let mut config = VirtioFsConfig::default();
        let tag_bytes = self.fs_cfg.tag.as_bytes();
        config.tag[..tag_bytes.len()].copy_from_slice(tag_bytes);
        config.num_request_queues = (QUEUE_NUM_FS - 1) as u32;
        self.config = config;

        self.device_features = 1_u64 << VIRTIO_F_VERSION_1;
        Ok(())
    }

    fn device_type(&self) -> u32 {
        VIRTIO_TYPE_FS
    }

    fn queue_num(&self) -> usize {
        QUEUE_NUM_FS
    }

    fn queue_size(&self) -> u16 {
        QUEUE_SIZE_FS
    }

    fn get_device_features(&self, features_select: u32) -> u32 {
        read_u32(self.device_features, features_select)
    }

    fn set_driver_features(&mut self, page: u32, value: u32) {
        self.driver_features = self.checked_driver_features(page, value);
    }

    fn get_driver_features(&self, features_select: u32) -> u32 {
        read_u32(self.driver_features, features_select)
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) -> Result<()> {
        let offset = cfg_space_offset(offset);
        let config_slice = self.config.as_bytes();
        let config_len = config_slice.len() as u64;
        if offset >= config_len {
            return Err(anyhow!(VirtioError::DevConfigOverflow(offset, config_len)));
        }
        let end = min(offset + data.len() as u64, config_len) as usize;
        let read_len = end - offset as usize;
        data[..read_len].copy_from_slice(&config_slice[offset as usize..end]);
        Ok(())
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let offset = cfg_space_offset(offset);
        warn!(
            "Virtio-fs config space is read-only: write of {} bytes at {}",
            data.len(),
            offset
        );
        Ok(())
    }

    fn activate(
        &mut self,
        mem_space: Arc<AddressSpace>,
        interrupt_cb: Arc<VirtioInterrupt>,
        queues: &[Arc<Mutex<Queue>>],
    ) -> Result<()> {
        if queues.len() != QUEUE_NUM_FS {
            return Err(anyhow!(VirtioError::IncorrectQueueNum(
                QUEUE_NUM_FS,
                queues.len()
            )));
        }
        self.mem_space = Some(mem_space);
        self.interrupt_cb = Some(interrupt_cb);
        self.queues = queues.to_vec();
        Ok(())
    }

    fn notify_queue(&mut self, queue_index: u16) -> Result<()> {
        if queue_index as usize >= QUEUE_NUM_FS {
            return Err(anyhow!(VirtioError::QueueIndex(
                queue_index,
                QUEUE_NUM_FS as u16
            )));
        }
        self.process_queue(queue_index)
    }

    fn deactivate(&mut self) -> Result<()> {
        self.mem_space = None;
        self.interrupt_cb = None;
        self.queues.clear();
        self.deferred.clear();
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.driver_features = 0;
        self.deferred.clear();
        Ok(())
    }
}
