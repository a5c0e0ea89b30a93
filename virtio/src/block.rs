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
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};

use address_space::{AddressSpace, GuestAddress};
use machine_manager::config::{ConfigCheck, DriveConfig};
use util::byte_code::ByteCode;
use util::num_ops::read_u32;

use crate::error::VirtioError;
use crate::{
    cfg_space_offset, ElemIovec, Element, Queue, VirtioDevice, VirtioInterrupt,
    VirtioInterruptType, VIRTIO_BLK_F_BLK_SIZE, VIRTIO_BLK_F_FLUSH, VIRTIO_BLK_F_RO,
    VIRTIO_BLK_F_SEG_MAX, VIRTIO_BLK_F_SIZE_MAX, VIRTIO_BLK_ID_BYTES, VIRTIO_BLK_S_IOERR,
    VIRTIO_BLK_S_OK, VIRTIO_BLK_S_UNSUPP, VIRTIO_BLK_T_FLUSH, VIRTIO_BLK_T_GET_ID,
    VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT, VIRTIO_F_RING_EVENT_IDX, VIRTIO_F_VERSION_1,
    VIRTIO_TYPE_BLOCK,
};

const QUEUE_NUM_BLK: usize = 1;
const QUEUE_SIZE_BLK: u16 = 256;

const SECTOR_SHIFT: u8 = 9;
const SECTOR_SIZE: u64 = 1 << SECTOR_SHIFT;
/// Largest single segment the device accepts.
const MAX_SEGMENT_SIZE: u32 = 1 << 20;
/// Most segments a single request may carry.
const MAX_SEGMENTS: u32 = 128;

const REQ_HEADER_LEN: u32 = 16;

/// Block device config space, little endian.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct VirtioBlkConfig {
    /// Capacity in 512-byte sectors.
    capacity: u64,
    size_max: u32,
    seg_max: u32,
    cylinders: u16,
    heads: u8,
    sectors: u8,
    blk_size: u32,
    reserved: [u8; 8],
}

impl ByteCode for VirtioBlkConfig {}

/// The fixed header leading every block request chain.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
struct RequestOutHeader {
    request_type: u32,
    io_prio: u32,
    sector: u64,
}

impl ByteCode for RequestOutHeader {}

/// One parsed block request: header, data segments split by direction, and
/// the trailing status byte location.
struct Request {
    desc_index: u16,
    out_header: RequestOutHeader,
    /// Device-readable data segments (`OUT` payload).
    read_iovec: Vec<ElemIovec>,
    /// Device-writable data segments (`IN`/`GET_ID` destination).
    write_iovec: Vec<ElemIovec>,
    status_addr: GuestAddress,
}

impl Request {
    fn new(mem_space: &Arc<AddressSpace>, elem: &Element) -> Result<Self> {
        if elem.out_iovec.is_empty() || elem.in_iovec.is_empty() {
            return Err(anyhow!(VirtioError::RequestMalformed(
                "block chain misses header or status descriptor"
            )));
        }
        let header_iov = elem.out_iovec[0];
        if header_iov.len != REQ_HEADER_LEN {
            return Err(anyhow!(VirtioError::RequestMalformed(
                "block request header must be exactly 16 bytes"
            )));
        }
        let out_header = mem_space
            .read_object::<RequestOutHeader>(header_iov.addr)
            .with_context(|| "Failed to read block request header")?;

        let mut write_iovec = elem.in_iovec.clone();
        // The trailing writable byte is the status cell.
        let status_iov = write_iovec.pop().unwrap();
        if status_iov.len < 1 {
            return Err(anyhow!(VirtioError::RequestMalformed(
                "block status descriptor is empty"
            )));
        }
        let status_addr = status_iov
            .addr
            .checked_add(u64::from(status_iov.len) - 1)
            .ok_or_else(|| anyhow!(VirtioError::RequestMalformed("status address overflow")))?;

        Ok(Request {
            desc_index: elem.index,
            out_header,
            read_iovec: elem.out_iovec[1..].to_vec(),
            write_iovec,
            status_addr,
        })
    }

    fn io_range_valid(&self, disk_sectors: u64, data_len: u64) -> bool {
        let offset = self.out_header.sector << SECTOR_SHIFT;
        offset
            .checked_add(data_len)
            .map_or(false, |end| end <= disk_sectors << SECTOR_SHIFT)
    }

    fn execute(&self, block: &Block, mem_space: &Arc<AddressSpace>) -> u8 {
        let disk = match &block.disk_image {
            Some(disk) => disk.as_ref(),
            None => {
                error!("Block request while the backing file is not opened");
                return VIRTIO_BLK_S_IOERR;
            }
        };

        match self.out_header.request_type {
            VIRTIO_BLK_T_IN => {
                if !self.read_iovec.is_empty() {
                    error!("Read-only data descriptor in a block read request");
                    return VIRTIO_BLK_S_IOERR;
                }
                if !self.io_range_valid(block.disk_sectors, Element::iovec_size(&self.write_iovec))
                {
                    return VIRTIO_BLK_S_IOERR;
                }
                let mut offset = self.out_header.sector << SECTOR_SHIFT;
                for iov in self.write_iovec.iter() {
                    let mut buf = vec![0_u8; iov.len as usize];
                    let mut filled = 0_usize;
                    while filled < buf.len() {
                        match disk.read_at(&mut buf[filled..], offset + filled as u64) {
                            // EOF: the remainder stays zero.
                            Ok(0) => break,
                            Ok(count) => filled += count,
                            Err(e) => {
                                if filled == 0 {
                                    error!("Failed to read backing file: {:?}", e);
                                    return VIRTIO_BLK_S_IOERR;
                                }
                                break;
                            }
                        }
                    }
                    if let Err(e) = mem_space.write(&mut buf.as_slice(), iov.addr, u64::from(iov.len))
                    {
                        error!("Failed to write read data to the guest: {:?}", e);
                        return VIRTIO_BLK_S_IOERR;
                    }
                    offset += u64::from(iov.len);
                }
                VIRTIO_BLK_S_OK
            }
            VIRTIO_BLK_T_OUT => {
                if block.blk_cfg.read_only {
                    error!("Write request to a read-only block device");
                    return VIRTIO_BLK_S_IOERR;
                }
                if !self.write_iovec.is_empty() {
                    error!("Writable data descriptor in a block write request");
                    return VIRTIO_BLK_S_IOERR;
                }
                if !self.io_range_valid(block.disk_sectors, Element::iovec_size(&self.read_iovec)) {
                    return VIRTIO_BLK_S_IOERR;
                }
                let mut offset = self.out_header.sector << SECTOR_SHIFT;
                for iov in self.read_iovec.iter() {
                    let mut buf = vec![0_u8; iov.len as usize];
                    let mut slice = buf.as_mut_slice();
                    if let Err(e) = mem_space.read(&mut slice, iov.addr, u64::from(iov.len)) {
                        error!("Failed to read write data from the guest: {:?}", e);
                        return VIRTIO_BLK_S_IOERR;
                    }
                    if let Err(e) = disk.write_all_at(&buf, offset) {
                        error!("Failed to write backing file: {:?}", e);
                        return VIRTIO_BLK_S_IOERR;
                    }
                    offset += u64::from(iov.len);
                }
                VIRTIO_BLK_S_OK
            }
            VIRTIO_BLK_T_FLUSH => match disk.sync_all() {
                Ok(()) => VIRTIO_BLK_S_OK,
                Err(e) => {
                    error!("Failed to flush backing file: {:?}", e);
                    VIRTIO_BLK_S_IOERR
                }
            },
            VIRTIO_BLK_T_GET_ID => {
                let iov = match self.write_iovec.first() {
                    Some(iov) => iov,
                    None => {
                        error!("GET_ID request without a writable data descriptor");
                        return VIRTIO_BLK_S_IOERR;
                    }
                };
                let serial = block.blk_cfg.serial_num.clone().unwrap_or_default();
                let mut id = vec![0_u8; VIRTIO_BLK_ID_BYTES as usize];
                let count = min(id.len(), serial.len());
                id[..count].copy_from_slice(&serial.as_bytes()[..count]);
                let count = min(id.len(), iov.len as usize);
                if let Err(e) = mem_space.write(&mut &id[..count], iov.addr, count as u64) {
                    error!("Failed to write device id to the guest: {:?}", e);
                    return VIRTIO_BLK_S_IOERR;
                }
                VIRTIO_BLK_S_OK
            }
            other => {
                warn!("Unsupported block request type {}", other);
                VIRTIO_BLK_S_UNSUPP
            }
        }
    }
}

/// State of the block device for a snapshot.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct BlockState {
    pub device_features: u64,
    pub driver_features: u64,
    pub config: VirtioBlkConfig,
}

impl ByteCode for BlockState {}

/// Virtio block device backed by a raw file.
pub struct Block {
    blk_cfg: DriveConfig,
    config: VirtioBlkConfig,
    disk_image: Option<Arc<File>>,
    disk_sectors: u64,
    device_features: u64,
    driver_features: u64,
    mem_space: Option<Arc<AddressSpace>>,
    interrupt_cb: Option<Arc<VirtioInterrupt>>,
    queue: Option<Arc<Mutex<Queue>>>,
}

impl Block {
    pub fn new(blk_cfg: DriveConfig) -> Self {
        Block {
            blk_cfg,
            config: VirtioBlkConfig::default(),
            disk_image: None,
            disk_sectors: 0,
            device_features: 0,
            driver_features: 0,
            mem_space: None,
            interrupt_cb: None,
            queue: None,
        }
    }

    pub fn state(&self) -> BlockState {
        BlockState {
            device_features: self.device_features,
            driver_features: self.driver_features,
            config: self.config,
        }
    }

    pub fn set_state(&mut self, state: &BlockState) {
        self.device_features = state.device_features;
        self.driver_features = state.driver_features;
        self.config = state.config;
    }

    /// Drain the request queue. All I/O runs under the device lock, so
    /// offsets derived from one header never interleave with another
    /// request's data.
    fn process_queue(&mut self) -> Result<()> {
        let queue = self
            .queue
            .clone()
            .ok_or_else(|| anyhow!(VirtioError::DeviceNotActivated("block".to_string())))?;
        let mem_space = self
            .mem_space
            .clone()
            .ok_or_else(|| anyhow!(VirtioError::DeviceNotActivated("block".to_string())))?;

        let mut queue_lock = queue.lock().unwrap();
        if !queue_lock.is_enabled() {
            return Ok(());
        }

        let mut need_interrupt = false;
        loop {
            let elem = queue_lock
                .vring
                .pop_avail(&mem_space, self.driver_features)?;
            if elem.desc_num == 0 {
                break;
            }
            let req = match Request::new(&mem_space, &elem) {
                Ok(req) => req,
                Err(e) => {
                    // The failing request is abandoned without a used
                    // entry; later requests keep flowing.
                    error!("Malformed block request: {:?}", e);
                    continue;
                }
            };
            let status = req.execute(self, &mem_space);
            if let Err(e) = mem_space.write_object(&status, req.status_addr) {
                error!("Failed to write block request status: {:?}", e);
                continue;
            }
            queue_lock
                .vring
                .add_used(&mem_space, req.desc_index, 1)
                .with_context(|| "Failed to add used element for block request")?;
            need_interrupt = true;
        }

        if need_interrupt
            && queue_lock
                .vring
                .should_notify(&mem_space, self.driver_features)
        {
            if let Some(cb) = &self.interrupt_cb {
                cb(&VirtioInterruptType::Vring, Some(&queue_lock))
                    .with_context(|| VirtioError::InterruptTrigger("block"))?;
            }
        }
        Ok(())
    }

    fn build_device_config(&mut self, file_size: u64) {
        self.config = VirtioBlkConfig {
            capacity: file_size >> SECTOR_SHIFT,
            size_max: MAX_SEGMENT_SIZE,
            seg_max: MAX_SEGMENTS,
            cylinders: 0,
            heads: 0,
            sectors: 0,
            blk_size: SECTOR_SIZE as u32,
            reserved: [0; 8],
        };
        self.disk_sectors = file_size >> SECTOR_SHIFT;
    }
}

impl VirtioDevice for Block {
    fn realize(&mut self) -> Result<()> {
        self.blk_cfg
            .check()
            .with_context(|| "Invalid block drive config")?;

        let file = OpenOptions::new()
            .read(true)
            .write(!self.blk_cfg.read_only)
            .open(&self.blk_cfg.path_on_host)
            .with_context(|| {
                format!("Failed to open block backing file {}", self.blk_cfg.path_on_host)
            })?;
        let file_size = file
            .metadata()
            .with_context(|| "Failed to stat block backing file")?
            .len();
        if file_size & (SECTOR_SIZE - 1) != 0 {
            warn!(
                "Block backing file size 0x{:x} is not sector aligned, the tail is unreachable",
                file_size
            );
        }
        self.disk_image = Some(Arc::new(file));
        self.build_device_config(file_size);

        self.device_features = (1_u64 << VIRTIO_F_VERSION_1)
            | (1 << VIRTIO_F_RING_EVENT_IDX)
            | (1 << VIRTIO_BLK_F_FLUSH)
            | (1 << VIRTIO_BLK_F_SEG_MAX)
            | (1 << VIRTIO_BLK_F_SIZE_MAX)
            | (1 << VIRTIO_BLK_F_BLK_SIZE);
        if self.blk_cfg.read_only {
            self.device_features |= 1 << VIRTIO_BLK_F_RO;
        }
        Ok(())
    }

    fn device_type(&self) -> u32 {
        VIRTIO_TYPE_BLOCK
    }

    fn queue_num(&self) -> usize {
        QUEUE_NUM_BLK
    }

    fn queue_size(&self) -> u16 {
        QUEUE_SIZE_BLK
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
            "Block config space is read-only: write of {} bytes at {}",
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
        if queues.len() != QUEUE_NUM_BLK {
            return Err(anyhow!(VirtioError::IncorrectQueueNum(
                QUEUE_NUM_BLK,
                queues.len()
            )));
        }
        self.mem_space = Some(mem_space);
        self.interrupt_cb = Some(interrupt_cb);
        self.queue = Some(queues[0].clone());
        Ok(())
    }

    fn notify_queue(&mut self, queue_index: u16) -> Result<()> {
        if queue_index != 0 {
            return Err(anyhow!(VirtioError::QueueIndex(
                queue_index,
                QUEUE_NUM_BLK as u16
            )));
        }
        self.process_queue()
    }

    fn deactivate(&mut self) -> Result<()> {
        self.mem_space = None;
        self.interrupt_cb = None;
        self.queue = None;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.driver_features = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use address_space::HostMemMapping;
    use machine_manager::config::parse_drive;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vmm_sys_util::tempfile::TempFile;

    use crate::{QueueConfig, QUEUE_TYPE_SPLIT_VRING, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};

    const DESC_BASE: u64 = 0x1000;
    const AVAIL_BASE: u64 = 0x2000;
    const USED_BASE: u64 = 0x3000;
    const HEADER_ADDR: u64 = 0x8000;
    const DATA_ADDR: u64 = 0x9000;
    const STATUS_ADDR: u64 = 0xa000;
    const QSIZE: u16 = 8;

    struct TestEnv {
        mem: Arc<AddressSpace>,
        block: Block,
        irqs: Arc<AtomicU32>,
        _file: TempFile,
    }

    fn setup(content: &[u8], read_only: bool, serial: Option<&str>) -> TestEnv {
        let file = TempFile::new().unwrap();
        file.as_file().write_all(content).unwrap();
        file.as_file().sync_all().unwrap();

        let mut drive_arg = format!(
            "id=drive0,file={}",
            file.as_path().to_str().unwrap()
        );
        if read_only {
            drive_arg.push_str(",readonly=on");
        }
        if let Some(serial) = serial {
            drive_arg.push_str(&format!(",serial={}", serial));
        }
        let mut block = Block::new(parse_drive(&drive_arg).unwrap());
        block.realize().unwrap();

        let mem = AddressSpace::new();
        mem.register_region(Arc::new(
            HostMemMapping::new(GuestAddress(0), 0x10_0000).unwrap(),
        ))
        .unwrap();

        let irqs = Arc::new(AtomicU32::new(0));
        let counter = irqs.clone();
        let cb = Arc::new(Box::new(
            move |_: &VirtioInterruptType, _: Option<&Queue>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        ) as VirtioInterrupt);

        let mut config = QueueConfig::new(QSIZE);
        config.desc_table = GuestAddress(DESC_BASE);
        config.avail_ring = GuestAddress(AVAIL_BASE);
        config.used_ring = GuestAddress(USED_BASE);
        config.size = QSIZE;
        config.ready = true;
        let queues = vec![Arc::new(Mutex::new(
            Queue::new(config, QUEUE_TYPE_SPLIT_VRING).unwrap(),
        ))];
        block.activate(mem.clone(), cb, &queues).unwrap();

        TestEnv {
            mem,
            block,
            irqs,
            _file: file,
        }
    }

    fn write_desc(mem: &Arc<AddressSpace>, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let desc = crate::SplitVringDesc {
            addr,
            len,
            flags,
            next,
        };
        mem.write_object(&desc, GuestAddress(DESC_BASE + u64::from(index) * 16))
            .unwrap();
    }

    fn submit_request(env: &TestEnv, request_type: u32, sector: u64, data_len: u32, writable: bool) {
        let header = RequestOutHeader {
            request_type,
            io_prio: 0,
            sector,
        };
        env.mem
            .write_object(&header, GuestAddress(HEADER_ADDR))
            .unwrap();

        let mut next_index = 1_u16;
        write_desc(&env.mem, 0, HEADER_ADDR, 16, VIRTQ_DESC_F_NEXT, next_index);
        if data_len > 0 {
            let flags = if writable {
                VIRTQ_DESC_F_WRITE | VIRTQ_DESC_F_NEXT
            } else {
                VIRTQ_DESC_F_NEXT
            };
            write_desc(&env.mem, 1, DATA_ADDR, data_len, flags, 2);
            next_index = 2;
        }
        write_desc(&env.mem, next_index, STATUS_ADDR, 1, VIRTQ_DESC_F_WRITE, 0);

        let avail_idx: u16 = env
            .mem
            .read_object(GuestAddress(AVAIL_BASE + 2))
            .unwrap();
        env.mem
            .write_object(
                &0_u16,
                GuestAddress(AVAIL_BASE + 4 + u64::from(avail_idx % QSIZE) * 2),
            )
            .unwrap();
        env.mem
            .write_object(&(avail_idx + 1), GuestAddress(AVAIL_BASE + 2))
            .unwrap();
    }

    fn status_byte(env: &TestEnv) -> u8 {
        env.mem.read_object(GuestAddress(STATUS_ADDR)).unwrap()
    }

    fn used_idx(env: &TestEnv) -> u16 {
        env.mem.read_object(GuestAddress(USED_BASE + 2)).unwrap()
    }

    #[test]
    fn test_capacity_from_file_size() {
        let env = setup(&[0_u8; 4096], false, None);
        assert_eq!(env.block.disk_sectors, 8);
        let mut cap = [0_u8; 8];
        env.block.read_config(0, &mut cap).unwrap();
        assert_eq!(u64::from_le_bytes(cap), 8);
    }

    #[test]
    fn test_read_hello() {
        let mut content = vec![0_u8; 512];
        content[..5].copy_from_slice(b"HELLO");
        let mut env = setup(&content, false, None);
        submit_request(&env, VIRTIO_BLK_T_IN, 0, 5, true);
        env.block.notify_queue(0).unwrap();

        let mut data = [0_u8; 5];
        env.mem
            .read(&mut data.as_mut_slice(), GuestAddress(DATA_ADDR), 5)
            .unwrap();
        assert_eq!(&data, b"HELLO");
        assert_eq!(status_byte(&env), VIRTIO_BLK_S_OK);
        assert_eq!(used_idx(&env), 1);
        let used_len: u32 = env.mem.read_object(GuestAddress(USED_BASE + 8)).unwrap();
        assert_eq!(used_len, 1);
        assert_eq!(env.irqs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut env = setup(&[0_u8; 2048], false, None);
        let payload = [0x5a_u8; 512];
        env.mem
            .write(&mut payload.as_slice(), GuestAddress(DATA_ADDR), 512)
            .unwrap();

        submit_request(&env, VIRTIO_BLK_T_OUT, 2, 512, false);
        env.block.notify_queue(0).unwrap();
        assert_eq!(status_byte(&env), VIRTIO_BLK_S_OK);

        // Clear the guest buffer, then read the sector back.
        env.mem
            .write(&mut [0_u8; 512].as_slice(), GuestAddress(DATA_ADDR), 512)
            .unwrap();
        submit_request(&env, VIRTIO_BLK_T_IN, 2, 512, true);
        env.block.notify_queue(0).unwrap();
        assert_eq!(status_byte(&env), VIRTIO_BLK_S_OK);

        let mut data = [0_u8; 512];
        env.mem
            .read(&mut data.as_mut_slice(), GuestAddress(DATA_ADDR), 512)
            .unwrap();
        assert_eq!(data, payload);
        assert_eq!(used_idx(&env), 2);
    }

    #[test]
    fn test_write_to_read_only_device() {
        let mut env = setup(&[7_u8; 1024], true, None);
        env.mem
            .write(&mut [1_u8; 512].as_slice(), GuestAddress(DATA_ADDR), 512)
            .unwrap();

        submit_request(&env, VIRTIO_BLK_T_OUT, 0, 512, false);
        env.block.notify_queue(0).unwrap();
        assert_eq!(status_byte(&env), VIRTIO_BLK_S_IOERR);

        // Backing file is unchanged byte for byte.
        let mut content = vec![0_u8; 1024];
        env.block
            .disk_image
            .as_ref()
            .unwrap()
            .read_at(&mut content, 0)
            .unwrap();
        assert_eq!(content, vec![7_u8; 1024]);
    }

    #[test]
    fn test_flush_twice_ok() {
        let mut env = setup(&[0_u8; 512], false, None);
        submit_request(&env, VIRTIO_BLK_T_FLUSH, 0, 0, false);
        env.block.notify_queue(0).unwrap();
        assert_eq!(status_byte(&env), VIRTIO_BLK_S_OK);

        submit_request(&env, VIRTIO_BLK_T_FLUSH, 0, 0, false);
        env.block.notify_queue(0).unwrap();
        assert_eq!(status_byte(&env), VIRTIO_BLK_S_OK);
        assert_eq!(used_idx(&env), 2);
    }

    #[test]
    fn test_get_id_padded() {
        let mut env = setup(&[0_u8; 512], false, Some("sn0001"));
        submit_request(&env, VIRTIO_BLK_T_GET_ID, 0, VIRTIO_BLK_ID_BYTES, true);
        env.block.notify_queue(0).unwrap();
        assert_eq!(status_byte(&env), VIRTIO_BLK_S_OK);

        let mut id = [0_u8; 20];
        env.mem
            .read(&mut id.as_mut_slice(), GuestAddress(DATA_ADDR), 20)
            .unwrap();
        assert_eq!(&id[..6], b"sn0001");
        assert_eq!(&id[6..], &[0_u8; 14]);
    }

    #[test]
    fn test_unknown_request_type() {
        let mut env = setup(&[0_u8; 512], false, None);
        submit_request(&env, 0xff, 0, 0, false);
        env.block.notify_queue(0).unwrap();
        assert_eq!(status_byte(&env), VIRTIO_BLK_S_UNSUPP);
        let used_len: u32 = env.mem.read_object(GuestAddress(USED_BASE + 8)).unwrap();
        assert_eq!(used_len, 1);
    }

    #[test]
    fn test_out_of_range_sector() {
        let mut env = setup(&[0_u8; 1024], false, None);
        submit_request(&env, VIRTIO_BLK_T_IN, 100, 512, true);
        env.block.notify_queue(0).unwrap();
        assert_eq!(status_byte(&env), VIRTIO_BLK_S_IOERR);
    }

    #[test]
    fn test_malformed_header_abandoned() {
        let mut env = setup(&[0_u8; 512], false, None);
        // Header descriptor is 8 bytes instead of 16.
        write_desc(&env.mem, 0, HEADER_ADDR, 8, VIRTQ_DESC_F_NEXT, 1);
        write_desc(&env.mem, 1, STATUS_ADDR, 1, VIRTQ_DESC_F_WRITE, 0);
        env.mem.write_object(&0_u16, GuestAddress(AVAIL_BASE + 4)).unwrap();
        env.mem.write_object(&1_u16, GuestAddress(AVAIL_BASE + 2)).unwrap();

        env.block.notify_queue(0).unwrap();
        // No used entry for the abandoned request, no interrupt.
        assert_eq!(used_idx(&env), 0);
        assert_eq!(env.irqs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_config_space_layout() {
        let env = setup(&[0_u8; 4096], false, None);
        let mut config = [0_u8; 32];
        env.block.read_config(0, &mut config).unwrap();
        // capacity | size_max | seg_max | geometry | blk_size
        assert_eq!(u64::from_le_bytes(config[0..8].try_into().unwrap()), 8);
        assert_eq!(
            u32::from_le_bytes(config[8..12].try_into().unwrap()),
            MAX_SEGMENT_SIZE
        );
        assert_eq!(
            u32::from_le_bytes(config[12..16].try_into().unwrap()),
            MAX_SEGMENTS
        );
        assert_eq!(
            u32::from_le_bytes(config[20..24].try_into().unwrap()),
            SECTOR_SIZE as u32
        );
        assert!(env.block.read_config(32, &mut [0_u8; 4]).is_err());
    }
}
