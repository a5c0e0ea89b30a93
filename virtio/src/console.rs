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
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use address_space::AddressSpace;
use machine_manager::config::{ConfigCheck, ConsoleConfig};
use util::byte_code::ByteCode;
use util::num_ops::read_u32;

use crate::error::VirtioError;
use crate::{
    cfg_space_offset, iov_from_buf, iov_to_buf, Element, Queue, VirtioDevice, VirtioInterrupt,
    VirtioInterruptType, VIRTIO_CONSOLE_F_SIZE, VIRTIO_F_VERSION_1, VIRTIO_TYPE_CONSOLE,
};

/// Queue index the device fills with host input.
const RX_QUEUE_INDEX: u16 = 0;
/// Queue index the guest sends output through.
const TX_QUEUE_INDEX: u16 = 1;
const QUEUE_NUM_CONSOLE: usize = 2;
const QUEUE_SIZE_CONSOLE: u16 = 256;

/// End-of-transmission byte injected when host input hits EOF.
const EOT_BYTE: u8 = 0x04;
const INPUT_BUF_SIZE: usize = 4096;
const INPUT_READ_DEADLINE: Duration = Duration::from_millis(100);
const STOP_WAIT_LIMIT: Duration = Duration::from_secs(1);

/// Host endpoint the console reads guest input from.
pub trait CommunicatInInterface: std::io::Read + Send {
    /// Bound each blocking read, where the endpoint supports a deadline.
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> std::io::Result<()> {
        Ok(())
    }
}

/// Host endpoint the console writes guest output to.
pub trait CommunicatOutInterface: std::io::Write + Send {}

impl CommunicatInInterface for std::io::Stdin {}
impl CommunicatOutInterface for std::io::Stdout {}

/// Virtio console device config, exposed in the device config space.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct VirtioConsoleConfig {
    cols: u16,
    rows: u16,
    max_nr_ports: u32,
    emerg_wr: u32,
}

impl ByteCode for VirtioConsoleConfig {}

impl VirtioConsoleConfig {
    fn new(cols: u16, rows: u16) -> Self {
        VirtioConsoleConfig {
            cols,
            rows,
            max_nr_ports: 1,
            emerg_wr: 0,
        }
    }
}

/// State of the console device for a snapshot. The pending input bytes
/// travel alongside as a variable-length payload.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct VirtioConsoleState {
    pub device_features: u64,
    pub driver_features: u64,
    pub config: VirtioConsoleConfig,
}

impl ByteCode for VirtioConsoleState {}

/// Everything the queue-processing paths need, shared between the vCPU
/// trap path and the input-reader thread.
struct ConsoleHandler {
    mem_space: Arc<AddressSpace>,
    interrupt_cb: Arc<VirtioInterrupt>,
    driver_features: u64,
    rx_queue: Arc<Mutex<Queue>>,
    tx_queue: Arc<Mutex<Queue>>,
    output: Arc<Mutex<dyn CommunicatOutInterface>>,
    pending: Arc<Mutex<VecDeque<u8>>>,
}

impl ConsoleHandler {
    /// Drain guest TX chains into the host writer. A writer error aborts
    /// the current chain without recording a used entry.
    fn process_tx_queue(&mut self) -> Result<()> {
        let mut queue_lock = self.tx_queue.lock().unwrap();
        if !queue_lock.is_enabled() {
            return Ok(());
        }

        let mut need_interrupt = false;
        loop {
            let elem = queue_lock
                .vring
                .pop_avail(&self.mem_space, self.driver_features)?;
            if elem.desc_num == 0 {
                break;
            }
            let payload_size = Element::iovec_size(&elem.out_iovec);
            let mut buf = vec![0_u8; payload_size as usize];
            iov_to_buf(&self.mem_space, &elem.out_iovec, &mut buf)?;

            let mut output = self.output.lock().unwrap();
            output
                .write_all(&buf)
                .with_context(|| "Failed to write console output")?;
            if let Err(e) = output.flush() {
                warn!("Failed to flush console output: {:?}", e);
            }
            drop(output);

            queue_lock
                .vring
                .add_used(&self.mem_space, elem.index, payload_size as u32)?;
            need_interrupt = true;
        }

        if need_interrupt
            && queue_lock
                .vring
                .should_notify(&self.mem_space, self.driver_features)
        {
            (self.interrupt_cb)(&VirtioInterruptType::Vring, Some(&queue_lock))
                .with_context(|| VirtioError::InterruptTrigger("console tx"))?;
        }
        Ok(())
    }

    /// Move pending host input into successive RX chains until either side
    /// runs out.
    fn process_rx_queue(&mut self) -> Result<()> {
        let mut queue_lock = self.rx_queue.lock().unwrap();
        if !queue_lock.is_enabled() {
            return Ok(());
        }

        let mut need_interrupt = false;
        loop {
            let count;
            {
                let pending = self.pending.lock().unwrap();
                if pending.is_empty() {
                    break;
                }
                count = pending.len();
            }
            let elem = queue_lock
                .vring
                .pop_avail(&self.mem_space, self.driver_features)?;
            if elem.desc_num == 0 {
                break;
            }
            let capacity = Element::iovec_size(&elem.in_iovec) as usize;
            let data: Vec<u8> = {
                let mut pending = self.pending.lock().unwrap();
                pending.drain(..min(capacity, count)).collect()
            };
            iov_from_buf(&self.mem_space, &elem.in_iovec, &data)?;
            queue_lock
                .vring
                .add_used(&self.mem_space, elem.index, data.len() as u32)?;
            need_interrupt = true;
        }

        if need_interrupt
            && queue_lock
                .vring
                .should_notify(&self.mem_space, self.driver_features)
        {
            (self.interrupt_cb)(&VirtioInterruptType::Vring, Some(&queue_lock))
                .with_context(|| VirtioError::InterruptTrigger("console rx"))?;
        }
        Ok(())
    }
}

struct InputReader {
    stop: Arc<AtomicBool>,
    done_rx: Receiver<()>,
    handle: thread::JoinHandle<()>,
}

/// Virtio console device: one guest-to-host byte stream (TX) and one
/// host-to-guest stream (RX) fed by a background input reader.
pub struct Console {
    console_cfg: ConsoleConfig,
    config: VirtioConsoleConfig,
    device_features: u64,
    driver_features: u64,
    input: Arc<Mutex<dyn CommunicatInInterface>>,
    output: Arc<Mutex<dyn CommunicatOutInterface>>,
    /// Host input not yet handed to the guest. Survives device reset: data
    /// already received must outlive a driver re-probe.
    pending: Arc<Mutex<VecDeque<u8>>>,
    handler: Arc<Mutex<Option<ConsoleHandler>>>,
    interrupt_cb: Option<Arc<VirtioInterrupt>>,
    input_reader: Option<InputReader>,
}

impl Console {
    pub fn new(
        console_cfg: ConsoleConfig,
        input: Arc<Mutex<dyn CommunicatInInterface>>,
        output: Arc<Mutex<dyn CommunicatOutInterface>>,
    ) -> Self {
        let config = VirtioConsoleConfig::new(console_cfg.cols, console_cfg.rows);
        Console {
            console_cfg,
            config,
            device_features: (1_u64 << VIRTIO_F_VERSION_1) | (1 << VIRTIO_CONSOLE_F_SIZE),
            driver_features: 0,
            input,
            output,
            pending: Arc::new(Mutex::new(VecDeque::new())),
            handler: Arc::new(Mutex::new(None)),
            interrupt_cb: None,
            input_reader: None,
        }
    }

    /// Update the advertised terminal size. Raises a config-change
    /// interrupt only when the pair actually changed.
    pub fn set_size(&mut self, cols: u16, rows: u16) -> Result<()> {
        if self.config.cols == cols && self.config.rows == rows {
            return Ok(());
        }
        self.config.cols = cols;
        self.config.rows = rows;
        if let Some(cb) = &self.interrupt_cb {
            cb(&VirtioInterruptType::Config, None)
                .with_context(|| VirtioError::InterruptTrigger("console config"))?;
        }
        Ok(())
    }

    /// The Stop contract: signal the reader, wait up to one second for it
    /// to exit, then proceed regardless.
    pub fn stop(&mut self) {
        if let Some(reader) = self.input_reader.take() {
            reader.stop.store(true, Ordering::SeqCst);
            match reader.done_rx.recv_timeout(STOP_WAIT_LIMIT) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = reader.handle.join();
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Console input reader did not stop within 1s, proceeding");
                }
            }
        }
    }

    /// Capture the device state; the caller persists the pending bytes
    /// next to it.
    pub fn state(&self) -> (VirtioConsoleState, Vec<u8>) {
        let state = VirtioConsoleState {
            device_features: self.device_features,
            driver_features: self.driver_features,
            config: self.config,
        };
        let pending = self.pending.lock().unwrap().iter().copied().collect();
        (state, pending)
    }

    pub fn set_state(&mut self, state: &VirtioConsoleState, pending: &[u8]) {
        self.device_features = state.device_features;
        self.driver_features = state.driver_features;
        self.config = state.config;
        let mut locked_pending = self.pending.lock().unwrap();
        locked_pending.clear();
        locked_pending.extend(pending.iter().copied());
    }

    fn start_input_reader(&mut self) -> Result<()> {
        if self.input_reader.is_some() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let input = self.input.clone();
        let pending = self.pending.clone();
        let handler_slot = self.handler.clone();
        let (done_tx, done_rx): (Sender<()>, Receiver<()>) = channel();
        let thread_stop = stop.clone();

        if let Err(e) = self
            .input
            .lock()
            .unwrap()
            .set_read_timeout(Some(INPUT_READ_DEADLINE))
        {
            warn!("Console input does not support a read deadline: {:?}", e);
        }

        let handle = thread::Builder::new()
            .name("console-input".to_string())
            .spawn(move || {
                let mut buf = [0_u8; INPUT_BUF_SIZE];
                loop {
                    if thread_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let count = match input.lock().unwrap().read(&mut buf) {
                        Ok(0) => {
                            // EOF: hand the guest an end-of-input marker.
                            pending.lock().unwrap().push_back(EOT_BYTE);
                            Self::drain_rx(&handler_slot);
                            break;
                        }
                        Ok(count) => count,
                        Err(e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue;
                        }
                        Err(e) => {
                            error!("Console input reader failed: {:?}", e);
                            break;
                        }
                    };
                    pending.lock().unwrap().extend(buf[..count].iter().copied());
                    Self::drain_rx(&handler_slot);
                }
                let _ = done_tx.send(());
            })
            .with_context(|| "Failed to spawn the console input reader")?;

        self.input_reader = Some(InputReader {
            stop,
            done_rx,
            handle,
        });
        Ok(())
    }

    fn drain_rx(handler_slot: &Arc<Mutex<Option<ConsoleHandler>>>) {
        if let Some(handler) = handler_slot.lock().unwrap().as_mut() {
            if let Err(e) = handler.process_rx_queue() {
                error!("Failed to fill console rx queue: {:?}", e);
            }
        }
    }
}

impl VirtioDevice for Console {
    fn realize(&mut self) -> Result<()> {
        self.console_cfg
            .check()
            .with_context(|| "Invalid console config")?;
        self.config = VirtioConsoleConfig::new(self.console_cfg.cols, self.console_cfg.rows);
        Ok(())
    }

    fn device_type(&self) -> u32 {
        VIRTIO_TYPE_CONSOLE
    }

    fn queue_num(&self) -> usize {
        QUEUE_NUM_CONSOLE
    }

    fn queue_size(&self) -> u16 {
        QUEUE_SIZE_CONSOLE
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
        // Only the emergency write cell is writable.
        let emerg_wr_offset = 8;
        if offset == emerg_wr_offset && !data.is_empty() {
            let mut output = self.output.lock().unwrap();
            output
                .write_all(&data[..1])
                .with_context(|| "Failed to handle emergency write")?;
            if let Err(e) = output.flush() {
                warn!("Failed to flush emergency write: {:?}", e);
            }
            return Ok(());
        }
        warn!("Unexpected console config write at offset {}", offset);
        Ok(())
    }

    fn activate(
        &mut self,
        mem_space: Arc<AddressSpace>,
        interrupt_cb: Arc<VirtioInterrupt>,
        queues: &[Arc<Mutex<Queue>>],
    ) -> Result<()> {
        if queues.len() != QUEUE_NUM_CONSOLE {
            return Err(anyhow!(VirtioError::IncorrectQueueNum(
                QUEUE_NUM_CONSOLE,
                queues.len()
            )));
        }
        let handler = ConsoleHandler {
            mem_space,
            interrupt_cb: interrupt_cb.clone(),
            driver_features: self.driver_features,
            rx_queue: queues[RX_QUEUE_INDEX as usize].clone(),
            tx_queue: queues[TX_QUEUE_INDEX as usize].clone(),
            output: self.output.clone(),
            pending: self.pending.clone(),
        };
        *self.handler.lock().unwrap() = Some(handler);
        self.interrupt_cb = Some(interrupt_cb);
        self.start_input_reader()
    }

    fn notify_queue(&mut self, queue_index: u16) -> Result<()> {
        let mut slot = self.handler.lock().unwrap();
        let handler = slot
            .as_mut()
            .ok_or_else(|| anyhow!(VirtioError::DeviceNotActivated("console".to_string())))?;
        match queue_index {
            RX_QUEUE_INDEX => {
                // Some guest drivers defer TX kicks until they next touch
                // RX; drain TX here, but its failure must not reach the RX
                // path.
                if let Err(e) = handler.process_tx_queue() {
                    error!("Failed to drain console tx on rx notify: {:?}", e);
                }
                handler.process_rx_queue()
            }
            TX_QUEUE_INDEX => handler.process_tx_queue(),
            _ => Err(anyhow!(VirtioError::QueueIndex(
                queue_index,
                QUEUE_NUM_CONSOLE as u16
            ))),
        }
    }

    fn deactivate(&mut self) -> Result<()> {
        *self.handler.lock().unwrap() = None;
        self.interrupt_cb = None;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        // Pending input survives a driver re-probe on purpose.
        self.driver_features = 0;
        Ok(())
    }
}
