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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VirtioError {
    #[error("Failed to write eventfd")]
    EventFdWrite,
    #[error("Failed to trigger interrupt for {0}")]
    InterruptTrigger(&'static str),
    #[error("Queue index {0} invalid, queue size is {1}")]
    QueueIndex(u16, u16),
    #[error("Vring descriptor is invalid")]
    QueueDescInvalid,
    #[error("Descriptor chain exceeds queue size {0}")]
    DescChainOverflow(u16),
    #[error("Read-only descriptor follows a write-only one in the chain")]
    DescOrderInvalid,
    #[error("Indirect descriptors are not supported")]
    DescIndirect,
    #[error("Queue is not enabled or not ready")]
    QueueNotEnabled,
    #[error("Cannot perform activate. Expected {0} queue(s), got {1}")]
    IncorrectQueueNum(usize, usize),
    #[error("Incorrect offset, expected {0}, got {1}")]
    IncorrectOffset(u64, u64),
    #[error("Device {0} not activated")]
    DeviceNotActivated(String),
    #[error("Failed to write config")]
    FailedToWriteConfig,
    #[error("Failed to read object for {0}, address: 0x{1:x}")]
    ReadObjectErr(&'static str, u64),
    #[error("Invalid device status: 0x{0:x}")]
    DevStatErr(u32),
    #[error("Unsupported mmio register at offset 0x{0:x}")]
    MmioRegErr(u64),
    #[error("Config space access overflow, offset {0}, config length {1}")]
    DevConfigOverflow(u64, u64),
    #[error("Malformed request: {0}")]
    RequestMalformed(&'static str),
}
