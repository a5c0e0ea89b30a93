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

//! # Address Space
//!
//! The gateway between guest-physical addresses and host memory.
//!
//! ## Design
//!
//! This module offers support for:
//! 1. `GuestAddress`: an opaque guest-physical address.
//! 2. `HostMemMapping`: one anonymous mmap region backing a range of
//!    guest-physical memory.
//! 3. `AddressSpace`: resolves `(GuestAddress, length)` pairs into host
//!    byte views and moves data in and out of them. Out-of-range access
//!    fails; it never panics on guest-controlled input.
//!
//! ## Platform Support
//!
//! - `x86_64`
//! - `aarch64`
#[macro_use]
extern crate log;

pub mod error;

mod address_space;
mod host_mmap;

pub use crate::address_space::AddressSpace;
pub use anyhow::Result;
pub use error::AddressSpaceError;
pub use host_mmap::HostMemMapping;

/// Represent an address in guest physical address space.
#[repr(transparent)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GuestAddress(pub u64);

impl GuestAddress {
    /// Get the raw value of the guest address.
    pub fn raw_value(self) -> u64 {
        self.0
    }

    /// Get the offset of this address from the given one, panicking on
    /// underflow. Callers must know `other` is not above `self`.
    pub fn offset_from(self, other: GuestAddress) -> u64 {
        self.raw_value() - other.raw_value()
    }

    /// Add an offset, or `None` on overflow.
    pub fn checked_add(self, offset: u64) -> Option<GuestAddress> {
        self.0.checked_add(offset).map(GuestAddress)
    }

    /// Add an offset with wrapping semantics.
    pub fn unchecked_add(self, offset: u64) -> GuestAddress {
        GuestAddress(self.0.wrapping_add(offset))
    }

    /// Check whether this address is `align`-byte aligned.
    pub fn is_aligned(self, align: u64) -> bool {
        align != 0 && self.0 & (align - 1) == 0
    }
}
