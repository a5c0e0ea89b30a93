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
pub enum AddressSpaceError {
    #[error("Failed to mmap: {0}")]
    Mmap(std::io::Error),
    #[error("Guest address 0x{0:x} (size 0x{1:x}) is not in any memory region")]
    AddrNotMapped(u64, u64),
    #[error("Access at guest address 0x{0:x} crosses a region boundary")]
    CrossRegionAccess(u64),
    #[error("Overflow when accessing guest address 0x{0:x} with size 0x{1:x}")]
    AddrOverflow(u64, u64),
    #[error("Memory region 0x{0:x}~0x{1:x} overlaps an existing region")]
    RegionOverlap(u64, u64),
    #[error("Failed to access io: {0}")]
    IoAccess(#[from] std::io::Error),
}
