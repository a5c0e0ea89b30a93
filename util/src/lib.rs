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

//! # Util
//!
//! Leaf helpers shared by every other crate in the workspace:
//!
//! 1. `byte_code`: zero-copy views between plain-old-data structs and byte
//!    slices, used to move ring entries and protocol headers through guest
//!    memory.
//! 2. `num_ops`: split/merge operations on 32-bit register halves.
//! 3. `offset_of!`: byte offset of a field inside a `repr(C)` struct.

pub mod byte_code;
pub mod num_ops;

/// Macro: get the byte offset of a field inside a `repr(C)` struct.
///
/// # Examples
///
/// ```
/// #[macro_use]
/// extern crate util;
///
/// #[repr(C)]
/// struct Header {
///     len: u32,
///     opcode: u32,
/// }
///
/// fn main() {
///     assert_eq!(offset_of!(Header, opcode), 4);
/// }
/// ```
#[macro_export]
macro_rules! offset_of {
    ($type_name:ty, $field:ident) => {{
        let tmp = core::mem::MaybeUninit::<$type_name>::uninit();
        let outer = tmp.as_ptr();
        // SAFETY: no read happens, only pointer arithmetic on a field
        // projection of an uninitialized value.
        let inner = unsafe { core::ptr::addr_of!((*outer).$field) } as *const u8;
        unsafe { inner.offset_from(outer as *const u8) as usize }
    }};
}
