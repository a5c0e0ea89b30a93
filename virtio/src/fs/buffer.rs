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

/// Smallest capacity a pooled buffer is allocated with.
const MIN_BUF_CAPACITY: usize = 64 * 1024;
/// Buffers above this capacity are dropped instead of pooled again.
const MAX_POOLED_CAPACITY: usize = 1024 * 1024;
const MAX_POOLED_BUFFERS: usize = 8;

/// Request/response buffers recycled across FUSE requests. Borrowed
/// buffers come back zeroed over their whole length so pool residue never
/// leaks into guest memory.
pub struct BufferPool {
    buffers: Vec<Vec<u8>>,
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool {
            buffers: Vec::new(),
        }
    }

    /// Take a zeroed buffer of exactly `len` bytes.
    pub fn borrow_buf(&mut self, len: usize) -> Vec<u8> {
        let mut buf = match self
            .buffers
            .iter()
            .position(|buf| buf.capacity() >= len)
        {
            Some(index) => self.buffers.swap_remove(index),
            None => Vec::with_capacity(std::cmp::max(len, MIN_BUF_CAPACITY)),
        };
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    /// Return a buffer to the pool, unless it is oversized or the pool is
    /// full.
    pub fn return_buf(&mut self, mut buf: Vec<u8>) {
        buf.clear();
        if buf.capacity() <= MAX_POOLED_CAPACITY && self.buffers.len() < MAX_POOLED_BUFFERS {
            self.buffers.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new()
    }
}
