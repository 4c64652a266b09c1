/* Copyright (c) 2018 University of Utah
 *
 * Permission to use, copy, modify, and distribute this software for any
 * purpose with or without fee is hereby granted, provided that the above
 * copyright notice and this permission notice appear in all copies.
 *
 * THE SOFTWARE IS PROVIDED "AS IS" AND THE AUTHOR(S) DISCLAIM ALL WARRANTIES
 * WITH REGARD TO THIS SOFTWARE INCLUDING ALL IMPLIED WARRANTIES OF
 * MERCHANTABILITY AND FITNESS. IN NO EVENT SHALL AUTHORS BE LIABLE FOR
 * ANY SPECIAL, DIRECT, INDIRECT, OR CONSEQUENTIAL DAMAGES OR ANY DAMAGES
 * WHATSOEVER RESULTING FROM LOSS OF USE, DATA OR PROFITS, WHETHER IN AN
 * ACTION OF CONTRACT, NEGLIGENCE OR OTHER TORTIOUS ACTION, ARISING OUT OF
 * OR IN CONNECTION WITH THE USE OR PERFORMANCE OF THIS SOFTWARE.
 */

//! The packet buffer pool.
//!
//! A fixed-count pool of uniformly sized packet buffers, backed by one
//! contiguous reservation of (ideally huge-page) memory. The pool never
//! grows after construction; exhaustion is reported to the caller rather
//! than treated as an error, since it is a normal, countable event under
//! load (see `crate::manager`).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::{EngineError, Result};

/// Bytes of headroom reserved at the front of every buffer, so that flow
/// construction can prepend bytes (e.g. a rebuilt Ethernet header) without
/// a reallocation. Matches the conventional DPDK `mbuf` headroom.
pub const HEADROOM: usize = 128;

/// Default per-buffer capacity, sized for a standard, non-jumbo Ethernet
/// frame plus headroom.
pub const DEFAULT_SLOT_SIZE: usize = 2048;

/// Offload flags recorded on a buffer. When the NIC adapter negotiated
/// hardware checksum offload these simply describe what the hardware should
/// compute; when it did not, `crate::nic` consults the same flags to decide
/// what it must compute in software before transmit (see SPEC_FULL.md §4.2).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OffloadFlags {
    pub ip_csum: bool,
    pub tcp_csum: bool,
    pub udp_csum: bool,
    /// Length of the Ethernet header, required by the offload engine (real
    /// or software) to locate the IP header.
    pub l2_len: u8,
    /// Length of the IPv4 header (from IHL), required to locate the L4
    /// header.
    pub l3_len: u8,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub exhausted: u64,
}

struct PoolShared {
    base: *mut u8,
    slot_size: usize,
    capacity: u32,
    huge_pages: bool,
    free: RefCell<Vec<u32>>,
    stats: Cell<PoolStats>,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let total = self.slot_size * self.capacity as usize;
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, total);
        }
    }
}

/// Fixed-count pool of packet buffers. Confined to the data-plane CPU; never
/// shared across threads.
pub struct BufferPool {
    shared: Rc<PoolShared>,
}

impl BufferPool {
    /// Reserves `capacity` buffers of `slot_size` bytes each. Attempts a
    /// huge-page backed mapping first and falls back to ordinary anonymous
    /// pages, logging a warning, if the kernel refuses `MAP_HUGETLB` (most
    /// commonly because no huge pages are reserved on the host).
    pub fn new(capacity: u32, slot_size: usize) -> Result<BufferPool> {
        if capacity == 0 {
            return Err(EngineError::PoolSetup("capacity must be non-zero".into()));
        }

        let total = slot_size * capacity as usize;
        let (base, huge_pages) = Self::reserve(total)?;

        let free = (0..capacity).collect::<Vec<_>>();
        Ok(BufferPool {
            shared: Rc::new(PoolShared {
                base,
                slot_size,
                capacity,
                huge_pages,
                free: RefCell::new(free),
                stats: Cell::new(PoolStats::default()),
            }),
        })
    }

    fn reserve(total: usize) -> Result<(*mut u8, bool)> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let anon = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        unsafe {
            let huge = libc::mmap(
                std::ptr::null_mut(),
                total,
                prot,
                anon | libc::MAP_HUGETLB,
                -1,
                0,
            );
            if huge != libc::MAP_FAILED {
                return Ok((huge as *mut u8, true));
            }

            log::warn!("huge page reservation failed, falling back to ordinary pages");
            let plain = libc::mmap(std::ptr::null_mut(), total, prot, anon, -1, 0);
            if plain == libc::MAP_FAILED {
                return Err(EngineError::PoolSetup(format!(
                    "mmap of {total} bytes failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            Ok((plain as *mut u8, false))
        }
    }

    pub fn capacity(&self) -> u32 {
        self.shared.capacity
    }

    pub fn huge_pages(&self) -> bool {
        self.shared.huge_pages
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats.get()
    }

    fn mark_exhausted(&self) {
        let mut s = self.shared.stats.get();
        s.exhausted += 1;
        self.shared.stats.set(s);
    }

    /// Returns a zero-length buffer with full headroom, or `None` if the
    /// pool is exhausted.
    pub fn alloc(&self) -> Option<Buffer> {
        let slot = self.shared.free.borrow_mut().pop();
        match slot {
            Some(slot) => Some(Buffer {
                pool: Rc::clone(&self.shared),
                slot,
                len: 0,
                offload: OffloadFlags::default(),
                next: None,
            }),
            None => {
                self.mark_exhausted();
                None
            }
        }
    }

    /// Deep-copies `src`, including any segmentation chain, into freshly
    /// allocated buffers. Each flow must own an independent copy of the
    /// capture template, since concurrent in-flight descriptors would
    /// otherwise race on address rewrites.
    pub fn copy(&self, src: &Buffer) -> Option<Buffer> {
        let mut head = self.alloc()?;
        head.data_mut_full()[..src.len].copy_from_slice(src.data());
        head.len = src.len;
        head.offload = src.offload;

        if let Some(ref next) = src.next {
            head.next = Some(Box::new(self.copy(next)?));
        }
        Some(head)
    }
}

/// A packet buffer uniquely owned by whoever holds this handle. Dropping it
/// returns the backing slot (and, transitively, any chained segments) to the
/// pool it was allocated from.
pub struct Buffer {
    pool: Rc<PoolShared>,
    slot: u32,
    len: usize,
    offload: OffloadFlags,
    next: Option<Box<Buffer>>,
}

impl Buffer {
    fn slot_ptr(&self) -> *mut u8 {
        unsafe { self.pool.base.add(self.slot as usize * self.pool.slot_size) }
    }

    /// Total slot capacity usable for packet data (slot size minus
    /// headroom).
    pub fn capacity(&self) -> usize {
        self.pool.slot_size - HEADROOM
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes of headroom still available at the front of the buffer.
    pub fn headroom(&self) -> usize {
        HEADROOM
    }

    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.slot_ptr().add(HEADROOM), self.len) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        unsafe { std::slice::from_raw_parts_mut(self.slot_ptr().add(HEADROOM), len) }
    }

    fn data_mut_full(&mut self) -> &mut [u8] {
        let cap = self.capacity();
        unsafe { std::slice::from_raw_parts_mut(self.slot_ptr().add(HEADROOM), cap) }
    }

    /// Exposes the full slot capacity for an adapter to receive directly
    /// into, ahead of knowing how many bytes actually arrived.
    pub(crate) fn data_mut_for_rx(&mut self, cap: usize) -> &mut [u8] {
        debug_assert!(cap <= self.capacity());
        unsafe { std::slice::from_raw_parts_mut(self.slot_ptr().add(HEADROOM), cap) }
    }

    /// Sets the buffer's length after an out-of-band write (e.g. a raw
    /// socket `recv` into `data_mut_for_rx`).
    pub(crate) fn set_rx_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity());
        self.len = len;
    }

    /// Appends bytes to the tail of the data region, growing `len`. Returns
    /// `false` (and writes nothing) if the remaining capacity is too small;
    /// the caller is expected to chain a new segment in that case.
    #[must_use]
    pub fn append(&mut self, bytes: &[u8]) -> bool {
        if self.len + bytes.len() > self.capacity() {
            return false;
        }
        let start = self.len;
        self.data_mut_full()[start..start + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        true
    }

    pub fn offload_flags(&self) -> OffloadFlags {
        self.offload
    }

    pub fn set_offload_flags(&mut self, flags: OffloadFlags) {
        self.offload = flags;
    }

    pub fn next(&self) -> Option<&Buffer> {
        self.next.as_deref()
    }

    pub fn next_mut(&mut self) -> Option<&mut Buffer> {
        self.next.as_deref_mut()
    }

    /// Appends `seg` as the new tail of the segmentation chain.
    pub fn chain(&mut self, seg: Buffer) {
        match self.next.as_mut() {
            Some(next) => next.chain(seg),
            None => self.next = Some(Box::new(seg)),
        }
    }

    /// Number of segments in the chain, including this one.
    pub fn nb_segs(&self) -> u32 {
        1 + self.next.as_ref().map_or(0, |n| n.nb_segs())
    }

    /// Total length across the whole segmentation chain.
    pub fn total_len(&self) -> usize {
        self.len + self.next.as_ref().map_or(0, |n| n.total_len())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.pool.free.borrow_mut().push(self.slot);
    }
}
