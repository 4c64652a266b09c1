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

//! A bounded, wait-free single-producer/single-consumer ring.
//!
//! This is the only channel the control-plane CPU and the data-plane CPU
//! are allowed to communicate over: no mutex, no condvar, nothing that
//! could leave the data-plane loop blocked waiting on the control plane.
//! Capacity is rounded up to a power of two so the index-to-slot mapping
//! is a mask instead of a modulo.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
}

struct RingInner<T> {
    buf: Box<[Slot<T>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

unsafe impl<T: Send> Sync for RingInner<T> {}

fn next_pow2(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Builds a ring of at least `capacity` slots, returning the producer and
/// consumer halves. Neither half is `Clone`: the single-producer/single-
/// consumer contract is enforced at the type level by there being exactly
/// one of each.
pub fn channel<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let capacity = next_pow2(capacity);
    let mut buf = Vec::with_capacity(capacity);
    for _ in 0..capacity {
        buf.push(Slot {
            value: UnsafeCell::new(MaybeUninit::uninit()),
        });
    }
    let inner = Arc::new(RingInner {
        buf: buf.into_boxed_slice(),
        mask: capacity - 1,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });
    (
        Producer {
            inner: inner.clone(),
        },
        Consumer { inner },
    )
}

pub struct Producer<T> {
    inner: Arc<RingInner<T>>,
}

pub struct Consumer<T> {
    inner: Arc<RingInner<T>>,
}

impl<T> Producer<T> {
    /// Pushes `value` if the ring has room. Returns `value` back on
    /// failure so the caller can retry, drop it, or count it as backlog;
    /// this ring never blocks.
    pub fn push(&self, value: T) -> Result<(), T> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) > self.inner.mask {
            return Err(value);
        }
        let slot = &self.inner.buf[tail & self.inner.mask];
        unsafe {
            (*slot.value.get()).write(value);
        }
        self.inner.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        tail.wrapping_sub(head) > self.inner.mask
    }
}

impl<T> Consumer<T> {
    /// Pops the oldest value, or `None` if the ring is empty.
    pub fn pop(&self) -> Option<T> {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let slot = &self.inner.buf[head & self.inner.mask];
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        self.inner.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Drains everything currently available, in FIFO order. Used by the
    /// data-plane loop to fully empty the control ring each iteration
    /// before checking the run window.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(v) = self.pop() {
            out.push(v);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);
        head == tail
    }
}

impl<T> Drop for RingInner<T> {
    fn drop(&mut self) {
        let mut head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        while head != tail {
            let slot = &self.buf[head & self.mask];
            unsafe {
                (*slot.value.get()).assume_init_drop();
            }
            head = head.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn push_pop_preserves_fifo_order() {
        let (p, c) = channel::<u32>(4);
        p.push(1).unwrap();
        p.push(2).unwrap();
        assert_eq!(c.pop(), Some(1));
        assert_eq!(c.pop(), Some(2));
        assert_eq!(c.pop(), None);
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two_and_rejects_overflow() {
        let (p, _c) = channel::<u32>(3);
        for i in 0..4 {
            p.push(i).unwrap();
        }
        assert!(p.is_full());
        assert_eq!(p.push(99), Err(99));
    }

    #[test]
    fn drain_empties_ring_in_order() {
        let (p, c) = channel::<u32>(8);
        for i in 0..5 {
            p.push(i).unwrap();
        }
        assert_eq!(c.drain(), vec![0, 1, 2, 3, 4]);
        assert!(c.is_empty());
    }

    #[test]
    fn drop_with_pending_items_does_not_leak_or_panic() {
        let (p, c) = channel::<String>(4);
        p.push("hello".to_string()).unwrap();
        p.push("world".to_string()).unwrap();
        drop(p);
        drop(c);
    }

    #[test]
    fn cross_thread_round_trip() {
        let (p, c) = channel::<u32>(1024);
        let producer = std::thread::spawn(move || {
            for i in 0..10_000u32 {
                while p.push(i).is_err() {
                    std::thread::yield_now();
                }
            }
        });
        let mut received = Vec::with_capacity(10_000);
        while received.len() < 10_000 {
            if let Some(v) = c.pop() {
                received.push(v);
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(received, (0..10_000).collect::<Vec<_>>());
    }
}
