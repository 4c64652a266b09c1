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

//! A microsecond-resolution event scheduler over the cycle counter in
//! `crate::cycles`.
//!
//! Slots live in a flat `Vec` rather than a tree: the generator only ever
//! schedules events a few hundred milliseconds out and fires them in
//! roughly arrival order, so a sorted-insert timer wheel beats a
//! priority queue on cache behavior at the burst sizes this loop runs.
//! `process_due` is called once per data-plane iteration and drains
//! everything at or before the current tick.

use crate::cycles::current_cycles;

/// Lifecycle of a single event slot. A slot starts `Idle`, moves to `Armed`
/// once scheduled, and to `Firing` for the duration of its callback so a
/// callback that reschedules itself (as every steady-state flow event does)
/// is never mistaken for a still-pending, unfired event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Armed,
    Firing,
}

struct Slot<T> {
    state: SlotState,
    due_cycles: u64,
    payload: T,
}

/// An opaque handle to a scheduled slot. Stays valid across reschedules of
/// the same slot (`reschedule`), but is invalidated once the slot fires and
/// is not immediately rearmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(usize);

/// A sorted-insert timer wheel keyed on absolute cycle counts.
///
/// `T` is whatever payload the caller wants delivered back on fire; the
/// flow generator uses it to carry a `(generator_id, flow_id)` pair rather
/// than a pointer back into its own arena (see `crate::flow`).
pub struct EventScheduler<T> {
    slots: Vec<Slot<T>>,
    /// Indices into `slots` holding armed events, kept sorted ascending by
    /// `due_cycles` so `process_due` can stop at the first not-yet-due
    /// entry.
    armed: Vec<usize>,
}

impl<T> Default for EventScheduler<T> {
    fn default() -> Self {
        EventScheduler {
            slots: Vec::new(),
            armed: Vec::new(),
        }
    }
}

impl<T> EventScheduler<T> {
    pub fn new() -> EventScheduler<T> {
        EventScheduler::default()
    }

    /// Number of currently armed slots. Must always equal the number of
    /// live flow handles that have a pending event outstanding; a mismatch
    /// means a flow either leaked an event or was double-scheduled.
    pub fn live_event_count(&self) -> usize {
        self.armed.len()
    }

    /// Arms a new slot due at `due_cycles`, returning its handle.
    pub fn schedule(&mut self, due_cycles: u64, payload: T) -> EventHandle {
        let index = self.slots.len();
        self.slots.push(Slot {
            state: SlotState::Armed,
            due_cycles,
            payload,
        });
        self.insert_sorted(index, due_cycles);
        EventHandle(index)
    }

    fn insert_sorted(&mut self, index: usize, due_cycles: u64) {
        let pos = self
            .armed
            .partition_point(|&i| self.slots[i].due_cycles <= due_cycles);
        self.armed.insert(pos, index);
    }

    /// Re-arms an existing, currently-firing slot for a new due time. Valid
    /// only from within the callback passed to `process_due`, which is the
    /// only place a slot is ever in `Firing` state.
    fn rearm(&mut self, handle: EventHandle, due_cycles: u64) {
        let slot = &mut self.slots[handle.0];
        debug_assert_eq!(slot.state, SlotState::Firing);
        slot.state = SlotState::Armed;
        slot.due_cycles = due_cycles;
        self.insert_sorted(handle.0, due_cycles);
    }

    /// Cancels an armed slot. No-op if the slot already fired and was not
    /// rearmed.
    pub fn cancel(&mut self, handle: EventHandle) {
        if let Some(pos) = self.armed.iter().position(|&i| i == handle.0) {
            self.armed.remove(pos);
        }
        self.slots[handle.0].state = SlotState::Idle;
    }

    /// Fires every slot due at or before the current tick, in due-time
    /// order. `f` receives the handle (so it can `reschedule` via the
    /// second closure argument) and the payload by reference.
    ///
    /// Returns the number of events fired this call.
    pub fn process_due<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(EventHandle, &T) -> Option<u64>,
    {
        let now = current_cycles();
        let mut fired = 0;

        loop {
            let Some(&index) = self.armed.first() else {
                break;
            };
            if self.slots[index].due_cycles > now {
                break;
            }
            self.armed.remove(0);
            self.slots[index].state = SlotState::Firing;

            let handle = EventHandle(index);
            let next_due = f(handle, &self.slots[index].payload);
            fired += 1;

            match next_due {
                Some(due) => self.rearm(handle, due),
                None => self.slots[index].state = SlotState::Idle,
            }
        }
        fired
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn schedule_then_cancel_drops_live_count() {
        let mut s: EventScheduler<u32> = EventScheduler::new();
        let h = s.schedule(current_cycles(), 7);
        assert_eq!(s.live_event_count(), 1);
        s.cancel(h);
        assert_eq!(s.live_event_count(), 0);
    }

    #[test]
    fn process_due_only_fires_past_events() {
        let mut s: EventScheduler<u32> = EventScheduler::new();
        let far_future = current_cycles() + crate::cycles::cycles_per_second() * 1000;
        s.schedule(far_future, 1);
        s.schedule(current_cycles(), 2);

        let mut fired = Vec::new();
        s.process_due(|_, payload| {
            fired.push(*payload);
            None
        });

        assert_eq!(fired, vec![2]);
        assert_eq!(s.live_event_count(), 1);
    }

    #[test]
    fn rescheduling_event_keeps_live_count_stable() {
        let mut s: EventScheduler<u32> = EventScheduler::new();
        s.schedule(current_cycles(), 0);

        let mut fires = 0;
        while fires < 3 {
            let n = s.process_due(|_, _| {
                fires += 1;
                if fires < 3 {
                    Some(current_cycles())
                } else {
                    None
                }
            });
            if n == 0 {
                break;
            }
        }

        assert_eq!(fires, 3);
        assert_eq!(s.live_event_count(), 0);
    }

    #[test]
    fn fires_in_due_time_order() {
        let mut s: EventScheduler<u32> = EventScheduler::new();
        let base = current_cycles();
        s.schedule(base + 300, 3);
        s.schedule(base, 1);
        s.schedule(base + 100, 2);

        std::thread::sleep(std::time::Duration::from_millis(1));

        let mut order = Vec::new();
        // Drain in two passes since the +300 one may not be due yet on slow
        // hosts; what matters is relative ordering of what did fire.
        s.process_due(|_, p| {
            order.push(*p);
            None
        });
        assert_eq!(order.first(), Some(&1));
    }
}
