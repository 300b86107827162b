//! Hierarchical timing wheel.
//!
//! Four wheels cascade into each other: `W[0]` has 256 one-millisecond
//! slots; `W[1..3]` each have 64 slots whose per-slot span equals the
//! *full* span of the previous wheel (256 ms, 16.384 s, ~17.48 min),
//! giving a total addressable horizon of ~18.6 h (`W[3]`'s own capacity:
//! 64 slots of ~17.48 min each). A pending FIFO catches zero-delay and
//! sub-resolution repeaters that would otherwise fall through the cracks
//! between ticks.
//!
//! Storage follows the source: a [`slab::Slab`] of entries for O(1)
//! removal by a stable key, and an `FxHashMap` from the public `id` to
//! that key for O(1) cancellation by id.

use crate::config::TimerWheelOptions;
use crate::error::{CoreError, CoreResult};
use rustc_hash::FxHashMap;
use slab::Slab;

const WHEELS: usize = 4;
const RESOLUTION_US: u64 = TimerWheelOptions::RESOLUTION_US;
const WHEEL_SIZES: [u32; WHEELS] = TimerWheelOptions::WHEEL_SIZES;

/// Per-slot-width in ticks (a tick = one resolution unit) for each wheel,
/// and each wheel's own full-revolution capacity in ticks.
struct WheelGeometry {
    span_ticks: [u64; WHEELS],
    /// `span_ticks[k] * WHEEL_SIZES[k]`: the longest delay `W[k]` can
    /// represent on its own. A timer fits the smallest `k` for which its
    /// tick count is under this, not under a sum across lower wheels —
    /// each wheel's ring wraps independently.
    capacity_ticks: [u64; WHEELS],
}

fn geometry() -> WheelGeometry {
    let mut span_ticks = [0u64; WHEELS];
    span_ticks[0] = 1;
    for k in 1..WHEELS {
        span_ticks[k] = span_ticks[k - 1] * WHEEL_SIZES[k - 1] as u64;
    }
    let mut capacity_ticks = [0u64; WHEELS];
    for k in 0..WHEELS {
        capacity_ticks[k] = span_ticks[k] * WHEEL_SIZES[k] as u64;
    }
    WheelGeometry {
        span_ticks,
        capacity_ticks,
    }
}

pub type TimerId = u64;
type SlabKey = usize;

/// `true` = reschedule if `repeat_us > 0`; `false` = remove.
pub type TimerCallback = Box<dyn FnMut(TimerId) -> bool + Send>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Location {
    Wheel { level: u8, slot: u32 },
    Pending,
    Overflow,
}

struct TimerEntry {
    id: TimerId,
    deadline_us: u64,
    repeat_us: u64,
    callback: TimerCallback,
    cancelled: bool,
    /// Set while the entry is sitting in a local "fire" batch, between
    /// being unlinked from its wheel/queue and its callback running.
    /// `cancel()` on an in-flight entry only flags it — physical removal
    /// would corrupt the batch being iterated.
    in_flight: bool,
    location: Location,
}

#[derive(Clone, Copy)]
struct SlotEntry {
    id: TimerId,
    key: SlabKey,
}

#[derive(Default)]
struct PendingEntry {
    deadline_us: u64,
    id: TimerId,
    key: SlabKey,
}

pub struct TimerWheel {
    wheels: [Vec<Vec<SlotEntry>>; WHEELS],
    current_index: [u32; WHEELS],
    overflow: Vec<SlotEntry>,
    pending: std::collections::VecDeque<PendingEntry>,
    entries: Slab<TimerEntry>,
    id_to_key: FxHashMap<TimerId, SlabKey>,
    next_id: TimerId,
    /// Absolute microsecond time of tick 0 of wheel 0; ticks are counted
    /// relative to this so wheel arithmetic stays in small integers.
    epoch_us: u64,
    geometry: WheelGeometry,
    total_cascades: u64,
}

impl TimerWheel {
    pub fn new(now_us: u64) -> Self {
        let wheels = std::array::from_fn(|i| {
            let mut slots = Vec::with_capacity(WHEEL_SIZES[i] as usize);
            slots.resize_with(WHEEL_SIZES[i] as usize, Vec::new);
            slots
        });
        Self {
            wheels,
            current_index: [0; WHEELS],
            overflow: Vec::new(),
            pending: std::collections::VecDeque::new(),
            entries: Slab::with_capacity(1024),
            id_to_key: FxHashMap::default(),
            next_id: 1,
            epoch_us: now_us,
            geometry: geometry(),
            total_cascades: 0,
        }
    }

    pub fn total_cascades(&self) -> u64 {
        self.total_cascades
    }

    fn current_tick(&self) -> u64 {
        // wheel 0's current_index doubles as the global tick counter
        // (it increments once per resolution unit and cascades the rest).
        self.current_index[0] as u64
            + self.current_index[1] as u64 * WHEEL_SIZES[0] as u64
            + self.current_index[2] as u64 * self.geometry.span_ticks[2]
            + self.current_index[3] as u64 * self.geometry.span_ticks[3]
    }

    /// Registers a new timer firing `delay_us` from `now_us`, repeating
    /// every `repeat_us` (`0` = one-shot).
    pub fn register(
        &mut self,
        now_us: u64,
        delay_us: u64,
        repeat_us: u64,
        callback: TimerCallback,
    ) -> CoreResult<TimerId> {
        let id = self.next_id;
        self.next_id = self
            .next_id
            .checked_add(1)
            .expect("timer id space exhausted");

        let deadline_us = now_us + delay_us;
        self.id_to_key
            .try_reserve(1)
            .map_err(|_| CoreError::Alloc("TimerWheel::register id_to_key"))?;
        let key = self.entries.insert(TimerEntry {
            id,
            deadline_us,
            repeat_us,
            callback,
            cancelled: false,
            in_flight: false,
            location: Location::Pending,
        });
        self.id_to_key.insert(id, key);
        self.place(now_us, deadline_us, id, key);
        Ok(id)
    }

    /// Decides which wheel/pending/overflow `key` belongs in given its
    /// deadline, and links it there.
    fn place(&mut self, now_us: u64, deadline_us: u64, id: TimerId, key: SlabKey) {
        let delay_us = deadline_us.saturating_sub(now_us);
        if delay_us < RESOLUTION_US {
            self.pending.push_back(PendingEntry {
                deadline_us,
                id,
                key,
            });
            self.entries[key].location = Location::Pending;
            return;
        }

        let ticks = delay_us / RESOLUTION_US;
        for k in 0..WHEELS {
            if ticks < self.geometry.capacity_ticks[k] {
                // `hops` counts how many of this wheel's own slot-widths
                // the deadline is out, measured from "now" rather than
                // from the start of the wheel's range: a timer exactly
                // `span_ticks[k]` out belongs one slot ahead of wherever
                // this wheel's hand currently sits, not at absolute slot
                // `hops`. The wraparound (mod size) is what lets a coarse
                // wheel represent any offset within its full revolution.
                let hops = ticks / self.geometry.span_ticks[k];
                let slot =
                    (self.current_index[k] as u64 + hops) % WHEEL_SIZES[k] as u64;
                self.wheels[k][slot as usize].push(SlotEntry { id, key });
                self.entries[key].location = Location::Wheel {
                    level: k as u8,
                    slot: slot as u32,
                };
                return;
            }
        }

        self.overflow.push(SlotEntry { id, key });
        self.entries[key].location = Location::Overflow;
    }

    /// Cancels `id`. Unknown ids are a silent no-op, matching the source.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let Some(&key) = self.id_to_key.get(&id) else {
            return false;
        };
        let entry = &mut self.entries[key];
        if entry.in_flight {
            entry.cancelled = true;
            return true;
        }
        let location = entry.location;
        self.unlink(location, id);
        self.id_to_key.remove(&id);
        self.entries.remove(key);
        true
    }

    fn unlink(&mut self, location: Location, id: TimerId) {
        match location {
            Location::Wheel { level, slot } => {
                let bucket = &mut self.wheels[level as usize][slot as usize];
                bucket.retain(|e| e.id != id);
            }
            Location::Pending => {
                self.pending.retain(|e| e.id != id);
            }
            Location::Overflow => {
                self.overflow.retain(|e| e.id != id);
            }
        }
    }

    /// Earliest deadline among all live timers, or `0` if none.
    pub fn next_event_at(&self) -> u64 {
        if let Some(head) = self.pending.front() {
            return head.deadline_us;
        }
        for k in 0..WHEELS {
            let size = WHEEL_SIZES[k];
            for offset in 0..size {
                let slot = (self.current_index[k] + offset) % size;
                if let Some(first) = self.wheels[k][slot as usize].first() {
                    if let Some(key) = self.id_to_key.get(&first.id) {
                        return self.entries[*key].deadline_us;
                    }
                }
            }
        }
        self.overflow
            .iter()
            .filter_map(|e| self.id_to_key.get(&e.id).map(|k| self.entries[*k].deadline_us))
            .min()
            .unwrap_or(0)
    }

    /// Cascades `W[k]`'s current slot down into lower wheels, then
    /// advances `W[k]`'s own pointer, cascading `W[k+1]` in turn if it
    /// wraps. When the outermost wheel wraps it drains the overflow list
    /// instead, since a timer parked there may now fit inside the wheels'
    /// combined horizon.
    fn cascade(&mut self, k: usize) {
        if k >= WHEELS {
            self.drain_overflow();
            return;
        }
        let slot = self.current_index[k];
        let drained = std::mem::take(&mut self.wheels[k][slot as usize]);
        if !drained.is_empty() {
            self.total_cascades += 1;
            tracing::trace!(level = k, slot, entries = drained.len(), "cascading wheel slot");
        }
        // Advance this wheel's hand before re-placing the drained entries:
        // `current_tick()` must reflect "now" as of the moment this slot
        // expired, not as of one slot before it, or every re-placed entry
        // would be pushed out by one extra lower-wheel span.
        self.current_index[k] = (self.current_index[k] + 1) % WHEEL_SIZES[k];
        let wrapped = self.current_index[k] == 0;
        for e in drained {
            let deadline = self.entries[e.key].deadline_us;
            let notional_now = self.epoch_us + self.current_tick() * RESOLUTION_US;
            self.place(notional_now, deadline, e.id, e.key);
        }
        if wrapped {
            self.cascade(k + 1);
        }
    }

    /// Re-examines every overflow entry against the current tick, giving
    /// timers that no longer exceed the wheels' combined horizon a chance
    /// to land in a real slot instead of sitting in overflow forever.
    fn drain_overflow(&mut self) {
        if self.overflow.is_empty() {
            return;
        }
        let drained = std::mem::take(&mut self.overflow);
        let notional_now = self.epoch_us + self.current_tick() * RESOLUTION_US;
        for e in drained {
            let deadline = self.entries[e.key].deadline_us;
            self.place(notional_now, deadline, e.id, e.key);
        }
    }

    /// Moves every pending entry due at or before `now_us` into `batch`,
    /// marking each in-flight.
    fn drain_pending_due(&mut self, now_us: u64, batch: &mut Vec<SlabKey>) {
        while let Some(head) = self.pending.front() {
            if head.deadline_us > now_us {
                break;
            }
            let entry = self.pending.pop_front().unwrap();
            self.entries[entry.key].in_flight = true;
            batch.push(entry.key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TimerWheel {
    /// Drains and fires due timers in one step, invoking each callback
    /// exactly once: the wheel decides who's due, advance/cascade
    /// bookkeeping happens first, then callbacks run in insertion order,
    /// honouring cancellation flags set mid-batch. Rescheduled repeaters
    /// are reinserted only after the whole batch has fired.
    pub fn advance(&mut self, now_us: u64) -> Vec<TimerId> {
        let mut batch: Vec<SlabKey> = Vec::new();
        self.drain_pending_due(now_us, &mut batch);

        while self.epoch_us + (self.current_tick() + 1) * RESOLUTION_US <= now_us {
            let slot = self.current_index[0];
            let drained = std::mem::take(&mut self.wheels[0][slot as usize]);
            for e in drained {
                self.entries[e.key].in_flight = true;
                batch.push(e.key);
            }
            self.current_index[0] = (self.current_index[0] + 1) % WHEEL_SIZES[0];
            if self.current_index[0] == 0 {
                self.cascade(1);
            }
        }

        // A cascade above may have re-placed an entry straight into the
        // pending queue (its remaining delay fell under one resolution
        // unit); catch it here so it fires within this same call instead
        // of waiting for the next `advance`.
        self.drain_pending_due(now_us, &mut batch);

        let mut fired_ids = Vec::with_capacity(batch.len());
        let mut to_reschedule = Vec::new();
        for key in batch {
            let cancelled = self.entries[key].cancelled;
            if cancelled {
                let id = self.entries[key].id;
                self.id_to_key.remove(&id);
                self.entries.remove(key);
                continue;
            }
            let TimerEntry {
                id,
                repeat_us,
                deadline_us,
                mut callback,
                ..
            } = self.entries.remove(key);
            self.id_to_key.remove(&id);
            let again = callback(id);
            fired_ids.push(id);
            if again && repeat_us > 0 {
                to_reschedule.push((id, deadline_us + repeat_us, repeat_us, callback));
            }
        }

        for (id, new_deadline, repeat_us, callback) in to_reschedule {
            let key = self.entries.insert(TimerEntry {
                id,
                deadline_us: new_deadline,
                repeat_us,
                callback,
                cancelled: false,
                in_flight: false,
                location: Location::Pending,
            });
            self.id_to_key.insert(id, key);
            self.place(now_us, new_deadline, id, key);
        }

        fired_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn cascade_accuracy() {
        let mut wheel = TimerWheel::new(0);
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        wheel
            .register(
                0,
                520_000,
                0,
                Box::new(move |_id| {
                    fired2.fetch_add(1, Ordering::SeqCst);
                    false
                }),
            )
            .unwrap();

        wheel.advance(256_000);
        assert_eq!(wheel.total_cascades(), 0);
        wheel.advance(512_000);
        assert_eq!(wheel.total_cascades(), 0);
        wheel.advance(768_000);
        assert_eq!(wheel.total_cascades(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sub_resolution_repeater_fires_every_advance() {
        let mut wheel = TimerWheel::new(0);
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        wheel
            .register(
                0,
                0,
                1,
                Box::new(move |_id| {
                    count2.fetch_add(1, Ordering::SeqCst);
                    true
                }),
            )
            .unwrap();

        wheel.advance(0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        for i in 1..=4u64 {
            wheel.advance(i);
        }
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert_ne!(wheel.next_event_at(), 0);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut wheel = TimerWheel::new(0);
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        let id = wheel
            .register(
                0,
                5_000,
                0,
                Box::new(move |_id| {
                    fired2.fetch_add(1, Ordering::SeqCst);
                    false
                }),
            )
            .unwrap();
        assert!(wheel.cancel(id));
        wheel.advance(10_000);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!wheel.cancel(id));
    }

    #[test]
    fn next_event_bounds_every_live_deadline() {
        let mut wheel = TimerWheel::new(0);
        wheel
            .register(0, 10_000, 0, Box::new(|_| false))
            .unwrap();
        wheel
            .register(0, 500_000, 0, Box::new(|_| false))
            .unwrap();
        let next = wheel.next_event_at();
        assert!(next <= 10_000);
    }

    #[test]
    fn unknown_id_cancel_is_silent_noop() {
        let mut wheel = TimerWheel::new(0);
        assert!(!wheel.cancel(999_999));
    }

    #[test]
    fn overflow_entry_is_redistributed_once_it_fits_the_wheels() {
        let mut wheel = TimerWheel::new(0);
        let horizon_us = wheel.geometry.capacity_ticks[WHEELS - 1] * RESOLUTION_US;
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        wheel
            .register(
                0,
                horizon_us + 5_000_000,
                0,
                Box::new(move |_id| {
                    fired2.fetch_add(1, Ordering::SeqCst);
                    false
                }),
            )
            .unwrap();
        assert_eq!(wheel.overflow.len(), 1);

        // Pretend a full revolution's worth of time has already elapsed
        // without moving any wheel hand, then trigger the same drain an
        // actual `W[3]` wrap would: the timer's remaining delay from this
        // notional "now" is well inside the wheels' horizon.
        wheel.epoch_us = horizon_us;
        wheel.drain_overflow();
        assert!(wheel.overflow.is_empty(), "overflow entry was never redistributed");

        wheel.advance(horizon_us + 5_000_000);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
