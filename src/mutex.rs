//! Waiter-queue mutex and condition variable.
//!
//! A single 64-bit atomic word doubles as the lock state and the head
//! pointer of an intrusive FIFO of parked waiters:
//!
//! - bit 0: `locked`
//! - bit 1: `queue_latch`, a spinlock guarding the waiter list
//! - bits 2..63: pointer to the head [`Waiter`] (requires `align_of::<Waiter>() >= 4`)
//!
//! The fast path never touches the waiter list. The slow path spins
//! briefly, then falls back to parking on a per-waiter OS mutex/condvar
//! pair (`parking_lot`, as the rest of this crate already depends on it).
//!
//! Waiters are stack-allocated on the parking thread and linked in by
//! raw pointer; this is safe because a waiter cannot leave scope while
//! it might still be in the queue — the parking thread only returns from
//! `lock()` after it has been unlinked and woken.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const LOCKED: u64 = 1 << 0;
const QUEUE_LATCH: u64 = 1 << 1;
const PTR_MASK: u64 = !0b11;

const SPIN_ITERS: u32 = 40;
const SPIN_BACKOFF_MAX_US: u64 = 100;

#[repr(align(4))]
struct Waiter {
    waiting: Mutex<bool>,
    cond: Condvar,
    next: std::cell::Cell<*const Waiter>,
    /// Valid only on the current head; caches the list's tail so
    /// enqueue is O(1).
    tail: std::cell::Cell<*const Waiter>,
}

impl Waiter {
    fn new() -> Self {
        Self {
            waiting: Mutex::new(true),
            cond: Condvar::new(),
            next: std::cell::Cell::new(std::ptr::null()),
            tail: std::cell::Cell::new(std::ptr::null()),
        }
    }

    fn park(&self) {
        let mut guard = self.waiting.lock();
        while *guard {
            self.cond.wait(&mut guard);
        }
    }

    fn wake(&self) {
        let mut guard = self.waiting.lock();
        *guard = false;
        self.cond.notify_one();
    }
}

/// A mutex with a lock-free fast path and an intrusive FIFO of waiters.
///
/// Lock/unlock are infallible with the `parking_lot`-backed waiter
/// primitive used here: its OS mutex/condvar cannot fail to initialise,
/// so [`crate::error::CoreError::Os`] is part of the crate's error type
/// for API parity with the source design but this implementation never
/// produces it.
pub struct WaiterMutex {
    word: AtomicU64,
}

impl Default for WaiterMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl WaiterMutex {
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        let mut w = self.word.load(Ordering::Relaxed);
        loop {
            if w & LOCKED != 0 {
                return false;
            }
            match self.word.compare_exchange_weak(
                w,
                w | LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => w = actual,
            }
        }
    }

    pub fn try_lock(&self) -> bool {
        self.try_acquire()
    }

    pub fn lock(&self) {
        if self.try_acquire() {
            return;
        }
        loop {
            let mut backoff_us = 1u64;
            let mut acquired = false;
            for _ in 0..SPIN_ITERS {
                if self.try_acquire() {
                    acquired = true;
                    break;
                }
                std::thread::sleep(Duration::from_micros(backoff_us));
                backoff_us = (backoff_us * 2).min(SPIN_BACKOFF_MAX_US);
            }
            if acquired {
                return;
            }

            let waiter = Waiter::new();
            if self.enqueue_or_steal(&waiter) {
                return;
            }
            waiter.park();
            tracing::trace!("waiter woke from park, retrying fast path");
            if self.try_acquire() {
                return;
            }
            // not yet acquired: loop back to spin + park again.
        }
    }

    /// Acquires the queue latch, then either steals the lock (if it has
    /// gone free in the meantime) or appends `waiter` to the list.
    /// Returns `true` if the lock was acquired directly.
    fn enqueue_or_steal(&self, waiter: &Waiter) -> bool {
        loop {
            let w = self.word.load(Ordering::Relaxed);
            if w & QUEUE_LATCH != 0 {
                std::hint::spin_loop();
                continue;
            }
            match self.word.compare_exchange_weak(
                w,
                w | QUEUE_LATCH,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let latched = w | QUEUE_LATCH;
                    return self.finish_enqueue(latched, waiter);
                }
                Err(_) => continue,
            }
        }
    }

    fn finish_enqueue(&self, latched_word: u64, waiter: &Waiter) -> bool {
        if latched_word & LOCKED == 0 {
            // Lock went free while we were acquiring the latch: take it.
            let new_word = (latched_word & PTR_MASK) | LOCKED;
            self.word.store(new_word, Ordering::Release);
            return true;
        }

        let waiter_ptr = waiter as *const Waiter;
        let head_ptr = (latched_word & PTR_MASK) as *const Waiter;
        if head_ptr.is_null() {
            waiter.tail.set(waiter_ptr);
            waiter.next.set(std::ptr::null());
            let new_word = ((waiter_ptr as u64) & PTR_MASK) | LOCKED;
            self.word.store(new_word, Ordering::Release);
        } else {
            // Safety: `head_ptr`'s waiter is guaranteed to still be parked
            // (and therefore alive) because only the unlocker, which holds
            // the queue latch we just acquired, may pop the head.
            unsafe {
                let head = &*head_ptr;
                let tail_ptr = head.tail.get();
                let tail = &*tail_ptr;
                tail.next.set(waiter_ptr);
                head.tail.set(waiter_ptr);
            }
            let new_word = latched_word & !QUEUE_LATCH;
            self.word.store(new_word, Ordering::Release);
        }
        false
    }

    pub fn unlock(&self) {
        if self
            .word
            .compare_exchange(LOCKED, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.unlock_slow();
    }

    fn unlock_slow(&self) {
        let latched_word = loop {
            let w = self.word.load(Ordering::Relaxed);
            if w & QUEUE_LATCH != 0 {
                std::hint::spin_loop();
                continue;
            }
            match self.word.compare_exchange_weak(
                w,
                w | QUEUE_LATCH,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => break w | QUEUE_LATCH,
                Err(_) => continue,
            }
        };

        let head_ptr = (latched_word & PTR_MASK) as *const Waiter;
        if head_ptr.is_null() {
            self.word.store(0, Ordering::Release);
            return;
        }

        // Safety: the head waiter is still parked; we hold the latch so
        // no concurrent locker can pop or mutate the list underneath us.
        let head = unsafe { &*head_ptr };
        let next_ptr = head.next.get();
        let new_word = if next_ptr.is_null() {
            0
        } else {
            // Safety: same as above — `next_ptr`'s waiter is still parked.
            unsafe {
                (*next_ptr).tail.set(head.tail.get());
            }
            (next_ptr as u64) & PTR_MASK
        };
        // Intentionally clears the `locked` bit here even when another
        // waiter remains queued: this is the documented steal window — a
        // fresh `lock()` may race in and win before `head` is woken. The
        // parked waiter's retry loop in `lock()` re-checks and re-parks
        // rather than assuming it inherited ownership.
        self.word.store(new_word, Ordering::Release);
        tracing::trace!("waking head waiter after unlock");
        head.wake();
    }
}

/// A condition variable associated with, but not owned by, a
/// [`WaiterMutex`]. Its waiter queue is guarded by a plain OS mutex
/// (`parking_lot::Mutex`) rather than the lock-free word, matching the
/// source's description of "the condvar's internal OS mutex".
pub struct WaiterCond {
    queue: Mutex<std::collections::VecDeque<std::sync::Arc<CondNode>>>,
}

struct CondNode {
    waiting: Mutex<bool>,
    cond: Condvar,
}

impl CondNode {
    fn new() -> Self {
        Self {
            waiting: Mutex::new(true),
            cond: Condvar::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signalled,
    TimedOut,
}

impl Default for WaiterCond {
    fn default() -> Self {
        Self::new()
    }
}

impl WaiterCond {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Atomically releases `user_mutex` and parks; re-acquires
    /// `user_mutex` before returning.
    pub fn wait(&self, user_mutex: &WaiterMutex) {
        let node = std::sync::Arc::new(CondNode::new());
        self.queue.lock().push_back(node.clone());
        user_mutex.unlock();

        let mut guard = node.waiting.lock();
        while *guard {
            node.cond.wait(&mut guard);
        }
        drop(guard);

        user_mutex.lock();
    }

    /// As [`Self::wait`], but gives up after `timeout` and splices itself
    /// out of the queue. If a concurrent `signal()` already claimed this
    /// waiter by the time it tries to splice out, it waits once more to
    /// consume that signal rather than losing it.
    pub fn wait_timeout(&self, user_mutex: &WaiterMutex, timeout: Duration) -> WaitOutcome {
        let node = std::sync::Arc::new(CondNode::new());
        self.queue.lock().push_back(node.clone());
        user_mutex.unlock();

        let deadline = Instant::now() + timeout;
        let outcome = {
            let mut guard = node.waiting.lock();
            loop {
                if !*guard {
                    break WaitOutcome::Signalled;
                }
                let now = Instant::now();
                if now >= deadline {
                    break WaitOutcome::TimedOut;
                }
                let result = node.cond.wait_for(&mut guard, deadline - now);
                if result.timed_out() && *guard {
                    break WaitOutcome::TimedOut;
                }
                // else: spurious wake or real signal; loop re-checks `*guard`.
            }
        };

        let outcome = if outcome == WaitOutcome::TimedOut {
            let mut q = self.queue.lock();
            if let Some(pos) = q.iter().position(|n| std::sync::Arc::ptr_eq(n, &node)) {
                q.remove(pos);
                WaitOutcome::TimedOut
            } else {
                drop(q);
                // Already popped by a concurrent signal(): the signal must
                // not be lost, so wait once more to consume it.
                let mut guard = node.waiting.lock();
                while *guard {
                    node.cond.wait(&mut guard);
                }
                WaitOutcome::Signalled
            }
        } else {
            outcome
        };

        user_mutex.lock();
        outcome
    }

    /// Wakes the longest-waiting parked thread, if any.
    pub fn signal(&self) {
        let node = self.queue.lock().pop_front();
        if let Some(node) = node {
            let mut guard = node.waiting.lock();
            *guard = false;
            node.cond.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn uncontended_lock_unlock() {
        let m = WaiterMutex::new();
        assert!(m.try_lock());
        assert!(!m.try_lock());
        m.unlock();
        assert!(m.try_lock());
        m.unlock();
    }

    #[test]
    fn eight_threads_each_increment_100k_times() {
        let m = Arc::new(WaiterMutex::new());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = m.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100_000 {
                    m.lock();
                    counter.fetch_add(1, Ordering::Relaxed);
                    m.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 800_000);
    }

    #[test]
    fn cond_signal_wakes_exactly_one_waiter() {
        let user_mutex = Arc::new(WaiterMutex::new());
        let cond = Arc::new(WaiterCond::new());
        user_mutex.lock();

        let woken = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let user_mutex = user_mutex.clone();
            let cond = cond.clone();
            let woken = woken.clone();
            handles.push(thread::spawn(move || {
                user_mutex.lock();
                cond.wait(&user_mutex);
                woken.fetch_add(1, Ordering::Relaxed);
                user_mutex.unlock();
            }));
        }
        // Give the waiters a chance to park.
        thread::sleep(Duration::from_millis(50));
        user_mutex.unlock();

        cond.signal();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(woken.load(Ordering::Relaxed), 1);

        cond.signal();
        cond.signal();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn cond_timed_wait_reports_timeout() {
        let user_mutex = WaiterMutex::new();
        let cond = WaiterCond::new();
        user_mutex.lock();
        let outcome = cond.wait_timeout(&user_mutex, Duration::from_millis(20));
        assert_eq!(outcome, WaitOutcome::TimedOut);
        user_mutex.unlock();
    }
}
