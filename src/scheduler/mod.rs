//! A priority timer queue driven either by a dedicated background
//! thread (blocking mode) or ticked opportunistically on every
//! `report(...)` call (inline-drive mode) — spec §4.5.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{stats::Statistics, ticker::Ticker};

type Action = Box<dyn FnOnce() + Send>;

struct Event {
    due_nanos: i64,
    priority: i64,
    seq: u64,
    action: Action,
}

// `BinaryHeap` is a max-heap; reversing the comparisons makes it pop
// the event with the smallest (dueTime, priority, seq) first, per spec
// §4.5 "keyed on (dueTime ascending, priority ascending)". `seq` breaks
// ties beyond priority so `enter` order is preserved.
impl Ord for Event {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due_nanos
            .cmp(&self.due_nanos)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.due_nanos == other.due_nanos && self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Event {}

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<Event>,
    next_seq: u64,
}

/// The priority timer queue itself. The queue's lock is released
/// before an action runs, so actions may freely call `enter` again
/// (spec §4.5 "Concurrency").
pub struct Scheduler {
    ticker: Arc<dyn Ticker>,
    state: Mutex<SchedulerState>,
    condvar: Condvar,
    stopped: AtomicBool,
    stats: Arc<Statistics>,
}

impl Scheduler {
    pub fn new(ticker: Arc<dyn Ticker>, stats: Arc<Statistics>) -> Self {
        Scheduler {
            ticker,
            state: Mutex::new(SchedulerState::default()),
            condvar: Condvar::new(),
            stopped: AtomicBool::new(false),
            stats,
        }
    }

    /// Schedules `action` to run at `now + deltaMillis`. Lower
    /// `priority` values run earlier when two actions share a due time.
    pub fn enter<F>(&self, action: F, delta_millis: i64, priority: i64)
    where
        F: FnOnce() + Send + 'static,
    {
        let due_nanos = self
            .ticker
            .now_nanos()
            .saturating_add(delta_millis.saturating_mul(1_000_000));
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Event {
            due_nanos,
            priority,
            seq,
            action: Box::new(action),
        });
        drop(state);
        self.condvar.notify_all();
    }

    /// Drains the queue. When the head event is due, it is removed and
    /// run with the lock released. When it is not yet due: if `block`,
    /// sleeps until it is (waking early if `enter` adds something
    /// sooner); if not, returns immediately. Loops until the queue is
    /// empty or [`Self::stop`] has been called.
    pub fn run(&self, block: bool) {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }

            let mut state = self.state.lock();
            let due_nanos = match state.queue.peek() {
                Some(event) => event.due_nanos,
                None => return,
            };

            let now = self.ticker.now_nanos();
            if due_nanos > now {
                if !block {
                    self.stats.record_scheduler_skip(0);
                    return;
                }
                let wait_nanos = (due_nanos - now).max(0) as u64;
                self.condvar
                    .wait_for(&mut state, Duration::from_nanos(wait_nanos));
                self.stats.record_scheduler_skip(wait_nanos as i64);
                continue;
            }

            // `peek` told us the queue is non-empty; `pop` cannot fail.
            let event = state.queue.pop().expect("queue non-empty after peek");
            drop(state);

            let start = self.ticker.now_nanos();
            (event.action)();
            let elapsed = self.ticker.now_nanos().saturating_sub(start);
            self.stats.record_scheduler_run(elapsed);
        }
    }

    /// `run(block = true)`.
    pub fn run_blocking(&self) {
        self.run(true);
    }

    /// Sets the stopped flag read at the top of every `run` iteration.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Number of pending events, for diagnostics/tests.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }
}
