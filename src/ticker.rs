// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use once_cell::sync::Lazy;

/// A monotonic nanosecond clock, injected into the aggregators, the
/// scheduler and the client facade so all TTL/cadence math can be
/// driven deterministically in tests (spec §6 "Ticker (consumed)").
pub trait Ticker: Send + Sync {
    fn now_nanos(&self) -> i64;
}

/// The real clock: `Instant::now()` relative to a fixed process-start
/// epoch, converted to nanoseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTicker;

static PROCESS_EPOCH: Lazy<std::time::Instant> = Lazy::new(std::time::Instant::now);

impl Ticker for SystemTicker {
    fn now_nanos(&self) -> i64 {
        PROCESS_EPOCH.elapsed().as_nanos() as i64
    }
}

impl SystemTicker {
    pub fn shared() -> Arc<dyn Ticker> {
        Arc::new(SystemTicker)
    }
}

/// A controllable clock for tests: starts at a fixed value and only
/// moves when `advance`/`set` is called.
#[derive(Debug, Default)]
pub struct FakeTicker {
    nanos: AtomicI64,
}

impl FakeTicker {
    pub fn new(start_nanos: i64) -> Arc<Self> {
        Arc::new(FakeTicker {
            nanos: AtomicI64::new(start_nanos),
        })
    }

    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_nanos: i64) {
        self.nanos.fetch_add(delta_nanos, Ordering::SeqCst);
    }
}

impl Ticker for FakeTicker {
    fn now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}
