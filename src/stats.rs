// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
};

/// Atomic counters the client facade updates on every call, plus a
/// stable human-readable summary (spec §4.6 "Statistics").
#[derive(Debug, Default)]
pub struct Statistics {
    checks_total: AtomicU64,
    checks_hits: AtomicU64,
    quota_total: AtomicU64,
    quota_hits: AtomicU64,
    direct_reports: AtomicU64,
    flushed_reports: AtomicU64,
    reported_operations: AtomicU64,
    flushed_operations: AtomicU64,
    scheduler_runs: AtomicU64,
    scheduler_skips: AtomicU64,
    scheduler_run_nanos: AtomicI64,
    scheduler_skip_nanos: AtomicI64,
}

/// A point-in-time copy of [`Statistics`], safe to hold and format
/// without further atomic reads. Not part of the original spec
/// surface; added so callers can read a consistent snapshot instead of
/// racing individual counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub checks_total: u64,
    pub checks_hits: u64,
    pub quota_total: u64,
    pub quota_hits: u64,
    pub direct_reports: u64,
    pub flushed_reports: u64,
    pub reported_operations: u64,
    pub flushed_operations: u64,
    pub scheduler_runs: u64,
    pub scheduler_skips: u64,
    pub scheduler_run_nanos: i64,
    pub scheduler_skip_nanos: i64,
}

impl Statistics {
    pub fn record_check(&self, hit: bool) {
        self.checks_total.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.checks_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_quota(&self, hit: bool) {
        self.quota_total.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.quota_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_direct_report(&self, operations: u64) {
        self.direct_reports.fetch_add(1, Ordering::Relaxed);
        self.reported_operations.fetch_add(operations, Ordering::Relaxed);
    }

    pub fn record_flushed_report(&self, operations: u64) {
        self.flushed_reports.fetch_add(1, Ordering::Relaxed);
        self.flushed_operations.fetch_add(operations, Ordering::Relaxed);
    }

    pub fn record_scheduler_run(&self, elapsed_nanos: i64) {
        self.scheduler_runs.fetch_add(1, Ordering::Relaxed);
        self.scheduler_run_nanos.fetch_add(elapsed_nanos, Ordering::Relaxed);
    }

    pub fn record_scheduler_skip(&self, elapsed_nanos: i64) {
        self.scheduler_skips.fetch_add(1, Ordering::Relaxed);
        self.scheduler_skip_nanos.fetch_add(elapsed_nanos, Ordering::Relaxed);
    }

    /// A consistent point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            checks_total: self.checks_total.load(Ordering::Relaxed),
            checks_hits: self.checks_hits.load(Ordering::Relaxed),
            quota_total: self.quota_total.load(Ordering::Relaxed),
            quota_hits: self.quota_hits.load(Ordering::Relaxed),
            direct_reports: self.direct_reports.load(Ordering::Relaxed),
            flushed_reports: self.flushed_reports.load(Ordering::Relaxed),
            reported_operations: self.reported_operations.load(Ordering::Relaxed),
            flushed_operations: self.flushed_operations.load(Ordering::Relaxed),
            scheduler_runs: self.scheduler_runs.load(Ordering::Relaxed),
            scheduler_skips: self.scheduler_skips.load(Ordering::Relaxed),
            scheduler_run_nanos: self.scheduler_run_nanos.load(Ordering::Relaxed),
            scheduler_skip_nanos: self.scheduler_skip_nanos.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.snapshot();
        writeln!(f, "checks:")?;
        writeln!(f, "  total: {}", s.checks_total)?;
        writeln!(f, "  hits: {}", s.checks_hits)?;
        writeln!(f, "quota:")?;
        writeln!(f, "  total: {}", s.quota_total)?;
        writeln!(f, "  hits: {}", s.quota_hits)?;
        writeln!(f, "report:")?;
        writeln!(f, "  direct: {}", s.direct_reports)?;
        writeln!(f, "  flushed: {}", s.flushed_reports)?;
        writeln!(f, "  reportedOperations: {}", s.reported_operations)?;
        writeln!(f, "  flushedOperations: {}", s.flushed_operations)?;
        writeln!(f, "scheduler:")?;
        writeln!(f, "  runs: {}", s.scheduler_runs)?;
        writeln!(f, "  skips: {}", s.scheduler_skips)?;
        writeln!(f, "  runNanos: {}", s.scheduler_run_nanos)?;
        write!(f, "  skipNanos: {}", s.scheduler_skip_nanos)
    }
}
