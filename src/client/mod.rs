//! The [`Client`] facade: binds the three aggregators, the [`Transport`]
//! and the background [`Scheduler`] into one lifecycle-managed entry
//! point (spec §4.6).

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, Weak,
    atomic::{AtomicI64, AtomicU64, Ordering},
};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    aggregator::{
        AllocateQuotaRequest, AllocateQuotaResponse, CheckAggregator, CheckOutcome, CheckRequest,
        CheckResponse, QuotaAggregator, QuotaOutcome, ReportAggregator, ReportOutcome,
        ReportRequest,
    },
    cfg::config::Configuration,
    error::{Error, Result},
    scheduler::Scheduler,
    stats::Statistics,
    thread_factory::ThreadFactory,
    ticker::Ticker,
    transport::Transport,
};

/// Lifecycle state of the [`Client`] facade (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Stopped,
    Running,
    Stopping,
}

/// Binds one of each aggregator to a [`Transport`], a [`ThreadFactory`]
/// and a [`Ticker`], driving background flush/refresh work through a
/// [`Scheduler`].
pub struct Client {
    config: Configuration,
    check: CheckAggregator,
    quota: QuotaAggregator,
    report: ReportAggregator,
    transport: Arc<dyn Transport>,
    thread_factory: Arc<dyn ThreadFactory>,
    ticker: Arc<dyn Ticker>,
    scheduler: Arc<Scheduler>,
    stats: Arc<Statistics>,
    state: Mutex<ClientState>,
    background: Mutex<Option<std::thread::JoinHandle<()>>>,
    inline_drive: std::sync::atomic::AtomicBool,
    report_calls: AtomicU64,
    last_nonempty_flush_nanos: AtomicI64,
    self_weak: OnceCell<Weak<Client>>,
}

impl Client {
    pub fn new(
        config: Configuration,
        transport: Arc<dyn Transport>,
        thread_factory: Arc<dyn ThreadFactory>,
        ticker: Arc<dyn Ticker>,
    ) -> Arc<Self> {
        let stats = Arc::new(Statistics::default());
        let scheduler = Arc::new(Scheduler::new(ticker.clone(), stats.clone()));
        let client = Arc::new(Client {
            check: CheckAggregator::new(config.check, ticker.clone()),
            quota: QuotaAggregator::new(config.quota, ticker.clone()),
            report: ReportAggregator::new(config.report, ticker.clone()),
            transport,
            thread_factory,
            ticker: ticker.clone(),
            scheduler,
            stats,
            state: Mutex::new(ClientState::Stopped),
            background: Mutex::new(None),
            inline_drive: std::sync::atomic::AtomicBool::new(false),
            report_calls: AtomicU64::new(0),
            last_nonempty_flush_nanos: AtomicI64::new(ticker.now_nanos()),
            self_weak: OnceCell::new(),
            config,
        });
        let _ = client.self_weak.set(Arc::downgrade(&client));
        client
    }

    /// Transitions Stopped → Running: attempts to spawn the background
    /// scheduler thread, falling back to inline-drive mode if thread
    /// creation fails (spec §4.6 "Start").
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if *state != ClientState::Stopped {
            return Ok(());
        }

        let scheduler = self.scheduler.clone();
        match self
            .thread_factory
            .spawn(Box::new(move || scheduler.run_blocking()))
        {
            Ok(handle) => {
                *self.background.lock() = Some(handle);
                self.inline_drive.store(false, Ordering::SeqCst);
                info!("client started with background scheduler thread");
            },
            Err(err) => {
                warn!(error = %err, "failed to spawn background thread, falling back to inline-drive mode");
                self.inline_drive.store(true, Ordering::SeqCst);
            },
        }

        // Only worth scheduling these off the priority queue when a
        // background thread is actually driving it; inline-drive mode
        // flushes reports opportunistically from `report()` instead and
        // has no regular cadence for the quota refresh to hang off.
        if !self.inline_drive.load(Ordering::SeqCst) {
            self.schedule_quota_flush();
            self.schedule_report_flush();
        }

        *state = ClientState::Running;
        Ok(())
    }

    /// Transitions Running → Stopping → Stopped. Fails with
    /// `IllegalState` if the facade is not running.
    pub fn stop(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if *state != ClientState::Running {
            return Err(Error::IllegalState("stop() called while not running".into()));
        }
        *state = ClientState::Stopping;
        self.scheduler.stop();
        if let Some(handle) = self.background.lock().take() {
            let _ = handle.join();
        }
        self.clear_all();
        *state = ClientState::Stopped;
        info!("client stopped");
        Ok(())
    }

    /// Consults the check cache; on miss, calls the Transport and
    /// populates it. Fails open on Transport failure (spec §4.6 "Check
    /// path").
    pub fn check(self: &Arc<Self>, req: CheckRequest) -> Result<Option<CheckResponse>> {
        self.ensure_started()?;
        match self.check.check(&req, &self.config.facade.service_name)? {
            CheckOutcome::Hit(resp) => {
                self.stats.record_check(true);
                Ok(Some(resp))
            },
            CheckOutcome::Miss => {
                self.stats.record_check(false);
                if self.check.is_flushing(&req) {
                    debug!("refreshing a check entry that already had a refresh in flight");
                }
                match self.transport.check(&self.config.facade.service_name, &req) {
                    Ok(resp) => {
                        self.check.add_response(&req, resp.clone());
                        Ok(Some(resp))
                    },
                    Err(err) => {
                        warn!(error = %err, "check transport failure, failing open");
                        Ok(None)
                    },
                }
            },
        }
    }

    /// Symmetric to [`Self::check`]; on Transport failure, caches and
    /// returns a default-empty grant rather than hammering a failing
    /// upstream (spec §4.6 "Quota path").
    pub fn allocate_quota(
        self: &Arc<Self>,
        req: AllocateQuotaRequest,
    ) -> Result<AllocateQuotaResponse> {
        self.ensure_started()?;
        match self.quota.allocate_quota(&req)? {
            QuotaOutcome::Allocated(resp) => {
                self.stats.record_quota(true);
                Ok(resp)
            },
            QuotaOutcome::Miss => {
                self.stats.record_quota(false);
                match self
                    .transport
                    .allocate_quota(&self.config.facade.service_name, &req)
                {
                    Ok(resp) => {
                        self.quota.cache_response(&req, resp.clone());
                        Ok(resp)
                    },
                    Err(err) => {
                        warn!(error = %err, "quota transport failure, granting default-empty allocation");
                        let default_resp = AllocateQuotaResponse {
                            operation_id: req.operation.operation_id.clone(),
                            granted_amounts: Default::default(),
                        };
                        self.quota.cache_response(&req, default_resp.clone());
                        Ok(default_resp)
                    },
                }
            },
        }
    }

    /// Attempts to merge `req` into the report aggregator; on decline,
    /// sends it directly (errors logged, not propagated). In
    /// inline-drive mode, also flushes the report aggregator directly —
    /// there is no background thread driving the scheduler's recurring
    /// flush tick, so `report()` itself is the only opportunity to drain
    /// merged operations to the Transport (spec §4.6 "Report path", §5
    /// "Inline-drive mode").
    pub fn report(self: &Arc<Self>, req: ReportRequest) -> Result<()> {
        self.ensure_started()?;
        let operation_count = req.operations.len() as u64;
        match self.report.report(&req) {
            ReportOutcome::Merged => {
                debug!(operations = operation_count, "report merged into aggregator");
            },
            ReportOutcome::Declined => {
                if let Err(err) = self
                    .transport
                    .report(&self.config.facade.service_name, &req)
                {
                    warn!(error = %err, "direct report failed, dropping (fail-silent)");
                }
                self.stats.record_direct_report(operation_count);
            },
        }

        let calls = self.report_calls.fetch_add(1, Ordering::Relaxed) + 1;
        self.maybe_log_stats(calls);

        if self.inline_drive.load(Ordering::SeqCst) {
            self.flush_reports_inline();
        }
        Ok(())
    }

    /// Drains the report aggregator and ships every batch directly to
    /// the Transport (errors logged, not propagated). This is
    /// inline-drive mode's substitute for the scheduler-driven
    /// `run_report_flush` tick, which never fires without a background
    /// thread.
    fn flush_reports_inline(&self) {
        for batch in self.report.flush() {
            let operations = batch.operations.len() as u64;
            match self.transport.report(&self.config.facade.service_name, &batch) {
                Ok(()) => self.stats.record_flushed_report(operations),
                Err(err) => warn!(error = %err, "inline-drive report flush failed"),
            }
        }
    }

    /// A consistent snapshot of the facade's statistics.
    pub fn stats(&self) -> crate::stats::StatisticsSnapshot {
        self.stats.snapshot()
    }

    fn ensure_started(self: &Arc<Self>) -> Result<()> {
        let needs_start = {
            let state = self.state.lock();
            *state == ClientState::Stopped
        };
        if needs_start {
            self.start()?;
        }
        Ok(())
    }

    /// Drops all cached state and, per spec §4.3 ("`clear()`... like
    /// flush, but also empties"), ships whatever was still pending in
    /// the report aggregator to the Transport rather than discarding it
    /// — the same fail-silent policy `run_report_flush` uses.
    fn clear_all(&self) {
        self.check.clear();
        self.quota.clear();
        for batch in self.report.clear() {
            let operations = batch.operations.len() as u64;
            match self.transport.report(&self.config.facade.service_name, &batch) {
                Ok(()) => self.stats.record_flushed_report(operations),
                Err(err) => warn!(error = %err, "shutdown report flush failed"),
            }
        }
    }

    fn maybe_log_stats(&self, calls: u64) {
        let frequency = self.config.facade.stats_log_frequency;
        if frequency > 0 && calls % frequency as u64 == 0 {
            info!(stats = %self.stats, "periodic statistics summary");
        }
    }

    /// Schedules the recurring quota-refresh tick. Disabled in
    /// inline-drive mode, which has no regular cadence to hang this off
    /// (spec §5 "Inline-drive mode").
    fn schedule_quota_flush(self: &Arc<Self>) {
        if self.inline_drive.load(Ordering::SeqCst) {
            return;
        }
        let weak = self.self_weak.get().cloned().unwrap_or_default();
        let interval = self.config.quota.refresh_millis.max(1);
        self.scheduler.enter(
            move || {
                if let Some(client) = weak.upgrade() {
                    client.run_quota_flush();
                }
            },
            interval,
            0,
        );
    }

    fn run_quota_flush(self: &Arc<Self>) {
        if self.inline_drive.load(Ordering::SeqCst) {
            return;
        }
        for refresh in self.quota.flush() {
            match self
                .transport
                .allocate_quota(&self.config.facade.service_name, &refresh)
            {
                Ok(resp) => self.quota.cache_response(&refresh, resp),
                Err(err) => warn!(error = %err, "quota refresh failed"),
            }
        }
        let interval = self.config.quota.refresh_millis.max(1);
        self.scheduler.enter(
            {
                let weak = self.self_weak.get().cloned().unwrap_or_default();
                move || {
                    if let Some(client) = weak.upgrade() {
                        client.run_quota_flush();
                    }
                }
            },
            interval,
            0,
        );
    }

    /// Schedules the recurring report-flush tick, which also drives
    /// the idle-shutdown heuristic (spec §4.6 "Idle shutdown").
    fn schedule_report_flush(self: &Arc<Self>) {
        if self.inline_drive.load(Ordering::SeqCst) {
            return;
        }
        let weak = self.self_weak.get().cloned().unwrap_or_default();
        let interval = self.config.report.flush_interval_millis.max(1);
        self.scheduler.enter(
            move || {
                if let Some(client) = weak.upgrade() {
                    client.run_report_flush();
                }
            },
            interval,
            1,
        );
    }

    fn run_report_flush(self: &Arc<Self>) {
        if self.inline_drive.load(Ordering::SeqCst) {
            return;
        }
        let batches = self.report.flush();
        if batches.is_empty() {
            let idle_nanos = self
                .ticker
                .now_nanos()
                .saturating_sub(self.last_nonempty_flush_nanos.load(Ordering::SeqCst));
            let idle_limit_nanos = (self.config.facade.max_idle_seconds as i64).saturating_mul(1_000_000_000);
            if idle_nanos > idle_limit_nanos {
                info!("idle for longer than maxIdleSeconds, self-stopping");
                self.scheduler.stop();
                *self.state.lock() = ClientState::Stopped;
                return;
            }
        } else {
            self.last_nonempty_flush_nanos
                .store(self.ticker.now_nanos(), Ordering::SeqCst);
            for batch in batches {
                let operations = batch.operations.len() as u64;
                match self.transport.report(&self.config.facade.service_name, &batch) {
                    Ok(()) => self.stats.record_flushed_report(operations),
                    Err(err) => warn!(error = %err, "flushed report failed"),
                }
            }
        }

        let interval = self.config.report.flush_interval_millis.max(1);
        self.scheduler.enter(
            {
                let weak = self.self_weak.get().cloned().unwrap_or_default();
                move || {
                    if let Some(client) = weak.upgrade() {
                        client.run_report_flush();
                    }
                }
            },
            interval,
            1,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex as StdMutex};

    use super::*;
    use crate::{
        cfg::config::{CheckConfig, FacadeConfig, QuotaConfig, ReportConfig},
        model::{Importance, Operation, Timestamp},
        ticker::FakeTicker,
    };

    struct FailingThreadFactory;
    impl ThreadFactory for FailingThreadFactory {
        fn spawn(
            &self,
            _task: Box<dyn FnOnce() + Send + 'static>,
        ) -> std::io::Result<std::thread::JoinHandle<()>> {
            Err(std::io::Error::other("threads unavailable"))
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        reports: StdMutex<Vec<ReportRequest>>,
    }

    impl Transport for RecordingTransport {
        fn check(&self, _service_name: &str, req: &CheckRequest) -> Result<CheckResponse> {
            Ok(CheckResponse {
                operation_id: req.operation.operation_id.clone(),
                attributes: Default::default(),
            })
        }

        fn allocate_quota(
            &self,
            _service_name: &str,
            req: &AllocateQuotaRequest,
        ) -> Result<AllocateQuotaResponse> {
            Ok(AllocateQuotaResponse {
                operation_id: req.operation.operation_id.clone(),
                granted_amounts: BTreeMap::new(),
            })
        }

        fn report(&self, _service_name: &str, req: &ReportRequest) -> Result<()> {
            self.reports.lock().expect("lock").push(req.clone());
            Ok(())
        }
    }

    fn test_config() -> Configuration {
        Configuration {
            check: CheckConfig::default(),
            quota: QuotaConfig::default(),
            report: ReportConfig::default(),
            facade: FacadeConfig {
                service_name: "svc".into(),
                ..FacadeConfig::default()
            },
        }
    }

    fn op(name: &str) -> Operation {
        Operation {
            operation_id: "id".into(),
            operation_name: name.into(),
            consumer_id: "C".into(),
            start_time: Timestamp::new(0, 0),
            end_time: Timestamp::new(1, 0),
            labels: BTreeMap::new(),
            metric_value_sets: vec![],
            importance: Importance::Low,
        }
    }

    #[test]
    fn falls_back_to_inline_drive_when_thread_spawn_fails() {
        let client = Client::new(
            test_config(),
            Arc::new(RecordingTransport::default()),
            Arc::new(FailingThreadFactory),
            FakeTicker::new(0),
        );
        client.start().expect("start");
        assert!(client.inline_drive.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_on_stopped_facade_is_illegal_state() {
        let client = Client::new(
            test_config(),
            Arc::new(RecordingTransport::default()),
            Arc::new(FailingThreadFactory),
            FakeTicker::new(0),
        );
        assert!(client.stop().is_err());
    }

    #[test]
    fn check_populates_cache_on_miss_then_hits() {
        let client = Client::new(
            test_config(),
            Arc::new(RecordingTransport::default()),
            Arc::new(FailingThreadFactory),
            FakeTicker::new(0),
        );
        let req = CheckRequest {
            service_name: "svc".into(),
            operation: op("OpX"),
        };
        let first = client.check(req.clone()).expect("check").expect("response");
        assert_eq!(first.operation_id, "id");
        let stats = client.stats();
        assert_eq!(stats.checks_total, 1);
        assert_eq!(stats.checks_hits, 0);

        client.check(req).expect("check").expect("response");
        let stats = client.stats();
        assert_eq!(stats.checks_total, 2);
        assert_eq!(stats.checks_hits, 1);
    }

    #[test]
    fn expired_check_entry_is_flagged_as_flushing() {
        let ticker = FakeTicker::new(0);
        let aggregator = crate::aggregator::CheckAggregator::new(
            crate::cfg::config::CheckConfig {
                num_entries: 10,
                expiration_millis: 5,
            },
            ticker.clone(),
        );
        let req = CheckRequest {
            service_name: "svc".into(),
            operation: op("OpX"),
        };
        assert!(!aggregator.is_flushing(&req));

        aggregator.add_response(&req, crate::aggregator::CheckResponse {
            operation_id: "id".into(),
            attributes: Default::default(),
        });
        assert!(!aggregator.is_flushing(&req));

        ticker.advance(10_000_000);
        let outcome = aggregator.check(&req, "svc").expect("check");
        assert!(matches!(outcome, crate::aggregator::CheckOutcome::Miss));
        assert!(aggregator.is_flushing(&req));
    }

    #[test]
    fn declined_report_goes_direct_to_transport() {
        let transport = Arc::new(RecordingTransport::default());
        let client = Client::new(
            Configuration {
                report: ReportConfig {
                    num_entries: 0,
                    ..ReportConfig::default()
                },
                ..test_config()
            },
            transport.clone(),
            Arc::new(FailingThreadFactory),
            FakeTicker::new(0),
        );
        let req = ReportRequest {
            service_name: "svc".into(),
            operations: vec![op("OpY")],
        };
        client.report(req).expect("report");
        assert_eq!(transport.reports.lock().expect("lock").len(), 1);
        assert_eq!(client.stats().direct_reports, 1);
    }
}
