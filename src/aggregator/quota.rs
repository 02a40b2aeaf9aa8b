// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::BTreeMap, sync::Arc};

use dashmap::DashMap;

use crate::{
    aggregator::approx_lru,
    cfg::config::QuotaConfig,
    error::{Error, Result},
    model::{
        Operation,
        metric_value::{Int64Value, MetricValue, MetricValueKind, MetricValueSet},
        operation::Timestamp,
    },
    signing::{self, Fingerprint},
    ticker::Ticker,
};

/// A quota allocation request: an operation whose int64-valued metrics
/// carry the requested amounts (spec §4.1 "Quota").
#[derive(Debug, Clone)]
pub struct AllocateQuotaRequest {
    pub service_name: String,
    pub operation: Operation,
}

/// The upstream's allocation decision: a grant of amounts per metric
/// name, keyed the same way requests are.
#[derive(Debug, Clone)]
pub struct AllocateQuotaResponse {
    pub operation_id: String,
    pub granted_amounts: BTreeMap<String, i64>,
}

/// Result of consulting the quota cache.
#[derive(Debug, Clone)]
pub enum QuotaOutcome {
    Allocated(AllocateQuotaResponse),
    Miss,
}

struct QuotaCacheEntry {
    response: AllocateQuotaResponse,
    /// Identity fields (consumer, operation name, labels) the original
    /// request carried, so a synthesized refresh request signs to the
    /// same fingerprint this entry is keyed under.
    key_template: Operation,
    remaining_amounts: BTreeMap<String, i64>,
    consumed_since_refresh: BTreeMap<String, i64>,
    last_refresh_nanos: i64,
    is_refreshing: bool,
}

/// TTL cache of allocation responses keyed by fingerprint, with
/// per-metric amount deduction on hit (spec §4.4).
pub struct QuotaAggregator {
    config: QuotaConfig,
    entries: DashMap<Fingerprint, QuotaCacheEntry>,
    ticker: Arc<dyn Ticker>,
}

impl QuotaAggregator {
    pub fn new(config: QuotaConfig, ticker: Arc<dyn Ticker>) -> Self {
        QuotaAggregator {
            config,
            entries: DashMap::new(),
            ticker,
        }
    }

    /// Deducts `req`'s requested amounts from the cached grant if one is
    /// present, non-expired and would not go negative; otherwise flags
    /// the entry (if any) for refresh and returns `Miss` so the caller
    /// performs a synchronous upstream call.
    pub fn allocate_quota(&self, req: &AllocateQuotaRequest) -> Result<QuotaOutcome> {
        self.validate(req)?;

        if self.config.is_disabled() {
            return Ok(QuotaOutcome::Miss);
        }

        let fp = signing::sign_quota(&req.operation);
        let requested = req.operation.requested_amounts();
        let now = self.ticker.now_nanos();

        let Some(mut entry) = self.entries.get_mut(&fp) else {
            return Ok(QuotaOutcome::Miss);
        };
        if self.is_expired(&entry, now) {
            return Ok(QuotaOutcome::Miss);
        }

        let mut would_be = entry.remaining_amounts.clone();
        for (metric, amount) in &requested {
            let remaining = would_be.entry((*metric).to_string()).or_insert(0);
            *remaining -= *amount;
            if *remaining < 0 {
                entry.is_refreshing = true;
                return Ok(QuotaOutcome::Miss);
            }
        }

        entry.remaining_amounts = would_be;
        for (metric, amount) in &requested {
            *entry
                .consumed_since_refresh
                .entry((*metric).to_string())
                .or_insert(0) += *amount;
        }
        Ok(QuotaOutcome::Allocated(entry.response.clone()))
    }

    /// Populates or replaces the cache entry for `req` from a fresh
    /// upstream grant, resetting the TTL clock, the deduction ledger,
    /// and clearing `is_refreshing`.
    pub fn cache_response(&self, req: &AllocateQuotaRequest, resp: AllocateQuotaResponse) {
        if self.config.is_disabled() {
            return;
        }
        let fp = signing::sign_quota(&req.operation);
        let remaining_amounts = resp.granted_amounts.clone();
        let key_template = Operation {
            metric_value_sets: Vec::new(),
            ..req.operation.clone()
        };
        self.entries.insert(
            fp,
            QuotaCacheEntry {
                response: resp,
                key_template,
                remaining_amounts,
                consumed_since_refresh: BTreeMap::new(),
                last_refresh_nanos: self.ticker.now_nanos(),
                is_refreshing: false,
            },
        );
        approx_lru::evict_to_capacity(
            &self.entries,
            self.config.num_entries.max(0) as usize,
            |e| e.last_refresh_nanos,
        );
    }

    /// Emits refresh requests for entries whose refresh cadence has
    /// elapsed or whose `is_refreshing` flag was set by a prior
    /// `allocate_quota`, each carrying the consumption accumulated
    /// since its last refresh.
    pub fn flush(&self) -> Vec<AllocateQuotaRequest> {
        let now = self.ticker.now_nanos();
        let refresh_nanos = self.config.refresh_millis.saturating_mul(1_000_000);
        let mut out = Vec::new();
        for entry in self.entries.iter() {
            let due = now.saturating_sub(entry.last_refresh_nanos) >= refresh_nanos;
            if due || entry.is_refreshing {
                out.push(AllocateQuotaRequest {
                    service_name: String::new(),
                    operation: synthesize_refresh_operation(
                        &entry.key_template,
                        &entry.consumed_since_refresh,
                    ),
                });
            }
        }
        out
    }

    /// Drops all cached entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of live entries, for diagnostics/tests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, entry: &QuotaCacheEntry, now_nanos: i64) -> bool {
        if self.config.expiration_millis < 0 {
            return false;
        }
        let ttl_nanos = self.config.expiration_millis.saturating_mul(1_000_000);
        now_nanos.saturating_sub(entry.last_refresh_nanos) > ttl_nanos
    }

    fn validate(&self, req: &AllocateQuotaRequest) -> Result<()> {
        if req.operation.is_missing_identity() {
            return Err(Error::InvalidRequest(
                "missing consumerId or operationName".into(),
            ));
        }
        Ok(())
    }
}

fn synthesize_refresh_operation(template: &Operation, consumed: &BTreeMap<String, i64>) -> Operation {
    let zero = Timestamp::new(0, 0);
    Operation {
        metric_value_sets: consumed
            .iter()
            .map(|(metric_name, amount)| MetricValueSet {
                metric_name: metric_name.clone(),
                values: vec![MetricValue {
                    start_time: zero,
                    end_time: zero,
                    labels: BTreeMap::new(),
                    value: MetricValueKind::Int64(Int64Value(*amount)),
                }],
            })
            .collect(),
        ..template.clone()
    }
}
