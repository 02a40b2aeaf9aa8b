// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::{
    cfg::config::ReportConfig,
    model::{
        Importance, MetricValueSet, Operation,
        metric_value::{BoolValue, DoubleValue, Int64Value, MetricValue, MetricValueKind, StringValue},
    },
    signing::{self, Fingerprint},
    ticker::Ticker,
};

/// A batch of operations to report, merged or sent as-is (spec §4.3).
#[derive(Debug, Clone)]
pub struct ReportRequest {
    pub service_name: String,
    pub operations: Vec<Operation>,
}

/// Whether every operation in a `report` call merged into the LRU, or
/// the caller must send the batch directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Merged,
    Declined,
}

struct ReportSlot {
    operation: Operation,
    last_merged_nanos: i64,
}

struct ReportState {
    slots: IndexMap<Fingerprint, ReportSlot>,
    /// Operations evicted to respect capacity before they could be
    /// flushed; carried here so eviction never loses data (spec §4.3
    /// "Eviction MUST NOT lose data").
    overflow: Vec<Operation>,
}

/// Bounded LRU of report operations with merge-on-insert (spec §4.3).
///
/// Backed by an `IndexMap` rather than `DashMap`: merging has to read,
/// combine and reinsert under one lock, and needs true insertion-order
/// eviction rather than `DashMap`'s approximate sampling, the same
/// ordered-cache shape linkerd2's connection caches use.
pub struct ReportAggregator {
    config: ReportConfig,
    state: Mutex<ReportState>,
    ticker: Arc<dyn Ticker>,
}

impl ReportAggregator {
    pub fn new(config: ReportConfig, ticker: Arc<dyn Ticker>) -> Self {
        ReportAggregator {
            config,
            state: Mutex::new(ReportState {
                slots: IndexMap::new(),
                overflow: Vec::new(),
            }),
            ticker,
        }
    }

    /// Attempts to merge every operation in `req` into its matching
    /// slot. Succeeds only if every operation merges; on any failure
    /// (a HIGH-importance operation, or a label conflict with the
    /// existing slot) nothing is mutated and `Declined` is returned so
    /// the caller sends the batch directly.
    pub fn report(&self, req: &ReportRequest) -> ReportOutcome {
        if self.config.is_disabled() {
            return ReportOutcome::Declined;
        }
        if req.operations.iter().any(|op| op.importance == Importance::High) {
            return ReportOutcome::Declined;
        }

        let mut state = self.state.lock();
        let mut planned: IndexMap<Fingerprint, Operation> = IndexMap::new();
        for op in &req.operations {
            let fp = signing::sign_report_slot(op);
            let base = planned
                .get(&fp)
                .cloned()
                .or_else(|| state.slots.get(&fp).map(|s| s.operation.clone()));
            let merged = match base {
                Some(existing) => match merge_operations(&existing, op) {
                    Some(m) => m,
                    None => return ReportOutcome::Declined,
                },
                None => op.clone(),
            };
            planned.insert(fp, merged);
        }

        let now = self.ticker.now_nanos();
        for (fp, merged) in planned {
            state.slots.shift_remove(&fp);
            state.slots.insert(fp, ReportSlot {
                operation: merged,
                last_merged_nanos: now,
            });
        }

        let capacity = self.config.num_entries.max(0) as usize;
        while state.slots.len() > capacity {
            match state.slots.shift_remove_index(0) {
                Some((_, slot)) => state.overflow.push(slot.operation),
                None => break,
            }
        }

        ReportOutcome::Merged
    }

    /// Atomically removes every current slot (and any queued overflow)
    /// and packages them into batches of at most
    /// `maxOperationsPerBatch` operations.
    pub fn flush(&self) -> Vec<ReportRequest> {
        self.drain_to_requests()
    }

    /// Like [`Self::flush`], emptying the aggregator at shutdown.
    pub fn clear(&self) -> Vec<ReportRequest> {
        self.drain_to_requests()
    }

    /// Configured flush cadence; negative means merging is disabled.
    pub fn flush_interval_millis(&self) -> i64 {
        self.config.flush_interval_millis
    }

    /// Number of live slots, for diagnostics/tests.
    pub fn len(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().slots.is_empty()
    }

    fn drain_to_requests(&self) -> Vec<ReportRequest> {
        let mut state = self.state.lock();
        let mut ops: Vec<Operation> = state
            .slots
            .drain(..)
            .map(|(_, slot)| slot.operation)
            .collect();
        ops.append(&mut state.overflow);
        drop(state);

        let batch_size = self.config.max_operations_per_batch.max(1);
        ops.chunks(batch_size)
            .map(|chunk| ReportRequest {
                service_name: String::new(),
                operations: chunk.to_vec(),
            })
            .collect()
    }
}

/// Merges `b` into `a` per spec §4.3. Returns `None` on a label
/// conflict (a shared key with differing values), which the caller
/// treats as a failed merge.
fn merge_operations(a: &Operation, b: &Operation) -> Option<Operation> {
    let mut labels = a.labels.clone();
    for (k, v) in &b.labels {
        match labels.get(k) {
            Some(existing) if existing != v => return None,
            _ => {
                labels.insert(k.clone(), v.clone());
            },
        }
    }

    Some(Operation {
        operation_id: a.operation_id.clone(),
        operation_name: a.operation_name.clone(),
        consumer_id: a.consumer_id.clone(),
        start_time: a.start_time.min(b.start_time),
        end_time: a.end_time.max(b.end_time),
        labels,
        metric_value_sets: merge_metric_value_sets(&a.metric_value_sets, &b.metric_value_sets),
        importance: a.importance,
    })
}

fn merge_metric_value_sets(a: &[MetricValueSet], b: &[MetricValueSet]) -> Vec<MetricValueSet> {
    let mut by_name: IndexMap<String, Vec<MetricValue>> = IndexMap::new();
    for set in a {
        by_name.insert(set.metric_name.clone(), set.values.clone());
    }
    for set in b {
        let values = by_name.entry(set.metric_name.clone()).or_default();
        for incoming in &set.values {
            match values.iter_mut().find(|v| v.labels == incoming.labels) {
                Some(existing) => *existing = merge_metric_values(existing, incoming),
                None => values.push(incoming.clone()),
            }
        }
    }
    by_name
        .into_iter()
        .map(|(metric_name, values)| MetricValueSet { metric_name, values })
        .collect()
}

fn merge_metric_values(a: &MetricValue, b: &MetricValue) -> MetricValue {
    MetricValue {
        start_time: a.start_time.min(b.start_time),
        end_time: a.end_time.max(b.end_time),
        labels: a.labels.clone(),
        value: merge_metric_value_kind(&a.value, &b.value),
    }
}

fn merge_metric_value_kind(a: &MetricValueKind, b: &MetricValueKind) -> MetricValueKind {
    match (a, b) {
        (MetricValueKind::Bool(x), MetricValueKind::Bool(y)) => {
            MetricValueKind::Bool(BoolValue(x.0 || y.0))
        },
        (MetricValueKind::Int64(x), MetricValueKind::Int64(y)) => {
            MetricValueKind::Int64(Int64Value(x.0 + y.0))
        },
        (MetricValueKind::Double(x), MetricValueKind::Double(y)) => {
            MetricValueKind::Double(DoubleValue(x.0 + y.0))
        },
        (MetricValueKind::String(_), MetricValueKind::String(y)) => {
            MetricValueKind::String(StringValue(y.0.clone()))
        },
        (MetricValueKind::Distribution(x), MetricValueKind::Distribution(y)) => {
            MetricValueKind::Distribution(x.combine(y))
        },
        // Mismatched kinds for the same (metricName, labels) pair should
        // not occur; the later sample wins rather than panicking.
        (_, later) => later.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{model::operation::Timestamp, ticker::FakeTicker};

    fn op(consumer: &str, name: &str, labels: &[(&str, &str)], metric: &str, amount: i64) -> Operation {
        let mut label_map = BTreeMap::new();
        for (k, v) in labels {
            label_map.insert(k.to_string(), v.to_string());
        }
        Operation {
            operation_id: "id".into(),
            operation_name: name.into(),
            consumer_id: consumer.into(),
            start_time: Timestamp::new(0, 0),
            end_time: Timestamp::new(10, 0),
            labels: label_map,
            metric_value_sets: vec![MetricValueSet {
                metric_name: metric.into(),
                values: vec![MetricValue {
                    start_time: Timestamp::new(0, 0),
                    end_time: Timestamp::new(10, 0),
                    labels: BTreeMap::new(),
                    value: MetricValueKind::Int64(Int64Value(amount)),
                }],
            }],
            importance: Importance::Low,
        }
    }

    fn req(ops: Vec<Operation>) -> ReportRequest {
        ReportRequest {
            service_name: "svc".into(),
            operations: ops,
        }
    }

    #[test]
    fn scenario_4_report_merge_arithmetic() {
        let agg = ReportAggregator::new(ReportConfig::default(), FakeTicker::new(0));
        let a = op("C", "OpY", &[("env", "prod")], "m.requests", 3);
        let b = op("C", "OpY", &[("env", "prod")], "m.requests", 5);

        assert_eq!(agg.report(&req(vec![a])), ReportOutcome::Merged);
        assert_eq!(agg.report(&req(vec![b])), ReportOutcome::Merged);

        let flushed = agg.flush();
        assert_eq!(flushed.len(), 1);
        let merged = &flushed[0].operations[0];
        match &merged.metric_value_sets[0].values[0].value {
            MetricValueKind::Int64(v) => assert_eq!(v.0, 8),
            other => panic!("unexpected kind: {other:?}"),
        }
        assert_eq!(merged.start_time, Timestamp::new(0, 0));
        assert_eq!(merged.end_time, Timestamp::new(10, 0));
    }

    #[test]
    fn scenario_5_report_batch_split() {
        let agg = ReportAggregator::new(
            ReportConfig {
                num_entries: 200,
                flush_interval_millis: 1_000,
                max_operations_per_batch: 2,
            },
            FakeTicker::new(0),
        );
        for i in 0..5 {
            let o = op("C", &format!("Op{i}"), &[], "m.requests", 1);
            assert_eq!(agg.report(&req(vec![o])), ReportOutcome::Merged);
        }
        let flushed = agg.flush();
        assert_eq!(flushed.len(), 3);
        let sizes: Vec<usize> = flushed.iter().map(|r| r.operations.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn high_importance_declines_whole_request() {
        let agg = ReportAggregator::new(ReportConfig::default(), FakeTicker::new(0));
        let mut high = op("C", "OpX", &[], "m.requests", 1);
        high.importance = Importance::High;
        assert_eq!(agg.report(&req(vec![high])), ReportOutcome::Declined);
        assert!(agg.is_empty());
    }

    #[test]
    fn conflicting_labels_decline_without_mutating_state() {
        let agg = ReportAggregator::new(ReportConfig::default(), FakeTicker::new(0));
        let a = op("C", "OpY", &[("env", "prod")], "m.requests", 3);
        assert_eq!(agg.report(&req(vec![a])), ReportOutcome::Merged);
        assert_eq!(agg.len(), 1);

        let conflicting = op("C", "OpY", &[("env", "staging")], "m.requests", 5);
        assert_eq!(agg.report(&req(vec![conflicting])), ReportOutcome::Declined);
        assert_eq!(agg.len(), 1);
    }

    #[test]
    fn eviction_queues_overflow_instead_of_dropping_it() {
        let agg = ReportAggregator::new(
            ReportConfig {
                num_entries: 1,
                flush_interval_millis: 1_000,
                max_operations_per_batch: 1_000,
            },
            FakeTicker::new(0),
        );
        let a = op("C", "OpA", &[], "m.requests", 1);
        let b = op("C", "OpB", &[], "m.requests", 2);
        assert_eq!(agg.report(&req(vec![a])), ReportOutcome::Merged);
        assert_eq!(agg.report(&req(vec![b])), ReportOutcome::Merged);

        let flushed = agg.flush();
        let total_ops: usize = flushed.iter().map(|r| r.operations.len()).sum();
        assert_eq!(total_ops, 2);
    }

    #[test]
    fn disabled_aggregator_always_declines() {
        let agg = ReportAggregator::new(
            ReportConfig {
                num_entries: 0,
                flush_interval_millis: 1_000,
                max_operations_per_batch: 1_000,
            },
            FakeTicker::new(0),
        );
        let a = op("C", "OpA", &[], "m.requests", 1);
        assert_eq!(agg.report(&req(vec![a])), ReportOutcome::Declined);
    }
}
