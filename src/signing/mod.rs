//! Canonical fingerprinting (spec §4.1): a deterministic byte-stream
//! over an `Operation`, hashed to a fixed-width `Fingerprint`.
//!
//! Three request families each exclude different fields from the
//! canonical form, so there are three entry points
//! ([`sign_check`], [`sign_quota`], [`sign_report_slot`]) rather than
//! one `sign`.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::model::{
    Operation,
    metric_value::{MetricEncode, MetricValue},
    operation::LabelMap,
};

/// A 128-bit digest of an operation's canonical form. Compared as an
/// opaque byte string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 16]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_labels(buf: &mut BytesMut, labels: &LabelMap) {
    // LabelMap is a BTreeMap, so iteration is already in ascending
    // lexicographic order by key (spec §4.1 step 3).
    for (name, value) in labels {
        put_cstring(buf, name);
        put_cstring(buf, value);
    }
}

fn put_metric_value(buf: &mut BytesMut, mv: &MetricValue) {
    buf.put_i64_le(mv.start_time.seconds);
    buf.put_i32_le(mv.start_time.nanos);
    buf.put_i64_le(mv.end_time.seconds);
    buf.put_i32_le(mv.end_time.nanos);
    put_labels(buf, &mv.labels);
    buf.put_u8(mv.value.kind_tag());
    mv.value.encode_body(buf);
}

/// `fold_digest` turns an arbitrarily long canonical byte stream into a
/// fixed 128-bit `Fingerprint` with a simple, fast, non-cryptographic
/// mix (FNV-1a extended to 128 bits via two independent 64-bit lanes).
/// Caching does not need collision resistance against an adversary,
/// only a low accidental-collision rate, so a cryptographic hash would
/// be needless overhead on the hot path.
fn fold_digest(bytes: &[u8]) -> Fingerprint {
    const FNV_OFFSET_LO: u64 = 0xcbf29ce484222325;
    const FNV_OFFSET_HI: u64 = 0x9e3779b97f4a7c15;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut lo: u64 = FNV_OFFSET_LO;
    let mut hi: u64 = FNV_OFFSET_HI;
    for &b in bytes {
        lo ^= b as u64;
        lo = lo.wrapping_mul(FNV_PRIME);
        hi ^= (b as u64).rotate_left(13);
        hi = hi.wrapping_mul(FNV_PRIME).rotate_left(7);
    }

    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&lo.to_le_bytes());
    out[8..].copy_from_slice(&hi.to_le_bytes());
    Fingerprint(out)
}

/// Canonical form for a check operation: consumer, operation name,
/// labels, and metric-value-sets in full (spec §4.1 "Check").
pub fn sign_check(op: &Operation) -> Fingerprint {
    let mut buf = BytesMut::new();
    put_cstring(&mut buf, &op.consumer_id);
    put_cstring(&mut buf, &op.operation_name);
    put_labels(&mut buf, &op.labels);
    for set in &op.metric_value_sets {
        put_cstring(&mut buf, &set.metric_name);
        for mv in &set.values {
            put_metric_value(&mut buf, mv);
        }
    }
    fold_digest(&buf)
}

/// Canonical form for a quota allocation: consumer, operation name,
/// top-level labels, and the per-metric requested amounts — no
/// timestamps, no per-`MetricValue` labels (spec §4.1 "Quota").
pub fn sign_quota(op: &Operation) -> Fingerprint {
    let mut buf = BytesMut::new();
    put_cstring(&mut buf, &op.consumer_id);
    put_cstring(&mut buf, &op.operation_name);
    put_labels(&mut buf, &op.labels);
    for (metric_name, amount) in op.requested_amounts() {
        put_cstring(&mut buf, metric_name);
        buf.put_i64_le(amount);
    }
    fold_digest(&buf)
}

/// Canonical form for a report-aggregator slot key: consumer, operation
/// name and top-level labels only. Excludes `operationId`, per-sample
/// timestamps and the sample payloads themselves, so operations that
/// differ only in their measured values share a slot (spec §4.1
/// "Report-slot key").
pub fn sign_report_slot(op: &Operation) -> Fingerprint {
    let mut buf = BytesMut::new();
    put_cstring(&mut buf, &op.consumer_id);
    put_cstring(&mut buf, &op.operation_name);
    put_labels(&mut buf, &op.labels);
    for set in &op.metric_value_sets {
        put_cstring(&mut buf, &set.metric_name);
        // Only the per-value label *structure* participates: two
        // operations with metrics tagged the same way share a slot
        // regardless of sample values, so we hash the label maps but
        // not the timestamps or the value bodies.
        for mv in &set.values {
            put_labels(&mut buf, &mv.labels);
        }
    }
    fold_digest(&buf)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::{
        metric_value::{BoolValue, Int64Value, MetricValueKind},
        operation::{Importance, Timestamp},
        MetricValueSet,
    };

    fn base_op() -> Operation {
        let mut labels = BTreeMap::new();
        labels.insert("env".to_string(), "prod".to_string());
        labels.insert("region".to_string(), "us".to_string());
        Operation {
            operation_id: "op-1".to_string(),
            operation_name: "OpX".to_string(),
            consumer_id: "C".to_string(),
            start_time: Timestamp::new(100, 0),
            end_time: Timestamp::new(200, 0),
            labels,
            metric_value_sets: vec![MetricValueSet {
                metric_name: "m.requests".to_string(),
                values: vec![MetricValue {
                    start_time: Timestamp::new(100, 0),
                    end_time: Timestamp::new(200, 0),
                    labels: BTreeMap::new(),
                    value: MetricValueKind::Int64(Int64Value(3)),
                }],
            }],
            importance: Importance::Low,
        }
    }

    #[test]
    fn label_order_does_not_affect_signature() {
        let a = base_op();
        let mut b = base_op();
        // Rebuild with labels inserted in the opposite order; BTreeMap
        // normalizes iteration order regardless.
        let mut reordered = BTreeMap::new();
        reordered.insert("region".to_string(), "us".to_string());
        reordered.insert("env".to_string(), "prod".to_string());
        b.labels = reordered;
        assert_eq!(sign_check(&a), sign_check(&b));
    }

    #[test]
    fn differing_label_value_changes_signature() {
        let a = base_op();
        let mut b = base_op();
        b.labels.insert("env".to_string(), "staging".to_string());
        assert_ne!(sign_check(&a), sign_check(&b));
    }

    #[test]
    fn differing_consumer_changes_signature() {
        let a = base_op();
        let mut b = base_op();
        b.consumer_id = "D".to_string();
        assert_ne!(sign_check(&a), sign_check(&b));
        assert_ne!(sign_quota(&a), sign_quota(&b));
        assert_ne!(sign_report_slot(&a), sign_report_slot(&b));
    }

    #[test]
    fn report_slot_key_ignores_sample_values() {
        let a = base_op();
        let mut b = base_op();
        b.metric_value_sets[0].values[0].value = MetricValueKind::Int64(Int64Value(999));
        assert_eq!(sign_report_slot(&a), sign_report_slot(&b));
        // But the check signature, which includes sample values, differs.
        assert_ne!(sign_check(&a), sign_check(&b));
    }

    #[test]
    fn report_slot_key_ignores_operation_id_and_timestamps() {
        let a = base_op();
        let mut b = base_op();
        b.operation_id = "completely-different".to_string();
        b.start_time = Timestamp::new(999, 0);
        b.metric_value_sets[0].values[0].start_time = Timestamp::new(1, 0);
        assert_eq!(sign_report_slot(&a), sign_report_slot(&b));
    }

    #[test]
    fn all_five_metric_kinds_produce_distinct_tags() {
        let mut op_bool = base_op();
        op_bool.metric_value_sets[0].values[0].value = MetricValueKind::Bool(BoolValue(true));
        let mut op_string = base_op();
        op_string.metric_value_sets[0].values[0].value =
            MetricValueKind::String(crate::model::metric_value::StringValue("x".into()));
        assert_ne!(sign_check(&op_bool), sign_check(&op_string));
        assert_ne!(sign_check(&op_bool), sign_check(&base_op()));
    }
}
