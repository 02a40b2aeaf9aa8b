// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::BufMut;
use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::model::operation::{LabelMap, Timestamp};

/// A metric-name plus an ordered sequence of samples (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValueSet {
    pub metric_name: String,
    pub values: Vec<MetricValue>,
}

/// A single labelled sample within a `MetricValueSet`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub labels: LabelMap,
    pub value: MetricValueKind,
}

/// Per-kind canonical encoding, auto-dispatched over [`MetricValueKind`].
///
/// Mirrors the `BasicHeaderSegment`/`SendingData` split the wire-level
/// PDU types use: one small trait, one enum of newtypes, `enum_dispatch`
/// wiring the match arms.
#[enum_dispatch]
pub trait MetricEncode {
    /// The 1-byte kind tag from spec §4.1 step 4 (`B`/`I`/`D`/`S`/`X`).
    fn kind_tag(&self) -> u8;

    /// Appends the kind-specific value body to the canonical byte
    /// stream.
    fn encode_body(&self, buf: &mut bytes::BytesMut);
}

/// A boolean sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoolValue(pub bool);

/// A 64-bit integer sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Int64Value(pub i64);

/// A 64-bit floating point sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DoubleValue(pub f64);

/// A UTF-8 string sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringValue(pub String);

impl MetricEncode for BoolValue {
    fn kind_tag(&self) -> u8 {
        b'B'
    }

    fn encode_body(&self, buf: &mut bytes::BytesMut) {
        buf.put_u8(if self.0 { 1 } else { 0 });
    }
}

impl MetricEncode for Int64Value {
    fn kind_tag(&self) -> u8 {
        b'I'
    }

    fn encode_body(&self, buf: &mut bytes::BytesMut) {
        buf.put_i64_le(self.0);
    }
}

impl MetricEncode for DoubleValue {
    fn kind_tag(&self) -> u8 {
        b'D'
    }

    fn encode_body(&self, buf: &mut bytes::BytesMut) {
        buf.put_f64_le(self.0);
    }
}

impl MetricEncode for StringValue {
    fn kind_tag(&self) -> u8 {
        b'S'
    }

    fn encode_body(&self, buf: &mut bytes::BytesMut) {
        buf.put_slice(self.0.as_bytes());
        buf.put_u8(0);
    }
}

impl MetricEncode for Distribution {
    fn kind_tag(&self) -> u8 {
        b'X'
    }

    fn encode_body(&self, buf: &mut bytes::BytesMut) {
        for boundary in &self.bucket_boundaries {
            buf.put_f64_le(*boundary);
        }
        for count in &self.bucket_counts {
            buf.put_i64_le(*count);
        }
    }
}

/// Exactly one of the five sample kinds a `MetricValue` can carry.
#[enum_dispatch(MetricEncode)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetricValueKind {
    Bool(BoolValue),
    Int64(Int64Value),
    Double(DoubleValue),
    String(StringValue),
    Distribution(Distribution),
}

/// A running histogram over pre-declared bucket boundaries, with the
/// usual streaming moments (spec §3, §4.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub bucket_boundaries: Vec<f64>,
    pub bucket_counts: Vec<i64>,
    pub count: i64,
    pub mean: f64,
    pub sum_of_squared_deviation: f64,
    pub minimum: f64,
    pub maximum: f64,
}

impl Distribution {
    /// A single-sample distribution over the given bucket boundaries,
    /// with `value` tallied into whichever bucket it falls in.
    pub fn single(bucket_boundaries: Vec<f64>, value: f64) -> Self {
        let mut bucket_counts = vec![0i64; bucket_boundaries.len() + 1];
        let idx = bucket_boundaries
            .iter()
            .position(|&b| value < b)
            .unwrap_or(bucket_boundaries.len());
        bucket_counts[idx] = 1;
        Distribution {
            bucket_boundaries,
            bucket_counts,
            count: 1,
            mean: value,
            sum_of_squared_deviation: 0.0,
            minimum: value,
            maximum: value,
        }
    }

    /// Combines two distributions over the *same* bucket boundaries,
    /// recomputing the mean and sum-of-squared-deviations with the
    /// standard Welford combine formula and folding min/max (spec
    /// §4.3).
    pub fn combine(&self, other: &Distribution) -> Distribution {
        let bucket_counts = self
            .bucket_counts
            .iter()
            .zip(other.bucket_counts.iter())
            .map(|(a, b)| a + b)
            .collect();

        let (n_a, n_b) = (self.count as f64, other.count as f64);
        let n = n_a + n_b;
        let (mean, sum_of_squared_deviation) = if n == 0.0 {
            (0.0, 0.0)
        } else {
            let delta = other.mean - self.mean;
            let mean = self.mean + delta * n_b / n;
            let m2 = self.sum_of_squared_deviation
                + other.sum_of_squared_deviation
                + delta * delta * n_a * n_b / n;
            (mean, m2)
        };

        Distribution {
            bucket_boundaries: self.bucket_boundaries.clone(),
            bucket_counts,
            count: self.count + other.count,
            mean,
            sum_of_squared_deviation,
            minimum: self.minimum.min(other.minimum),
            maximum: self.maximum.max(other.maximum),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_match_spec_alphabet() {
        assert_eq!(BoolValue(true).kind_tag(), b'B');
        assert_eq!(Int64Value(1).kind_tag(), b'I');
        assert_eq!(DoubleValue(1.0).kind_tag(), b'D');
        assert_eq!(StringValue("x".into()).kind_tag(), b'S');
        let dist = Distribution::single(vec![1.0, 2.0], 0.5);
        assert_eq!(dist.kind_tag(), b'X');
    }

    #[test]
    fn distribution_combine_matches_manual_welford() {
        let a = Distribution::single(vec![10.0], 3.0);
        let b = Distribution::single(vec![10.0], 5.0);
        let c = a.combine(&b);
        assert_eq!(c.count, 2);
        assert!((c.mean - 4.0).abs() < 1e-9);
        assert_eq!(c.minimum, 3.0);
        assert_eq!(c.maximum, 5.0);
        // bucketwise: both samples land in bucket 0 (< 10.0)
        assert_eq!(c.bucket_counts, vec![2, 0]);
    }

    #[test]
    fn distribution_combine_is_commutative() {
        let a = Distribution::single(vec![10.0], 3.0);
        let b = Distribution::single(vec![10.0], 9.0);
        let ab = a.combine(&b);
        let ba = b.combine(&a);
        assert_eq!(ab.count, ba.count);
        assert!((ab.mean - ba.mean).abs() < 1e-9);
        assert!((ab.sum_of_squared_deviation - ba.sum_of_squared_deviation).abs() < 1e-9);
    }
}
