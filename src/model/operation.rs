// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::metric_value::MetricValueSet;

/// Label maps are kept sorted by key so the signing step (§4.1 step 3)
/// never has to sort them itself, and so two operations built from
/// differently-ordered inputs compare equal.
pub type LabelMap = BTreeMap<String, String>;

/// A protobuf-`Timestamp`-shaped wall-clock instant: seconds since the
/// epoch plus sub-second nanos. Ordered so `min`/`max` fall out of
/// `Ord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub const fn new(seconds: i64, nanos: i32) -> Self {
        Timestamp { seconds, nanos }
    }
}

/// Per-operation importance. `High` always bypasses the check cache and
/// is never merged by the report aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Importance {
    #[default]
    Low,
    High,
}

/// The atomic unit of work the aggregation layer manipulates: one
/// access check, one quota allocation, or one usage report sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub operation_id: String,
    pub operation_name: String,
    pub consumer_id: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub labels: LabelMap,
    pub metric_value_sets: Vec<MetricValueSet>,
    pub importance: Importance,
}

impl Operation {
    /// True when the operation is missing the identity fields the
    /// aggregators require (spec §4.2: "missing operation, empty
    /// consumerId, empty operationName").
    pub fn is_missing_identity(&self) -> bool {
        self.consumer_id.is_empty() || self.operation_name.is_empty()
    }

    /// Requested amounts for a quota allocation, read off the operation's
    /// int64-valued metrics (one MetricValueSet per metric name, first
    /// value used as the requested amount).
    pub fn requested_amounts(&self) -> BTreeMap<&str, i64> {
        let mut amounts = BTreeMap::new();
        for set in &self.metric_value_sets {
            if let Some(first) = set.values.first() {
                if let crate::model::metric_value::MetricValueKind::Int64(n) =
                    &first.value
                {
                    amounts.insert(set.metric_name.as_str(), *n);
                }
            }
        }
        amounts
    }
}
