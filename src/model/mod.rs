//! The data model the aggregation layer manipulates: `Operation`,
//! `MetricValueSet` and `MetricValue`, plus the label map and timestamp
//! types shared by all three.

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Metric samples and their element-wise merge rules.
pub mod metric_value;
/// The `Operation` envelope and merge semantics.
pub mod operation;

pub use metric_value::{Distribution, MetricValue, MetricValueKind, MetricValueSet};
pub use operation::{Importance, LabelMap, Operation, Timestamp};
