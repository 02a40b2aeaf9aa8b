//! The three fingerprint-indexed aggregators the client facade drives:
//! [`check`], [`quota`] and [`report`].

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

/// Approximate-LRU eviction helper shared by the check and quota caches.
mod approx_lru;
/// TTL cache of check responses, keyed by fingerprint (spec §4.2).
pub mod check;
/// LRU of mergeable report operations with flush policy (spec §4.3).
pub mod report;
/// TTL cache of quota allocations with amount deduction (spec §4.4).
pub mod quota;

pub use check::{CheckAggregator, CheckOutcome, CheckRequest, CheckResponse};
pub use quota::{
    AllocateQuotaRequest, AllocateQuotaResponse, QuotaAggregator, QuotaOutcome,
};
pub use report::{ReportAggregator, ReportOutcome, ReportRequest};
