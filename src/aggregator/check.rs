// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{
    aggregator::approx_lru,
    cfg::config::{CheckConfig, NON_CACHING},
    error::{Error, Result},
    model::Operation,
    signing::{self, Fingerprint},
    ticker::Ticker,
};

/// A check request: an operation plus the service name the caller
/// expects the facade to be configured for.
#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub service_name: String,
    pub operation: Operation,
}

/// The upstream's verdict on a check request. The wire encoding is out
/// of scope (spec §1); this carries just enough for the cache to be
/// useful plus an open `attributes` bag for whatever else the real
/// response contains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub operation_id: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// Result of consulting the check cache.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    Hit(CheckResponse),
    Miss,
}

struct CheckCacheEntry {
    response: CheckResponse,
    last_refresh_nanos: i64,
    is_flushing: bool,
}

/// TTL cache of check responses keyed by fingerprint, with an
/// importance-gated bypass (spec §4.2).
pub struct CheckAggregator {
    config: CheckConfig,
    entries: DashMap<Fingerprint, CheckCacheEntry>,
    ticker: Arc<dyn Ticker>,
}

impl CheckAggregator {
    pub fn new(config: CheckConfig, ticker: Arc<dyn Ticker>) -> Self {
        CheckAggregator {
            config,
            entries: DashMap::new(),
            ticker,
        }
    }

    /// Returns the cached response if present and the request is `Low`
    /// importance; always a miss otherwise. Requests that fail basic
    /// validity checks return `Error::InvalidRequest`.
    pub fn check(&self, req: &CheckRequest, expected_service: &str) -> Result<CheckOutcome> {
        self.validate(req, expected_service)?;

        if self.config.is_disabled() {
            return Ok(CheckOutcome::Miss);
        }
        if req.operation.importance == crate::model::Importance::High {
            return Ok(CheckOutcome::Miss);
        }

        let fp = signing::sign_check(&req.operation);
        let now = self.ticker.now_nanos();
        match self.entries.get_mut(&fp) {
            Some(mut entry) if !self.is_expired(&entry, now) => {
                Ok(CheckOutcome::Hit(entry.response.clone()))
            },
            Some(mut entry) => {
                // Expired but still present: a refresh for this fingerprint
                // is presumably already in flight via the caller's upcoming
                // Transport call, so flag it for `is_flushing` rather than
                // just falling through silently.
                entry.is_flushing = true;
                Ok(CheckOutcome::Miss)
            },
            None => Ok(CheckOutcome::Miss),
        }
    }

    /// Inserts or overwrites the cache entry for `req`, resetting its
    /// TTL clock and clearing `is_flushing`.
    pub fn add_response(&self, req: &CheckRequest, resp: CheckResponse) {
        if self.config.is_disabled() {
            return;
        }
        let fp = signing::sign_check(&req.operation);
        self.entries.insert(
            fp,
            CheckCacheEntry {
                response: resp,
                last_refresh_nanos: self.ticker.now_nanos(),
                is_flushing: false,
            },
        );
        approx_lru::evict_to_capacity(
            &self.entries,
            self.config.num_entries.max(0) as usize,
            |e| e.last_refresh_nanos,
        );
    }

    /// Advisory hint read by the facade before issuing a refresh; never
    /// correctness-critical (spec §9).
    pub fn is_flushing(&self, req: &CheckRequest) -> bool {
        let fp = signing::sign_check(&req.operation);
        self.entries.get(&fp).map(|e| e.is_flushing).unwrap_or(false)
    }

    /// Drops all cached entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// The configured TTL, or `NonCaching` (`NON_CACHING`) when the
    /// cache is disabled.
    pub fn expiration_millis(&self) -> i64 {
        self.config.expiration_millis_or_non_caching()
    }

    /// Number of live entries, for diagnostics/tests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, entry: &CheckCacheEntry, now_nanos: i64) -> bool {
        if self.config.expiration_millis < 0 {
            return false;
        }
        let ttl_nanos = self.config.expiration_millis.saturating_mul(1_000_000);
        now_nanos.saturating_sub(entry.last_refresh_nanos) > ttl_nanos
    }

    fn validate(&self, req: &CheckRequest, expected_service: &str) -> Result<()> {
        if req.operation.operation_name.is_empty() {
            return Err(Error::InvalidRequest("missing operationName".into()));
        }
        if req.operation.consumer_id.is_empty() {
            return Err(Error::InvalidRequest("missing consumerId".into()));
        }
        if !expected_service.is_empty() && req.service_name != expected_service {
            return Err(Error::InvalidRequest(format!(
                "serviceName mismatch: expected {expected_service}, got {}",
                req.service_name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        model::{Importance, Timestamp},
        ticker::FakeTicker,
    };

    fn req(consumer: &str, op_name: &str, importance: Importance) -> CheckRequest {
        CheckRequest {
            service_name: "svc".into(),
            operation: Operation {
                operation_id: "id".into(),
                operation_name: op_name.into(),
                consumer_id: consumer.into(),
                start_time: Timestamp::new(0, 0),
                end_time: Timestamp::new(1, 0),
                labels: BTreeMap::new(),
                metric_value_sets: vec![],
                importance,
            },
        }
    }

    fn resp(op_id: &str) -> CheckResponse {
        CheckResponse {
            operation_id: op_id.into(),
            attributes: serde_json::Map::new(),
        }
    }

    #[test]
    fn scenario_1_check_cache_hit_and_ttl_expiry() {
        let ticker = FakeTicker::new(0);
        let agg = CheckAggregator::new(
            CheckConfig {
                num_entries: 1000,
                expiration_millis: 4_000,
            },
            ticker.clone(),
        );
        let r = req("C", "OpX", Importance::Low);

        assert!(matches!(agg.check(&r, "svc").unwrap(), CheckOutcome::Miss));
        agg.add_response(&r, resp("OpX"));
        match agg.check(&r, "svc").unwrap() {
            CheckOutcome::Hit(v) => assert_eq!(v.operation_id, "OpX"),
            CheckOutcome::Miss => panic!("expected hit"),
        }

        ticker.advance(4_001 * 1_000_000);
        assert!(matches!(agg.check(&r, "svc").unwrap(), CheckOutcome::Miss));
    }

    #[test]
    fn scenario_2_high_importance_always_bypasses() {
        let ticker = FakeTicker::new(0);
        let agg = CheckAggregator::new(CheckConfig::default(), ticker);
        let r = req("C", "OpX", Importance::High);
        agg.add_response(&r, resp("OpX"));
        assert!(matches!(agg.check(&r, "svc").unwrap(), CheckOutcome::Miss));
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let agg = CheckAggregator::new(CheckConfig::default(), FakeTicker::new(0));
        let mut r = req("", "OpX", Importance::Low);
        assert!(agg.check(&r, "svc").is_err());
        r.operation.consumer_id = "C".into();
        r.operation.operation_name = "".into();
        assert!(agg.check(&r, "svc").is_err());
        r.operation.operation_name = "OpX".into();
        r.service_name = "other".into();
        assert!(agg.check(&r, "svc").is_err());
    }

    #[test]
    fn disabled_cache_always_misses() {
        let agg = CheckAggregator::new(
            CheckConfig {
                num_entries: 0,
                expiration_millis: 4_000,
            },
            FakeTicker::new(0),
        );
        let r = req("C", "OpX", Importance::Low);
        agg.add_response(&r, resp("OpX"));
        assert!(matches!(agg.check(&r, "svc").unwrap(), CheckOutcome::Miss));
        assert_eq!(agg.expiration_millis(), NON_CACHING);
    }

    #[test]
    fn negative_ttl_means_never_expire_by_time() {
        let ticker = FakeTicker::new(0);
        let agg = CheckAggregator::new(
            CheckConfig {
                num_entries: 10,
                expiration_millis: -1,
            },
            ticker.clone(),
        );
        let r = req("C", "OpX", Importance::Low);
        agg.add_response(&r, resp("OpX"));
        ticker.advance(i64::MAX / 2);
        assert!(matches!(
            agg.check(&r, "svc").unwrap(),
            CheckOutcome::Hit(_)
        ));
    }
}
