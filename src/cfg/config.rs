// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Sentinel returned by [`CheckConfig::expiration_millis_or_non_caching`]
/// when caching is disabled for that aggregator.
pub const NON_CACHING: i64 = -1;

/// Sentinel for [`FacadeConfig::stats_log_frequency`]: never emit the
/// statistics summary.
pub const DO_NOT_LOG: i64 = -1;

/// Top-level configuration for the aggregation/caching layer.
///
/// Mirrors the nested shape of a classic YAML service config: one struct
/// per aggregator plus the facade's own lifecycle knobs, each with
/// `Default` impls matching the values recognised spec-side.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Configuration {
    /// Check-aggregator cache sizing and TTL.
    pub check: CheckConfig,
    /// Quota-aggregator cache sizing, TTL and refresh cadence.
    pub quota: QuotaConfig,
    /// Report-aggregator batching and flush cadence.
    pub report: ReportConfig,
    /// Client facade lifecycle and statistics knobs.
    pub facade: FacadeConfig,
}

impl Configuration {
    /// Loads and parses a YAML configuration file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {path:?}"))?;
        let cfg: Configuration = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {path:?}"))?;
        Ok(cfg)
    }
}

/// Check-aggregator configuration: `{ numEntries, expirationMillis }`.
#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
#[serde(default, rename_all = "camelCase")]
pub struct CheckConfig {
    /// Maximum number of cached entries. Non-positive disables caching.
    pub num_entries: i64,
    /// TTL-after-write, in milliseconds. Negative means "never expire by
    /// time, only by capacity".
    pub expiration_millis: i64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        CheckConfig {
            num_entries: 1000,
            expiration_millis: 4_000,
        }
    }
}

impl CheckConfig {
    /// Whether the cache is disabled entirely (`numEntries <= 0`).
    pub fn is_disabled(&self) -> bool {
        self.num_entries <= 0
    }

    /// The configured TTL, or [`NON_CACHING`] when disabled.
    pub fn expiration_millis_or_non_caching(&self) -> i64 {
        if self.is_disabled() {
            NON_CACHING
        } else {
            self.expiration_millis
        }
    }
}

/// Quota-aggregator configuration: `{ numEntries, expirationMillis,
/// refreshMillis }`.
#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
#[serde(default, rename_all = "camelCase")]
pub struct QuotaConfig {
    /// Maximum number of cached entries. Non-positive disables caching.
    pub num_entries: i64,
    /// TTL-after-write, in milliseconds.
    pub expiration_millis: i64,
    /// Interval between proactive refreshes, in milliseconds.
    pub refresh_millis: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        QuotaConfig {
            num_entries: 1000,
            expiration_millis: 60_000,
            refresh_millis: 60_000,
        }
    }
}

impl QuotaConfig {
    /// Whether the cache is disabled entirely (`numEntries <= 0`).
    pub fn is_disabled(&self) -> bool {
        self.num_entries <= 0
    }
}

/// Report-aggregator configuration: `{ numEntries, flushIntervalMillis,
/// maxOperationsPerBatch }`.
#[derive(Deserialize, Serialize, Debug, Clone, Copy)]
#[serde(default, rename_all = "camelCase")]
pub struct ReportConfig {
    /// Maximum number of pending report slots. Non-positive disables
    /// merging.
    pub num_entries: i64,
    /// Flush cadence, in milliseconds. Negative means caching disabled.
    pub flush_interval_millis: i64,
    /// Maximum operations carried by one flushed `ReportRequest`.
    pub max_operations_per_batch: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        ReportConfig {
            num_entries: 200,
            flush_interval_millis: 1_000,
            max_operations_per_batch: 1_000,
        }
    }
}

impl ReportConfig {
    /// Whether merging is disabled entirely (`numEntries <= 0`).
    pub fn is_disabled(&self) -> bool {
        self.num_entries <= 0
    }
}

/// Client facade configuration: statistics cadence, upstream service
/// name, and the idle-shutdown threshold.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct FacadeConfig {
    /// Emit the statistics summary every N report calls. `DO_NOT_LOG`
    /// (-1) disables emission.
    pub stats_log_frequency: i64,
    /// The upstream service name carried on every request and checked
    /// against incoming requests.
    pub service_name: String,
    /// Self-stop the background thread after this many seconds without a
    /// non-empty report flush.
    pub max_idle_seconds: u64,
}

impl Default for FacadeConfig {
    fn default() -> Self {
        FacadeConfig {
            stats_log_frequency: DO_NOT_LOG,
            service_name: String::new(),
            max_idle_seconds: 120,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Configuration::default();
        assert_eq!(cfg.check.num_entries, 1000);
        assert_eq!(cfg.check.expiration_millis, 4_000);
        assert_eq!(cfg.quota.num_entries, 1000);
        assert_eq!(cfg.quota.expiration_millis, 60_000);
        assert_eq!(cfg.quota.refresh_millis, 60_000);
        assert_eq!(cfg.report.num_entries, 200);
        assert_eq!(cfg.report.flush_interval_millis, 1_000);
        assert_eq!(cfg.report.max_operations_per_batch, 1_000);
        assert_eq!(cfg.facade.max_idle_seconds, 120);
        assert_eq!(cfg.facade.stats_log_frequency, DO_NOT_LOG);
    }

    #[test]
    fn parses_partial_yaml_with_defaults() {
        let yaml = "check:\n  numEntries: 10\n";
        let cfg: Configuration = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.check.num_entries, 10);
        assert_eq!(cfg.quota.num_entries, 1000);
    }
}
