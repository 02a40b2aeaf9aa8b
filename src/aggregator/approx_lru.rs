// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use dashmap::DashMap;
use rand::Rng;

/// How many candidate keys to sample when a `DashMap`-backed cache needs
/// to evict to stay under its configured capacity.
///
/// `DashMap` keeps no access-order list, so an exact LRU victim isn't
/// cheaply available; spec §4.2 only asks for "approximately"
/// least-recently-used eviction, the same trade-off caches like
/// Caffeine/Redis make. Sampling a handful of keys and evicting the
/// oldest among them gets the same qualitative behavior without an
/// auxiliary ordered index.
const SAMPLE_SIZE: usize = 5;

/// Evicts entries from `map` until its length is at most `capacity`,
/// each round sampling up to [`SAMPLE_SIZE`] keys and removing whichever
/// one `last_access` reports as oldest.
pub fn evict_to_capacity<K, V>(map: &DashMap<K, V>, capacity: usize, last_access: impl Fn(&V) -> i64)
where
    K: std::hash::Hash + Eq + Clone,
{
    let mut rng = rand::rng();
    while map.len() > capacity {
        let keys: Vec<K> = map.iter().map(|e| e.key().clone()).collect();
        if keys.is_empty() {
            break;
        }
        let sample = SAMPLE_SIZE.min(keys.len());
        let mut victim: Option<K> = None;
        let mut victim_access = i64::MAX;
        for _ in 0..sample {
            let idx = rng.random_range(0..keys.len());
            let key = &keys[idx];
            if let Some(entry) = map.get(key) {
                let access = last_access(entry.value());
                if access < victim_access {
                    victim_access = access;
                    victim = Some(key.clone());
                }
            }
        }
        match victim {
            Some(key) => {
                map.remove(&key);
            },
            None => break,
        }
    }
}
