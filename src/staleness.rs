use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::db::{normalize_key, ListingRecord};

/// Read-only map from natural key to last successful fetch.
#[derive(Debug, Default, Clone)]
pub struct FreshnessIndex {
    last_fetched: HashMap<String, Option<DateTime<Utc>>>,
}

impl FreshnessIndex {
    /// When a key appears more than once the newest timestamp wins.
    pub fn from_records(records: &[ListingRecord]) -> Self {
        let mut last_fetched: HashMap<String, Option<DateTime<Utc>>> = HashMap::new();
        for r in records {
            let Some(key) = normalize_key(&r.external_id) else {
                continue;
            };
            let slot = last_fetched.entry(key).or_insert(None);
            if r.last_fetched > *slot {
                *slot = r.last_fetched;
            }
        }
        FreshnessIndex { last_fetched }
    }

    /// `None` if the key was never stored; `Some(None)` if stored undated.
    pub fn lookup(&self, key: &str) -> Option<Option<DateTime<Utc>>> {
        let key = normalize_key(key)?;
        self.last_fetched.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.last_fetched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_fetched.is_empty()
    }
}

/// True when `key` must be (re)extracted. Unknown keys and undated rows are
/// always stale, so a bad timestamp can only cause extra work.
pub fn is_stale(
    key: &str,
    index: &FreshnessIndex,
    now: DateTime<Utc>,
    ttl: Duration,
    force: bool,
) -> bool {
    if force {
        return true;
    }
    match index.lookup(key) {
        None | Some(None) => true,
        Some(Some(last)) => now - last >= ttl,
    }
}
