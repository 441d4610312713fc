use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::{info, warn};

use crate::db::{self, normalize_key, ListingRecord};
use crate::staleness::FreshnessIndex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("dataset error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create dataset directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Other(String),
}

/// Persistence backend for the listing table.
pub trait Dataset {
    fn load(&self) -> Result<Vec<ListingRecord>, StoreError>;
    /// Atomically replace every stored row.
    fn replace_all(&self, rows: &[ListingRecord]) -> Result<(), StoreError>;
    fn append(&self, rows: &[ListingRecord]) -> Result<(), StoreError>;
}

pub struct SqliteDataset {
    conn: Connection,
}

impl SqliteDataset {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = db::connect(path)?;
        db::init_schema(&conn)?;
        Ok(SqliteDataset { conn })
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        let conn = Connection::open_in_memory().unwrap();
        db::init_schema(&conn).unwrap();
        SqliteDataset { conn }
    }
}

impl Dataset for SqliteDataset {
    fn load(&self) -> Result<Vec<ListingRecord>, StoreError> {
        Ok(db::load_listings(&self.conn)?)
    }

    fn replace_all(&self, rows: &[ListingRecord]) -> Result<(), StoreError> {
        Ok(db::replace_listings(&self.conn, rows)?)
    }

    fn append(&self, rows: &[ListingRecord]) -> Result<(), StoreError> {
        Ok(db::append_listings(&self.conn, rows)?)
    }
}

#[derive(Debug)]
pub enum UpsertOutcome {
    Nothing,
    Merged { rows: usize },
    /// The merge path failed and only the new batch was appended.
    Appended { rows: usize, primary_error: String },
}

/// Snapshot-based upsert: the dataset is read once when the store opens and
/// written once per `upsert`.
pub struct MergeUpsertStore<D> {
    dataset: D,
    snapshot: Vec<ListingRecord>,
    snapshot_loaded: bool,
}

impl<D: Dataset> MergeUpsertStore<D> {
    pub fn open(dataset: D) -> Self {
        let (snapshot, snapshot_loaded) = match dataset.load() {
            Ok(rows) => (merge_records(Vec::new(), rows), true),
            Err(e) => {
                warn!(error = %e, "Existing dataset unreadable, new rows will be appended only");
                (Vec::new(), false)
            }
        };
        MergeUpsertStore {
            dataset,
            snapshot,
            snapshot_loaded,
        }
    }

    /// Deduplicated view of the dataset as of the last read or write.
    pub fn snapshot(&self) -> &[ListingRecord] {
        &self.snapshot
    }

    pub fn freshness_index(&self) -> FreshnessIndex {
        FreshnessIndex::from_records(&self.snapshot)
    }

    /// Merge `new_records` into the snapshot and persist. Falls back to a
    /// plain append of the batch when the merge path fails; only a failure of
    /// that fallback is returned as an error.
    pub fn upsert(&mut self, new_records: Vec<ListingRecord>) -> Result<UpsertOutcome, StoreError> {
        if new_records.is_empty() {
            return Ok(UpsertOutcome::Nothing);
        }

        match self.merge_and_replace(&new_records) {
            Ok(merged) => {
                let rows = merged.len();
                self.snapshot = merged;
                info!(new = new_records.len(), total = rows, "Dataset saved");
                Ok(UpsertOutcome::Merged { rows })
            }
            Err(e) => {
                warn!(error = %e, rows = new_records.len(), "Merge failed, appending batch instead");
                self.dataset.append(&new_records)?;
                if self.snapshot_loaded {
                    let previous = std::mem::take(&mut self.snapshot);
                    self.snapshot = merge_records(new_records.clone(), previous);
                }
                Ok(UpsertOutcome::Appended {
                    rows: new_records.len(),
                    primary_error: e.to_string(),
                })
            }
        }
    }

    fn merge_and_replace(&self, new_records: &[ListingRecord]) -> Result<Vec<ListingRecord>, StoreError> {
        if !self.snapshot_loaded {
            return Err(StoreError::Other(
                "existing dataset was not readable at startup".into(),
            ));
        }
        let merged = merge_records(new_records.to_vec(), self.snapshot.clone());
        self.dataset.replace_all(&merged)?;
        Ok(merged)
    }
}

/// New rows first, then existing; stable sort newest-first (undated rows
/// last); keep the first row per normalized key. Ties go to the new row.
pub fn merge_records(new: Vec<ListingRecord>, existing: Vec<ListingRecord>) -> Vec<ListingRecord> {
    let mut all: Vec<ListingRecord> = new
        .into_iter()
        .chain(existing)
        .filter_map(|mut r| {
            r.external_id = normalize_key(&r.external_id)?;
            Some(r)
        })
        .collect();

    all.sort_by(|a, b| b.last_fetched.cmp(&a.last_fetched));

    let mut seen = HashSet::new();
    all.retain(|r| seen.insert(r.external_id.clone()));
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_record;
    use chrono::{TimeZone, Utc};

    struct FailingMerge(SqliteDataset);

    impl Dataset for FailingMerge {
        fn load(&self) -> Result<Vec<ListingRecord>, StoreError> {
            self.0.load()
        }
        fn replace_all(&self, _rows: &[ListingRecord]) -> Result<(), StoreError> {
            Err(StoreError::Other("forced merge error".into()))
        }
        fn append(&self, rows: &[ListingRecord]) -> Result<(), StoreError> {
            self.0.append(rows)
        }
    }

    struct Unwritable;

    impl Dataset for Unwritable {
        fn load(&self) -> Result<Vec<ListingRecord>, StoreError> {
            Ok(Vec::new())
        }
        fn replace_all(&self, _rows: &[ListingRecord]) -> Result<(), StoreError> {
            Err(StoreError::Other("disk full".into()))
        }
        fn append(&self, _rows: &[ListingRecord]) -> Result<(), StoreError> {
            Err(StoreError::Other("disk full".into()))
        }
    }

    fn day(d: u32) -> Option<chrono::DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2026, 1, d, 0, 0, 0).unwrap())
    }

    #[test]
    fn keeps_existing_and_adds_new() {
        let ds = SqliteDataset::in_memory();
        ds.append(&[test_record("100", "place-100", day(1))]).unwrap();

        let mut store = MergeUpsertStore::open(ds);
        store.upsert(vec![test_record("200", "place-200", day(22))]).unwrap();

        let ids: HashSet<String> = store.dataset.load().unwrap().into_iter().map(|r| r.external_id).collect();
        assert_eq!(ids, HashSet::from(["100".to_string(), "200".to_string()]));
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut store = MergeUpsertStore::open(SqliteDataset::in_memory());
        let rec = test_record("100", "same", day(5));
        store.upsert(vec![rec.clone()]).unwrap();
        store.upsert(vec![rec.clone()]).unwrap();

        let rows = store.dataset.load().unwrap();
        assert_eq!(rows, vec![rec]);
    }

    #[test]
    fn newer_new_record_wins() {
        let ds = SqliteDataset::in_memory();
        ds.append(&[test_record("500", "old-title", day(1))]).unwrap();
        let mut store = MergeUpsertStore::open(ds);
        store.upsert(vec![test_record("500", "new-title", day(22))]).unwrap();

        let rows = store.dataset.load().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "new-title");
    }

    #[test]
    fn newer_existing_record_beats_stale_new_one() {
        let ds = SqliteDataset::in_memory();
        ds.append(&[test_record("500", "disk-newer", day(20))]).unwrap();
        let mut store = MergeUpsertStore::open(ds);
        store.upsert(vec![test_record("500", "memory-older", day(2))]).unwrap();

        let rows = store.dataset.load().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "disk-newer");
        assert_eq!(rows[0].last_fetched, day(20));
    }

    #[test]
    fn keys_are_normalized_before_dedup() {
        let merged = merge_records(
            vec![test_record(" 600 ", "string-id-new", day(22))],
            vec![
                test_record("600", "int-id", day(1)),
                test_record("nan", "junk", day(3)),
                test_record("", "junk", day(3)),
            ],
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].external_id, "600");
        assert_eq!(merged[0].title, "string-id-new");
    }

    #[test]
    fn undated_rows_lose_to_dated_ones() {
        let merged = merge_records(
            vec![test_record("7", "undated-new", None)],
            vec![test_record("7", "dated-old", day(1))],
        );
        assert_eq!(merged[0].title, "dated-old");
    }

    #[test]
    fn fallback_appends_when_merge_fails() {
        let mut store = MergeUpsertStore::open(FailingMerge(SqliteDataset::in_memory()));
        let outcome = store.upsert(vec![test_record("300", "place-300", day(22))]).unwrap();

        assert!(matches!(outcome, UpsertOutcome::Appended { rows: 1, .. }));
        let rows = store.dataset.0.load().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].external_id, "300");
    }

    #[test]
    fn fallback_duplicates_collapse_on_next_open() {
        let ds = SqliteDataset::in_memory();
        ds.append(&[test_record("42", "v1", day(1))]).unwrap();
        let mut store = MergeUpsertStore::open(FailingMerge(ds));
        store.upsert(vec![test_record("42", "v2", day(9))]).unwrap();

        let FailingMerge(ds) = store.dataset;
        assert_eq!(ds.load().unwrap().len(), 2);

        let reopened = MergeUpsertStore::open(ds);
        assert_eq!(reopened.snapshot().len(), 1);
        assert_eq!(reopened.snapshot()[0].title, "v2");
    }

    #[test]
    fn fallback_failure_is_reported() {
        let mut store = MergeUpsertStore::open(Unwritable);
        assert!(store.upsert(vec![test_record("1", "a", day(1))]).is_err());
    }

    #[test]
    fn open_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/nested/listings.sqlite");
        let ds = SqliteDataset::open(&path).unwrap();
        ds.append(&[test_record("1", "a", day(1))]).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn unusable_directory_is_named_in_the_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let err = SqliteDataset::open(&blocker.join("sub/listings.sqlite")).err().unwrap();
        assert!(matches!(&err, StoreError::CreateDir { path, .. } if *path == blocker.join("sub")));
        assert!(err.to_string().contains("blocker"));
    }

    #[test]
    fn empty_batch_touches_nothing() {
        let mut store = MergeUpsertStore::open(Unwritable);
        assert!(matches!(store.upsert(Vec::new()).unwrap(), UpsertOutcome::Nothing));
    }
}
