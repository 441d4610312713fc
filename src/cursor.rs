use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("partition list {0} not found")]
    Missing(PathBuf),
    #[error("partition list {0} has no URLs")]
    Empty(PathBuf),
    #[error("failed to read partition list {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to persist cursor state to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    current_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionState {
    pub cursor: usize,
    pub total_partitions: usize,
}

/// URLs drawn for one cycle. `position` is the 0-based index of the first URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub urls: Vec<String>,
    pub position: usize,
    pub total: usize,
}

/// Round-robin pointer into the ordered partition list.
pub struct PartitionCursor {
    list_path: PathBuf,
    state_path: PathBuf,
}

impl PartitionCursor {
    pub fn new(list_path: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Self {
        PartitionCursor {
            list_path: list_path.into(),
            state_path: state_path.into(),
        }
    }

    pub fn state(&self) -> Result<PartitionState, CursorError> {
        let urls = self.read_urls()?;
        Ok(PartitionState {
            cursor: clamp_index(self.read_index(), urls.len()),
            total_partitions: urls.len(),
        })
    }

    /// Draw the next `batch_size` URLs, wrapping at the end of the list.
    /// Never mutates the persisted state.
    pub fn next_partition(&self, batch_size: usize) -> Result<Partition, CursorError> {
        let urls = self.read_urls()?;
        let total = urls.len();
        let start = clamp_index(self.read_index(), total);
        let take = batch_size.clamp(1, total);

        let selected = (0..take)
            .map(|i| urls[(start + i) % total].clone())
            .collect();

        Ok(Partition {
            urls: selected,
            position: start,
            total,
        })
    }

    /// Move the cursor forward by `batch_size` (at least one, as in
    /// [`next_partition`](Self::next_partition)), modulo the list length.
    pub fn advance(&self, batch_size: usize) -> Result<PartitionState, CursorError> {
        let urls = self.read_urls()?;
        let total = urls.len();
        let start = clamp_index(self.read_index(), total);
        let step = batch_size.max(1) % total;
        let next = (start + step) % total;

        self.write_index(next)?;
        debug!(from = start, to = next, total, "Cursor advanced");
        Ok(PartitionState {
            cursor: next,
            total_partitions: total,
        })
    }

    fn read_urls(&self) -> Result<Vec<String>, CursorError> {
        let text = std::fs::read_to_string(&self.list_path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CursorError::Missing(self.list_path.clone())
            } else {
                CursorError::Read {
                    path: self.list_path.clone(),
                    source: e,
                }
            }
        })?;
        let urls = parse_url_list(&text);
        if urls.is_empty() {
            return Err(CursorError::Empty(self.list_path.clone()));
        }
        Ok(urls)
    }

    /// Absent or corrupt state reads as index 0.
    fn read_index(&self) -> usize {
        let Ok(raw) = std::fs::read_to_string(&self.state_path) else {
            return 0;
        };
        match serde_json::from_str::<StateFile>(&raw) {
            Ok(state) => state.current_index,
            Err(e) => {
                warn!(path = %self.state_path.display(), error = %e, "Corrupt cursor state, starting from 0");
                0
            }
        }
    }

    fn write_index(&self, index: usize) -> Result<(), CursorError> {
        let persist_err = |source| CursorError::Persist {
            path: self.state_path.clone(),
            source,
        };
        let body = serde_json::to_string(&StateFile {
            current_index: index,
        })
        .map_err(|e| persist_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let tmp = tmp_path(&self.state_path);
        std::fs::write(&tmp, body).map_err(persist_err)?;
        std::fs::rename(&tmp, &self.state_path).map_err(persist_err)
    }
}

/// Trimmed, non-blank, non-comment lines; duplicates dropped keeping the first.
pub fn parse_url_list(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter(|l| seen.insert(l.to_string()))
        .map(str::to_string)
        .collect()
}

fn clamp_index(index: usize, total: usize) -> usize {
    if index >= total {
        0
    } else {
        index
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
