//! Append-only structured-line file backend.
//!
//! One JSON document per line, written under a mutex so concurrent appends
//! from unrelated traces never interleave within a record. Queries re-read
//! the file; append order is chronological order.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use super::{apply_limit, DecisionRecord, DecisionStore, RecordFilter};

pub struct LineFileStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl LineFileStore {
    /// Open (or create) the record file in append mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating audit directory {parent:?}"))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening audit file {path:?}"))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DecisionStore for LineFileStore {
    async fn append(&self, record: &DecisionRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("serializing decision record")?;
        let mut file = self.file.lock();
        writeln!(file, "{line}").context("appending decision record")?;
        file.flush().context("flushing audit file")?;
        Ok(())
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<DecisionRecord>> {
        // Hold the lock so a concurrent append can't hand us a torn tail line.
        let contents = {
            let _guard = self.file.lock();
            std::fs::read_to_string(&self.path)
                .with_context(|| format!("reading audit file {:?}", self.path))?
        };

        let mut matched = Vec::new();
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DecisionRecord>(line) {
                Ok(record) => {
                    if filter.matches(&record) {
                        matched.push(record);
                    }
                }
                Err(e) => {
                    warn!(
                        "Skipping malformed audit line {} in {:?}: {}",
                        number + 1,
                        self.path,
                        e
                    );
                }
            }
        }
        Ok(apply_limit(matched, filter.limit))
    }
}
