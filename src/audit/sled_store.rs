//! Indexed embedded backend on sled, for higher-volume deployments.
//!
//! The primary tree keys records by big-endian (timestamp-micros, sequence)
//! so an in-order scan is chronological. Secondary trees index trace id and
//! decision type; their keys embed the primary key, so prefix scans come
//! back chronological too.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{apply_limit, DecisionRecord, DecisionStore, DecisionType, RecordFilter};

const RECORDS_TREE: &str = "records";
const TRACE_TREE: &str = "by_trace";
const TYPE_TREE: &str = "by_type";

pub struct SledStore {
    db: sled::Db,
    records: sled::Tree,
    by_trace: sled::Tree,
    by_type: sled::Tree,
}

impl SledStore {
    /// Open (or create) the store at the given directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .with_context(|| format!("opening audit database at {path:?}"))?;
        let records = db.open_tree(RECORDS_TREE)?;
        let by_trace = db.open_tree(TRACE_TREE)?;
        let by_type = db.open_tree(TYPE_TREE)?;
        Ok(Self {
            db,
            records,
            by_trace,
            by_type,
        })
    }

    fn primary_key(&self, record: &DecisionRecord) -> Result<[u8; 16]> {
        let micros = record.timestamp.timestamp_micros().max(0) as u64;
        let seq = self.db.generate_id().context("allocating record id")?;
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&micros.to_be_bytes());
        key[8..].copy_from_slice(&seq.to_be_bytes());
        Ok(key)
    }

    fn trace_key(trace_id: &str, primary: &[u8; 16]) -> Vec<u8> {
        let mut key = Vec::with_capacity(trace_id.len() + 1 + primary.len());
        key.extend_from_slice(trace_id.as_bytes());
        key.push(0);
        key.extend_from_slice(primary);
        key
    }

    fn type_tag(decision_type: DecisionType) -> u8 {
        match decision_type {
            DecisionType::Plan => 0,
            DecisionType::Route => 1,
        }
    }

    fn type_key(decision_type: DecisionType, primary: &[u8; 16]) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + primary.len());
        key.push(Self::type_tag(decision_type));
        key.extend_from_slice(primary);
        key
    }

    fn load(&self, primary: &[u8]) -> Result<Option<DecisionRecord>> {
        match self.records.get(primary)? {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes).context("decoding decision record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn collect_from_index(
        &self,
        tree: &sled::Tree,
        prefix: &[u8],
        filter: &RecordFilter,
    ) -> Result<Vec<DecisionRecord>> {
        let mut matched = Vec::new();
        for item in tree.scan_prefix(prefix) {
            let (_, primary) = item?;
            if let Some(record) = self.load(&primary)? {
                if filter.matches(&record) {
                    matched.push(record);
                }
            }
        }
        Ok(matched)
    }
}

#[async_trait]
impl DecisionStore for SledStore {
    async fn append(&self, record: &DecisionRecord) -> Result<()> {
        let primary = self.primary_key(record)?;
        let bytes = serde_json::to_vec(record).context("encoding decision record")?;

        self.records.insert(&primary[..], bytes)?;
        self.by_trace
            .insert(Self::trace_key(&record.trace_id, &primary), &primary[..])?;
        self.by_type
            .insert(Self::type_key(record.decision_type, &primary), &primary[..])?;
        self.db.flush().context("flushing audit database")?;
        Ok(())
    }

    async fn query(&self, filter: &RecordFilter) -> Result<Vec<DecisionRecord>> {
        let matched = if let Some(trace_id) = &filter.trace_id {
            let mut prefix = trace_id.as_bytes().to_vec();
            prefix.push(0);
            self.collect_from_index(&self.by_trace, &prefix, filter)?
        } else if let Some(decision_type) = filter.decision_type {
            self.collect_from_index(&self.by_type, &[Self::type_tag(decision_type)], filter)?
        } else {
            let mut matched = Vec::new();
            for item in self.records.iter() {
                let (_, bytes) = item?;
                let record: DecisionRecord =
                    serde_json::from_slice(&bytes).context("decoding decision record")?;
                if filter.matches(&record) {
                    matched.push(record);
                }
            }
            matched
        };
        Ok(apply_limit(matched, filter.limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::tests::record;

    #[tokio::test]
    async fn trace_index_isolates_traces() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        store.append(&record("t1", DecisionType::Plan, "goal")).await.unwrap();
        store.append(&record("t2", DecisionType::Route, "bravo")).await.unwrap();
        store.append(&record("t1", DecisionType::Route, "alpha")).await.unwrap();

        let t1 = store.query(&RecordFilter::for_trace("t1")).await.unwrap();
        assert_eq!(t1.len(), 2);
        assert!(t1.iter().all(|r| r.trace_id == "t1"));

        // A trace id that prefixes another must not leak records.
        let none = store.query(&RecordFilter::for_trace("t")).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn type_index_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        store.append(&record("t1", DecisionType::Plan, "goal")).await.unwrap();
        store.append(&record("t1", DecisionType::Route, "alpha")).await.unwrap();

        let plans = store
            .query(&RecordFilter::of_type(DecisionType::Plan, 10))
            .await
            .unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].target, "goal");
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.append(&record("t1", DecisionType::Route, "alpha")).await.unwrap();
        }
        let reopened = SledStore::open(dir.path()).unwrap();
        let all = reopened.query(&RecordFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
