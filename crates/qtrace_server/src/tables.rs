//! Internal catalog tables for captured plans and per-node statistics.
//!
//! Two append-only tables backed by keyspace partitions: `pg_qss_plans`
//! (one row per distinct plan, upserted under a primary-key existence
//! check) and `pg_qss_stats` (one row per counter block per execution).
//! The heap is keyed by a monotonic tuple id; the plans primary key lives
//! in its own index partition, probed before every insert.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions};
use serde::{Deserialize, Serialize};

const PLANS_TABLE: &str = "pg_qss_plans";
const PLANS_INDEX: &str = "pg_qss_plans_pkey";
const STATS_TABLE: &str = "pg_qss_stats";

/// One row of `pg_qss_plans`, primary key `(query_id, generation, db_id, pid)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlansRow {
    pub query_id: i64,
    pub generation: i32,
    pub db_id: i32,
    pub pid: i32,
    pub timestamp: i64,
    pub features_text: String,
}

/// One row of `pg_qss_stats`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsRow {
    pub query_id: i64,
    pub db_id: i32,
    pub pid: i32,
    pub timestamp: i64,
    pub plan_node_id: i32,
    pub elapsed_us: f64,
    pub counters: [f64; 10],
    pub payload: i64,
    pub comment: Option<String>,
}

fn plans_key(query_id: i64, generation: i32, db_id: i32, pid: i32) -> [u8; 20] {
    let mut key = [0u8; 20];
    key[0..8].copy_from_slice(&query_id.to_be_bytes());
    key[8..12].copy_from_slice(&generation.to_be_bytes());
    key[12..16].copy_from_slice(&db_id.to_be_bytes());
    key[16..20].copy_from_slice(&pid.to_be_bytes());
    key
}

pub struct QssTables {
    /// Keeps the keyspace alive for as long as the table handles are.
    _keyspace: Keyspace,
    plans: fjall::PartitionHandle,
    plans_index: fjall::PartitionHandle,
    stats: fjall::PartitionHandle,
    plans_tid_seq: AtomicU64,
    stats_tid_seq: AtomicU64,
    /// Serializes the probe-then-insert pair, the moral equivalent of the
    /// row-exclusive table locks the upsert holds.
    upsert_lock: Mutex<()>,
}

fn next_tid(partition: &fjall::PartitionHandle) -> anyhow::Result<u64> {
    let mut max_tid = 0u64;
    for item in partition.iter() {
        let (key, _) = item.context("scan table for max tuple id")?;
        if key.len() == 8 {
            let tid = u64::from_be_bytes(key.as_ref().try_into().expect("8-byte tid"));
            max_tid = max_tid.max(tid + 1);
        }
    }
    Ok(max_tid)
}

impl QssTables {
    pub fn open(keyspace: &Keyspace) -> anyhow::Result<Self> {
        let plans = keyspace
            .open_partition(PLANS_TABLE, PartitionCreateOptions::default())
            .context("open plans table")?;
        let plans_index = keyspace
            .open_partition(PLANS_INDEX, PartitionCreateOptions::default())
            .context("open plans pkey index")?;
        let stats = keyspace
            .open_partition(STATS_TABLE, PartitionCreateOptions::default())
            .context("open stats table")?;
        let plans_tid_seq = AtomicU64::new(next_tid(&plans)?);
        let stats_tid_seq = AtomicU64::new(next_tid(&stats)?);
        Ok(Self {
            _keyspace: keyspace.clone(),
            plans,
            plans_index,
            stats,
            plans_tid_seq,
            stats_tid_seq,
            upsert_lock: Mutex::new(()),
        })
    }

    /// Idempotent insert on the plans primary key. The caller has already
    /// formatted the plan text once. Returns false when the key existed and
    /// nothing was written.
    pub fn upsert_plan(&self, row: &PlansRow) -> anyhow::Result<bool> {
        let key = plans_key(row.query_id, row.generation, row.db_id, row.pid);
        let _guard = self
            .upsert_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self
            .plans_index
            .get(key)
            .context("probe plans pkey")?
            .is_some()
        {
            return Ok(false);
        }
        let tid = self.plans_tid_seq.fetch_add(1, Ordering::Relaxed);
        let value = serde_json::to_vec(row).context("encode plans row")?;
        self.plans
            .insert(tid.to_be_bytes(), value)
            .context("insert plans heap tuple")?;
        self.plans_index
            .insert(key, tid.to_be_bytes())
            .context("insert plans index tuple")?;
        Ok(true)
    }

    pub fn append_stat(&self, row: &StatsRow) -> anyhow::Result<()> {
        let tid = self.stats_tid_seq.fetch_add(1, Ordering::Relaxed);
        let value = serde_json::to_vec(row).context("encode stats row")?;
        self.stats
            .insert(tid.to_be_bytes(), value)
            .context("insert stats heap tuple")?;
        Ok(())
    }

    pub fn scan_plans(&self) -> anyhow::Result<Vec<PlansRow>> {
        let mut rows = Vec::new();
        for item in self.plans.iter() {
            let (_, value) = item.context("scan plans table")?;
            rows.push(serde_json::from_slice(&value).context("decode plans row")?);
        }
        Ok(rows)
    }

    pub fn scan_stats(&self) -> anyhow::Result<Vec<StatsRow>> {
        let mut rows = Vec::new();
        for item in self.stats.iter() {
            let (_, value) = item.context("scan stats table")?;
            rows.push(serde_json::from_slice(&value).context("decode stats row")?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tables(dir: &std::path::Path) -> QssTables {
        let keyspace = fjall::Config::new(dir).open().expect("open keyspace");
        QssTables::open(&keyspace).expect("open tables")
    }

    fn plans_row(query_id: i64, generation: i32) -> PlansRow {
        PlansRow {
            query_id,
            generation,
            db_id: 1,
            pid: 7,
            timestamp: 1_000,
            features_text: "{\"plan\":{}}".to_string(),
        }
    }

    #[test]
    fn plan_upsert_is_idempotent_on_pkey() {
        let dir = tempfile::tempdir().unwrap();
        let tables = open_tables(dir.path());

        assert!(tables.upsert_plan(&plans_row(9, 1)).unwrap());
        assert!(!tables.upsert_plan(&plans_row(9, 1)).unwrap());
        assert!(tables.upsert_plan(&plans_row(9, 2)).unwrap());
        assert_eq!(tables.scan_plans().unwrap().len(), 2);
    }

    #[test]
    fn stats_rows_append() {
        let dir = tempfile::tempdir().unwrap();
        let tables = open_tables(dir.path());

        let row = StatsRow {
            query_id: 9,
            db_id: 1,
            pid: 7,
            timestamp: 1_000,
            plan_node_id: -1,
            elapsed_us: 123.5,
            counters: [0.0; 10],
            payload: 0,
            comment: None,
        };
        tables.append_stat(&row).unwrap();
        tables.append_stat(&row).unwrap();
        let rows = tables.scan_stats().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], row);
    }

    #[test]
    fn tuple_ids_resume_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tables = open_tables(dir.path());
            assert!(tables.upsert_plan(&plans_row(1, 1)).unwrap());
        }
        let tables = open_tables(dir.path());
        assert!(tables.upsert_plan(&plans_row(2, 1)).unwrap());
        assert_eq!(tables.scan_plans().unwrap().len(), 2);
    }
}
