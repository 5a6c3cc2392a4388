//! JournalStore — redb-backed persistence for patch campaigns.
//!
//! Provides typed operations over campaign records, the step write-ahead
//! log, and the progress log. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` via a closure factory.
///
/// `map_err!(Open)` for database creation, `map_err!(stage "read")` for redb
/// operations, `map_err!(Corrupt, key)` / `map_err!(Encode, key)` for values.
macro_rules! map_err {
    (Open) => {
        |e| StateError::Open(e.to_string())
    };
    (stage $stage:literal) => {
        |e| StateError::Storage {
            stage: $stage,
            message: e.to_string(),
        }
    };
    ($variant:ident, $key:expr) => {
        |e| StateError::$variant {
            key: $key.to_string(),
            message: e.to_string(),
        }
    };
}

/// Thread-safe campaign journal backed by redb.
#[derive(Clone)]
pub struct JournalStore {
    db: Arc<Database>,
}

impl JournalStore {
    /// Open (or create) a persistent journal at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "journal opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory journal (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory journal opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(stage "transaction"))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CAMPAIGNS).map_err(map_err!(stage "table"))?;
        txn.open_table(STEPS).map_err(map_err!(stage "table"))?;
        txn.open_table(PROGRESS).map_err(map_err!(stage "table"))?;
        txn.open_table(PROGRESS_KEYS).map_err(map_err!(stage "table"))?;
        txn.commit().map_err(map_err!(stage "transaction"))?;
        Ok(())
    }

    // ── Campaigns ──────────────────────────────────────────────────

    /// Insert or replace a campaign record.
    pub fn put_campaign(&self, record: &CampaignRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Encode, record.id))?;
        let txn = self.db.begin_write().map_err(map_err!(stage "transaction"))?;
        {
            let mut table = txn.open_table(CAMPAIGNS).map_err(map_err!(stage "table"))?;
            table
                .insert(record.id.as_str(), value.as_slice())
                .map_err(map_err!(stage "write"))?;
        }
        txn.commit().map_err(map_err!(stage "transaction"))?;
        debug!(campaign = %record.id, status = ?record.status, "campaign stored");
        Ok(())
    }

    /// Get a campaign by ID.
    pub fn get_campaign(&self, id: &str) -> StateResult<Option<CampaignRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(stage "transaction"))?;
        let table = txn.open_table(CAMPAIGNS).map_err(map_err!(stage "table"))?;
        match table.get(id).map_err(map_err!(stage "read"))? {
            Some(guard) => {
                let record: CampaignRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Corrupt, id))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all campaigns.
    pub fn list_campaigns(&self) -> StateResult<Vec<CampaignRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(stage "transaction"))?;
        let table = txn.open_table(CAMPAIGNS).map_err(map_err!(stage "table"))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(stage "read"))? {
            let (key, value) = entry.map_err(map_err!(stage "read"))?;
            let record: CampaignRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Corrupt, key.value()))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Read-modify-write a campaign record inside one write transaction.
    ///
    /// Returns the updated record, or `CampaignNotFound` if the campaign is unknown.
    pub fn update_campaign<F>(&self, id: &str, mutate: F) -> StateResult<CampaignRecord>
    where
        F: FnOnce(&mut CampaignRecord),
    {
        let txn = self.db.begin_write().map_err(map_err!(stage "transaction"))?;
        let record = {
            let mut table = txn.open_table(CAMPAIGNS).map_err(map_err!(stage "table"))?;
            let mut record: CampaignRecord = match table.get(id).map_err(map_err!(stage "read"))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Corrupt, id))?
                }
                None => return Err(StateError::CampaignNotFound(id.to_string())),
            };
            mutate(&mut record);
            let value = serde_json::to_vec(&record).map_err(map_err!(Encode, id))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(stage "write"))?;
            record
        };
        txn.commit().map_err(map_err!(stage "transaction"))?;
        Ok(record)
    }

    /// Mark a campaign approved. Idempotent; approval is never revoked.
    ///
    /// Returns true if this call flipped the flag.
    pub fn set_approved(&self, id: &str) -> StateResult<bool> {
        let mut changed = false;
        self.update_campaign(id, |record| {
            changed = !record.approved;
            record.approved = true;
        })?;
        debug!(campaign = %id, changed, "approval recorded");
        Ok(changed)
    }

    // ── Steps ──────────────────────────────────────────────────────

    /// Record the outcome of a step. Overwrites any earlier record for the key.
    pub fn record_step(
        &self,
        campaign_id: &str,
        step_key: &str,
        record: &StepRecord,
    ) -> StateResult<()> {
        let key = scoped_key(campaign_id, step_key);
        let value = serde_json::to_vec(record).map_err(map_err!(Encode, key))?;
        let txn = self.db.begin_write().map_err(map_err!(stage "transaction"))?;
        {
            let mut table = txn.open_table(STEPS).map_err(map_err!(stage "table"))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(stage "write"))?;
        }
        txn.commit().map_err(map_err!(stage "transaction"))?;
        debug!(%key, status = ?record.status, "step recorded");
        Ok(())
    }

    /// Get the journaled outcome of a step, if any.
    pub fn get_step(&self, campaign_id: &str, step_key: &str) -> StateResult<Option<StepRecord>> {
        let key = scoped_key(campaign_id, step_key);
        let txn = self.db.begin_read().map_err(map_err!(stage "transaction"))?;
        let table = txn.open_table(STEPS).map_err(map_err!(stage "table"))?;
        match table.get(key.as_str()).map_err(map_err!(stage "read"))? {
            Some(guard) => {
                let record: StepRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Corrupt, key))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all journaled steps of a campaign as `(step_key, record)` pairs.
    pub fn list_steps_for_campaign(
        &self,
        campaign_id: &str,
    ) -> StateResult<Vec<(String, StepRecord)>> {
        let prefix = campaign_prefix(campaign_id);
        let txn = self.db.begin_read().map_err(map_err!(stage "transaction"))?;
        let table = txn.open_table(STEPS).map_err(map_err!(stage "table"))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(stage "read"))? {
            let (key, value) = entry.map_err(map_err!(stage "read"))?;
            let Some(step_key) = key.value().strip_prefix(prefix.as_str()) else {
                break;
            };
            let record: StepRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Corrupt, key.value()))?;
            results.push((step_key.to_string(), record));
        }
        Ok(results)
    }

    // ── Progress ───────────────────────────────────────────────────

    /// Append an entry to a campaign's progress log.
    ///
    /// The milestone key identifies the entry across replays: if it was
    /// already written, nothing is appended and `false` is returned. The
    /// check and the append happen in one write transaction.
    pub fn append_progress(
        &self,
        campaign_id: &str,
        milestone_key: &str,
        entry: &str,
    ) -> StateResult<bool> {
        let marker = scoped_key(campaign_id, milestone_key);
        let prefix = campaign_prefix(campaign_id);
        let txn = self.db.begin_write().map_err(map_err!(stage "transaction"))?;
        let seq = {
            let mut keys = txn.open_table(PROGRESS_KEYS).map_err(map_err!(stage "table"))?;
            if keys.get(marker.as_str()).map_err(map_err!(stage "read"))?.is_some() {
                return Ok(false);
            }

            let mut table = txn.open_table(PROGRESS).map_err(map_err!(stage "table"))?;
            let seq = match table
                .range(prefix.as_str()..prefix_end(campaign_id).as_str())
                .map_err(map_err!(stage "read"))?
                .next_back()
            {
                Some(last) => {
                    let (key, _) = last.map_err(map_err!(stage "read"))?;
                    let key = key.value();
                    let last_seq = key[prefix.len()..]
                        .parse::<u64>()
                        .map_err(map_err!(Corrupt, key))?;
                    last_seq + 1
                }
                None => 0,
            };

            let key = scoped_key(campaign_id, &format!("{seq:010}"));
            table
                .insert(key.as_str(), entry.as_bytes())
                .map_err(map_err!(stage "write"))?;
            keys.insert(marker.as_str(), seq)
                .map_err(map_err!(stage "write"))?;
            seq
        };
        txn.commit().map_err(map_err!(stage "transaction"))?;
        debug!(campaign = %campaign_id, seq, %entry, "progress appended");
        Ok(true)
    }

    /// List a campaign's progress entries in append order.
    pub fn list_progress(&self, campaign_id: &str) -> StateResult<Vec<String>> {
        let prefix = campaign_prefix(campaign_id);
        let txn = self.db.begin_read().map_err(map_err!(stage "transaction"))?;
        let table = txn.open_table(PROGRESS).map_err(map_err!(stage "table"))?;
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(stage "read"))? {
            let (key, value) = entry.map_err(map_err!(stage "read"))?;
            if !key.value().starts_with(prefix.as_str()) {
                break;
            }
            let text =
                std::str::from_utf8(value.value()).map_err(map_err!(Corrupt, key.value()))?;
            results.push(text.to_string());
        }
        Ok(results)
    }

    // ── Archival ───────────────────────────────────────────────────

    /// Delete a campaign and its whole history (steps and progress).
    ///
    /// Used when a finished campaign's identifier is reused. Returns the
    /// number of history rows removed.
    pub fn purge_campaign(&self, campaign_id: &str) -> StateResult<u32> {
        let prefix = campaign_prefix(campaign_id);
        let txn = self.db.begin_write().map_err(map_err!(stage "transaction"))?;
        let mut removed = 0u32;
        {
            let mut campaigns = txn.open_table(CAMPAIGNS).map_err(map_err!(stage "table"))?;
            campaigns.remove(campaign_id).map_err(map_err!(stage "write"))?;

            let mut steps = txn.open_table(STEPS).map_err(map_err!(stage "table"))?;
            let step_keys = collect_prefixed(&steps, &prefix)?;
            for key in &step_keys {
                steps.remove(key.as_str()).map_err(map_err!(stage "write"))?;
            }

            let mut progress = txn.open_table(PROGRESS).map_err(map_err!(stage "table"))?;
            let progress_keys = collect_prefixed(&progress, &prefix)?;
            for key in &progress_keys {
                progress.remove(key.as_str()).map_err(map_err!(stage "write"))?;
            }
            removed += (step_keys.len() + progress_keys.len()) as u32;

            let mut markers = txn.open_table(PROGRESS_KEYS).map_err(map_err!(stage "table"))?;
            for key in &collect_prefixed(&markers, &prefix)? {
                markers.remove(key.as_str()).map_err(map_err!(stage "write"))?;
            }
        }
        txn.commit().map_err(map_err!(stage "transaction"))?;
        debug!(campaign = %campaign_id, removed, "campaign purged");
        Ok(removed)
    }
}

/// Collect every key starting with `prefix`; the range borrows the table,
/// so removal happens afterwards.
fn collect_prefixed<V, T>(table: &T, prefix: &str) -> StateResult<Vec<String>>
where
    V: redb::Value + 'static,
    T: ReadableTable<&'static str, V>,
{
    let mut keys = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(stage "read"))? {
        let (key, _) = entry.map_err(map_err!(stage "read"))?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_string());
    }
    Ok(keys)
}
