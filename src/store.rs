use anyhow::Context;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use crate::crypto::Pkh;
use crate::error::{MultisigError, Result};
use crate::lock::{LockRoot, SpendingCondition};
use crate::note::Nicks;
use crate::proposal::{Proposal, ProposalStatus, SeedSummary};
use crate::tx::{SignedFragment, TxId};

/// A registered m-of-n wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: Uuid,
    pub lock_root: LockRoot,
    pub condition: SpendingCondition,
    pub created_by: Pkh,
    pub created_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(condition: SpendingCondition, created_by: Pkh) -> Result<Self> {
        if !condition.contains(&created_by) {
            return Err(MultisigError::UnauthorizedSigner(created_by));
        }
        Ok(LockRecord {
            id: Uuid::new_v4(),
            lock_root: condition.lock_root(),
            condition,
            created_by,
            created_at: Utc::now(),
        })
    }

    pub fn threshold(&self) -> u64 {
        self.condition.threshold()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryStatus {
    Broadcast,
    Confirmed,
}

/// A transaction handed to the ledger, keyed by its canonical id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub tx_id: TxId,
    pub proposal_id: Option<Uuid>,
    pub lock_root: LockRoot,
    pub participants: Vec<Pkh>,
    pub proposer: Pkh,
    pub signers: Vec<Pkh>,
    pub status: HistoryStatus,
    pub total_input: Nicks,
    pub fee: Nicks,
    pub seeds: Vec<SeedSummary>,
    pub broadcast_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ProposalFilter {
    pub participant: Option<Pkh>,
    pub lock_root: Option<LockRoot>,
    pub status: Option<ProposalStatus>,
}

impl ProposalFilter {
    pub fn matches(&self, p: &Proposal) -> bool {
        self.participant.map_or(true, |pkh| p.condition.contains(&pkh))
            && self.lock_root.map_or(true, |root| p.lock_root == root)
            && self.status.map_or(true, |s| p.status == s)
    }
}

/// Persistence for locks, proposals and history.
///
/// Implementors provide keyed reads and writes plus an atomic
/// read-modify-write on a single proposal; the lifecycle operations are
/// built on top of those.
pub trait CoordinationStore: Send + Sync {
    fn insert_lock(&self, lock: LockRecord) -> Result<()>;
    fn get_lock(&self, root: &LockRoot) -> Result<Option<LockRecord>>;
    fn all_locks(&self) -> Result<Vec<LockRecord>>;

    fn insert_proposal(&self, proposal: Proposal) -> Result<()>;
    fn get_proposal(&self, id: &Uuid) -> Result<Option<Proposal>>;
    fn all_proposals(&self) -> Result<Vec<Proposal>>;
    /// Applies `f` to the stored proposal atomically; nothing is written if `f` fails.
    fn update_proposal(&self, id: &Uuid, f: &mut dyn FnMut(&mut Proposal) -> Result<()>) -> Result<Proposal>;

    fn insert_history(&self, entry: HistoryEntry) -> Result<()>;
    fn update_history(&self, tx_id: &TxId, f: &mut dyn FnMut(&mut HistoryEntry)) -> Result<Option<HistoryEntry>>;
    fn all_history(&self) -> Result<Vec<HistoryEntry>>;

    fn create_lock(&self, lock: LockRecord) -> Result<()> {
        if self.get_lock(&lock.lock_root)?.is_some() {
            return Err(MultisigError::DuplicateLock(lock.lock_root));
        }
        self.insert_lock(lock)
    }

    fn list_locks(&self, participant: Option<&Pkh>) -> Result<Vec<LockRecord>> {
        let mut locks: Vec<LockRecord> = self
            .all_locks()?
            .into_iter()
            .filter(|l| participant.map_or(true, |p| l.condition.contains(p)))
            .collect();
        locks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(locks)
    }

    fn create_proposal(&self, proposal: Proposal) -> Result<()> {
        self.insert_proposal(proposal)
    }

    fn list_proposals(&self, filter: &ProposalFilter) -> Result<Vec<Proposal>> {
        let mut out: Vec<Proposal> = self.all_proposals()?.into_iter().filter(|p| filter.matches(p)).collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    /// Upserts `signer`'s fragment; the last submission wins.
    fn append_signature(&self, id: &Uuid, signer: Pkh, fragment: SignedFragment) -> Result<Proposal> {
        self.update_proposal(id, &mut |p| {
            p.upsert_signature(signer, fragment.clone());
            Ok(())
        })
    }

    /// Compare-and-set on status.
    fn transition(&self, id: &Uuid, from: &[ProposalStatus], to: ProposalStatus) -> Result<Proposal> {
        self.update_proposal(id, &mut |p| p.transition(from, to))
    }

    /// Moves a ready proposal to broadcast under its canonical id and writes
    /// the history entry.
    fn mark_broadcast(&self, id: &Uuid, final_tx_id: TxId, signers: Vec<Pkh>) -> Result<HistoryEntry> {
        let proposal = self.update_proposal(id, &mut |p| {
            p.transition(&[ProposalStatus::Ready], ProposalStatus::Broadcast)?;
            p.final_tx_id = Some(final_tx_id);
            Ok(())
        })?;
        let entry = proposal.history_entry(final_tx_id, signers);
        self.insert_history(entry.clone())?;
        Ok(entry)
    }

    fn mark_confirmed(&self, id: &Uuid) -> Result<Proposal> {
        let proposal = self.transition(id, &[ProposalStatus::Broadcast], ProposalStatus::Confirmed)?;
        if let Some(tx_id) = proposal.final_tx_id {
            self.confirm_history(&tx_id)?;
        }
        Ok(proposal)
    }

    fn mark_failed(&self, id: &Uuid, reason: &str) -> Result<Proposal> {
        self.update_proposal(id, &mut |p| {
            p.transition(&[ProposalStatus::Ready], ProposalStatus::Failed)?;
            p.failure = Some(reason.to_string());
            Ok(())
        })
    }

    fn record_history(&self, entry: HistoryEntry) -> Result<()> {
        self.insert_history(entry)
    }

    fn confirm_history(&self, tx_id: &TxId) -> Result<()> {
        self.update_history(tx_id, &mut |h| {
            h.status = HistoryStatus::Confirmed;
            h.confirmed_at = Some(Utc::now());
        })?;
        Ok(())
    }

    fn list_history(&self, participant: Option<&Pkh>) -> Result<Vec<HistoryEntry>> {
        let mut out: Vec<HistoryEntry> = self
            .all_history()?
            .into_iter()
            .filter(|h| participant.map_or(true, |p| h.participants.contains(p)))
            .collect();
        out.sort_by(|a, b| b.broadcast_at.cmp(&a.broadcast_at));
        Ok(out)
    }
}

#[derive(Default)]
struct MemoryState {
    locks: HashMap<LockRoot, LockRecord>,
    proposals: HashMap<Uuid, Proposal>,
    history: HashMap<TxId, HistoryEntry>,
}

/// Store kept in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CoordinationStore for MemoryStore {
    fn insert_lock(&self, lock: LockRecord) -> Result<()> {
        let mut st = self.state();
        if st.locks.contains_key(&lock.lock_root) {
            return Err(MultisigError::DuplicateLock(lock.lock_root));
        }
        st.locks.insert(lock.lock_root, lock);
        Ok(())
    }

    fn get_lock(&self, root: &LockRoot) -> Result<Option<LockRecord>> {
        Ok(self.state().locks.get(root).cloned())
    }

    fn all_locks(&self) -> Result<Vec<LockRecord>> {
        Ok(self.state().locks.values().cloned().collect())
    }

    fn insert_proposal(&self, proposal: Proposal) -> Result<()> {
        let mut st = self.state();
        if st.proposals.values().any(|p| p.tx_id == proposal.tx_id) {
            return Err(MultisigError::DuplicateProposal(proposal.tx_id));
        }
        st.proposals.insert(proposal.id, proposal);
        Ok(())
    }

    fn get_proposal(&self, id: &Uuid) -> Result<Option<Proposal>> {
        Ok(self.state().proposals.get(id).cloned())
    }

    fn all_proposals(&self) -> Result<Vec<Proposal>> {
        Ok(self.state().proposals.values().cloned().collect())
    }

    fn update_proposal(&self, id: &Uuid, f: &mut dyn FnMut(&mut Proposal) -> Result<()>) -> Result<Proposal> {
        let mut st = self.state();
        let current = st.proposals.get(id).ok_or_else(|| MultisigError::NotFound(format!("proposal {id}")))?;
        let mut next = current.clone();
        f(&mut next)?;
        next.updated_at = Utc::now();
        st.proposals.insert(*id, next.clone());
        Ok(next)
    }

    fn mark_broadcast(&self, id: &Uuid, final_tx_id: TxId, signers: Vec<Pkh>) -> Result<HistoryEntry> {
        let mut st = self.state();
        let current = st.proposals.get(id).ok_or_else(|| MultisigError::NotFound(format!("proposal {id}")))?;
        let mut next = current.clone();
        next.transition(&[ProposalStatus::Ready], ProposalStatus::Broadcast)?;
        next.final_tx_id = Some(final_tx_id);
        next.updated_at = Utc::now();
        let entry = next.history_entry(final_tx_id, signers);
        st.proposals.insert(*id, next);
        st.history.insert(entry.tx_id, entry.clone());
        Ok(entry)
    }

    fn insert_history(&self, entry: HistoryEntry) -> Result<()> {
        self.state().history.insert(entry.tx_id, entry);
        Ok(())
    }

    fn update_history(&self, tx_id: &TxId, f: &mut dyn FnMut(&mut HistoryEntry)) -> Result<Option<HistoryEntry>> {
        let mut st = self.state();
        Ok(st.history.get_mut(tx_id).map(|h| {
            f(h);
            h.clone()
        }))
    }

    fn all_history(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.state().history.values().cloned().collect())
    }
}

const CF_LOCKS: &str = "locks";
const CF_PROPOSALS: &str = "proposals";
const CF_PROPOSAL_TX: &str = "proposal_tx";
const CF_HISTORY: &str = "history";

/// RocksDB-backed store. Values are bincode, zstd-compressed.
pub struct RocksStore {
    db: DB,
    path: String,
    // serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl RocksStore {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let cf_names = ["default", CF_LOCKS, CF_PROPOSALS, CF_PROPOSAL_TX, CF_HISTORY];
        let cf_opts = Options::default();
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = cf_names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_opts.clone()))
            .collect();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        std::fs::create_dir_all(path).ok();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)
            .with_context(|| format!("Failed to open database at '{path}'"))?;
        tracing::info!(path, "coordination store opened");
        Ok(RocksStore { db, path: path.to_string(), write_lock: Mutex::new(()) })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn encode<T: Serialize>(cf: &str, key: &[u8], value: &T) -> anyhow::Result<Vec<u8>> {
        let encoded = bincode::serialize(value)
            .with_context(|| format!("Failed to serialize value for key '{key:?}' in CF '{cf}'"))?;
        zstd::encode_all(&encoded[..], 3).with_context(|| "zstd compression failed")
    }

    fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> anyhow::Result<()> {
        let compressed = Self::encode(cf, key, value)?;
        let handle = self.db.cf_handle(cf).ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))?;
        self.db
            .put_cf(handle, key, compressed)
            .with_context(|| format!("Failed to PUT key '{key:?}' in CF '{cf}'"))?;
        Ok(())
    }

    fn batch_put<T: Serialize>(&self, batch: &mut WriteBatch, cf: &str, key: &[u8], value: &T) -> anyhow::Result<()> {
        let compressed = Self::encode(cf, key, value)?;
        let handle = self.db.cf_handle(cf).ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))?;
        batch.put_cf(handle, key, compressed);
        Ok(())
    }

    /// Atomically applies a set of writes.
    fn write_batch(&self, batch: WriteBatch) -> anyhow::Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts).with_context(|| "Failed to write batch to database")
    }

    fn decode<T: DeserializeOwned>(cf: &str, value: &[u8]) -> anyhow::Result<T> {
        // First attempt: assume data is compressed
        if let Ok(decompressed) = zstd::decode_all(value) {
            if let Ok(v) = bincode::deserialize(&decompressed) {
                return Ok(v);
            }
        }
        // Fallback: treat data as uncompressed bincode
        bincode::deserialize(value).with_context(|| format!("Failed to deserialize value in CF '{cf}'"))
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> anyhow::Result<Option<T>> {
        let handle = self.db.cf_handle(cf).ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))?;
        match self.db.get_cf(handle, key)? {
            Some(value) => Ok(Some(Self::decode(cf, &value)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str) -> anyhow::Result<Vec<T>> {
        let handle = self.db.cf_handle(cf).ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (_key, value) = item?;
            out.push(Self::decode(cf, &value)?);
        }
        Ok(out)
    }

    /// Number of records per column family.
    pub fn counts(&self) -> anyhow::Result<Vec<(&'static str, usize)>> {
        let mut out = Vec::new();
        for cf in [CF_LOCKS, CF_PROPOSALS, CF_HISTORY] {
            let handle = self.db.cf_handle(cf).ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))?;
            out.push((cf, self.db.iterator_cf(handle, IteratorMode::Start).count()));
        }
        Ok(out)
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.db.flush().with_context(|| "Failed to flush database")
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CoordinationStore for RocksStore {
    fn insert_lock(&self, lock: LockRecord) -> Result<()> {
        let _g = self.guard();
        let key = lock.lock_root.digest().0;
        if self.get::<LockRecord>(CF_LOCKS, &key)?.is_some() {
            return Err(MultisigError::DuplicateLock(lock.lock_root));
        }
        self.put(CF_LOCKS, &key, &lock)?;
        Ok(())
    }

    fn get_lock(&self, root: &LockRoot) -> Result<Option<LockRecord>> {
        Ok(self.get(CF_LOCKS, &root.digest().0)?)
    }

    fn all_locks(&self) -> Result<Vec<LockRecord>> {
        Ok(self.scan(CF_LOCKS)?)
    }

    fn insert_proposal(&self, proposal: Proposal) -> Result<()> {
        let _g = self.guard();
        if self.get::<Uuid>(CF_PROPOSAL_TX, &proposal.tx_id.0)?.is_some() {
            return Err(MultisigError::DuplicateProposal(proposal.tx_id));
        }
        let mut batch = WriteBatch::default();
        self.batch_put(&mut batch, CF_PROPOSALS, proposal.id.as_bytes(), &proposal)?;
        self.batch_put(&mut batch, CF_PROPOSAL_TX, &proposal.tx_id.0, &proposal.id)?;
        self.write_batch(batch)?;
        Ok(())
    }

    fn get_proposal(&self, id: &Uuid) -> Result<Option<Proposal>> {
        Ok(self.get(CF_PROPOSALS, id.as_bytes())?)
    }

    fn all_proposals(&self) -> Result<Vec<Proposal>> {
        Ok(self.scan(CF_PROPOSALS)?)
    }

    fn update_proposal(&self, id: &Uuid, f: &mut dyn FnMut(&mut Proposal) -> Result<()>) -> Result<Proposal> {
        let _g = self.guard();
        let mut proposal: Proposal = self
            .get(CF_PROPOSALS, id.as_bytes())?
            .ok_or_else(|| MultisigError::NotFound(format!("proposal {id}")))?;
        f(&mut proposal)?;
        proposal.updated_at = Utc::now();
        self.put(CF_PROPOSALS, id.as_bytes(), &proposal)?;
        Ok(proposal)
    }

    /// Proposal status and history entry land in one synced batch.
    fn mark_broadcast(&self, id: &Uuid, final_tx_id: TxId, signers: Vec<Pkh>) -> Result<HistoryEntry> {
        let _g = self.guard();
        let mut proposal: Proposal = self
            .get(CF_PROPOSALS, id.as_bytes())?
            .ok_or_else(|| MultisigError::NotFound(format!("proposal {id}")))?;
        proposal.transition(&[ProposalStatus::Ready], ProposalStatus::Broadcast)?;
        proposal.final_tx_id = Some(final_tx_id);
        proposal.updated_at = Utc::now();
        let entry = proposal.history_entry(final_tx_id, signers);

        let mut batch = WriteBatch::default();
        self.batch_put(&mut batch, CF_PROPOSALS, id.as_bytes(), &proposal)?;
        self.batch_put(&mut batch, CF_HISTORY, &entry.tx_id.0, &entry)?;
        self.write_batch(batch)?;
        Ok(entry)
    }

    fn mark_confirmed(&self, id: &Uuid) -> Result<Proposal> {
        let _g = self.guard();
        let mut proposal: Proposal = self
            .get(CF_PROPOSALS, id.as_bytes())?
            .ok_or_else(|| MultisigError::NotFound(format!("proposal {id}")))?;
        proposal.transition(&[ProposalStatus::Broadcast], ProposalStatus::Confirmed)?;
        proposal.updated_at = Utc::now();

        let mut batch = WriteBatch::default();
        self.batch_put(&mut batch, CF_PROPOSALS, id.as_bytes(), &proposal)?;
        if let Some(tx_id) = proposal.final_tx_id {
            if let Some(mut entry) = self.get::<HistoryEntry>(CF_HISTORY, &tx_id.0)? {
                entry.status = HistoryStatus::Confirmed;
                entry.confirmed_at = Some(Utc::now());
                self.batch_put(&mut batch, CF_HISTORY, &tx_id.0, &entry)?;
            }
        }
        self.write_batch(batch)?;
        Ok(proposal)
    }

    fn insert_history(&self, entry: HistoryEntry) -> Result<()> {
        let _g = self.guard();
        self.put(CF_HISTORY, &entry.tx_id.0, &entry)?;
        Ok(())
    }

    fn update_history(&self, tx_id: &TxId, f: &mut dyn FnMut(&mut HistoryEntry)) -> Result<Option<HistoryEntry>> {
        let _g = self.guard();
        let Some(mut entry) = self.get::<HistoryEntry>(CF_HISTORY, &tx_id.0)? else {
            return Ok(None);
        };
        f(&mut entry);
        self.put(CF_HISTORY, &tx_id.0, &entry)?;
        Ok(Some(entry))
    }

    fn all_history(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.scan(CF_HISTORY)?)
    }
}

/// Opens the persistent store at the configured path.
pub fn open(cfg: &crate::config::Storage) -> anyhow::Result<Arc<RocksStore>> {
    Ok(Arc::new(RocksStore::open(&cfg.path)?))
}
