use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregate;
use crate::builder::FeePolicy;
use crate::config::Polling;
use crate::confirm::{self, Acceptance, InclusionOutcome};
use crate::crypto::Pkh;
use crate::error::{MultisigError, Result};
use crate::lock::{LockRoot, SpendingCondition};
use crate::metrics;
use crate::note::{total_assets, Nicks};
use crate::oracle::{BroadcastOracle, SubmitOutcome};
use crate::store::{CoordinationStore, HistoryEntry, HistoryStatus, LockRecord, ProposalFilter};
use crate::tx::{MergedTransaction, SignedFragment, TxId, UnsignedTransaction};
use crate::validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Pending,
    Ready,
    Broadcast,
    Confirmed,
    Failed,
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Ready => "ready",
            ProposalStatus::Broadcast => "broadcast",
            ProposalStatus::Confirmed => "confirmed",
            ProposalStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for ProposalStatus {
    type Err = MultisigError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ProposalStatus::Pending),
            "ready" => Ok(ProposalStatus::Ready),
            "broadcast" => Ok(ProposalStatus::Broadcast),
            "confirmed" => Ok(ProposalStatus::Confirmed),
            "failed" => Ok(ProposalStatus::Failed),
            other => Err(MultisigError::InvalidInput(format!("unknown status '{other}'"))),
        }
    }
}

/// An output paid to someone other than the wallet itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedSummary {
    pub recipient: LockRoot,
    pub amount: Nicks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub signer: Pkh,
    pub fragment: SignedFragment,
    pub signed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: Uuid,
    /// Id of the unsigned transaction; tentative until broadcast.
    pub tx_id: TxId,
    pub lock_root: LockRoot,
    pub condition: SpendingCondition,
    pub proposer: Pkh,
    pub status: ProposalStatus,
    pub unsigned: UnsignedTransaction,
    pub total_input: Nicks,
    pub seeds: Vec<SeedSummary>,
    pub signatures: Vec<SignatureRecord>,
    /// Canonical id of the merged transaction, set at broadcast.
    pub final_tx_id: Option<TxId>,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    pub fn threshold(&self) -> usize {
        self.condition.threshold() as usize
    }

    pub fn signatures_collected(&self) -> usize {
        self.signatures.len()
    }

    pub fn signers(&self) -> Vec<Pkh> {
        self.signatures.iter().map(|s| s.signer).collect()
    }

    pub fn has_signed(&self, pkh: &Pkh) -> bool {
        self.signatures.iter().any(|s| &s.signer == pkh)
    }

    /// Fragments in participant order.
    pub fn fragments(&self) -> Vec<SignedFragment> {
        let mut records: Vec<&SignatureRecord> = self.signatures.iter().collect();
        records.sort_by_key(|r| self.condition.position(&r.signer).unwrap_or(usize::MAX));
        records.into_iter().map(|r| r.fragment.clone()).collect()
    }

    pub(crate) fn upsert_signature(&mut self, signer: Pkh, fragment: SignedFragment) {
        let record = SignatureRecord { signer, fragment, signed_at: Utc::now() };
        match self.signatures.iter_mut().find(|r| r.signer == signer) {
            Some(existing) => *existing = record,
            None => self.signatures.push(record),
        }
    }

    pub(crate) fn transition(&mut self, from: &[ProposalStatus], to: ProposalStatus) -> Result<()> {
        if !from.contains(&self.status) {
            return Err(MultisigError::InvalidTransition { id: self.id.to_string(), from: self.status, to });
        }
        self.status = to;
        Ok(())
    }

    pub(crate) fn history_entry(&self, tx_id: TxId, signers: Vec<Pkh>) -> HistoryEntry {
        HistoryEntry {
            id: Uuid::new_v4(),
            tx_id,
            proposal_id: Some(self.id),
            lock_root: self.lock_root,
            participants: self.condition.participants().to_vec(),
            proposer: self.proposer,
            signers,
            status: HistoryStatus::Broadcast,
            total_input: self.total_input,
            fee: self.unsigned.fee(),
            seeds: self.seeds.clone(),
            broadcast_at: Utc::now(),
            confirmed_at: None,
        }
    }
}

/// Gifts leaving the wallet: every seed not addressed back to `own`.
pub fn seed_summaries(unsigned: &UnsignedTransaction, own: &LockRoot) -> Vec<SeedSummary> {
    unsigned
        .raw()
        .spends
        .iter()
        .flat_map(|s| s.seeds.iter())
        .filter(|seed| &seed.lock_root != own)
        .map(|seed| SeedSummary { recipient: seed.lock_root, amount: seed.gift })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub proposal_id: Uuid,
    /// Canonical id of the merged transaction.
    pub tx_id: TxId,
    pub signers: Vec<Pkh>,
    pub acceptance: Acceptance,
    /// True when another client had already broadcast this proposal.
    pub already_broadcast: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectSpendOutcome {
    pub tx_id: TxId,
    pub history_id: Uuid,
    pub acceptance: Acceptance,
}

/// Drives proposals from creation through broadcast and confirmation.
pub struct ProposalCoordinator {
    store: Arc<dyn CoordinationStore>,
    ledger: Arc<dyn BroadcastOracle>,
    policy: FeePolicy,
    polling: Polling,
}

impl ProposalCoordinator {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        ledger: Arc<dyn BroadcastOracle>,
        policy: FeePolicy,
        polling: Polling,
    ) -> Self {
        ProposalCoordinator { store, ledger, policy, polling }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn register_lock(&self, threshold: u64, participants: Vec<Pkh>, created_by: Pkh) -> Result<LockRecord> {
        let condition = SpendingCondition::new(threshold, participants)?;
        let record = LockRecord::new(condition, created_by)?;
        self.store.create_lock(record.clone())?;
        info!(lock = %record.lock_root.digest().short(), threshold, "lock registered");
        Ok(record)
    }

    pub fn list_locks(&self, participant: Option<&Pkh>) -> Result<Vec<LockRecord>> {
        self.store.list_locks(participant)
    }

    /// Creates a proposal already carrying the proposer's signature.
    pub fn propose(&self, unsigned: UnsignedTransaction, proposer: Pkh, fragment: SignedFragment) -> Result<Proposal> {
        let first = unsigned
            .notes()
            .first()
            .ok_or_else(|| MultisigError::InvalidInput("transaction has no inputs".into()))?;
        let lock_root = first.lock_root();
        let lock = self
            .store
            .get_lock(&lock_root)?
            .ok_or_else(|| MultisigError::NotFound(format!("lock {lock_root}")))?;
        for condition in unsigned.conditions() {
            if condition != &lock.condition {
                return Err(MultisigError::SpendConditionMismatch {
                    expected: lock.lock_root,
                    actual: condition.lock_root(),
                });
            }
        }
        if !lock.condition.contains(&proposer) {
            return Err(MultisigError::UnauthorizedSigner(proposer));
        }
        check_fragment(&unsigned, proposer, &fragment)?;

        let now = Utc::now();
        let mut proposal = Proposal {
            id: Uuid::new_v4(),
            tx_id: unsigned.raw().content_id(),
            lock_root,
            condition: lock.condition.clone(),
            proposer,
            status: ProposalStatus::Pending,
            total_input: total_assets(unsigned.notes()),
            seeds: seed_summaries(&unsigned, &lock_root),
            signatures: Vec::new(),
            unsigned,
            final_tx_id: None,
            failure: None,
            created_at: now,
            updated_at: now,
        };
        proposal.upsert_signature(proposer, fragment);
        if proposal.signatures_collected() >= proposal.threshold() {
            proposal.status = ProposalStatus::Ready;
        }
        self.store.create_proposal(proposal.clone())?;
        metrics::record(|m| {
            m.proposals_created.inc();
            m.signatures_collected.inc();
        });
        info!(proposal = %proposal.id, tx = %proposal.tx_id.short(), status = %proposal.status, "proposal created");
        Ok(proposal)
    }

    /// Records `signer`'s fragment. Re-submission replaces the earlier one.
    pub fn sign(&self, id: &Uuid, signer: Pkh, fragment: SignedFragment) -> Result<Proposal> {
        let proposal = self.get_proposal(id)?;
        if !matches!(proposal.status, ProposalStatus::Pending | ProposalStatus::Ready) {
            return Err(MultisigError::InvalidTransition {
                id: id.to_string(),
                from: proposal.status,
                to: ProposalStatus::Ready,
            });
        }
        if !proposal.condition.contains(&signer) {
            return Err(MultisigError::UnauthorizedSigner(signer));
        }
        check_fragment(&proposal.unsigned, signer, &fragment)?;

        let updated = self.store.update_proposal(id, &mut |p| {
            if !matches!(p.status, ProposalStatus::Pending | ProposalStatus::Ready) {
                return Err(MultisigError::InvalidTransition { id: p.id.to_string(), from: p.status, to: ProposalStatus::Ready });
            }
            p.upsert_signature(signer, fragment.clone());
            if p.signatures_collected() >= p.threshold() {
                p.status = ProposalStatus::Ready;
            }
            Ok(())
        })?;
        metrics::record(|m| m.signatures_collected.inc());
        info!(
            proposal = %id,
            signer = %signer.short(),
            collected = updated.signatures_collected(),
            threshold = updated.threshold(),
            status = %updated.status,
            "signature recorded"
        );
        Ok(updated)
    }

    /// Merges, validates and submits a ready proposal. Broadcasting a
    /// proposal some other client already broadcast returns its recorded id.
    pub async fn broadcast(&self, id: &Uuid) -> Result<BroadcastOutcome> {
        let proposal = self.get_proposal(id)?;
        match proposal.status {
            ProposalStatus::Pending => {
                return Err(MultisigError::InsufficientSignatures {
                    have: proposal.signatures_collected(),
                    need: proposal.threshold(),
                })
            }
            ProposalStatus::Broadcast | ProposalStatus::Confirmed => return Ok(self.already_broadcast(&proposal).await),
            ProposalStatus::Failed => {
                return Err(MultisigError::InvalidTransition {
                    id: id.to_string(),
                    from: proposal.status,
                    to: ProposalStatus::Broadcast,
                })
            }
            ProposalStatus::Ready => {}
        }

        let merged = aggregate::merge(&proposal.fragments(), proposal.threshold())?;
        validate::validate(&merged, proposal.unsigned.notes(), proposal.unsigned.conditions(), self.policy)?;
        self.submit(&merged).await.map_err(|e| {
            if let MultisigError::BroadcastRejected(reason) = &e {
                if let Err(mark) = self.store.mark_failed(id, reason) {
                    warn!(proposal = %id, "could not mark proposal failed: {mark}");
                }
            }
            e
        })?;

        let signers = merged.signers().to_vec();
        match self.store.mark_broadcast(id, merged.id(), signers.clone()) {
            Ok(_) => {}
            Err(MultisigError::InvalidTransition { .. }) => {
                // another client won the race; the ledger arbitrates
                let current = self.get_proposal(id)?;
                if matches!(current.status, ProposalStatus::Broadcast | ProposalStatus::Confirmed) {
                    return Ok(self.already_broadcast(&current).await);
                }
                return Err(MultisigError::InvalidTransition {
                    id: id.to_string(),
                    from: current.status,
                    to: ProposalStatus::Broadcast,
                });
            }
            Err(e) => return Err(e),
        }
        if merged.id() != proposal.tx_id {
            info!(proposal = %id, tentative = %proposal.tx_id.short(), canonical = %merged.id().short(), "recording canonical id");
        }

        let acceptance = self.await_acceptance(&merged.id()).await;
        Ok(BroadcastOutcome {
            proposal_id: *id,
            tx_id: merged.id(),
            signers,
            acceptance,
            already_broadcast: false,
        })
    }

    /// Waits for block inclusion of a broadcast proposal; on inclusion the
    /// proposal and its history entry become confirmed.
    pub async fn track_inclusion(&self, id: &Uuid, shutdown: broadcast::Receiver<()>) -> Result<InclusionOutcome> {
        let proposal = self.get_proposal(id)?;
        let tx_id = match (proposal.status, proposal.final_tx_id) {
            (ProposalStatus::Confirmed, _) => return Ok(InclusionOutcome::Included),
            (ProposalStatus::Broadcast, Some(tx_id)) => tx_id,
            (from, _) => {
                return Err(MultisigError::InvalidTransition { id: id.to_string(), from, to: ProposalStatus::Confirmed })
            }
        };
        let outcome = confirm::poll_inclusion(self.ledger.as_ref(), &tx_id, &self.polling, shutdown).await;
        if outcome == InclusionOutcome::Included {
            self.store.mark_confirmed(id)?;
            info!(proposal = %id, tx = %tx_id.short(), "transaction confirmed");
        }
        Ok(outcome)
    }

    /// Single-signer path: no proposal is stored, only the history entry.
    pub async fn direct_spend(
        &self,
        unsigned: &UnsignedTransaction,
        signer: Pkh,
        fragment: SignedFragment,
    ) -> Result<DirectSpendOutcome> {
        let condition = unsigned
            .conditions()
            .first()
            .ok_or_else(|| MultisigError::InvalidInput("transaction has no inputs".into()))?;
        if let Some(c) = unsigned.conditions().iter().find(|c| c.threshold() != 1) {
            return Err(MultisigError::InsufficientSignatures { have: 1, need: c.threshold() as usize });
        }
        if !unsigned.conditions().iter().all(|c| c.contains(&signer)) {
            return Err(MultisigError::UnauthorizedSigner(signer));
        }
        check_fragment(unsigned, signer, &fragment)?;

        let merged = aggregate::merge(std::slice::from_ref(&fragment), 1)?;
        validate::validate(&merged, unsigned.notes(), unsigned.conditions(), self.policy)?;
        self.submit(&merged).await?;

        let lock_root = condition.lock_root();
        let entry = HistoryEntry {
            id: Uuid::new_v4(),
            tx_id: merged.id(),
            proposal_id: None,
            lock_root,
            participants: condition.participants().to_vec(),
            proposer: signer,
            signers: merged.signers().to_vec(),
            status: HistoryStatus::Broadcast,
            total_input: total_assets(unsigned.notes()),
            fee: unsigned.fee(),
            seeds: seed_summaries(unsigned, &lock_root),
            broadcast_at: Utc::now(),
            confirmed_at: None,
        };
        let history_id = entry.id;
        self.store.record_history(entry)?;

        let acceptance = self.await_acceptance(&merged.id()).await;
        Ok(DirectSpendOutcome { tx_id: merged.id(), history_id, acceptance })
    }

    pub fn get_proposal(&self, id: &Uuid) -> Result<Proposal> {
        self.store.get_proposal(id)?.ok_or_else(|| MultisigError::NotFound(format!("proposal {id}")))
    }

    pub fn list_proposals(&self, filter: &ProposalFilter) -> Result<Vec<Proposal>> {
        self.store.list_proposals(filter)
    }

    pub fn list_history(&self, participant: Option<&Pkh>) -> Result<Vec<HistoryEntry>> {
        self.store.list_history(participant)
    }

    async fn submit(&self, merged: &MergedTransaction) -> Result<()> {
        metrics::record(|m| m.broadcasts.inc());
        match self.ledger.submit(merged).await? {
            SubmitOutcome::Accepted => {
                info!(tx = %merged.id().short(), "transaction submitted");
                Ok(())
            }
            SubmitOutcome::Rejected(reason) => {
                // a racing client may already have landed the same transaction
                match self.ledger.accepted(&merged.id()).await {
                    Ok(true) => {
                        info!(tx = %merged.id().short(), "submission rejected but transaction already accepted");
                        Ok(())
                    }
                    Ok(false) => {
                        metrics::record(|m| m.broadcast_failures.inc());
                        warn!(tx = %merged.id().short(), "submission rejected: {reason}");
                        Err(MultisigError::BroadcastRejected(reason))
                    }
                    // acceptance unknown; leave the proposal ready for a retry
                    Err(e) => {
                        warn!(tx = %merged.id().short(), "submission rejected ({reason}) and acceptance lookup failed: {e}");
                        Err(MultisigError::Oracle(format!("rejected ({reason}), acceptance unknown: {e}")))
                    }
                }
            }
        }
    }

    async fn await_acceptance(&self, tx_id: &TxId) -> Acceptance {
        let acceptance = confirm::poll_acceptance(self.ledger.as_ref(), tx_id, &self.polling).await;
        if acceptance == Acceptance::Unconfirmed {
            metrics::record(|m| m.unconfirmed.inc());
        }
        acceptance
    }

    async fn already_broadcast(&self, proposal: &Proposal) -> BroadcastOutcome {
        let tx_id = proposal.final_tx_id.unwrap_or(proposal.tx_id);
        let acceptance = if proposal.status == ProposalStatus::Confirmed {
            Acceptance::Accepted
        } else {
            self.await_acceptance(&tx_id).await
        };
        info!(proposal = %proposal.id, tx = %tx_id.short(), "proposal already broadcast");
        BroadcastOutcome {
            proposal_id: proposal.id,
            tx_id,
            signers: proposal.signers(),
            acceptance,
            already_broadcast: true,
        }
    }
}

/// A fragment must sign the same content as the unsigned transaction and
/// carry at least one signature from its signer.
fn check_fragment(unsigned: &UnsignedTransaction, signer: Pkh, fragment: &SignedFragment) -> Result<()> {
    let expected = unsigned.raw().content_id();
    let actual = fragment.tx.content_id();
    if actual != expected {
        return Err(MultisigError::FragmentMismatch { index: 0, expected, actual });
    }
    if fragment.signer != signer || !fragment.has_signature_of(&signer) {
        return Err(MultisigError::UnsignedFragment { signer });
    }
    Ok(())
}
