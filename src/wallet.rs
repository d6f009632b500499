use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::builder::{FeePolicy, TxBuilder};
use crate::config;
use crate::error::{MultisigError, Result};
use crate::lock::{LockRoot, SpendingCondition};
use crate::note::{total_assets, Nicks, Note};
use crate::oracle::{retry, NoteOracle, OracleCache};
use crate::select::select;
use crate::store::LockRecord;
use crate::tx::UnsignedTransaction;

pub type NoteOracleCache = OracleCache<Arc<dyn NoteOracle>>;

/// A multisig wallet: one spending condition and the lock root it derives.
/// Change always returns to that same canonically derived root.
#[derive(Debug, Clone)]
pub struct MultisigWallet {
    condition: SpendingCondition,
    lock_root: LockRoot,
}

impl MultisigWallet {
    pub fn new(condition: SpendingCondition) -> Self {
        let lock_root = condition.lock_root();
        MultisigWallet { condition, lock_root }
    }

    pub fn from_lock(record: &LockRecord) -> Self {
        Self::new(record.condition.clone())
    }

    pub fn lock_root(&self) -> LockRoot {
        self.lock_root
    }

    pub fn condition(&self) -> &SpendingCondition {
        &self.condition
    }

    /// Notes in `notes` that this wallet can spend.
    pub fn list_unspent(&self, notes: &[Note]) -> Vec<Note> {
        notes.iter().filter(|n| n.lock_root() == self.lock_root).cloned().collect()
    }

    pub fn balance(&self, notes: &[Note]) -> Nicks {
        total_assets(&self.list_unspent(notes))
    }

    /// Queries unspent notes through the shared per-endpoint handle, retrying
    /// with a fixed delay. A failed query drops the cached handle so the next
    /// attempt reconnects.
    pub async fn fetch_notes<F, Fut>(
        &self,
        cache: &NoteOracleCache,
        endpoint: &str,
        connect: F,
        cfg: &config::Oracle,
    ) -> Result<Vec<Note>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Arc<dyn NoteOracle>>>,
    {
        let root = self.lock_root;
        let connect = &connect;
        let notes = retry(cfg.query_retry_attempts, cfg.retry_delay(), move || async move {
            let oracle = cache.get_or_connect(endpoint, |ep| connect(ep)).await?;
            match oracle.notes_by_lock(&root).await {
                Ok(notes) => Ok(notes),
                Err(e) => {
                    cache.invalidate(endpoint);
                    Err(e)
                }
            }
        })
        .await?;
        debug!(lock = %root.digest().short(), count = notes.len(), "notes fetched");
        Ok(notes)
    }

    /// Builds an unsigned spend paying `recipients` from this wallet's notes.
    ///
    /// The largest selected note anchors the transaction and carries every
    /// recipient seed; other selected notes only contribute fee and refund.
    /// When the selection cannot also cover the calculated fee, selection is
    /// retried with the fee added to the target.
    pub fn plan_spend(&self, notes: &[Note], recipients: &[(LockRoot, Nicks)], policy: FeePolicy) -> Result<UnsignedTransaction> {
        if recipients.is_empty() {
            return Err(MultisigError::InvalidInput("no recipients".into()));
        }
        if recipients.iter().any(|(_, gift)| *gift == 0) {
            return Err(MultisigError::ZeroGift);
        }
        let gifts = recipients
            .iter()
            .try_fold(0, |acc: Nicks, (_, g)| acc.checked_add(*g))
            .ok_or_else(|| MultisigError::InvalidInput("recipient amounts overflow".into()))?;
        let spendable = self.list_unspent(notes);

        let mut target = gifts
            .checked_add(policy.min_fee)
            .ok_or_else(|| MultisigError::InvalidInput("recipient amounts plus fee overflow".into()))?;
        loop {
            let chosen = select(&spendable, target)?;
            let mut builder = TxBuilder::new(policy);
            for (i, note) in chosen.into_iter().enumerate() {
                builder.add_spend(note, self.condition.clone(), self.condition.clone())?;
                if i == 0 {
                    for (root, gift) in recipients {
                        let seed = builder.anchor_seed(*root, *gift)?;
                        builder.add_seed(seed)?;
                    }
                }
                builder.finalize_spend()?;
            }

            let fee = builder.calc_fee();
            let rebalanced = builder.set_fee_and_rebalance(fee, true).map(|_| ());
            match rebalanced {
                Ok(_) => {
                    let tx = builder.build()?;
                    info!(
                        lock = %self.lock_root.digest().short(),
                        inputs = tx.notes().len(),
                        gifts,
                        fee = tx.fee(),
                        "spend planned"
                    );
                    return Ok(tx);
                }
                Err(e @ MultisigError::Unbalanceable { .. }) => {
                    let next = gifts.saturating_add(fee);
                    if next <= target {
                        return Err(e);
                    }
                    debug!(target, next, "selection short of fee; reselecting");
                    target = next;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
