use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::Digest;
use crate::error::{MultisigError, Result};
use crate::lock::{verify_lock, LockRoot, SpendingCondition};
use crate::note::{Nicks, Note};
use crate::tx::{RawTx, Seed, Spend, UnsignedTransaction, Witness};

pub const DEFAULT_FEE_RATE: Nicks = 1;
pub const DEFAULT_MIN_FEE: Nicks = 256;

/// Fee is `fee_rate` nicks per word of serialized transaction, never below `min_fee`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    pub fee_rate: Nicks,
    pub min_fee: Nicks,
}

impl FeePolicy {
    pub fn new(fee_rate: Nicks) -> Self {
        FeePolicy { fee_rate, min_fee: DEFAULT_MIN_FEE }
    }

    pub fn fee_for_words(&self, words: u64) -> Nicks {
        self.fee_rate.saturating_mul(words).max(self.min_fee)
    }
}

impl Default for FeePolicy {
    fn default() -> Self {
        FeePolicy::new(DEFAULT_FEE_RATE)
    }
}

#[derive(Debug)]
struct SpendBuilder {
    note: Note,
    condition: SpendingCondition,
    // None when re-derived from an existing transaction
    refund_lock: Option<LockRoot>,
    seeds: Vec<Seed>,
    refund: Nicks,
    fee: Nicks,
    // actual witness size when re-derived; estimated otherwise
    witness_words: Option<u64>,
}

impl SpendBuilder {
    fn gifts(&self) -> Nicks {
        self.seeds.iter().fold(0, |acc: Nicks, s| acc.saturating_add(s.gift))
    }

    /// Value left after explicit seeds, to be split between fee and refund.
    fn surplus(&self) -> Nicks {
        self.note.assets.saturating_sub(self.gifts())
    }

    fn refund_seed(&self, parent: Digest) -> Option<Seed> {
        match self.refund_lock {
            Some(lock) if self.refund > 0 => Some(Seed::new(lock, self.refund, parent)),
            _ => None,
        }
    }

    /// Seeds as they will appear in the transaction; the refund goes first.
    fn materialized_seeds(&self, parent: Digest) -> Vec<Seed> {
        let mut out = Vec::with_capacity(self.seeds.len() + 1);
        out.extend(self.refund_seed(parent));
        out.extend(self.seeds.iter().cloned());
        out
    }

    fn words(&self, parent: Digest) -> u64 {
        let seeds: u64 = self.materialized_seeds(parent).iter().map(Seed::words).sum();
        let witness = self.witness_words.unwrap_or_else(|| Witness::estimated_words(&self.condition));
        seeds + witness
    }

    fn outputs(&self) -> Nicks {
        self.gifts() + self.refund
    }

    fn is_balanced(&self) -> bool {
        self.note.assets == self.outputs() + self.fee
    }
}

/// Sequenced builder for an unsigned multi-spend transaction.
///
/// `add_spend` → `add_seed`* → `finalize_spend`, repeated per input, then
/// `set_fee_and_rebalance` and a one-shot `build`. The first spend is the
/// anchor: every seed in the transaction references its note as parent, and
/// only the anchor may carry seeds besides the automatic refund.
#[derive(Debug)]
pub struct TxBuilder {
    policy: FeePolicy,
    spends: Vec<SpendBuilder>,
    open: Option<SpendBuilder>,
    anchor: Option<Digest>,
}

impl TxBuilder {
    pub fn new(policy: FeePolicy) -> Self {
        TxBuilder { policy, spends: Vec::new(), open: None, anchor: None }
    }

    /// Re-derives a builder view of an existing transaction from its inputs.
    /// Witness sizes are taken from the transaction rather than estimated.
    pub fn from_tx(
        raw: &RawTx,
        notes: &[Note],
        conditions: &[SpendingCondition],
        policy: FeePolicy,
    ) -> Result<Self> {
        if notes.len() != raw.spends.len() || conditions.len() != raw.spends.len() {
            return Err(MultisigError::InvalidInput(format!(
                "{} spends but {} notes and {} conditions supplied",
                raw.spends.len(),
                notes.len(),
                conditions.len()
            )));
        }
        let mut builder = TxBuilder::new(policy);
        for (i, spend) in raw.spends.iter().enumerate() {
            let note = notes
                .iter()
                .find(|n| n.name == spend.note)
                .ok_or_else(|| MultisigError::NotFound(format!("input note for spend {i}")))?;
            if i == 0 {
                builder.anchor = Some(note.hash());
            }
            builder.spends.push(SpendBuilder {
                note: note.clone(),
                condition: conditions[i].clone(),
                refund_lock: None,
                seeds: spend.seeds.clone(),
                refund: 0,
                fee: spend.fee,
                witness_words: Some(spend.witness.words()),
            });
        }
        Ok(builder)
    }

    /// Opens a spend of `note` under `condition`, refunding to `refund_lock`.
    /// Takes ownership of both conditions; a note not locked under
    /// `condition` is rejected before anything is recorded.
    pub fn add_spend(&mut self, note: Note, condition: SpendingCondition, refund_lock: SpendingCondition) -> Result<&mut Self> {
        if self.open.is_some() {
            return Err(MultisigError::BuilderState("previous spend not finalized"));
        }
        verify_lock(&note, &condition)?;
        if self.anchor.is_none() {
            self.anchor = Some(note.hash());
        }
        self.open = Some(SpendBuilder {
            note,
            condition,
            refund_lock: Some(refund_lock.lock_root()),
            seeds: Vec::new(),
            refund: 0,
            fee: 0,
            witness_words: None,
        });
        Ok(self)
    }

    /// Seed addressed to `lock_root` that references the anchor note.
    pub fn anchor_seed(&self, lock_root: LockRoot, gift: Nicks) -> Result<Seed> {
        let parent = self.anchor.ok_or(MultisigError::BuilderState("no anchor spend yet"))?;
        Ok(Seed::new(lock_root, gift, parent))
    }

    pub fn add_seed(&mut self, seed: Seed) -> Result<&mut Self> {
        let anchor = self.anchor;
        let is_anchor = self.spends.is_empty();
        let open = self.open.as_mut().ok_or(MultisigError::BuilderState("no open spend"))?;
        if !is_anchor {
            return Err(MultisigError::BuilderState("non-anchor spends are refund-only"));
        }
        if seed.gift == 0 {
            return Err(MultisigError::ZeroGift);
        }
        if let Some(expected) = anchor {
            if seed.parent_hash != expected {
                return Err(MultisigError::ParentMismatch { expected, actual: seed.parent_hash });
            }
        }
        open.seeds.push(seed);
        Ok(self)
    }

    /// Closes the open spend, sending everything not gifted back as refund.
    pub fn finalize_spend(&mut self) -> Result<&mut Self> {
        let mut spend = self.open.take().ok_or(MultisigError::BuilderState("no open spend"))?;
        let gifts = spend.gifts();
        if gifts > spend.note.assets {
            return Err(MultisigError::Unbalanceable { needed: gifts, available: spend.note.assets });
        }
        spend.refund = spend.surplus();
        spend.fee = 0;
        debug!(
            note = %spend.note.name.last.short(),
            gifts,
            refund = spend.refund,
            "spend finalized"
        );
        self.spends.push(spend);
        Ok(self)
    }

    /// Fee the transaction needs at its current size.
    pub fn calc_fee(&self) -> Nicks {
        let parent = self.anchor.unwrap_or_default();
        let words: u64 = self.spends.iter().map(|s| s.words(parent)).sum();
        self.policy.fee_for_words(words)
    }

    /// Fee currently set across all spends.
    pub fn current_fee(&self) -> Nicks {
        self.spends.iter().map(|s| s.fee).sum()
    }

    pub fn spend_count(&self) -> usize {
        self.spends.len()
    }

    /// Sets the total fee and moves the difference into refunds. The fee is
    /// charged against spends in order, each up to its surplus. With
    /// `allow_fee_adjustment`, a fee below `calc_fee()` is raised to it.
    pub fn set_fee_and_rebalance(&mut self, fee: Nicks, allow_fee_adjustment: bool) -> Result<&mut Self> {
        if self.open.is_some() {
            return Err(MultisigError::BuilderState("spend still open"));
        }
        if self.spends.is_empty() {
            return Err(MultisigError::BuilderState("no spends"));
        }
        let target = if allow_fee_adjustment { fee.max(self.calc_fee()) } else { fee };

        let mut remaining = target;
        let shares: Vec<Nicks> = self
            .spends
            .iter()
            .map(|s| {
                let share = remaining.min(s.surplus());
                remaining -= share;
                share
            })
            .collect();
        if remaining > 0 {
            let available = self.spends.iter().fold(0, |acc: Nicks, s| acc.saturating_add(s.note.assets));
            let outputs = self.spends.iter().fold(0, |acc: Nicks, s| acc.saturating_add(s.gifts()));
            return Err(MultisigError::Unbalanceable { needed: outputs.saturating_add(target), available });
        }

        for (spend, share) in self.spends.iter_mut().zip(shares) {
            spend.fee = share;
            spend.refund = spend.surplus() - share;
        }
        debug!(fee = target, calculated = self.calc_fee(), "fee rebalanced");
        Ok(self)
    }

    /// Checks every spend's balance: assets equal outputs plus fee share.
    pub fn check_balance(&self) -> Result<()> {
        for (i, s) in self.spends.iter().enumerate() {
            if !s.is_balanced() {
                return Err(MultisigError::Unbalanced {
                    spend: i,
                    assets: s.note.assets,
                    outputs: s.outputs(),
                    fee: s.fee,
                });
            }
        }
        Ok(())
    }

    /// Freezes the transaction. Consumes the builder.
    pub fn build(self) -> Result<UnsignedTransaction> {
        if self.open.is_some() {
            return Err(MultisigError::BuilderState("spend still open"));
        }
        let parent = self.anchor.ok_or(MultisigError::BuilderState("no spends"))?;
        self.check_balance()?;

        let mut notes = Vec::with_capacity(self.spends.len());
        let mut conditions = Vec::with_capacity(self.spends.len());
        let mut spends = Vec::with_capacity(self.spends.len());
        for s in self.spends {
            spends.push(Spend {
                note: s.note.name,
                witness: Witness::new(s.condition.clone()),
                seeds: s.materialized_seeds(parent),
                fee: s.fee,
            });
            notes.push(s.note);
            conditions.push(s.condition);
        }
        let raw = RawTx::new(spends);
        debug!(id = %raw.id.short(), fee = raw.fee(), "transaction built");
        UnsignedTransaction::freeze(raw, notes, conditions)
    }
}
