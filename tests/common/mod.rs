// Shared fixtures for the integration tests
#![allow(dead_code)]

use nockvault::{
    blake3_hash,
    builder::{FeePolicy, TxBuilder},
    config::Polling,
    oracle::LocalSigner,
    LockRoot, Nicks, Note, SpendingCondition, UnsignedTransaction,
};

/// A wallet's key holders plus the condition they share.
pub struct Party {
    pub signers: Vec<LocalSigner>,
    pub condition: SpendingCondition,
}

impl Party {
    pub fn new(threshold: u64, n: usize) -> Self {
        let signers: Vec<LocalSigner> = (0..n).map(|_| LocalSigner::generate()).collect();
        let pkhs = signers.iter().map(|s| s.pkh()).collect();
        let condition = SpendingCondition::new(threshold, pkhs).expect("valid policy");
        Party { signers, condition }
    }

    pub fn lock_root(&self) -> LockRoot {
        self.condition.lock_root()
    }

    pub fn note(&self, tag: u8, assets: Nicks) -> Note {
        note_under(self.lock_root(), tag, assets)
    }
}

pub fn note_under(root: LockRoot, tag: u8, assets: Nicks) -> Note {
    Note::new(root, blake3_hash(&[b'n', tag]), assets, 1)
}

/// Lock root of some outside single-key wallet.
pub fn recipient(tag: u8) -> LockRoot {
    SpendingCondition::single(blake3_hash(&[b'r', tag])).lock_root()
}

/// Single-input spend to one recipient with the fee set to the calculated fee.
pub fn single_spend(party: &Party, note: Note, to: LockRoot, gift: Nicks) -> UnsignedTransaction {
    let mut builder = TxBuilder::new(FeePolicy::default());
    builder
        .add_spend(note, party.condition.clone(), party.condition.clone())
        .expect("add spend");
    let seed = builder.anchor_seed(to, gift).expect("anchor seed");
    builder.add_seed(seed).expect("add seed");
    builder.finalize_spend().expect("finalize");
    let fee = builder.calc_fee();
    builder.set_fee_and_rebalance(fee, false).expect("rebalance");
    builder.build().expect("build")
}

/// Millisecond-scale polling so tests never wait on real intervals.
pub fn fast_polling() -> Polling {
    Polling {
        acceptance_interval_ms: 1,
        acceptance_attempts: 3,
        inclusion_interval_secs: 0,
        inclusion_budget_secs: 5,
    }
}
