use std::collections::HashSet;
use tracing::debug;

use crate::builder::{FeePolicy, TxBuilder};
use crate::crypto::{self, Pkh};
use crate::error::{MultisigError, Result};
use crate::lock::{verify_lock, SpendingCondition};
use crate::note::Note;
use crate::tx::{MergedTransaction, Spend};

/// Pre-broadcast gate. Checks, in order, that every input sits under the
/// supplied condition, that the set fee covers the calculated fee, and that
/// every spend carries a threshold-satisfying set of valid signatures.
pub fn validate(
    merged: &MergedTransaction,
    notes: &[Note],
    conditions: &[SpendingCondition],
    policy: FeePolicy,
) -> Result<()> {
    let raw = merged.raw();
    let view = TxBuilder::from_tx(raw, notes, conditions, policy)?;

    for (i, spend) in raw.spends.iter().enumerate() {
        let condition = &conditions[i];
        let note = notes
            .iter()
            .find(|n| n.name == spend.note)
            .ok_or_else(|| MultisigError::NotFound(format!("input note for spend {i}")))?;
        verify_lock(note, condition)?;
        if &spend.witness.condition != condition {
            return Err(MultisigError::SpendConditionMismatch {
                expected: condition.lock_root(),
                actual: spend.witness.condition.lock_root(),
            });
        }
    }

    view.check_balance()?;

    let needed = view.calc_fee();
    let actual = view.current_fee();
    if actual < needed {
        return Err(MultisigError::InsufficientFee { needed, actual });
    }

    for (i, spend) in raw.spends.iter().enumerate() {
        let have = valid_signers(spend).len();
        let need = spend.witness.condition.threshold() as usize;
        if have < need {
            return Err(MultisigError::MissingUnlock { spend: i, have, need });
        }
    }

    debug!(id = %merged.id().short(), fee = actual, calculated = needed, "transaction validated");
    Ok(())
}

/// Distinct participants with a verifying signature over the spend.
pub fn valid_signers(spend: &Spend) -> HashSet<Pkh> {
    let msg = spend.sig_hash();
    let condition = &spend.witness.condition;
    spend
        .witness
        .signatures
        .iter()
        .filter(|e| condition.contains(&e.pkh))
        .filter(|e| crypto::pkh_from_bytes(&e.public_key) == e.pkh)
        .filter(|e| crypto::verify_digest(&e.public_key, &e.signature, &msg))
        .map(|e| e.pkh)
        .collect()
}
