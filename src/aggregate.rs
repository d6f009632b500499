use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::crypto::Pkh;
use crate::error::{MultisigError, Result};
use crate::tx::{MergedTransaction, SignatureEntry, SignedFragment};

/// Merges independently signed copies of one transaction.
///
/// All fragments must carry the same non-witness content. Each fragment
/// contributes only its own signer's entries; any other entry it carries is
/// ignored. For each spend the union of those signatures is taken in
/// participant order and cut at the spend's threshold; surplus signatures are
/// dropped so the witness stays minimal. The merged id is recomputed from the result and no fragment's
/// reported id is used.
pub fn merge(fragments: &[SignedFragment], threshold: usize) -> Result<MergedTransaction> {
    if fragments.len() < threshold || fragments.is_empty() {
        return Err(MultisigError::InsufficientSignatures { have: fragments.len(), need: threshold.max(1) });
    }

    let base = &fragments[0].tx;
    let expected = base.content_id();
    for (index, fragment) in fragments.iter().enumerate().skip(1) {
        let actual = fragment.tx.content_id();
        if actual != expected {
            return Err(MultisigError::FragmentMismatch { index, expected, actual });
        }
    }

    let mut merged = base.without_signatures();
    let mut signers = BTreeSet::new();
    for (si, spend) in merged.spends.iter_mut().enumerate() {
        let condition = &spend.witness.condition;
        let need = condition.threshold() as usize;

        let mut candidates: Vec<(usize, &SignatureEntry)> = Vec::new();
        for fragment in fragments {
            for entry in &fragment.tx.spends[si].witness.signatures {
                if entry.pkh != fragment.signer {
                    debug!(spend = si, signer = %fragment.signer.short(), "ignoring entry for another participant");
                    continue;
                }
                let Some(pos) = condition.position(&entry.pkh) else { continue };
                if candidates.iter().all(|(p, _)| *p != pos) {
                    candidates.push((pos, entry));
                }
            }
        }
        if candidates.len() < need {
            return Err(MultisigError::InsufficientSignatures { have: candidates.len(), need });
        }
        candidates.sort_by_key(|(pos, _)| *pos);
        if candidates.len() > need {
            debug!(spend = si, dropped = candidates.len() - need, "dropping surplus signatures");
        }
        let chosen: Vec<SignatureEntry> = candidates.into_iter().take(need).map(|(_, e)| e.clone()).collect();
        signers.extend(chosen.iter().map(|e| e.pkh));
        spend.witness.signatures = chosen;
    }

    let merged = MergedTransaction::from_merge(merged, signers.into_iter().collect::<Vec<Pkh>>());
    for fragment in fragments {
        if fragment.reported_id() != merged.id() {
            warn!(
                signer = %fragment.signer.short(),
                reported = %fragment.reported_id().short(),
                canonical = %merged.id().short(),
                "fragment reported a different transaction id; using recomputed id"
            );
        }
    }
    info!(id = %merged.id().short(), fragments = fragments.len(), "fragments merged");
    crate::metrics::record(|m| m.merges.inc());
    Ok(merged)
}
