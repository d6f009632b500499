use crate::error::{MultisigError, Result};
use crate::note::{total_assets, Nicks, Note};

/// Greedy largest-first coin selection.
///
/// Candidates are ordered by amount descending (ties keep their input order)
/// and accumulated until the running total reaches `target`. The whole
/// candidate set falling short is `InsufficientFunds`; no partial result is
/// returned.
pub fn select(notes: &[Note], target: Nicks) -> Result<Vec<Note>> {
    let available = total_assets(notes);
    if available < target {
        return Err(MultisigError::InsufficientFunds { requested: target, available });
    }

    let mut sorted: Vec<&Note> = notes.iter().collect();
    // sort_by is stable, which gives the tie order
    sorted.sort_by(|a, b| b.assets.cmp(&a.assets));

    let mut chosen = Vec::new();
    let mut total: Nicks = 0;
    for note in sorted {
        if total >= target {
            break;
        }
        total = total.saturating_add(note.assets);
        chosen.push(note.clone());
    }
    Ok(chosen)
}
