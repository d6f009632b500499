use serde::{Deserialize, Serialize};

use crate::crypto::{self, Digest, CTX_NOTE};
use crate::lock::LockRoot;

/// Smallest unit of value.
pub type Nicks = u64;

pub const NICKS_PER_NOCK: Nicks = 65_536;

/// Unique note name: the lock root it sits under plus its origin commitment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NoteName {
    pub first: LockRoot,
    pub last: Digest,
}

/// An unspent value record. Consumed whole; any remainder must be re-emitted as a refund.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub name: NoteName,
    pub assets: Nicks,
    pub origin_page: u64,
    /// Opaque ledger payload proving spendability.
    #[serde(default)]
    pub note_data: Vec<u8>,
}

impl Note {
    pub fn new(lock_root: LockRoot, origin: Digest, assets: Nicks, origin_page: u64) -> Self {
        Note {
            name: NoteName { first: lock_root, last: origin },
            assets,
            origin_page,
            note_data: Vec::new(),
        }
    }

    pub fn lock_root(&self) -> LockRoot {
        self.name.first
    }

    /// Commitment to this note, referenced as the parent of seeds it funds.
    pub fn hash(&self) -> Digest {
        let mut hasher = blake3::Hasher::new_derive_key(CTX_NOTE);
        hasher.update(self.name.first.digest().as_bytes());
        hasher.update(self.name.last.as_bytes());
        hasher.update(&self.assets.to_le_bytes());
        hasher.update(&self.origin_page.to_le_bytes());
        hasher.update(crypto::blake3_hash(&self.note_data).as_bytes());
        Digest(*hasher.finalize().as_bytes())
    }
}

/// Renders nicks as a NOCK amount with four decimals, e.g. `1.5000 NOCK`.
pub fn format_nicks(nicks: Nicks) -> String {
    let whole = nicks / NICKS_PER_NOCK;
    let frac = (nicks % NICKS_PER_NOCK) * 10_000 / NICKS_PER_NOCK;
    format!("{whole}.{frac:04} NOCK")
}

/// Saturates at `Nicks::MAX` rather than wrapping.
pub fn total_assets(notes: &[Note]) -> Nicks {
    notes.iter().fold(0, |acc: Nicks, n| acc.saturating_add(n.assets))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_nock_amounts() {
        assert_eq!(format_nicks(NICKS_PER_NOCK), "1.0000 NOCK");
        assert_eq!(format_nicks(NICKS_PER_NOCK + NICKS_PER_NOCK / 2), "1.5000 NOCK");
        assert_eq!(format_nicks(0), "0.0000 NOCK");
    }
}
