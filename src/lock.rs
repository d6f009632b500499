use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::crypto::{Digest, Pkh, CTX_LOCK};
use crate::error::{MultisigError, Result};
use crate::note::Note;

/// Identifier under which notes are locked and queried.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockRoot(Digest);

impl LockRoot {
    /// Wraps an externally supplied hash, for sends to arbitrary locks.
    pub fn from_raw(digest: Digest) -> Self {
        LockRoot(digest)
    }

    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for LockRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for LockRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockRoot({})", self.0.short())
    }
}

impl FromStr for LockRoot {
    type Err = MultisigError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(LockRoot(s.parse()?))
    }
}

/// An m-of-n policy over an ordered participant list. Participant order is
/// significant: it changes the derived root.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawCondition", into = "RawCondition")]
pub struct SpendingCondition {
    threshold: u64,
    participants: Vec<Pkh>,
}

#[derive(Serialize, Deserialize)]
struct RawCondition {
    threshold: u64,
    participants: Vec<Pkh>,
}

impl TryFrom<RawCondition> for SpendingCondition {
    type Error = MultisigError;

    fn try_from(raw: RawCondition) -> Result<Self> {
        SpendingCondition::new(raw.threshold, raw.participants)
    }
}

impl From<SpendingCondition> for RawCondition {
    fn from(c: SpendingCondition) -> Self {
        RawCondition { threshold: c.threshold, participants: c.participants }
    }
}

impl SpendingCondition {
    pub fn new(threshold: u64, participants: Vec<Pkh>) -> Result<Self> {
        check_policy(threshold, &participants)?;
        Ok(SpendingCondition { threshold, participants })
    }

    /// The 1-of-1 condition for a single key.
    pub fn single(pkh: Pkh) -> Self {
        SpendingCondition { threshold: 1, participants: vec![pkh] }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn participants(&self) -> &[Pkh] {
        &self.participants
    }

    pub fn contains(&self, pkh: &Pkh) -> bool {
        self.participants.contains(pkh)
    }

    /// Position of `pkh` in the participant order.
    pub fn position(&self, pkh: &Pkh) -> Option<usize> {
        self.participants.iter().position(|p| p == pkh)
    }

    pub fn lock_root(&self) -> LockRoot {
        root_of(self.threshold, &self.participants)
    }

    /// Serialized size in words: threshold, length prefix, one digest per participant.
    pub fn words(&self) -> u64 {
        2 + 4 * self.participants.len() as u64
    }
}

impl fmt::Debug for SpendingCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-of-{} {:?}", self.threshold, self.participants.len(), self.lock_root())
    }
}

fn check_policy(threshold: u64, participants: &[Pkh]) -> Result<()> {
    if participants.is_empty() {
        return Err(MultisigError::InvalidPolicy("participant list is empty".into()));
    }
    if threshold == 0 || threshold > participants.len() as u64 {
        return Err(MultisigError::InvalidPolicy(format!(
            "threshold {} outside 1..={}",
            threshold,
            participants.len()
        )));
    }
    let mut seen = HashSet::with_capacity(participants.len());
    for p in participants {
        if !seen.insert(p) {
            return Err(MultisigError::InvalidPolicy(format!("participant {p} listed twice")));
        }
    }
    Ok(())
}

fn root_of(threshold: u64, participants: &[Pkh]) -> LockRoot {
    let mut hasher = blake3::Hasher::new_derive_key(CTX_LOCK);
    hasher.update(&threshold.to_le_bytes());
    hasher.update(&(participants.len() as u64).to_le_bytes());
    for p in participants {
        hasher.update(p.as_bytes());
    }
    LockRoot(Digest(*hasher.finalize().as_bytes()))
}

/// Derives the lock root for `threshold` of the ordered `participants`.
pub fn derive(threshold: u64, participants: &[Pkh]) -> Result<LockRoot> {
    check_policy(threshold, participants)?;
    Ok(root_of(threshold, participants))
}

/// Fails unless `note` is locked under the root `condition` derives to.
pub fn verify_lock(note: &Note, condition: &SpendingCondition) -> Result<()> {
    let expected = condition.lock_root();
    let actual = note.name.first;
    if expected != actual {
        return Err(MultisigError::SpendConditionMismatch { expected, actual });
    }
    Ok(())
}
