use thiserror::Error;

use crate::crypto::Digest;
use crate::lock::LockRoot;
use crate::note::Nicks;
use crate::proposal::ProposalStatus;

pub type Result<T> = std::result::Result<T, MultisigError>;

/// Every failure the multisig lifecycle can surface. Variants carry the
/// expected and actual values so a caller can render a precise message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MultisigError {
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("spend condition mismatch: note is locked to {actual}, condition derives {expected}")]
    SpendConditionMismatch { expected: LockRoot, actual: LockRoot },

    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: Nicks, available: Nicks },

    #[error("unbalanceable: outputs plus fee need {needed}, inputs provide {available}")]
    Unbalanceable { needed: Nicks, available: Nicks },

    #[error("spend {spend} unbalanced: assets {assets} != outputs {outputs} + fee {fee}")]
    Unbalanced { spend: usize, assets: Nicks, outputs: Nicks, fee: Nicks },

    #[error("seed gift must be non-zero")]
    ZeroGift,

    #[error("seed parent {actual} does not reference anchor note {expected}")]
    ParentMismatch { expected: Digest, actual: Digest },

    #[error("builder misuse: {0}")]
    BuilderState(&'static str),

    #[error("insufficient signatures: have {have}, need {need}")]
    InsufficientSignatures { have: usize, need: usize },

    #[error("fragment {index} signs different content: expected {expected}, got {actual}")]
    FragmentMismatch { index: usize, expected: Digest, actual: Digest },

    #[error("fragment from {signer} carries no signature of that signer")]
    UnsignedFragment { signer: Digest },

    #[error("insufficient fee: calculated {needed}, set {actual}")]
    InsufficientFee { needed: Nicks, actual: Nicks },

    #[error("spend {spend} unlock incomplete: {have} valid signatures of {need}")]
    MissingUnlock { spend: usize, have: usize, need: usize },

    #[error("signer {0} is not a participant")]
    UnauthorizedSigner(Digest),

    #[error("proposal {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: ProposalStatus, to: ProposalStatus },

    #[error("lock {0} is already registered")]
    DuplicateLock(LockRoot),

    #[error("a proposal for transaction {0} already exists")]
    DuplicateProposal(Digest),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("oracle error: {0}")]
    Oracle(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

impl MultisigError {
    /// Errors worth retrying without changing inputs: transient oracle
    /// failures and proposals that simply need more signers.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MultisigError::Oracle(_) | MultisigError::InsufficientSignatures { .. })
    }
}

impl From<anyhow::Error> for MultisigError {
    fn from(e: anyhow::Error) -> Self {
        MultisigError::Storage(format!("{e:#}"))
    }
}

impl From<serde_json::Error> for MultisigError {
    fn from(e: serde_json::Error) -> Self {
        MultisigError::Encoding(e.to_string())
    }
}

impl From<bincode::Error> for MultisigError {
    fn from(e: bincode::Error) -> Self {
        MultisigError::Encoding(e.to_string())
    }
}
