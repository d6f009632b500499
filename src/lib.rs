// Library interface for nockvault multisig coordination
// This allows the CLI, tests and embedding services to share the lifecycle

pub mod error;
pub mod config;
pub mod crypto;
pub mod lock;
pub mod note;
pub mod select;
pub mod tx;
pub mod builder;
pub mod aggregate;
pub mod validate;
pub mod oracle;
pub mod confirm;
pub mod store;
pub mod proposal;
pub mod wallet;
pub mod metrics;

pub use error::{MultisigError, Result};
pub use crypto::{blake3_hash, pkh_from_pk, Digest, Pkh};
pub use lock::{derive, LockRoot, SpendingCondition};
pub use note::{Nicks, Note, NoteName, NICKS_PER_NOCK};
pub use select::select;
pub use tx::{MergedTransaction, RawTx, Seed, SignedFragment, SigningRequest, TxId, UnsignedTransaction};
pub use builder::{FeePolicy, TxBuilder};
pub use aggregate::merge;
pub use validate::validate;
pub use store::{CoordinationStore, MemoryStore, RocksStore};
pub use proposal::{Proposal, ProposalCoordinator, ProposalStatus};
pub use wallet::MultisigWallet;
