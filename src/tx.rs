use serde::{Deserialize, Serialize};

use crate::crypto::{self, Digest, Pkh, CTX_OUTPUT, CTX_SIG_HASH, CTX_TX_ID, DILITHIUM3_PK_BYTES, DILITHIUM3_SIG_BYTES};
use crate::error::{MultisigError, Result};
use crate::lock::{LockRoot, SpendingCondition};
use crate::note::{Nicks, Note, NoteName};

pub const TX_VERSION: u32 = 1;

/// Fixed words per seed: lock root, gift, parent hash, payload length.
pub const SEED_HEADER_WORDS: u64 = 10;

/// Words one witness signature entry occupies (pkh + public key + signature).
pub const SIGNATURE_WORDS: u64 = 4 + crypto::words(DILITHIUM3_PK_BYTES) + crypto::words(DILITHIUM3_SIG_BYTES);

pub type TxId = Digest;

/// A requested output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seed {
    pub lock_root: LockRoot,
    pub gift: Nicks,
    #[serde(default)]
    pub note_data: Vec<u8>,
    pub parent_hash: Digest,
}

impl Seed {
    pub fn new(lock_root: LockRoot, gift: Nicks, parent_hash: Digest) -> Self {
        Seed { lock_root, gift, note_data: Vec::new(), parent_hash }
    }

    pub fn with_data(mut self, note_data: Vec<u8>) -> Self {
        self.note_data = note_data;
        self
    }

    pub fn words(&self) -> u64 {
        SEED_HEADER_WORDS + crypto::words(self.note_data.len())
    }
}

/// One signer's contribution to a spend's unlock.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub pkh: Pkh,
    pub public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub condition: SpendingCondition,
    pub signatures: Vec<SignatureEntry>,
}

impl Witness {
    pub fn new(condition: SpendingCondition) -> Self {
        Witness { condition, signatures: Vec::new() }
    }

    /// Inserts or replaces the entry for `entry.pkh`.
    pub fn upsert(&mut self, entry: SignatureEntry) {
        match self.signatures.iter_mut().find(|e| e.pkh == entry.pkh) {
            Some(existing) => *existing = entry,
            None => self.signatures.push(entry),
        }
    }

    pub fn signed_by(&self, pkh: &Pkh) -> bool {
        self.signatures.iter().any(|e| &e.pkh == pkh)
    }

    /// Words for the witness as it currently stands.
    pub fn words(&self) -> u64 {
        let sigs: u64 = self
            .signatures
            .iter()
            .map(|e| 4 + crypto::words(e.public_key.len()) + crypto::words(e.signature.len()))
            .sum();
        self.condition.words() + sigs
    }

    /// Words for a witness carrying exactly `threshold` signatures.
    pub fn estimated_words(condition: &SpendingCondition) -> u64 {
        condition.words() + condition.threshold() * SIGNATURE_WORDS
    }
}

/// One input note, the seeds it funds and its fee share.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spend {
    pub note: NoteName,
    pub witness: Witness,
    pub seeds: Vec<Seed>,
    pub fee: Nicks,
}

impl Spend {
    pub fn outputs(&self) -> Nicks {
        self.seeds.iter().map(|s| s.gift).sum()
    }

    pub fn seed_words(&self) -> u64 {
        self.seeds.iter().map(Seed::words).sum()
    }

    /// Message each signer signs for this spend.
    pub fn sig_hash(&self) -> Digest {
        #[derive(Serialize)]
        struct SigBody<'a> {
            note: &'a NoteName,
            seeds: &'a [Seed],
            fee: Nicks,
        }
        let body = SigBody { note: &self.note, seeds: &self.seeds, fee: self.fee };
        // bincode over plain structs of fixed-size fields cannot fail
        let bytes = bincode::serialize(&body).unwrap_or_default();
        crypto::hash_with(CTX_SIG_HASH, &bytes)
    }
}

/// Transaction as it travels between builder, signers and aggregator.
/// `id` is whatever the producer last computed; only `content_id()` is canonical.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTx {
    pub version: u32,
    pub id: TxId,
    pub spends: Vec<Spend>,
}

impl RawTx {
    pub fn new(spends: Vec<Spend>) -> Self {
        let mut tx = RawTx { version: TX_VERSION, id: Digest::default(), spends };
        tx.recalc_id();
        tx
    }

    /// Identifier over the non-witness content: version, inputs, spending
    /// condition roots, seeds and fee shares. Signatures never change it.
    pub fn content_id(&self) -> TxId {
        #[derive(Serialize)]
        struct SpendBody<'a> {
            note: &'a NoteName,
            lock: LockRoot,
            seeds: &'a [Seed],
            fee: Nicks,
        }
        let bodies: Vec<SpendBody<'_>> = self
            .spends
            .iter()
            .map(|s| SpendBody { note: &s.note, lock: s.witness.condition.lock_root(), seeds: &s.seeds, fee: s.fee })
            .collect();
        let bytes = bincode::serialize(&(self.version, bodies)).unwrap_or_default();
        crypto::hash_with(CTX_TX_ID, &bytes)
    }

    /// Overwrites the carried id with the canonical one.
    pub fn recalc_id(&mut self) -> TxId {
        self.id = self.content_id();
        self.id
    }

    pub fn fee(&self) -> Nicks {
        self.spends.iter().map(|s| s.fee).sum()
    }

    pub fn words(&self) -> u64 {
        self.spends.iter().map(|s| s.seed_words() + s.witness.words()).sum()
    }

    pub fn without_signatures(&self) -> RawTx {
        let mut tx = self.clone();
        for spend in &mut tx.spends {
            spend.witness.signatures.clear();
        }
        tx
    }

    /// Deterministic names of the notes this transaction creates, in spend
    /// then seed order.
    pub fn output_names(&self) -> Vec<NoteName> {
        let mut names = Vec::new();
        for (si, spend) in self.spends.iter().enumerate() {
            for (ki, seed) in spend.seeds.iter().enumerate() {
                let mut hasher = blake3::Hasher::new_derive_key(CTX_OUTPUT);
                hasher.update(seed.lock_root.digest().as_bytes());
                hasher.update(seed.parent_hash.as_bytes());
                hasher.update(&(si as u64).to_le_bytes());
                hasher.update(&(ki as u64).to_le_bytes());
                hasher.update(&seed.gift.to_le_bytes());
                names.push(NoteName { first: seed.lock_root, last: Digest(*hasher.finalize().as_bytes()) });
            }
        }
        names
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(s: &str) -> Result<RawTx> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Output of `TxBuilder::build`: the transaction plus the inputs a signer
/// needs to check it. Frozen once built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawUnsigned", into = "RawUnsigned")]
pub struct UnsignedTransaction {
    raw: RawTx,
    notes: Vec<Note>,
    conditions: Vec<SpendingCondition>,
    encoded: String,
}

#[derive(Serialize, Deserialize)]
struct RawUnsigned {
    raw: RawTx,
    notes: Vec<Note>,
    conditions: Vec<SpendingCondition>,
    encoded: String,
}

impl TryFrom<RawUnsigned> for UnsignedTransaction {
    type Error = MultisigError;

    /// Re-checks what `freeze` guarantees; the stored encoding is rebuilt.
    fn try_from(r: RawUnsigned) -> Result<Self> {
        let canonical = r.raw.content_id();
        if r.raw.id != canonical {
            return Err(MultisigError::InvalidInput(format!(
                "transaction id {} does not match content {}",
                r.raw.id.short(),
                canonical.short()
            )));
        }
        let spends = r.raw.spends.len();
        if r.notes.len() != spends || r.conditions.len() != spends {
            return Err(MultisigError::InvalidInput(format!(
                "{} spends but {} notes and {} conditions",
                spends,
                r.notes.len(),
                r.conditions.len()
            )));
        }
        for (i, spend) in r.raw.spends.iter().enumerate() {
            if spend.note != r.notes[i].name || spend.witness.condition != r.conditions[i] {
                return Err(MultisigError::InvalidInput(format!("spend {i} does not match its note or condition")));
            }
        }
        UnsignedTransaction::freeze(r.raw, r.notes, r.conditions)
    }
}

impl From<UnsignedTransaction> for RawUnsigned {
    fn from(u: UnsignedTransaction) -> Self {
        RawUnsigned { raw: u.raw, notes: u.notes, conditions: u.conditions, encoded: u.encoded }
    }
}

impl UnsignedTransaction {
    pub(crate) fn freeze(raw: RawTx, notes: Vec<Note>, conditions: Vec<SpendingCondition>) -> Result<Self> {
        let encoded = raw.encode()?;
        Ok(UnsignedTransaction { raw, notes, conditions, encoded })
    }

    pub fn id(&self) -> TxId {
        self.raw.id
    }

    pub fn raw(&self) -> &RawTx {
        &self.raw
    }

    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn conditions(&self) -> &[SpendingCondition] {
        &self.conditions
    }

    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    pub fn fee(&self) -> Nicks {
        self.raw.fee()
    }

    pub fn signing_request(&self) -> SigningRequest {
        SigningRequest {
            raw_tx: self.raw.clone(),
            notes: self.notes.clone(),
            conditions: self.conditions.clone(),
        }
    }
}

/// What a signing oracle receives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningRequest {
    pub raw_tx: RawTx,
    pub notes: Vec<Note>,
    pub conditions: Vec<SpendingCondition>,
}

/// One signer's copy of the transaction carrying their partial witness.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedFragment {
    pub signer: Pkh,
    pub tx: RawTx,
}

impl SignedFragment {
    /// Id the signer's tooling reported; not trusted.
    pub fn reported_id(&self) -> TxId {
        self.tx.id
    }

    pub fn has_signature_of(&self, pkh: &Pkh) -> bool {
        self.tx.spends.iter().any(|s| s.witness.signed_by(pkh))
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(s: &str) -> Result<SignedFragment> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Result of merging at least `threshold` fragments. Only the aggregator
/// constructs one; its id is always recomputed from the merged content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MergedTransaction {
    raw: RawTx,
    signers: Vec<Pkh>,
}

impl MergedTransaction {
    pub(crate) fn from_merge(mut raw: RawTx, signers: Vec<Pkh>) -> Self {
        raw.recalc_id();
        MergedTransaction { raw, signers }
    }

    pub fn id(&self) -> TxId {
        self.raw.id
    }

    pub fn raw(&self) -> &RawTx {
        &self.raw
    }

    /// Signers whose signatures made it into the merged witnesses.
    pub fn signers(&self) -> &[Pkh] {
        &self.signers
    }

    pub fn encode(&self) -> Result<String> {
        self.raw.encode()
    }
}
