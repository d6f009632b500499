use async_trait::async_trait;
use pqcrypto_dilithium::dilithium3::{PublicKey, SecretKey};
use pqcrypto_traits::sign::PublicKey as _;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::crypto::{self, Pkh};
use crate::error::{MultisigError, Result};
use crate::lock::{verify_lock, LockRoot};
use crate::note::Note;
use crate::tx::{MergedTransaction, RawTx, SignatureEntry, SignedFragment, SigningRequest, TxId};

/// External per-signer agent holding a private key.
#[async_trait]
pub trait SigningOracle: Send + Sync {
    fn signer(&self) -> Pkh;
    /// Handshake before the first request.
    async fn connect(&self) -> Result<()>;
    async fn sign(&self, request: &SigningRequest) -> Result<SignedFragment>;
}

/// Ledger query surface: unspent notes under a lock root.
#[async_trait]
pub trait NoteOracle: Send + Sync {
    async fn notes_by_lock(&self, root: &LockRoot) -> Result<Vec<Note>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(String),
}

/// Ledger broadcast surface.
#[async_trait]
pub trait BroadcastOracle: Send + Sync {
    async fn submit(&self, tx: &MergedTransaction) -> Result<SubmitOutcome>;
    async fn accepted(&self, id: &TxId) -> Result<bool>;
    async fn included(&self, id: &TxId) -> Result<bool>;
}

/// Retry an async operation with fixed delay. Used for query and poll paths
/// only; signing and broadcast surface their errors immediately.
pub async fn retry<F, Fut, T>(mut attempts: usize, delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err = None;
    while attempts > 0 {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                debug!("retryable oracle call failed: {err}");
                last_err = Some(err);
                attempts -= 1;
                if attempts > 0 {
                    sleep(delay).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| MultisigError::Oracle("retry exhausted".to_string())))
}

/// Wraps a signing oracle with its connect handshake and settle delay, and
/// checks every returned fragment against the request.
pub struct SigningSession {
    oracle: Arc<dyn SigningOracle>,
    settle: Duration,
    connected: tokio::sync::Mutex<bool>,
}

impl SigningSession {
    pub fn new(oracle: Arc<dyn SigningOracle>, settle: Duration) -> Self {
        SigningSession { oracle, settle, connected: tokio::sync::Mutex::new(false) }
    }

    pub fn signer(&self) -> Pkh {
        self.oracle.signer()
    }

    async fn ensure_connected(&self) -> Result<()> {
        let mut connected = self.connected.lock().await;
        if !*connected {
            self.oracle.connect().await?;
            sleep(self.settle).await;
            *connected = true;
            debug!(signer = %self.signer().short(), "signing oracle connected");
        }
        Ok(())
    }

    pub async fn sign(&self, request: &SigningRequest) -> Result<SignedFragment> {
        self.ensure_connected().await?;
        let fragment = match self.oracle.sign(request).await {
            Ok(f) => f,
            Err(e) => {
                // next attempt starts with a fresh handshake
                *self.connected.lock().await = false;
                return Err(e);
            }
        };
        let expected = request.raw_tx.content_id();
        let actual = fragment.tx.content_id();
        if actual != expected {
            return Err(MultisigError::FragmentMismatch { index: 0, expected, actual });
        }
        let signer = self.signer();
        if fragment.signer != signer || !fragment.has_signature_of(&signer) {
            return Err(MultisigError::UnsignedFragment { signer });
        }
        Ok(fragment)
    }
}

/// Asks every session to sign concurrently. Fails on the first error.
pub async fn collect_signatures(sessions: &[SigningSession], request: &SigningRequest) -> Result<Vec<SignedFragment>> {
    futures::future::try_join_all(sessions.iter().map(|s| s.sign(request))).await
}

/// In-process Dilithium3 signer.
pub struct LocalSigner {
    pk: PublicKey,
    sk: SecretKey,
    pkh: Pkh,
}

impl LocalSigner {
    pub fn generate() -> Self {
        let (pk, sk) = crypto::dilithium3_keypair();
        let pkh = crypto::pkh_from_pk(&pk);
        LocalSigner { pk, sk, pkh }
    }

    pub fn pkh(&self) -> Pkh {
        self.pkh
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.pk.as_bytes().to_vec()
    }

    /// Attaches this key's signature to every spend whose condition lists it.
    pub fn sign_tx(&self, raw: &RawTx) -> SignedFragment {
        let mut tx = raw.clone();
        for spend in &mut tx.spends {
            if !spend.witness.condition.contains(&self.pkh) {
                continue;
            }
            let signature = crypto::sign_digest(&self.sk, &spend.sig_hash());
            spend.witness.upsert(SignatureEntry {
                pkh: self.pkh,
                public_key: self.public_key_bytes(),
                signature,
            });
        }
        tx.recalc_id();
        SignedFragment { signer: self.pkh, tx }
    }
}

#[async_trait]
impl SigningOracle for LocalSigner {
    fn signer(&self) -> Pkh {
        self.pkh
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn sign(&self, request: &SigningRequest) -> Result<SignedFragment> {
        // refuse to sign spends of notes that are not under the stated lock
        for (spend, condition) in request.raw_tx.spends.iter().zip(&request.conditions) {
            let note = request
                .notes
                .iter()
                .find(|n| n.name == spend.note)
                .ok_or_else(|| MultisigError::NotFound(format!("note {}", spend.note.last.short())))?;
            verify_lock(note, condition)?;
        }
        Ok(self.sign_tx(&request.raw_tx))
    }
}

/// Shared oracle handles keyed by endpoint. Construction is single-flight:
/// concurrent callers for one endpoint await the same connect. A failed
/// connect leaves the slot empty, and `invalidate` drops a handle known to be
/// broken so the next caller reconnects.
pub struct OracleCache<T: Clone + Send + Sync + 'static> {
    cells: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T: Clone + Send + Sync + 'static> OracleCache<T> {
    pub fn new() -> Self {
        OracleCache { cells: Mutex::new(HashMap::new()) }
    }

    fn cell(&self, endpoint: &str) -> Arc<OnceCell<T>> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.entry(endpoint.to_string()).or_insert_with(|| Arc::new(OnceCell::new())).clone()
    }

    pub async fn get_or_connect<F, Fut>(&self, endpoint: &str, connect: F) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cell = self.cell(endpoint);
        let handle = cell
            .get_or_try_init(|| {
                info!(endpoint, "connecting ledger oracle");
                connect(endpoint.to_string())
            })
            .await?;
        Ok(handle.clone())
    }

    pub fn invalidate(&self, endpoint: &str) {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        if cells.remove(endpoint).is_some() {
            warn!(endpoint, "ledger oracle handle invalidated");
        }
    }

    /// Drops every handle; called at session teardown.
    pub fn clear(&self) {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn is_connected(&self, endpoint: &str) -> bool {
        let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells.get(endpoint).map_or(false, |c| c.initialized())
    }
}

impl<T: Clone + Send + Sync + 'static> Default for OracleCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory ledger implementing the note and broadcast oracles. Submitted
/// transactions spend their inputs and create their outputs immediately;
/// acceptance and inclusion are driven by the caller.
pub struct MemoryLedger {
    notes: Mutex<Vec<Note>>,
    submitted: Mutex<Vec<RawTx>>,
    accepted: Mutex<HashSet<TxId>>,
    included: Mutex<HashSet<TxId>>,
    reject_next: Mutex<Option<String>>,
    accept_on_submit: AtomicBool,
    failing_queries: AtomicUsize,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_notes(Vec::new())
    }

    pub fn with_notes(notes: Vec<Note>) -> Self {
        MemoryLedger {
            notes: Mutex::new(notes),
            submitted: Mutex::new(Vec::new()),
            accepted: Mutex::new(HashSet::new()),
            included: Mutex::new(HashSet::new()),
            reject_next: Mutex::new(None),
            accept_on_submit: AtomicBool::new(true),
            failing_queries: AtomicUsize::new(0),
        }
    }

    pub fn push_note(&self, note: Note) {
        self.notes.lock().unwrap_or_else(PoisonError::into_inner).push(note);
    }

    pub fn submitted_transactions(&self) -> Vec<RawTx> {
        self.submitted.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// When false, submissions are recorded but only `accept` marks them accepted.
    pub fn set_accept_on_submit(&self, on: bool) {
        self.accept_on_submit.store(on, Ordering::SeqCst);
    }

    pub fn accept(&self, id: TxId) {
        self.accepted.lock().unwrap_or_else(PoisonError::into_inner).insert(id);
    }

    pub fn include(&self, id: TxId) {
        self.accept(id);
        self.included.lock().unwrap_or_else(PoisonError::into_inner).insert(id);
    }

    pub fn reject_next(&self, reason: &str) {
        *self.reject_next.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
    }

    /// Makes the next `n` note queries fail.
    pub fn fail_next_queries(&self, n: usize) {
        self.failing_queries.store(n, Ordering::SeqCst);
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NoteOracle for MemoryLedger {
    async fn notes_by_lock(&self, root: &LockRoot) -> Result<Vec<Note>> {
        let failing = self.failing_queries.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_queries.store(failing - 1, Ordering::SeqCst);
            return Err(MultisigError::Oracle("ledger unavailable".into()));
        }
        let notes = self.notes.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(notes.iter().filter(|n| &n.name.first == root).cloned().collect())
    }
}

#[async_trait]
impl BroadcastOracle for MemoryLedger {
    async fn submit(&self, tx: &MergedTransaction) -> Result<SubmitOutcome> {
        if let Some(reason) = self.reject_next.lock().unwrap_or_else(PoisonError::into_inner).take() {
            return Ok(SubmitOutcome::Rejected(reason));
        }
        let raw = tx.raw();
        let mut submitted = self.submitted.lock().unwrap_or_else(PoisonError::into_inner);
        if submitted.iter().any(|t| t.id == raw.id) {
            return Ok(SubmitOutcome::Accepted);
        }
        let mut notes = self.notes.lock().unwrap_or_else(PoisonError::into_inner);
        for spend in &raw.spends {
            if !notes.iter().any(|n| n.name == spend.note) {
                return Ok(SubmitOutcome::Rejected(format!("note {} already spent", spend.note.last.short())));
            }
        }
        notes.retain(|n| !raw.spends.iter().any(|s| s.note == n.name));
        let page = submitted.len() as u64 + 1;
        for (name, seed) in raw.output_names().into_iter().zip(raw.spends.iter().flat_map(|s| s.seeds.iter())) {
            notes.push(Note { name, assets: seed.gift, origin_page: page, note_data: seed.note_data.clone() });
        }
        submitted.push(raw.clone());
        if self.accept_on_submit.load(Ordering::SeqCst) {
            self.accepted.lock().unwrap_or_else(PoisonError::into_inner).insert(raw.id);
        }
        Ok(SubmitOutcome::Accepted)
    }

    async fn accepted(&self, id: &TxId) -> Result<bool> {
        Ok(self.accepted.lock().unwrap_or_else(PoisonError::into_inner).contains(id))
    }

    async fn included(&self, id: &TxId) -> Result<bool> {
        Ok(self.included.lock().unwrap_or_else(PoisonError::into_inner).contains(id))
    }
}
