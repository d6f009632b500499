// Coordination store behaviour, in memory and on RocksDB

mod common;

use std::sync::Arc;
use tempfile::TempDir;

use common::{fast_polling, recipient, single_spend, Party};
use nockvault::{
    builder::FeePolicy,
    config,
    oracle::MemoryLedger,
    store::{self, CoordinationStore, LockRecord, ProposalFilter},
    MemoryStore, MultisigError, ProposalCoordinator, ProposalStatus, RocksStore,
};

/// Registers the party's lock and opens a pending proposal signed by the first participant.
fn seed_store(store: Arc<dyn CoordinationStore>, party: &Party) -> uuid::Uuid {
    let coord = ProposalCoordinator::new(store, Arc::new(MemoryLedger::new()), FeePolicy::default(), fast_polling());
    let a = &party.signers[0];
    coord
        .register_lock(party.condition.threshold(), party.condition.participants().to_vec(), a.pkh())
        .expect("register");
    let tx = single_spend(party, party.note(1, 100_000), recipient(1), 30_000);
    coord.propose(tx.clone(), a.pkh(), a.sign_tx(tx.raw())).expect("propose").id
}

fn exercise_store(store: Arc<dyn CoordinationStore>) {
    let party = Party::new(2, 3);
    let id = seed_store(store.clone(), &party);
    let (a, b, c) = (&party.signers[0], &party.signers[1], &party.signers[2]);

    let proposal = store.get_proposal(&id).expect("get").expect("present");
    assert_eq!(proposal.status, ProposalStatus::Pending);
    assert_eq!(proposal.proposer, a.pkh());

    // same transaction cannot be proposed twice
    let err = store.create_proposal(proposal.clone()).unwrap_err();
    assert_eq!(err, MultisigError::DuplicateProposal(proposal.tx_id));

    let err = store.create_lock(LockRecord::new(party.condition.clone(), b.pkh()).expect("record")).unwrap_err();
    assert_eq!(err, MultisigError::DuplicateLock(party.lock_root()));

    // compare-and-set refuses a transition from the wrong state
    let err = store.transition(&id, &[ProposalStatus::Ready], ProposalStatus::Broadcast).unwrap_err();
    assert!(matches!(err, MultisigError::InvalidTransition { from: ProposalStatus::Pending, .. }));

    let fragment = b.sign_tx(proposal.unsigned.raw());
    store.append_signature(&id, b.pkh(), fragment.clone()).expect("append");
    let updated = store.append_signature(&id, b.pkh(), fragment).expect("append again");
    assert_eq!(updated.signatures_collected(), 2, "Second submission replaces the first");

    store.transition(&id, &[ProposalStatus::Pending], ProposalStatus::Ready).expect("to ready");
    let entry = store.mark_broadcast(&id, proposal.tx_id, updated.signers()).expect("broadcast");
    assert_eq!(entry.proposal_id, Some(id));
    let err = store.mark_broadcast(&id, proposal.tx_id, updated.signers()).unwrap_err();
    assert!(matches!(err, MultisigError::InvalidTransition { .. }), "mark_broadcast is one-shot");

    // a broadcast transaction may still confirm, so it is never marked failed
    let err = store.mark_failed(&id, "rejected after broadcast").unwrap_err();
    assert!(matches!(err, MultisigError::InvalidTransition { from: ProposalStatus::Broadcast, .. }));
    let broadcast = store.get_proposal(&id).expect("get").expect("present");
    assert_eq!(broadcast.status, ProposalStatus::Broadcast);
    assert_eq!(broadcast.final_tx_id, Some(entry.tx_id));
    assert!(broadcast.failure.is_none());

    let confirmed = store.mark_confirmed(&id).expect("confirm");
    assert_eq!(confirmed.status, ProposalStatus::Confirmed);
    assert!(store.mark_failed(&id, "late").is_err(), "Confirmed is final");

    let history = store.list_history(Some(&c.pkh())).expect("history");
    assert_eq!(history.len(), 1);
    assert!(history[0].confirmed_at.is_some());

    let by_status = store
        .list_proposals(&ProposalFilter { status: Some(ProposalStatus::Confirmed), ..Default::default() })
        .expect("list");
    assert_eq!(by_status.len(), 1);
    let by_lock = store
        .list_proposals(&ProposalFilter { lock_root: Some(recipient(1)), ..Default::default() })
        .expect("list");
    assert!(by_lock.is_empty());
    let by_participant = store
        .list_proposals(&ProposalFilter { participant: Some(c.pkh()), ..Default::default() })
        .expect("list");
    assert_eq!(by_participant.len(), 1);

    let err = store.transition(&uuid::Uuid::new_v4(), &[ProposalStatus::Pending], ProposalStatus::Ready).unwrap_err();
    assert!(matches!(err, MultisigError::NotFound(_)));
}

#[tokio::test]
async fn test_memory_store() {
    println!("🧪 Testing in-memory coordination store...");
    exercise_store(Arc::new(MemoryStore::new()));
    println!("✅ Memory store behaves");
}

#[tokio::test]
async fn test_rocks_store() {
    println!("🧪 Testing RocksDB coordination store...");
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("store");
    let db = Arc::new(RocksStore::open(path.to_str().expect("utf8 path")).expect("Failed to open store"));
    exercise_store(db.clone());

    let counts = db.counts().expect("counts");
    assert!(counts.iter().all(|(_, n)| *n == 1), "one lock, proposal and history entry: {counts:?}");
    println!("✅ RocksDB store behaves");
}

#[tokio::test]
async fn test_rocks_store_survives_reopen() {
    println!("🧪 Testing persistence across reopen...");

    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let cfg = config::Storage { path: temp_dir.path().join("db").to_string_lossy().into_owned() };
    let party = Party::new(2, 3);

    let (id, before) = {
        let db = store::open(&cfg).expect("open");
        let id = seed_store(db.clone(), &party);
        let before = db.get_proposal(&id).expect("get").expect("present");
        db.flush().expect("flush");
        (id, before)
    };

    let db = store::open(&cfg).expect("reopen");
    let after = db.get_proposal(&id).expect("get").expect("still present");
    assert_eq!(after, before, "Proposal round-trips through bincode + zstd");
    assert_eq!(after.unsigned.id(), before.tx_id);
    assert_eq!(db.list_locks(None).expect("locks").len(), 1);
    assert_eq!(db.path(), cfg.path);

    // the tx index was written together with the proposal
    let err = db.create_proposal(after.clone()).unwrap_err();
    assert_eq!(err, MultisigError::DuplicateProposal(before.tx_id));

    println!("✅ Proposal survived reopen");
}

#[tokio::test]
async fn test_rocks_broadcast_record_survives_reopen() {
    println!("🧪 Testing broadcast status and history persist together...");

    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let cfg = config::Storage { path: temp_dir.path().join("db").to_string_lossy().into_owned() };
    let party = Party::new(2, 3);
    let b = &party.signers[1];

    let id = {
        let db = store::open(&cfg).expect("open");
        let id = seed_store(db.clone(), &party);
        let proposal = db.get_proposal(&id).expect("get").expect("present");
        let updated = db.append_signature(&id, b.pkh(), b.sign_tx(proposal.unsigned.raw())).expect("append");
        db.transition(&id, &[ProposalStatus::Pending], ProposalStatus::Ready).expect("to ready");
        db.mark_broadcast(&id, proposal.tx_id, updated.signers()).expect("broadcast");
        id
    };

    let db = store::open(&cfg).expect("reopen");
    let proposal = db.get_proposal(&id).expect("get").expect("present");
    assert_eq!(proposal.status, ProposalStatus::Broadcast);
    let history = db.list_history(None).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(Some(history[0].tx_id), proposal.final_tx_id);
    assert_eq!(history[0].proposal_id, Some(id));
    assert_eq!(history[0].signers.len(), 2);

    let confirmed = db.mark_confirmed(&id).expect("confirm");
    assert_eq!(confirmed.status, ProposalStatus::Confirmed);
    drop(db);

    let db = store::open(&cfg).expect("reopen again");
    let history = db.list_history(None).expect("history");
    assert!(history[0].confirmed_at.is_some(), "Confirmation written with the proposal");
    assert_eq!(db.get_proposal(&id).expect("get").expect("present").status, ProposalStatus::Confirmed);

    println!("✅ Broadcast record is consistent after reopen");
}
