// Lock root derivation and spend-condition checks

mod common;

use common::{note_under, Party};
use nockvault::{
    blake3_hash, derive,
    builder::{FeePolicy, TxBuilder},
    lock::verify_lock,
    MultisigError, Pkh, SpendingCondition,
};

fn pkhs(n: u8) -> Vec<Pkh> {
    (0..n).map(|i| blake3_hash(&[b'p', i])).collect()
}

#[tokio::test]
async fn test_derive_is_deterministic() {
    println!("🧪 Testing lock root determinism...");

    let participants = pkhs(3);
    let a = derive(2, &participants).expect("derive");
    let b = derive(2, &participants).expect("derive");
    assert_eq!(a, b, "Same inputs must derive the same root");

    let condition = SpendingCondition::new(2, participants.clone()).expect("condition");
    assert_eq!(condition.lock_root(), a, "Condition and free function must agree");

    let other_threshold = derive(3, &participants).expect("derive");
    assert_ne!(a, other_threshold, "Threshold is part of the root");

    println!("✅ Lock root derivation is deterministic");
}

#[tokio::test]
async fn test_participant_order_changes_root() {
    println!("🧪 Testing participant order sensitivity...");

    let ordered = pkhs(3);
    let mut reordered = ordered.clone();
    reordered.swap(0, 2);

    let root_1 = derive(2, &ordered).expect("derive");
    let root_2 = derive(2, &reordered).expect("derive");
    assert_ne!(root_1, root_2, "Reordering participants must produce a different lock");

    println!("✅ Participant order is significant");
}

#[tokio::test]
async fn test_invalid_policies_rejected() {
    println!("🧪 Testing policy validation...");

    let participants = pkhs(3);
    for threshold in [0u64, 4] {
        let err = derive(threshold, &participants).unwrap_err();
        assert!(matches!(err, MultisigError::InvalidPolicy(_)), "threshold {threshold}: {err:?}");
    }

    let err = derive(1, &[]).unwrap_err();
    assert!(matches!(err, MultisigError::InvalidPolicy(_)), "empty participants: {err:?}");

    let mut dup = pkhs(2);
    dup.push(dup[0]);
    let err = SpendingCondition::new(2, dup).unwrap_err();
    assert!(matches!(err, MultisigError::InvalidPolicy(_)), "duplicates: {err:?}");

    println!("✅ Invalid policies are rejected");
}

#[tokio::test]
async fn test_condition_survives_json() {
    let condition = SpendingCondition::new(2, pkhs(3)).expect("condition");
    let json = serde_json::to_string(&condition).expect("serialize");
    let back: SpendingCondition = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, condition);
    assert_eq!(back.lock_root(), condition.lock_root());

    // a persisted condition with a broken policy must not load
    let broken = json.replace("\"threshold\":2", "\"threshold\":9");
    assert!(serde_json::from_str::<SpendingCondition>(&broken).is_err());
}

#[tokio::test]
async fn test_note_under_one_order_unspendable_by_other() {
    println!("🧪 Testing reordered condition cannot spend...");

    let party = Party::new(2, 3);
    let mut reordered_pkhs: Vec<Pkh> = party.condition.participants().to_vec();
    reordered_pkhs.reverse();
    let reordered = SpendingCondition::new(2, reordered_pkhs).expect("condition");

    let note = note_under(party.lock_root(), 1, 50_000);
    verify_lock(&note, &party.condition).expect("original order matches");

    let err = verify_lock(&note, &reordered).unwrap_err();
    assert_eq!(
        err,
        MultisigError::SpendConditionMismatch { expected: reordered.lock_root(), actual: party.lock_root() }
    );

    // the builder refuses before recording anything
    let mut builder = TxBuilder::new(FeePolicy::default());
    let err = builder.add_spend(note, reordered.clone(), reordered).unwrap_err();
    assert!(matches!(err, MultisigError::SpendConditionMismatch { .. }));
    assert_eq!(builder.spend_count(), 0);

    println!("✅ Mismatched condition caught before any network call");
}
