// Fragment merging and pre-broadcast validation

mod common;

use common::{recipient, single_spend, Party};
use nockvault::{
    builder::{FeePolicy, TxBuilder},
    merge,
    tx::SignatureEntry,
    validate, MultisigError, SignedFragment,
};

#[tokio::test]
async fn test_merged_id_independent_of_signer_subset() {
    println!("🧪 Testing merged id across signer subsets...");

    let party = Party::new(2, 3);
    let tx = single_spend(&party, party.note(1, 100_000), recipient(1), 30_000);
    let [a, b, c] = [0, 1, 2].map(|i| party.signers[i].sign_tx(tx.raw()));

    let ab = merge(&[a.clone(), b.clone()], 2).expect("merge A+B");
    let ac = merge(&[a.clone(), c.clone()], 2).expect("merge A+C");
    let bc = merge(&[b.clone(), c.clone()], 2).expect("merge B+C");
    let ba = merge(&[b.clone(), a.clone()], 2).expect("merge B+A");

    assert_eq!(ab.id(), ac.id());
    assert_eq!(ab.id(), bc.id());
    assert_eq!(ab.id(), tx.id(), "Signatures never change the id");
    assert_eq!(ab.raw(), ba.raw(), "Fragment order does not matter");

    println!("✅ All subsets produce id {}", ab.id().short());
}

#[tokio::test]
async fn test_surplus_signatures_dropped() {
    let party = Party::new(2, 3);
    let tx = single_spend(&party, party.note(1, 100_000), recipient(1), 30_000);
    let fragments: Vec<SignedFragment> = party.signers.iter().rev().map(|s| s.sign_tx(tx.raw())).collect();

    let merged = merge(&fragments, 2).expect("merge all three");
    let witness = &merged.raw().spends[0].witness;
    assert_eq!(witness.signatures.len(), 2, "Witness keeps exactly threshold signatures");
    assert_eq!(witness.signatures[0].pkh, party.signers[0].pkh(), "Participant order wins");
    assert_eq!(witness.signatures[1].pkh, party.signers[1].pkh());
    assert_eq!(merged.signers().len(), 2);
    assert!(!merged.signers().contains(&party.signers[2].pkh()));

    validate(&merged, tx.notes(), tx.conditions(), FeePolicy::default()).expect("minimal witness validates");
}

#[tokio::test]
async fn test_insufficient_fragments() {
    println!("🧪 Testing merge below threshold...");

    let party = Party::new(2, 3);
    let tx = single_spend(&party, party.note(1, 100_000), recipient(1), 30_000);
    let a = party.signers[0].sign_tx(tx.raw());

    let err = merge(&[a.clone()], 2).unwrap_err();
    assert_eq!(err, MultisigError::InsufficientSignatures { have: 1, need: 2 });

    let err = merge(&[], 1).unwrap_err();
    assert!(matches!(err, MultisigError::InsufficientSignatures { have: 0, .. }));

    // the same signer twice is still one signature
    let err = merge(&[a.clone(), a], 2).unwrap_err();
    assert_eq!(err, MultisigError::InsufficientSignatures { have: 1, need: 2 });

    println!("✅ Below-threshold merges refused");
}

#[tokio::test]
async fn test_mismatched_fragments_refused() {
    println!("🧪 Testing fragments over different content...");

    let party = Party::new(2, 3);
    let note = party.note(1, 100_000);
    let tx_1 = single_spend(&party, note.clone(), recipient(1), 30_000);
    let tx_2 = single_spend(&party, note, recipient(1), 31_000);

    let a = party.signers[0].sign_tx(tx_1.raw());
    let b = party.signers[1].sign_tx(tx_2.raw());
    let err = merge(&[a, b], 2).unwrap_err();
    match err {
        MultisigError::FragmentMismatch { index, expected, actual } => {
            assert_eq!(index, 1);
            assert_eq!(expected, tx_1.id());
            assert_eq!(actual, tx_2.id());
        }
        other => panic!("expected FragmentMismatch, got {other:?}"),
    }

    println!("✅ No silently-wrong merge");
}

#[tokio::test]
async fn test_reported_ids_are_ignored() {
    let party = Party::new(2, 3);
    let tx = single_spend(&party, party.note(1, 100_000), recipient(1), 30_000);
    let a = party.signers[0].sign_tx(tx.raw());
    let mut b = party.signers[1].sign_tx(tx.raw());
    b.tx.id = nockvault::blake3_hash(b"some other tooling's id");

    let merged = merge(&[a, b], 2).expect("merge");
    assert_eq!(merged.id(), tx.id());
    assert_eq!(merged.raw().id, merged.raw().content_id());
}

#[tokio::test]
async fn test_validate_rejects_low_fee() {
    println!("🧪 Testing fee validation...");

    let party = Party::new(2, 3);
    let note = party.note(1, 100_000);
    let mut builder = TxBuilder::new(FeePolicy::default());
    builder.add_spend(note, party.condition.clone(), party.condition.clone()).expect("spend");
    let seed = builder.anchor_seed(recipient(1), 30_000).expect("seed");
    builder.add_seed(seed).expect("add seed");
    builder.finalize_spend().expect("finalize");
    let needed = builder.calc_fee();
    builder.set_fee_and_rebalance(256, false).expect("underpay");
    let tx = builder.build().expect("build");

    let fragments: Vec<SignedFragment> = party.signers[..2].iter().map(|s| s.sign_tx(tx.raw())).collect();
    let merged = merge(&fragments, 2).expect("merge");
    let err = validate(&merged, tx.notes(), tx.conditions(), FeePolicy::default()).unwrap_err();
    assert_eq!(err, MultisigError::InsufficientFee { needed, actual: 256 });

    println!("✅ Underpaying transaction refused before broadcast");
}

#[tokio::test]
async fn test_validate_rejects_bad_signature() {
    let party = Party::new(2, 3);
    let tx = single_spend(&party, party.note(1, 100_000), recipient(1), 30_000);
    let a = party.signers[0].sign_tx(tx.raw());
    let mut b = party.signers[1].sign_tx(tx.raw());
    b.tx.spends[0].witness.signatures[0].signature[10] ^= 0xFF;

    let merged = merge(&[a, b], 2).expect("merge does not verify signatures");
    let err = validate(&merged, tx.notes(), tx.conditions(), FeePolicy::default()).unwrap_err();
    assert_eq!(err, MultisigError::MissingUnlock { spend: 0, have: 1, need: 2 });
}

#[tokio::test]
async fn test_validate_rejects_foreign_condition() {
    let party = Party::new(2, 3);
    let other = Party::new(2, 3);
    let tx = single_spend(&party, party.note(1, 100_000), recipient(1), 30_000);
    let fragments: Vec<SignedFragment> = party.signers[..2].iter().map(|s| s.sign_tx(tx.raw())).collect();
    let merged = merge(&fragments, 2).expect("merge");

    let conditions = vec![other.condition.clone()];
    let err = validate(&merged, tx.notes(), &conditions, FeePolicy::default()).unwrap_err();
    assert!(matches!(err, MultisigError::SpendConditionMismatch { .. }), "{err:?}");

    validate(&merged, tx.notes(), tx.conditions(), FeePolicy::default()).expect("own condition validates");
}

#[tokio::test]
async fn test_fragment_cannot_fill_another_signers_slot() {
    println!("🧪 Testing merge with an entry planted for an absent signer...");

    let party = Party::new(2, 3);
    let tx = single_spend(&party, party.note(1, 100_000), recipient(1), 30_000);
    let (a, b, c) = (&party.signers[0], &party.signers[1], &party.signers[2]);

    let from_b = b.sign_tx(tx.raw());
    let mut from_c = c.sign_tx(tx.raw());
    from_c.tx.spends[0].witness.signatures.insert(
        0,
        SignatureEntry { pkh: a.pkh(), public_key: vec![1; 16], signature: vec![2; 16] },
    );

    for fragments in [[from_b.clone(), from_c.clone()], [from_c.clone(), from_b.clone()]] {
        let merged = merge(&fragments, 2).expect("merge B+C");
        let witness = &merged.raw().spends[0].witness;
        assert_eq!(witness.signatures.len(), 2);
        assert_eq!(witness.signatures[0].pkh, b.pkh());
        assert_eq!(witness.signatures[1].pkh, c.pkh());
        assert!(!merged.signers().contains(&a.pkh()));
        validate(&merged, tx.notes(), tx.conditions(), FeePolicy::default()).expect("B+C validates");
    }

    // a lone fragment cannot reach the threshold by carrying someone else's entry
    let mut from_b_with_c = from_b.clone();
    from_b_with_c.tx.spends[0].witness.signatures.push(from_c.tx.spends[0].witness.signatures[1].clone());
    let from_a_copy = SignedFragment { signer: a.pkh(), tx: from_b_with_c.tx.clone() };
    let err = merge(&[from_b_with_c, from_a_copy], 2).unwrap_err();
    assert_eq!(err, MultisigError::InsufficientSignatures { have: 1, need: 2 });

    println!("✅ Each fragment only speaks for its own signer");
}
