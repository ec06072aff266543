//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify:
//! - Merkle proofs verify for every leaf of every tree size
//! - The Merkle root depends on leaf order
//! - Canonical JSON ignores key insertion order
//! - Sealed blocks verify and keep the seal order

mod common;

use proptest::prelude::*;
use seal_ledger::{
    canonical::{canonical_json, sha256_hex},
    merkle::{build_proof, merkle_root, verify_proof},
    sealer::seal_order,
    CommitRequest, LedgerKind,
};
use serde_json::{Map, Value};

/// Strategy for distinct leaf hashes
fn leaves_strategy(max: usize) -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set(any::<u64>(), 1..=max)
        .prop_map(|set| set.into_iter().map(|n| sha256_hex(&n.to_string())).collect())
}

/// Strategy for flat JSON objects as key/value pairs
fn pairs_strategy() -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::btree_map("[a-zA-Z]{1,8}", any::<i64>(), 1..12)
        .prop_map(|m| m.into_iter().collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: every leaf of every tree has a valid proof
    #[test]
    fn prop_proofs_verify_for_every_index(leaves in leaves_strategy(16)) {
        let root = merkle_root(&leaves);
        for idx in 0..leaves.len() {
            let proof = build_proof(&leaves, idx).unwrap();
            prop_assert_eq!(&proof.merkle_root, &root);
            prop_assert_eq!(&proof.leaf_hash, &leaves[idx]);
            prop_assert!(verify_proof(&proof.leaf_hash, &proof.steps, &root));
        }
        prop_assert!(build_proof(&leaves, leaves.len()).is_err());
    }

    /// Property: a proof does not verify another leaf
    #[test]
    fn prop_proof_rejects_foreign_leaf(leaves in leaves_strategy(16), pick in any::<prop::sample::Index>()) {
        prop_assume!(leaves.len() > 1);
        let idx = pick.index(leaves.len());
        let other = (idx + 1) % leaves.len();
        let proof = build_proof(&leaves, idx).unwrap();
        prop_assert!(!verify_proof(&leaves[other], &proof.steps, &proof.merkle_root));
    }

    /// Property: swapping two distinct leaves changes the root
    #[test]
    fn prop_root_is_order_sensitive(leaves in leaves_strategy(16), a in any::<prop::sample::Index>(), b in any::<prop::sample::Index>()) {
        let (i, j) = (a.index(leaves.len()), b.index(leaves.len()));
        prop_assume!(i != j);
        let mut swapped = leaves.clone();
        swapped.swap(i, j);
        prop_assert_ne!(merkle_root(&leaves), merkle_root(&swapped));
    }

    /// Property: canonical JSON does not depend on key insertion order
    #[test]
    fn prop_canonical_json_ignores_key_order(pairs in pairs_strategy()) {
        let forward: Map<String, Value> = pairs
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect();
        let backward: Map<String, Value> = pairs
            .iter()
            .rev()
            .map(|(k, v)| (k.clone(), Value::from(*v)))
            .collect();
        let nested_forward = serde_json::json!({ "outer": Value::Object(forward.clone()), "list": [Value::Object(forward)] });
        let nested_backward = serde_json::json!({ "list": [Value::Object(backward.clone())], "outer": Value::Object(backward) });
        prop_assert_eq!(canonical_json(&nested_forward), canonical_json(&nested_backward));
    }

    /// Property: sealed blocks verify and items follow the seal order
    #[test]
    fn prop_sealed_blocks_verify(
        wallet_secs in prop::collection::vec(0i64..5, 0..12),
        trade_secs in prop::collection::vec(0i64..5, 0..12),
        max_items in 1usize..10,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let h = common::harness();
            for (i, secs) in wallet_secs.iter().enumerate() {
                h.sources.insert(common::wallet(i as i64 + 1, "u1", *secs));
            }
            for (i, secs) in trade_secs.iter().enumerate() {
                h.sources.insert(common::trade(i as i64 + 1, "u1", *secs, "ref-x"));
            }

            let total = wallet_secs.len() + trade_secs.len();
            let request = CommitRequest::new("admin-1", max_items);
            let mut sealed = 0;
            let mut blocks = 0u64;
            loop {
                let outcome = h
                    .ledger
                    .commit_next_block(LedgerKind::Settlement, &request)
                    .await
                    .unwrap();
                if !outcome.summary.committed() {
                    break;
                }
                blocks += 1;
                let view = h
                    .ledger
                    .get_block_by_height(LedgerKind::Settlement, blocks, true)
                    .await
                    .unwrap();
                let items = view.items.unwrap();
                prop_assert!(items.len() <= max_items);
                for pair in items.windows(2) {
                    let key = |i: &seal_ledger::Item| {
                        (i.created_at, i.source.as_str().to_string(), i.source_id)
                    };
                    prop_assert!(key(&pair[0]) < key(&pair[1]));
                }
                sealed += items.len();
            }
            prop_assert_eq!(sealed, total);

            let report = h
                .ledger
                .verify_chain(LedgerKind::Settlement, 5000)
                .await
                .unwrap();
            prop_assert_eq!(report.verified, blocks);
            Ok(())
        })?;
    }
}

#[test]
fn test_seal_order_breaks_ties_by_source_then_id() {
    use seal_ledger::canonical::normalize;
    use seal_ledger::Source;

    let wallet = normalize(Source::WalletTransactions, &common::wallet(2, "u1", 0)).unwrap();
    let trade = normalize(Source::TradeFills, &common::trade(9, "u1", 0, "r")).unwrap();
    let trade_low = normalize(Source::TradeFills, &common::trade(3, "u1", 0, "r")).unwrap();
    let later = normalize(Source::TradeFills, &common::trade(1, "u1", 1, "r")).unwrap();

    let mut items = vec![later, wallet, trade, trade_low];
    items.sort_by(seal_order);
    let order: Vec<(Source, i64)> = items.iter().map(|i| (i.source, i.source_id)).collect();
    assert_eq!(
        order,
        vec![
            (Source::TradeFills, 3),
            (Source::TradeFills, 9),
            (Source::WalletTransactions, 2),
            (Source::TradeFills, 1),
        ]
    );
}
