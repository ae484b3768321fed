//! Rebuilding leaves from a base image plus deltas.

mod common;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use oxievict::btree::{page_in, replay_deltas, ReadFlags, RefState, TreeConfig};
use oxievict::device::{MemPageStore, PageStore};
use oxievict::evict::{EvictCaller, EvictionConfig};
use oxievict::page::{DeltaEntry, DeltaOp, DeltaRecord, RowEntry, Update};
use oxievict::txn::TXN_NONE;

use common::{engine, fill_leaves, tree_with_leaves};

const KEYS: u8 = 32;

fn random_op(rng: &mut StdRng) -> (DeltaOp, Option<Vec<u8>>) {
    match rng.gen_range(0..3) {
        0 => (DeltaOp::Delete { txn: TXN_NONE, ts: 0 }, None),
        1 => {
            let value = vec![rng.gen(); rng.gen_range(1..8)];
            (
                DeltaOp::Insert {
                    value: value.clone(),
                    start_txn: TXN_NONE,
                    start_ts: 0,
                    stop: None,
                },
                Some(value),
            )
        }
        _ => (
            DeltaOp::Insert {
                value: vec![rng.gen(); 4],
                start_txn: TXN_NONE,
                start_ts: 0,
                stop: Some((TXN_NONE, 0)),
            },
            None,
        ),
    }
}

#[test]
fn test_replay_matches_model() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let keys: Vec<Vec<u8>> = (0..KEYS).map(|k| vec![k]).collect();

    for _ in 0..200 {
        let mut rows = BTreeMap::new();
        let mut model: HashMap<Vec<u8>, Option<Vec<u8>>> = HashMap::new();
        for key in keys.iter().filter(|_| rng.gen_bool(0.5)) {
            let value = vec![key[0]; 3];
            rows.insert(key.clone(), RowEntry::from_base(value.clone()));
            model.insert(key.clone(), Some(value));
        }

        // Each delta changes a distinct set of keys; later deltas win.
        let mut deltas = Vec::new();
        for _ in 0..rng.gen_range(0..6) {
            let count = rng.gen_range(1..=KEYS as usize);
            let mut entries = Vec::new();
            let chosen: Vec<Vec<u8>> = keys.choose_multiple(&mut rng, count).cloned().collect();
            for key in chosen {
                let (op, value) = random_op(&mut rng);
                model.insert(key.clone(), value);
                entries.push(DeltaEntry { key, op });
            }
            deltas.push(DeltaRecord { entries });
        }

        let touched: HashSet<_> = deltas
            .iter()
            .flat_map(|d| d.entries.iter().map(|e| e.key.clone()))
            .collect();
        assert_eq!(replay_deltas(&mut rows, &deltas), touched.len());

        for key in &keys {
            let expected = model.get(key).cloned().flatten();
            let actual = rows.get(key).and_then(|row| row.newest_value().map(<[u8]>::to_vec));
            assert_eq!(actual, expected, "key {key:?}");
        }
    }
}

#[test]
fn test_replay_skips_keys_restored_by_newer_delta() {
    let mut rows = BTreeMap::new();
    rows.insert(b"k".to_vec(), RowEntry::from_base(b"base".to_vec()));
    let insert = |value: &[u8]| DeltaEntry {
        key: b"k".to_vec(),
        op: DeltaOp::Insert {
            value: value.to_vec(),
            start_txn: TXN_NONE,
            start_ts: 0,
            stop: None,
        },
    };
    let deltas = vec![
        DeltaRecord {
            entries: vec![insert(b"old")],
        },
        DeltaRecord {
            entries: vec![insert(b"new")],
        },
    ];
    assert_eq!(replay_deltas(&mut rows, &deltas), 1);
    let row = &rows[b"k".as_slice()];
    assert_eq!(row.updates.len(), 1);
    assert!(row.has_restored());
    assert_eq!(row.newest_value(), Some(b"new".as_slice()));
}

#[test]
fn test_evicted_changes_are_written_as_deltas() {
    let (engine, _txn) = engine(EvictionConfig::default());
    let store = Arc::new(MemPageStore::new());
    let tree = tree_with_leaves(1, 1, store.clone(), TreeConfig::default());
    engine.add_tree(Arc::clone(&tree));
    fill_leaves(&engine, &tree, 10, 8);

    let leaf = tree.leaf_for(b"").unwrap();
    assert_eq!(engine.evict_tree(&tree, false), Ok(1));
    assert_eq!(leaf.state(), RefState::Disk);
    let addr = leaf.addr().unwrap();
    assert_eq!(store.delta_count(addr), 0);

    let caller = EvictCaller::idle();
    for round in 1..=3u8 {
        let handle = page_in(&engine, &tree, &leaf, ReadFlags::NO_SPLIT, &caller).unwrap();
        let upd = Update::standard(TXN_NONE, 0, vec![100 + round; 8]);
        let size = upd.memory_size();
        let change = handle.apply_update(&[0, round], upd);
        engine.cache().page_modified(tree.bytes(), change, size);
        let upd = Update::tombstone(TXN_NONE, 0);
        let size = upd.memory_size();
        let change = handle.apply_update(&[0, 9], upd);
        engine.cache().page_modified(tree.bytes(), change, size);
        drop(handle);

        assert_eq!(engine.evict_tree(&tree, false), Ok(1));
        assert_eq!(leaf.addr(), Some(addr));
        assert_eq!(store.delta_count(addr), round as usize);
    }

    let handle = page_in(&engine, &tree, &leaf, ReadFlags::NO_SPLIT, &caller).unwrap();
    assert!(!handle.is_dirty());
    assert_eq!(handle.get(&[0, 0]), Some(vec![0; 8]));
    for round in 1..=3u8 {
        assert_eq!(handle.get(&[0, round]), Some(vec![100 + round; 8]));
    }
    assert_eq!(handle.get(&[0, 4]), Some(vec![4; 8]));
    assert_eq!(handle.get(&[0, 9]), None);
    assert_eq!(store.read_multi(addr).unwrap().len(), 4);
}
