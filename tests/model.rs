//! Model test: random operation sequences against a `BTreeMap` oracle.

use std::collections::BTreeMap;

use proptest::prelude::*;

use dasdb::MmapFile;

#[derive(Clone, Debug)]
enum Op {
    Insert(u64, u64),
    Replace(u64, u64),
    Remove(u64),
    TxnBatch(Vec<(u64, Option<u64>)>),
}

fn op() -> impl Strategy<Value = Op> {
    let key = 0u64..64;
    let value = 0u64..1_000_000;
    prop_oneof![
        (key.clone(), value.clone()).prop_map(|(k, v)| Op::Insert(k, v)),
        (key.clone(), value.clone()).prop_map(|(k, v)| Op::Replace(k, v)),
        key.clone().prop_map(Op::Remove),
        proptest::collection::vec(
            (0u64..64, proptest::option::of(0u64..1_000_000)),
            1..8
        )
        .prop_map(Op::TxnBatch),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn matches_btreemap(ops in proptest::collection::vec(op(), 1..40)) {
        let file = MmapFile::anonymous(1 << 20).unwrap();
        file.allocate_map(0, "model").unwrap();
        let map = file.map::<u64, u64>(0);

        let mut model: BTreeMap<u64, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    let (_, inserted) = map.insert(&k, v).unwrap();
                    let expected = !model.contains_key(&k);
                    prop_assert_eq!(inserted, expected);
                    model.entry(k).or_insert(v);
                }
                Op::Replace(k, v) => {
                    let (_, old) = map.replace(&k, v).unwrap();
                    prop_assert_eq!(old, model.get(&k).copied());
                    if let Some(slot) = model.get_mut(&k) {
                        *slot = v;
                    }
                }
                Op::Remove(k) => {
                    let removed = map.remove(&k).unwrap();
                    prop_assert_eq!(removed, model.remove(&k).is_some());
                }
                Op::TxnBatch(entries) => {
                    let mut txn = map.transaction();
                    for (k, v) in entries {
                        match v {
                            Some(v) => {
                                if txn.find(&k).is_some() {
                                    txn.replace(&k, v).unwrap();
                                } else {
                                    txn.insert(&k, v).unwrap();
                                }
                                model.insert(k, v);
                            }
                            None => {
                                txn.remove(&k).unwrap();
                                model.remove(&k);
                            }
                        }
                    }
                    txn.commit().unwrap();
                }
            }

            // Full equivalence after every operation.
            prop_assert_eq!(map.size(), model.len() as u64);
            let version = map.current();
            let mut it = version.begin();
            for (k, v) in &model {
                prop_assert!(!it.is_end());
                let (got_k, got_v) = it.entry();
                prop_assert_eq!(got_k, *k);
                prop_assert_eq!(got_v, *v);
                it.next();
            }
            prop_assert!(it.is_end());
        }
    }
}
