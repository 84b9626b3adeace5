//! End-to-end scenarios over file-backed maps.

use std::sync::Arc;

use dasdb::{MmapFile, Permissions};

fn open_db(dir: &tempfile::TempDir) -> MmapFile {
    let path = dir.path().join("data.db");
    dasdb::cleanup(&path).unwrap();
    let file = MmapFile::open_or_create(&path, Permissions::ReadWrite, 1 << 20).unwrap();
    file.allocate_map(0, "test").unwrap();
    file
}

#[test]
fn basic_insert_find_remove() {
    let dir = tempfile::tempdir().unwrap();
    let file = open_db(&dir);
    let map = file.map::<u64, u64>(0);

    file.defer_barrier();
    let baseline = file.bytes_outstanding();

    for i in 0..1000u64 {
        let (_, inserted) = map.insert(&i, i).unwrap();
        assert!(inserted, "insert {i}");
    }
    for i in 0..1000u64 {
        assert_eq!(map.find(&i).unwrap(), Some(i), "find {i}");
    }
    assert_eq!(map.size(), 1000);

    for i in 0..1000u64 {
        assert!(map.remove(&i).unwrap(), "remove {i}");
    }
    assert_eq!(map.size(), 0);

    // Every node the workload allocated has been reclaimed.
    file.defer_barrier();
    assert_eq!(file.bytes_outstanding(), baseline);
}

#[test]
fn reverse_bit_order_insert() {
    let dir = tempfile::tempdir().unwrap();
    let file = open_db(&dir);
    let map = file.map::<u64, u64>(0);

    for i in 0..1000u64 {
        map.insert(&i.reverse_bits(), i).unwrap();
    }
    assert_eq!(map.size(), 1000);

    // Iterating in key order yields each value at its bit-reversed key.
    let version = map.current();
    let mut it = version.begin();
    let mut last_key = None;
    let mut seen = 0;
    while !it.is_end() {
        let (k, v) = it.entry();
        assert_eq!(k, v.reverse_bits());
        if let Some(last) = last_key {
            assert!(k > last, "iteration went backwards");
        }
        last_key = Some(k);
        seen += 1;
        it.next();
    }
    assert_eq!(seen, 1000);
}

#[test]
fn cas_loop_fetch_and_add() {
    let dir = tempfile::tempdir().unwrap();
    let file = open_db(&dir);
    let map = Arc::new(file.map::<u64, u64>(0));
    map.insert(&1, 0).unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let map = map.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..10_000 {
                map.fetch_and_add(&1, 1).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(map.find(&1).unwrap(), Some(80_000));
}

#[test]
fn transactional_merge_disjoint_ranges() {
    for flip in [false, true] {
        let dir = tempfile::tempdir().unwrap();
        let file = open_db(&dir);
        let map = file.map::<String, u64>(0);

        let mut tx1 = map.transaction();
        let mut tx2 = map.transaction();
        for c in 'a'..='m' {
            tx1.insert(&c.to_string(), c as u64).unwrap();
        }
        for c in 'n'..='z' {
            tx2.insert(&c.to_string(), c as u64).unwrap();
        }

        if flip {
            tx2.commit().unwrap();
            tx1.commit().unwrap();
        } else {
            tx1.commit().unwrap();
            tx2.commit().unwrap();
        }

        assert_eq!(map.size(), 26, "flip={flip}");
        for c in 'a'..='z' {
            assert_eq!(
                map.find(&c.to_string()).unwrap(),
                Some(c as u64),
                "flip={flip} key={c}"
            );
        }
    }
}

#[test]
fn transactional_merge_overlapping_replace() {
    // Base {k: 1}. TX1 replaces with 2, TX2 with 3. With the default
    // conflict resolution (source wins) the later committer's value
    // stands, whichever order they land in.
    for (first, second, expect) in [(2u64, 3u64, 3u64), (3, 2, 2)] {
        let dir = tempfile::tempdir().unwrap();
        let file = open_db(&dir);
        let map = file.map::<u64, u64>(0);
        map.insert(&7, 1).unwrap();

        let mut tx1 = map.transaction();
        let mut tx2 = map.transaction();
        tx1.replace(&7, first).unwrap();
        tx2.replace(&7, second).unwrap();

        tx1.commit().unwrap();
        tx2.commit().unwrap();

        assert_eq!(map.find(&7).unwrap(), Some(expect));
    }
}

#[test]
fn transaction_isolation_both_ways() {
    let dir = tempfile::tempdir().unwrap();
    let file = open_db(&dir);
    let map = file.map::<u64, u64>(0);
    map.insert(&1, 1).unwrap();

    let mut txn = map.transaction();
    txn.insert(&2, 2).unwrap();

    // The transaction never observes parent writes made after its fork.
    map.insert(&3, 3).unwrap();
    assert_eq!(txn.find(&3), None);
    assert_eq!(txn.find(&1), Some(1));

    // The parent never observes workspace writes before commit.
    assert_eq!(map.find(&2).unwrap(), None);

    txn.commit().unwrap();
    assert_eq!(map.find(&2).unwrap(), Some(2));
    assert_eq!(map.find(&3).unwrap(), Some(3));
}

#[test]
fn iterators_compare_within_a_version() {
    let dir = tempfile::tempdir().unwrap();
    let file = open_db(&dir);
    let map = file.map::<u64, u64>(0);
    for i in 0..10u64 {
        map.insert(&i, i).unwrap();
    }

    let version = map.current();
    let a = version.lower_bound(&2);
    let b = version.lower_bound(&5);
    assert!(a < b);
    assert!(a == version.get(&2));
    assert_eq!(version.size(), 10);
}

#[test]
fn mixed_writers_and_readers() {
    let dir = tempfile::tempdir().unwrap();
    let file = open_db(&dir);
    let map = Arc::new(file.map::<u64, u64>(0));

    let mut handles = Vec::new();
    for t in 0..4u64 {
        let map = map.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..250u64 {
                map.insert(&(t * 10_000 + i), i).unwrap();
            }
        }));
    }
    // Readers race the writers; all they must see is a consistent version.
    for _ in 0..2 {
        let map = map.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..50 {
                let version = map.current();
                let size = version.size();
                let mut it = version.begin();
                let mut count = 0;
                while !it.is_end() {
                    count += 1;
                    it.next();
                }
                assert_eq!(count, size);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(map.size(), 1000);
}

#[test]
fn blob_values_survive_and_release() {
    let dir = tempfile::tempdir().unwrap();
    let file = open_db(&dir);
    let map = file.map::<String, Vec<u8>>(0);

    file.defer_barrier();
    let baseline = file.bytes_outstanding();

    for i in 0..100u64 {
        map.insert(&format!("key-{i:04}"), vec![i as u8; 300]).unwrap();
    }
    for i in 0..100u64 {
        assert_eq!(
            map.find(&format!("key-{i:04}")).unwrap(),
            Some(vec![i as u8; 300])
        );
    }
    for i in 0..100u64 {
        assert!(map.remove(&format!("key-{i:04}")).unwrap());
    }
    file.defer_barrier();
    assert_eq!(file.bytes_outstanding(), baseline);
}

#[test]
fn large_keys_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let file = open_db(&dir);
    let map = file.map::<Vec<u8>, u64>(0);

    // Keys far beyond the inline fragment width, sharing long prefixes.
    let mut keys = Vec::new();
    for i in 0..64u64 {
        let mut k = vec![0xabu8; 40];
        k.extend_from_slice(&i.to_be_bytes());
        keys.push(k);
    }
    for (i, k) in keys.iter().enumerate() {
        map.insert(k, i as u64).unwrap();
    }
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(map.find(k).unwrap(), Some(i as u64));
    }
    let version = map.current();
    let mut it = version.begin();
    let mut n = 0;
    while !it.is_end() {
        assert_eq!(it.key(), keys[n]);
        n += 1;
        it.next();
    }
    assert_eq!(n, 64);
}
