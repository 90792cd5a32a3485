//! Reopen-and-recover coverage: both trees must come back from a pool
//! file through their durable anchors alone.

use duotree::{FixTree, PmPool, Record, WoTree};
use tempfile::tempdir;

const FIX_ROOT: usize = 0;
const WO_ROOT: usize = 1;

#[test]
fn fixtree_survives_pool_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("recovery.pool");

    {
        let pool = PmPool::create(&path, 64 << 20).unwrap();
        let records: Vec<Record> = (1..=500).map(|k| Record::new(k * 2, k * 20)).collect();
        let tree = FixTree::build(&pool, &records).unwrap();
        pool.set_root(FIX_ROOT, tree.entrance());
        pool.sync().unwrap();
    }

    let pool = PmPool::open(&path).unwrap();
    let mut tree = FixTree::recover(&pool, pool.root(FIX_ROOT)).unwrap();

    assert_eq!(tree.leaf_cnt(), 63); // ceil(500 / 8)
    assert_eq!(tree.height(), 2);

    for k in 1..=500u64 {
        let rec = tree.find_lower_record(k * 2);
        assert_eq!(rec.key, k * 2);
        assert_eq!(rec.val, k * 20);
    }
    assert_eq!(tree.find_lower_record(1).key, 2);
    assert_eq!(tree.find_lower_record(5000).key, 1000);

    // the recovered tree keeps absorbing bounded inserts
    assert!(tree.insert(3, 33));
    assert_eq!(tree.find_lower_record(3).key, 3);
}

#[test]
fn fixtree_recover_rejects_null_entrance() {
    let dir = tempdir().unwrap();
    let pool = PmPool::create(dir.path().join("empty.pool"), 1 << 20).unwrap();

    let result = FixTree::recover(&pool, pool.root(FIX_ROOT));
    assert!(result.is_err());
}

#[test]
fn wotree_survives_pool_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("wo-recovery.pool");

    {
        let pool = PmPool::create(&path, 64 << 20).unwrap();
        let mut tree = WoTree::create(&pool, pool.root_cell(WO_ROOT)).unwrap();
        for k in 1..=100u64 {
            tree.insert(k, k * 3, 8).unwrap();
        }
        pool.sync().unwrap();
    }

    let pool = PmPool::open(&path).unwrap();
    let mut tree = WoTree::attach(&pool, pool.root_cell(WO_ROOT)).unwrap();

    for k in 1..=100u64 {
        assert_eq!(tree.find(k), Some(k * 3), "key {}", k);
    }
    assert_eq!(tree.find(101), None);

    // and keeps mutating
    tree.insert(101, 303, 8).unwrap();
    assert!(tree.update(1, 999));
    assert_eq!(tree.find(101), Some(303));
    assert_eq!(tree.find(1), Some(999));
}

#[test]
fn both_trees_share_one_pool() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.pool");

    {
        let pool = PmPool::create(&path, 64 << 20).unwrap();
        let records: Vec<Record> = (1..=64).map(|k| Record::new(k, k)).collect();
        let fix = FixTree::build(&pool, &records).unwrap();
        pool.set_root(FIX_ROOT, fix.entrance());

        let mut wo = WoTree::create(&pool, pool.root_cell(WO_ROOT)).unwrap();
        for k in 1000..=1040u64 {
            wo.insert(k, k, 8).unwrap();
        }
        pool.sync().unwrap();
    }

    let pool = PmPool::open(&path).unwrap();
    let fix = FixTree::recover(&pool, pool.root(FIX_ROOT)).unwrap();
    let wo = WoTree::attach(&pool, pool.root_cell(WO_ROOT)).unwrap();

    assert_eq!(fix.find_lower_record(32).key, 32);
    assert_eq!(wo.find(1024), Some(1024));
}
