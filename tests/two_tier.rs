//! The two-layer lifecycle the index is built for: the fixed tree
//! serves reads and absorbs what it can, overflow goes to the
//! write-optimized tree, and a merge rebuilds the fixed tree from both.

use duotree::{FixTree, InsertOutcome, PmPool, Record, WoTree};
use tempfile::tempdir;

#[test]
fn overflow_escalates_to_write_layer_and_merges_back() {
    let dir = tempdir().unwrap();
    let pool = PmPool::create(dir.path().join("tier.pool"), 256 << 20).unwrap();

    // read layer over the even keys
    let records: Vec<Record> = (1..=400u64).map(|k| Record::new(k * 2, k * 2)).collect();
    let mut fix = FixTree::build(&pool, &records).unwrap();
    pool.set_root(0, fix.entrance());

    let mut wo = WoTree::create(&pool, pool.root_cell(1)).unwrap();

    // the outer system keeps its own sorted journal of what went to
    // the write layer (the write tree has no range scan)
    let mut journal: Vec<Record> = Vec::new();

    // odd keys arrive live: the fixed tree takes them while its leaves
    // have room, the rest goes to the write layer
    let mut rejected = 0u32;
    for k in (1..=801u64).step_by(2) {
        if fix.insert(k, k) {
            continue;
        }
        rejected += 1;
        match wo.insert(k, k, 8).unwrap() {
            InsertOutcome::Done => {}
            InsertOutcome::Escalate { .. } => unreachable!("threshold 8 is never reached here"),
        }
        journal.push(Record::new(k, k));
    }
    assert!(rejected > 0, "some leaves must fill up");

    // every key is findable in one of the two layers
    for k in 1..=801u64 {
        let in_fix = fix.find_lower_record(k).key == k;
        let in_wo = wo.find(k).is_some();
        assert!(in_fix || in_wo, "key {} lost", k);
    }

    // merge the journal with the fixed tree's live records and rebuild
    let mut merged = Vec::new();
    fix.merge_into(&journal, &mut merged);
    assert_eq!(merged.len(), 801);
    assert!(merged.windows(2).all(|w| w[0].key < w[1].key));

    let rebuilt = FixTree::build(&pool, &merged).unwrap();
    pool.set_root(0, rebuilt.entrance());
    fix.free();

    for k in 1..=801u64 {
        let rec = rebuilt.find_lower_record(k);
        assert_eq!(rec.key, k, "key {} after rebuild", k);
        assert_eq!(rec.val, k);
    }
}

#[test]
fn incoming_records_replace_stale_read_layer_values() {
    let dir = tempdir().unwrap();
    let pool = PmPool::create(dir.path().join("replace.pool"), 64 << 20).unwrap();

    let records: Vec<Record> = (1..=100u64).map(|k| Record::new(k, k)).collect();
    let fix = FixTree::build(&pool, &records).unwrap();

    // the write layer carries newer values for some existing keys
    let journal: Vec<Record> = (1..=100u64)
        .step_by(10)
        .map(|k| Record::new(k, k + 5000))
        .collect();

    let mut merged = Vec::new();
    fix.merge_into(&journal, &mut merged);
    assert_eq!(merged.len(), 100);

    let rebuilt = FixTree::build(&pool, &merged).unwrap();
    for k in 1..=100u64 {
        let expect = if (k - 1) % 10 == 0 { k + 5000 } else { k };
        assert_eq!(rebuilt.lookup(k), expect, "key {}", k);
    }
}

#[test]
fn escalation_signals_rebuild_time() {
    let dir = tempdir().unwrap();
    let pool = PmPool::create(dir.path().join("escalate.pool"), 64 << 20).unwrap();

    let mut wo = WoTree::create(&pool, pool.root_cell(0)).unwrap();

    // with a height bound of 2 the tree may grow one root above the
    // leaves, and escalates when the internal root itself splits
    let mut escalated = false;
    for k in 1..=2000u64 {
        match wo.insert(k, k, 2).unwrap() {
            InsertOutcome::Done => {}
            InsertOutcome::Escalate {
                split_key,
                split_node,
            } => {
                assert!(split_key > 0);
                assert!(!split_node.is_null());
                escalated = true;
                break;
            }
        }
    }
    assert!(escalated, "a bounded tree must eventually escalate");
}
