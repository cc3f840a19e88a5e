//! Cross-module black-box scenarios (§8): exercised only through the public
//! `Db`/`Tx` surface, the way `commit_log`'s own integration test drives
//! `CommitLog` from outside the crate.

use nutkv::{Db, Error, Options};
use tempfile::tempdir;

#[test]
fn put_get_roundtrips_across_a_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = Db::open(Options::new(dir.path())).unwrap();
        let mut tx = db.begin(true).unwrap();
        tx.put(b"b", b"k", b"v", 0).unwrap();
        tx.commit().unwrap();
    }
    let db = Db::open(Options::new(dir.path())).unwrap();
    let tx = db.begin(false).unwrap();
    assert_eq!(tx.get(b"b", b"k").unwrap(), b"v");
}

#[test]
fn second_open_of_the_same_dir_is_rejected() {
    let dir = tempdir().unwrap();
    let _db = Db::open(Options::new(dir.path())).unwrap();
    assert!(matches!(Db::open(Options::new(dir.path())), Err(Error::AlreadyOpen)));
}

#[test]
fn rollback_discards_staged_writes() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::new(dir.path())).unwrap();
    let mut tx = db.begin(true).unwrap();
    tx.put(b"b", b"k", b"v", 0).unwrap();
    tx.rollback().unwrap();

    let tx = db.begin(false).unwrap();
    assert!(matches!(tx.get(b"b", b"k"), Err(Error::NotFound)));
}

#[test]
fn write_tx_observes_its_own_uncommitted_writes() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::new(dir.path())).unwrap();
    let mut tx = db.begin(true).unwrap();
    tx.put(b"b", b"k", b"v1", 0).unwrap();
    assert_eq!(tx.get(b"b", b"k").unwrap(), b"v1");
    tx.commit().unwrap();
}

#[test]
fn delete_then_get_is_not_found() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::new(dir.path())).unwrap();
    let mut tx = db.begin(true).unwrap();
    tx.put(b"b", b"k", b"v", 0).unwrap();
    tx.commit().unwrap();

    let mut tx = db.begin(true).unwrap();
    tx.delete(b"b", b"k").unwrap();
    tx.commit().unwrap();

    let tx = db.begin(false).unwrap();
    assert!(matches!(tx.get(b"b", b"k"), Err(Error::NotFound)));
}

#[test]
fn ttl_expiry_is_observed_on_read() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::new(dir.path())).unwrap();
    let mut tx = db.begin(true).unwrap();
    tx.put(b"b", b"k", b"v", 1).unwrap();
    tx.commit().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(1100));
    let tx = db.begin(false).unwrap();
    assert!(matches!(tx.get(b"b", b"k"), Err(Error::Expired)));
}

#[test]
fn range_and_prefix_scans_are_ordered() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::new(dir.path())).unwrap();
    let mut tx = db.begin(true).unwrap();
    for k in ["a", "ab", "b", "c"] {
        tx.put(b"bkt", k.as_bytes(), b"v", 0).unwrap();
    }
    tx.commit().unwrap();

    let tx = db.begin(false).unwrap();
    let got = tx.prefix_scan(b"bkt", b"a", 10).unwrap();
    assert_eq!(got.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(), vec![b"a".to_vec(), b"ab".to_vec()]);

    let got = tx.range_scan(b"bkt", b"ab", b"b").unwrap();
    assert_eq!(got.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(), vec![b"ab".to_vec(), b"b".to_vec()]);
}

#[test]
fn list_set_zset_survive_a_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = Db::open(Options::new(dir.path())).unwrap();
        let mut tx = db.begin(true).unwrap();
        tx.rpush(b"b", b"mylist", b"a").unwrap();
        tx.rpush(b"b", b"mylist", b"b").unwrap();
        tx.sadd(b"b", b"myset", b"x").unwrap();
        tx.zadd(b"z", b"m1", 1.5, b"v").unwrap();
        tx.commit().unwrap();
    }
    let db = Db::open(Options::new(dir.path())).unwrap();
    let tx = db.begin(false).unwrap();
    assert_eq!(tx.lrange(b"b", b"mylist", 0, -1).unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
    assert!(tx.sismember(b"b", b"myset", b"x").unwrap());
    assert_eq!(tx.zscore(b"z", b"m1").unwrap(), 1.5);
}

#[test]
fn merge_keeps_data_readable() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::new(dir.path())).unwrap();
    for i in 0..50u32 {
        let mut tx = db.begin(true).unwrap();
        tx.put(b"b", format!("k{}", i).as_bytes(), b"v", 0).unwrap();
        tx.commit().unwrap();
    }
    db.merge().unwrap();
    let tx = db.begin(false).unwrap();
    assert_eq!(tx.get(b"b", b"k7").unwrap(), b"v");
    assert_eq!(tx.get(b"b", b"k49").unwrap(), b"v");
}

#[test]
fn backup_copies_segments_to_a_fresh_directory() {
    let src = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let db = Db::open(Options::new(src.path())).unwrap();
    let mut tx = db.begin(true).unwrap();
    tx.put(b"b", b"k", b"v", 0).unwrap();
    tx.commit().unwrap();
    db.backup(dest.path()).unwrap();
    assert!(std::fs::read_dir(dest.path()).unwrap().count() >= 1);
}

#[test]
fn zadd_ranges_members_by_score_with_member_key_as_tiebreak() {
    let dir = tempdir().unwrap();
    let db = Db::open(Options::new(dir.path())).unwrap();
    let mut tx = db.begin(true).unwrap();
    tx.zadd(b"z", b"k1", 70.0, b"v1").unwrap();
    tx.zadd(b"z", b"k2", 90.0, b"v2").unwrap();
    tx.zadd(b"z", b"k3", 86.0, b"v3").unwrap();
    tx.commit().unwrap();

    let tx = db.begin(false).unwrap();
    let got = tx.zrange_by_score(b"z", 80.0, 100.0, Default::default()).unwrap();
    assert_eq!(
        got.into_iter().map(|(m, s, _)| (m, s)).collect::<Vec<_>>(),
        vec![(b"k3".to_vec(), 86.0), (b"k2".to_vec(), 90.0)]
    );
}
