//! The redb-backed record store: durability across reopen, compare-and-set
//! commits, and a syncer resuming from a record written by another
//! process lifetime.

mod common;

use common::*;
use std::sync::Arc;
use tempfile::tempdir;
use viewsync::cvr::Cvr;
use viewsync::engine::RowChangeEvent;
use viewsync::error::CvrError;
use viewsync::{CvrStore, RedbCvrStore, ViewSyncer};

#[test]
fn test_commit_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state").join("cvr.redb");

    let mut cvr = Cvr::new("g1");
    {
        let store = RedbCvrStore::open(&path).unwrap();
        store.commit(&cvr, None).unwrap();
        let previous = cvr.version.clone();
        cvr.version = previous.next(Some(7));
        store.commit(&cvr, Some(&previous)).unwrap();
    }

    let store = RedbCvrStore::open(&path).unwrap();
    let loaded = store.load("g1").unwrap().unwrap();
    assert_eq!(loaded, cvr);
    assert_eq!(store.group_ids().unwrap(), vec!["g1".to_string()]);
    assert!(store.load("missing").unwrap().is_none());
}

#[test]
fn test_stale_commit_conflicts() {
    let dir = tempdir().unwrap();
    let store = RedbCvrStore::open(&dir.path().join("cvr.redb")).unwrap();

    let first = Cvr::new("g1");
    store.commit(&first, None).unwrap();

    let mut ours = first.clone();
    ours.version = first.version.next(None);
    let mut theirs = first.clone();
    theirs.version = first.version.next(Some(3));

    store.commit(&theirs, Some(&first.version)).unwrap();
    let err = store.commit(&ours, Some(&first.version)).unwrap_err();
    assert!(matches!(err, CvrError::Conflict { .. }));
    assert!(!err.is_transient());
    assert_eq!(store.load("g1").unwrap().unwrap().version, theirs.version);
}

#[test]
fn test_syncer_resumes_from_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cvr.redb");
    let schema = schema();
    let replica = replica(
        &schema,
        vec![batch(
            4,
            vec![
                RowChangeEvent::insert("issue", issue(1, "crash", true)),
                RowChangeEvent::insert("issue", issue(2, "typo", true)),
            ],
        )],
    );

    let cookie = {
        let store = Arc::new(RedbCvrStore::open(&path).unwrap());
        let mut syncer = ViewSyncer::load("g1", schema.clone(), store).unwrap();
        let mut client = connect(&mut syncer, &replica, "c1", None, vec![put_query("q1", open_issues())]).unwrap();
        assert_eq!(rows_in(&client.parts()).len(), 2);
        syncer.stop();
        syncer.version().to_cookie()
    };

    let store = Arc::new(RedbCvrStore::open(&path).unwrap());
    let mut syncer = ViewSyncer::load("g1", schema, store).unwrap();
    assert_eq!(syncer.version().to_cookie(), cookie);
    assert_eq!(syncer.replica_version(), Some(4));

    let mut client = connect(&mut syncer, &replica, "c1", Some(cookie), vec![]).unwrap();
    assert!(rows_in(&client.parts()).is_empty());
    assert_eq!(syncer.cvr().clients.len(), 1);
}
