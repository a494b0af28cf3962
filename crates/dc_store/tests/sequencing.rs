//! Sequence allocation under sequential and concurrent writers.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use dc_proto::{Message, MessageStatus};
use dc_store::{Store, ThreadStore};

#[test]
fn sequential_inserts_yield_strictly_increasing_ids() {
    let store = Store::open_in_memory().unwrap();
    let threads = ThreadStore::new(&store);
    let mut last = 0;
    for i in 0..50u8 {
        let mut m = Message::new("alice", "bob", vec![i]);
        let id = threads.add("bob", &mut m).unwrap();
        assert!(id > last);
        last = id;
    }
    assert_eq!(threads.list("bob").unwrap().len(), 50);
}

#[test]
fn concurrent_inserts_never_share_an_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&dir.path().join("store.db")).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let threads = ThreadStore::new(&store);
                (0..25)
                    .map(|i| {
                        let mut m = Message::new(format!("w{worker}"), "bob", vec![i]);
                        threads.add("bob", &mut m).unwrap()
                    })
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id), "duplicate id {id}");
        }
    }
    assert_eq!(seen.len(), 200);
    assert_eq!(seen.iter().copied().max(), Some(200));
}

#[test]
fn data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    {
        let store = Store::open(&path).unwrap();
        let threads = ThreadStore::new(&store);
        let mut m = Message::new("alice", "bob", b"kept".to_vec());
        threads.add("bob", &mut m).unwrap();
        threads.set_status("bob", m.id, MessageStatus::Failed).unwrap();
    }
    let store = Store::open(&path).unwrap();
    let threads = ThreadStore::new(&store);
    assert_eq!(threads.count_failed().unwrap(), 1);
    let mut next = Message::new("alice", "bob", b"next".to_vec());
    assert_eq!(threads.add("bob", &mut next).unwrap(), 2);
}
