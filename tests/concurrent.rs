//! Multi-threaded stress tests exercising the map under real contention.

use std::sync::Arc;
use std::thread;

use stripemap::StripedHashMap;

#[test]
fn spam_insert() {
    let m = Arc::new(StripedHashMap::new());
    let mut joins = Vec::new();

    for t in 0..10 {
        let m = m.clone();
        joins.push(thread::spawn(move || {
            for i in t * 1000..(t + 1) * 1000 {
                assert!(m.insert(i, !i).is_none());
                assert_eq!(m.insert(i, i).unwrap(), !i);
            }
        }));
    }
    for j in joins.drain(..) {
        j.join().unwrap();
    }

    for t in 0..5 {
        let m = m.clone();
        joins.push(thread::spawn(move || {
            for i in t * 2000..(t + 1) * 2000 {
                assert_eq!(m.get(&i), Some(i));
            }
        }));
    }
    for j in joins {
        j.join().unwrap();
    }

    assert_eq!(m.len(), 10_000);
}

#[test]
fn spam_insert_if_absent() {
    let m = Arc::new(StripedHashMap::new());
    let mut joins = Vec::new();

    // Every thread races to be the one that wins `insert_if_absent` for
    // each key; exactly one write per key should ever take effect.
    for _ in 0..8 {
        let m = m.clone();
        joins.push(thread::spawn(move || {
            for i in 0..500 {
                m.insert_if_absent(i, i);
            }
        }));
    }
    for j in joins {
        j.join().unwrap();
    }

    assert_eq!(m.len(), 500);
    for i in 0..500 {
        assert_eq!(m.get(&i), Some(i));
    }
}

#[test]
fn spam_remove_while_reading() {
    let m = Arc::new(StripedHashMap::new());
    for i in 0..1000 {
        m.insert(i, i);
    }

    let writer = {
        let m = m.clone();
        thread::spawn(move || {
            for _ in 0..50 {
                for i in 0..1000 {
                    m.remove(&i);
                    m.insert(i, i);
                }
            }
        })
    };

    let reader = {
        let m = m.clone();
        thread::spawn(move || {
            for _ in 0..200_000 {
                // A concurrent writer may have removed this key; the reader
                // must never panic or hang, only ever see a value or None.
                let _ = m.get(&500);
            }
        })
    };

    writer.join().unwrap();
    reader.join().unwrap();
    assert_eq!(m.len(), 1000);
}

#[test]
fn spam_triggers_many_rehashes() {
    let m = Arc::new(
        StripedHashMap::builder()
            .initial_capacity(4)
            .concurrency_level(4)
            .build::<usize, usize>()
            .unwrap(),
    );
    let mut joins = Vec::new();
    for t in 0..16 {
        let m = m.clone();
        joins.push(thread::spawn(move || {
            for i in (t * 2000)..((t + 1) * 2000) {
                m.insert(i, i * 2);
            }
        }));
    }
    for j in joins {
        j.join().unwrap();
    }

    assert_eq!(m.len(), 32_000);
    for i in 0..32_000 {
        assert_eq!(m.get(&i), Some(i * 2));
    }
}

#[test]
fn iteration_is_weakly_consistent_under_concurrent_removal() {
    let m = Arc::new(StripedHashMap::new());
    for i in 0..1000 {
        m.insert(i, i);
    }

    let remover = {
        let m = m.clone();
        thread::spawn(move || {
            for i in (0..1000).step_by(2) {
                m.remove(&i);
            }
        })
    };

    // The cursor must never duplicate a key and must never panic even as
    // entries vanish underneath it.
    let mut seen = std::collections::HashSet::new();
    for key in m.keys() {
        assert!(seen.insert(*key), "cursor yielded a duplicate key");
    }

    remover.join().unwrap();
    assert!(seen.len() <= 1000);
}
