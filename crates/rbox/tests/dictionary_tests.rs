//! Integration tests for the key/value dictionary
//!
//! These run the dictionary against the in-memory cluster through the
//! public API only.

use std::sync::{Arc, mpsc};
use std::thread;

use rbox::dict::{CommitOutcome, DictSettings, IterateFlags, RadosDictionary};
use rbox::host::{self, DICT_COMMIT_RET_NOTFOUND};
use rbox::{DictError, MemoryCluster, SqliteCluster, StorageSettings};
use tempfile::tempdir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open(cluster: &MemoryCluster, username: &str) -> RadosDictionary {
    RadosDictionary::init(
        "oid=metadata:config=:pool=librmb",
        &DictSettings {
            username: username.to_string(),
        },
        Arc::new(cluster.clone()),
    )
    .unwrap()
}

#[test]
fn test_open_from_settings() {
    let cluster = MemoryCluster::with_pools(&["dict"]);
    let settings = StorageSettings {
        config_path: "/nonexistent/ceph.conf".into(),
        dict_pool: "dict".to_string(),
        dict_oid: "users".to_string(),
        ..StorageSettings::default()
    };
    let dict = RadosDictionary::from_settings(&settings, "alice", Arc::new(cluster.clone())).unwrap();
    let mut tx = dict.transaction_begin();
    tx.set("shared/motd", "hello");
    tx.commit().unwrap();

    let same = RadosDictionary::init(
        "oid=users:config=:pool=dict",
        &DictSettings {
            username: "bob".to_string(),
        },
        Arc::new(cluster.clone()),
    )
    .unwrap();
    assert_eq!(same.lookup("shared/motd").unwrap().as_deref(), Some("hello"));

    let other = RadosDictionary::init(
        "oid=metadata:config=:pool=dict",
        &DictSettings {
            username: "bob".to_string(),
        },
        Arc::new(cluster.clone()),
    )
    .unwrap();
    assert_eq!(other.lookup("shared/motd").unwrap(), None);

    let missing = StorageSettings {
        dict_pool: "librmb".to_string(),
        ..settings
    };
    assert!(RadosDictionary::from_settings(&missing, "alice", Arc::new(cluster)).is_err());
}

#[test]
fn test_set_lookup_unset_roundtrip() {
    init_logging();
    let cluster = MemoryCluster::with_pools(&["librmb"]);
    let dict = open(&cluster, "alice");

    for key in ["priv/a", "shared/b", "priv/"] {
        assert_eq!(dict.lookup(key).unwrap(), None);

        let mut tx = dict.transaction_begin();
        tx.set(key, "value");
        assert_eq!(tx.commit().unwrap(), CommitOutcome::Ok);
        assert_eq!(dict.lookup(key).unwrap(), Some("value".to_string()));

        let mut tx = dict.transaction_begin();
        tx.unset(key);
        tx.commit().unwrap();
        assert_eq!(dict.lookup(key).unwrap(), None);
    }
}

#[test]
fn test_empty_value_is_not_absent() {
    let cluster = MemoryCluster::with_pools(&["librmb"]);
    let dict = open(&cluster, "alice");

    let mut tx = dict.transaction_begin();
    tx.set("priv/empty", "");
    tx.commit().unwrap();
    assert_eq!(dict.lookup("priv/empty").unwrap(), Some(String::new()));
}

#[test]
fn test_sequential_increments_accumulate() {
    let cluster = MemoryCluster::with_pools(&["librmb"]);
    let dict = open(&cluster, "alice");

    let mut tx = dict.transaction_begin();
    tx.set("priv/quota/messages", "10");
    tx.commit().unwrap();

    for delta in [5, -3] {
        let mut tx = dict.transaction_begin();
        tx.atomic_inc("priv/quota/messages", delta);
        assert_eq!(tx.commit().unwrap(), CommitOutcome::Ok);
    }
    assert_eq!(
        dict.lookup("priv/quota/messages").unwrap(),
        Some("12".to_string())
    );
}

#[test]
fn test_concurrent_increments_are_not_lost() {
    init_logging();
    let cluster = MemoryCluster::with_pools(&["librmb"]);
    {
        let dict = open(&cluster, "alice");
        let mut tx = dict.transaction_begin();
        tx.set("priv/counter", "0");
        tx.commit().unwrap();
    }

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let cluster = cluster.clone();
            thread::spawn(move || {
                let dict = open(&cluster, "alice");
                for _ in 0..25 {
                    let mut tx = dict.transaction_begin();
                    tx.atomic_inc("priv/counter", 1);
                    tx.commit().unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let dict = open(&cluster, "alice");
    assert_eq!(dict.lookup("priv/counter").unwrap(), Some("100".to_string()));
}

#[test]
fn test_increment_of_missing_key_keeps_other_mutations() {
    let cluster = MemoryCluster::with_pools(&["librmb"]);
    let dict = open(&cluster, "alice");

    let mut tx = dict.transaction_begin();
    tx.set("priv/a", "1");
    tx.atomic_inc("priv/missing", 1);
    let result = tx.commit();

    assert!(matches!(result, Ok(CommitOutcome::NotFound)));
    assert_eq!(host::commit_status(&result).code, DICT_COMMIT_RET_NOTFOUND);
    assert_eq!(dict.lookup("priv/a").unwrap(), Some("1".to_string()));
    assert_eq!(dict.lookup("priv/missing").unwrap(), None);
}

#[test]
fn test_commit_async_matches_sync_outcome() {
    let cluster = MemoryCluster::with_pools(&["librmb"]);
    let dict = open(&cluster, "alice");

    let (sender, receiver) = mpsc::channel();
    let mut tx = dict.transaction_begin();
    tx.set("priv/a", "1");
    tx.set("shared/b", "2");
    tx.atomic_inc("shared/nope", 1);
    tx.commit_async(Box::new(move |result| {
        sender.send(result).unwrap();
    }));

    dict.wait_for_completions();
    let outcome = receiver.recv().unwrap().unwrap();
    assert_eq!(outcome, CommitOutcome::NotFound);
    assert!(receiver.try_recv().is_err());
    assert_eq!(dict.lookup("shared/b").unwrap(), Some("2".to_string()));
}

#[test]
fn test_iterate_filter_yields_existing_keys_once() {
    let cluster = MemoryCluster::with_pools(&["librmb"]);
    let dict = open(&cluster, "alice");

    let mut tx = dict.transaction_begin();
    tx.set("a", "value_a");
    tx.commit().unwrap();

    let mut iter = dict.iterate(&["a", "b"], IterateFlags::empty()).unwrap();
    assert_eq!(iter.next(), Some(("a".to_string(), "value_a".to_string())));
    assert_eq!(iter.next(), None);
    assert_eq!(iter.next(), None);
}

#[test]
fn test_iterate_rejects_unsupported_flags() {
    let cluster = MemoryCluster::with_pools(&["librmb"]);
    let dict = open(&cluster, "alice");
    assert!(matches!(
        dict.iterate(&["a"], IterateFlags::SORT_BY_VALUE),
        Err(DictError::UnsupportedFlag("SORT_BY_VALUE"))
    ));
}

#[test]
fn test_shared_keys_are_visible_to_other_users() {
    let cluster = MemoryCluster::with_pools(&["librmb"]);
    let alice = open(&cluster, "alice");
    let bob = open(&cluster, "bob");

    let mut tx = alice.transaction_begin();
    tx.set("shared/motd", "hello");
    tx.set("priv/secret", "alice only");
    tx.commit().unwrap();

    assert_eq!(bob.lookup("shared/motd").unwrap(), Some("hello".to_string()));
    assert_eq!(bob.lookup("priv/secret").unwrap(), None);
}

#[test]
fn test_separator_in_username_does_not_collide() {
    let cluster = MemoryCluster::with_pools(&["librmb"]);
    let slash = open(&cluster, "a/b");
    let escaped = open(&cluster, "a\\-b");

    let mut tx = slash.transaction_begin();
    tx.set("priv/k", "slash");
    tx.commit().unwrap();

    assert_eq!(slash.lookup("priv/k").unwrap(), Some("slash".to_string()));
    assert_eq!(escaped.lookup("priv/k").unwrap(), None);
}

#[test]
fn test_sqlite_cluster_persists_dictionary() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("cluster.db");
    let settings = DictSettings {
        username: "alice".to_string(),
    };

    {
        let cluster = SqliteCluster::open(&db_path).unwrap();
        cluster.ensure_pool("librmb").unwrap();
        let dict = RadosDictionary::init("config=", &settings, Arc::new(cluster)).unwrap();
        let mut tx = dict.transaction_begin();
        tx.set("priv/a", "1");
        tx.atomic_inc("priv/a", 41);
        tx.commit().unwrap();
        dict.deinit().unwrap();
    }

    let cluster = SqliteCluster::open(&db_path).unwrap();
    let dict = RadosDictionary::init("config=", &settings, Arc::new(cluster)).unwrap();
    assert_eq!(dict.lookup("priv/a").unwrap(), Some("42".to_string()));
}
