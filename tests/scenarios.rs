//! End-to-end scenarios from spec.md §8: one test per lettered scenario,
//! exercising the public `Bucket`/`Partition`/`Flusher`/`dcp` surface
//! together rather than any single module in isolation.

use flowkv::collections::{ClusterCollection, ClusterManifest};
use flowkv::config::EngineConfig;
use flowkv::dcp::producer::ActiveStream;
use flowkv::dcp::wire::DcpMessage;
use flowkv::dcp::{BufferLog, PassiveStream};
use flowkv::error::EngineError;
use flowkv::flusher::{FlushOutcome, Flusher};
use flowkv::hash_table::MemoryBudget;
use flowkv::key::StoredKey;
use flowkv::store::memory_store::MemoryStore;
use std::sync::Arc;

fn manifest(revision: u64, separator: &str, names: &[&str]) -> ClusterManifest {
    ClusterManifest {
        revision,
        separator: separator.to_string(),
        collections: names
            .iter()
            .map(|n| ClusterCollection { name: n.to_string() })
            .collect(),
    }
}

fn budget() -> MemoryBudget {
    MemoryBudget {
        max_data_size: usize::MAX,
        mutation_threshold: 0.99,
        replication_threshold: 0.99,
    }
}

// A. Namespace separation.
#[test]
fn namespace_separation_hides_system_keys_from_collections_namespace() {
    let bucket = flowkv::Bucket::new("default", EngineConfig::balanced());
    bucket.activate_all().unwrap();

    let system_key = StoredKey::system(b"$collections::create:meat 1".to_vec());
    bucket.set(0, system_key.clone(), b"value".to_vec(), 0, 0).unwrap();

    bucket.apply_cluster_manifest(&manifest(1, "::", &["$default", "meat"]));

    let store = Arc::new(MemoryStore::new());
    let flusher = Flusher::new(store.clone(), 100);
    assert!(matches!(flusher.flush_one(&bucket, 0), FlushOutcome::Committed { .. }));

    let partition = bucket.partition(0).unwrap();
    assert!(partition.hash_table().evict_value_only(&system_key));

    let sv = bucket.get(0, &system_key).unwrap().unwrap();
    assert!(!sv.is_resident());
    let (_, fetched) = store.get(0, &system_key).unwrap();
    sv.complete_bg_fetch(fetched);
    assert_eq!(sv.value(), Some(b"value".to_vec()));

    let collections_key = StoredKey::collections(b"$collections::create:meat 1".to_vec());
    let via_collections = bucket.get(0, &collections_key).unwrap();
    assert!(via_collections.is_none(), "same bytes under a different namespace must not collide");
}

// B. Collection denies unknown.
#[test]
fn set_to_unknown_collection_is_denied_until_manifest_creates_it() {
    let bucket = flowkv::Bucket::new("default", EngineConfig::balanced());
    bucket.activate_all().unwrap();

    let key = StoredKey::collections(b"meat::beef".to_vec());
    let result = bucket.set(0, key.clone(), b"v".to_vec(), 0, 0);
    assert_eq!(result.unwrap_err(), EngineError::UnknownCollection);

    bucket.apply_cluster_manifest(&manifest(1, "::", &["$default", "meat"]));
    let store = Arc::new(MemoryStore::new());
    let flusher = Flusher::new(store, 100);
    flusher.flush_one(&bucket, 0);

    let stamp = bucket.set(0, key, b"v".to_vec(), 0, 0).unwrap();
    assert!(stamp.cas > 0);
}

// C. Collection delete makes reads deny.
#[test]
fn deleting_a_collection_denies_reads_of_its_still_present_records() {
    let bucket = flowkv::Bucket::new("default", EngineConfig::balanced());
    bucket.activate_all().unwrap();

    bucket.apply_cluster_manifest(&manifest(1, "::", &["$default", "meat"]));
    let key = StoredKey::collections(b"meat::beef".to_vec());
    bucket.set(0, key.clone(), b"v".to_vec(), 0, 0).unwrap();

    let store = Arc::new(MemoryStore::new());
    let flusher = Flusher::new(store, 100);
    flusher.flush_one(&bucket, 0);

    bucket.apply_cluster_manifest(&manifest(2, "::", &["$default"]));
    flusher.flush_one(&bucket, 0);

    let result = bucket.get(0, &key);
    assert_eq!(result.unwrap_err(), EngineError::UnknownCollection);
}

// D. Rollback to middle.
#[test]
fn rollback_to_middle_drops_everything_above_and_keeps_everything_at_or_below() {
    let bucket = flowkv::Bucket::new("default", EngineConfig::balanced());
    bucket.activate_all().unwrap();
    let store = Arc::new(MemoryStore::new());
    let flusher = Flusher::new(store, 100);

    for i in 0..7 {
        bucket
            .set(0, StoredKey::default_collection(format!("item-{i}").into_bytes()), b"v".to_vec(), 0, 0)
            .unwrap();
    }
    flusher.flush_one(&bucket, 0);

    let mut cp2_seqno = 0;
    for i in 1..=3 {
        let stamp = bucket
            .set(0, StoredKey::default_collection(format!("rollback-cp-{i}").into_bytes()), b"v".to_vec(), 0, 0)
            .unwrap();
        if i == 2 {
            cp2_seqno = stamp.by_seqno;
        }
    }
    flusher.flush_one(&bucket, 0);

    for i in 0..3 {
        bucket
            .set(0, StoredKey::default_collection(format!("tail-{i}").into_bytes()), b"v".to_vec(), 0, 0)
            .unwrap();
    }

    let partition = bucket.partition(0).unwrap();
    let stream = PassiveStream::new(partition);
    stream
        .accept_stream(&DcpMessage::AddStreamResp { opaque: 1, status: 1, rollback_seqno: Some(cp2_seqno) })
        .unwrap();

    for i in 0..7 {
        assert!(bucket.get(0, &StoredKey::default_collection(format!("item-{i}").into_bytes())).unwrap().is_some());
    }
    assert!(bucket.get(0, &StoredKey::default_collection(b"rollback-cp-1".to_vec())).unwrap().is_some());
    assert!(bucket.get(0, &StoredKey::default_collection(b"rollback-cp-2".to_vec())).unwrap().is_some());
    assert!(bucket.get(0, &StoredKey::default_collection(b"rollback-cp-3".to_vec())).unwrap().is_none());
    for i in 0..3 {
        assert!(bucket.get(0, &StoredKey::default_collection(format!("tail-{i}").into_bytes())).unwrap().is_none());
    }
}

// E. Rollback-0 retry then accept.
#[test]
fn first_zero_rollback_retries_second_triggers_real_rollback_to_zero() {
    let bucket = flowkv::Bucket::new("default", EngineConfig::balanced());
    bucket.activate_all().unwrap();
    let store = Arc::new(MemoryStore::new());
    let flusher = Flusher::new(store, 100);

    for i in 0..5 {
        bucket
            .set(0, StoredKey::default_collection(format!("k-{i}").into_bytes()), b"v".to_vec(), 0, 0)
            .unwrap();
    }
    flusher.flush_one(&bucket, 0);

    let partition = bucket.partition(0).unwrap();
    let stream = PassiveStream::new(partition);

    stream
        .accept_stream(&DcpMessage::AddStreamResp { opaque: 1, status: 1, rollback_seqno: Some(0) })
        .unwrap();
    assert_eq!(stream.state(), flowkv::dcp::consumer::PassiveStreamState::Pending);

    stream
        .accept_stream(&DcpMessage::AddStreamResp { opaque: 1, status: 1, rollback_seqno: Some(0) })
        .unwrap();
    assert_eq!(stream.state(), flowkv::dcp::consumer::PassiveStreamState::Active);

    for i in 0..5 {
        assert!(bucket.get(0, &StoredKey::default_collection(format!("k-{i}").into_bytes())).unwrap().is_none());
    }
}

// F. HLC monotonicity under clock regression.
#[test]
fn hlc_stamp_still_advances_after_observing_a_future_peer_cas() {
    let bucket = flowkv::Bucket::new("default", EngineConfig::balanced());
    bucket.activate_all().unwrap();
    let key = StoredKey::default_collection(b"k".to_vec());

    let c1 = bucket.set(0, key.clone(), b"v1".to_vec(), 0, 0).unwrap().cas;

    // Simulate a replica ingest observing a cas far ahead of local wall
    // time, as if the local clock had since regressed relative to it.
    let partition = bucket.partition(0).unwrap();
    partition
        .set_with_meta(
            StoredKey::default_collection(b"other".to_vec()),
            b"v".to_vec(),
            c1 + 1_000_000,
            1,
            0,
            0,
            flowkv::value::Datatype::Raw,
            None,
            &budget(),
        )
        .unwrap();

    let c2 = bucket.set(0, key, b"v2".to_vec(), 0, 0).unwrap().cas;
    assert!(c2 > c1, "cas must still advance monotonically after a future peer observation");
}

// G. MetaEvent is not visible to client but is persisted.
#[test]
fn collection_system_event_is_replicated_and_persisted_but_not_client_readable() {
    let bucket = flowkv::Bucket::new("default", EngineConfig::balanced());
    bucket.activate_all().unwrap();

    bucket.apply_cluster_manifest(&manifest(1, "::", &["$default", "meat"]));
    for i in 0..3 {
        bucket
            .set(0, StoredKey::default_collection(format!("item-{i}").into_bytes()), b"v".to_vec(), 0, 0)
            .unwrap();
    }

    let store = Arc::new(MemoryStore::new());
    let flusher = Flusher::new(store.clone(), 100);
    let outcome = flusher.flush_one(&bucket, 0);
    // 2 collection-create markers ($default, meat) + 3 item mutations.
    assert_eq!(outcome, FlushOutcome::Committed { items: 5 });

    let partition = bucket.partition(0).unwrap();
    let stream = ActiveStream::new(
        partition,
        "backfill-conn",
        store,
        std::time::Duration::from_millis(EngineConfig::balanced().dcp_noop_interval_ms),
        BufferLog::disabled(),
    );
    stream.stream_request(0, 0, 0).unwrap();
    let messages = stream.step(100);
    assert!(messages.iter().any(|m| matches!(m, DcpMessage::SystemEvent { .. })));
    assert_eq!(
        messages.iter().filter(|m| matches!(m, DcpMessage::Mutation { .. })).count(),
        3
    );

    let system_event_key = StoredKey::collections(b"$collections::create:meat".to_vec());
    assert!(bucket.get(0, &system_event_key).unwrap().is_none());
}
