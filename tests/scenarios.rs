use std::time::Duration;

use btrfs_scope::fragmentation::{compute_stats, BlockGroupRole, BlockMap, BlockMapEntry};
use btrfs_scope::path_resolver::SampleType;
use btrfs_scope::session::{open_store, SampleRecord, Session};

#[test]
fn empty_session_scenario() {
    let tmp = tempfile::tempdir().unwrap();
    let db = open_store(tmp.path()).unwrap();
    let session = Session::open(db, std::path::Path::new("/mnt/empty"), 0).unwrap();

    assert_eq!(session.get_path_stats("/").unwrap().total_samples(), 0);
    assert!(session.get_children("/").unwrap().is_empty());
    assert_eq!(session.sample_count(), 0);
}

#[test]
fn single_sample_scenario() {
    let tmp = tempfile::tempdir().unwrap();
    let db = open_store(tmp.path()).unwrap();
    let session = Session::open(db, std::path::Path::new("/mnt/single"), 1000).unwrap();

    session
        .add_sample_batch(&[SampleRecord {
            path: "/a/b/file".to_string(),
            sample_type: SampleType::Represented,
            duration: Duration::from_millis(1),
        }])
        .unwrap();

    assert_eq!(session.get_path_stats("/a/b/file").unwrap().represented().samples, 1);
    assert_eq!(session.get_path_stats("/a").unwrap().represented().samples, 1);
    assert_eq!(session.get_path_stats("/").unwrap().represented().samples, 1);
}

#[test]
fn shared_path_scenario() {
    let tmp = tempfile::tempdir().unwrap();
    let db = open_store(tmp.path()).unwrap();
    let session = Session::open(db, std::path::Path::new("/mnt/shared"), 1000).unwrap();

    session
        .add_sample_batch(&[SampleRecord {
            path: "/x/orig".to_string(),
            sample_type: SampleType::Shared,
            duration: Duration::from_micros(500),
        }])
        .unwrap();

    assert_eq!(session.get_path_stats("/x/orig").unwrap().by_type[SampleType::Shared.slot()].samples, 1);
    assert_eq!(session.sample_count(), 1);
}

#[test]
fn flush_idempotence_matches_single_final_flush() {
    let tmp1 = tempfile::tempdir().unwrap();
    let db1 = open_store(tmp1.path()).unwrap();
    let incremental = Session::open(db1, std::path::Path::new("/mnt/inc"), 1000).unwrap();

    let tmp2 = tempfile::tempdir().unwrap();
    let db2 = open_store(tmp2.path()).unwrap();
    let batched = Session::open(db2, std::path::Path::new("/mnt/inc"), 1000).unwrap();

    let batches: Vec<Vec<SampleRecord>> = (0..3)
        .map(|i| {
            vec![SampleRecord {
                path: format!("/f{}", i),
                sample_type: SampleType::Represented,
                duration: Duration::from_micros(10),
            }]
        })
        .collect();

    for batch in &batches {
        incremental.add_sample_batch(batch).unwrap();
        incremental.flush().unwrap();
    }

    for batch in &batches {
        batched.add_sample_batch(batch).unwrap();
    }
    batched.flush().unwrap();

    for i in 0..3 {
        let path = format!("/f{}", i);
        assert_eq!(
            incremental.get_path_stats(&path).unwrap().represented().samples,
            batched.get_path_stats(&path).unwrap().represented().samples
        );
    }
}

// Chunk-index sample_position mapping (logical=100,len=10 / logical=200,len=20)
// is covered by the unit tests in src/chunk_index.rs, which have access to
// its private fields to build a fixture without a live ioctl transport.

#[test]
fn block_map_scenario() {
    let map = BlockMap {
        devid: 1,
        device_total_bytes: 1000,
        entries: vec![
            BlockMapEntry::Allocated {
                offset: 0,
                length: 100,
                chunk_offset: 1,
                role: BlockGroupRole::Data,
                used_bytes: 100,
            },
            BlockMapEntry::Free {
                offset: 100,
                length: 200,
            },
            BlockMapEntry::Allocated {
                offset: 300,
                length: 100,
                chunk_offset: 2,
                role: BlockGroupRole::Data,
                used_bytes: 50,
            },
            BlockMapEntry::Free {
                offset: 400,
                length: 600,
            },
        ],
    };

    let total: u64 = map.entries.iter().map(|e| e.length()).sum();
    assert_eq!(total, 1000);

    let stats = compute_stats(&map);
    assert_eq!(stats.allocated_bytes, 200);
    assert_eq!(stats.free_bytes, 800);
}
