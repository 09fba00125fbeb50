//! The shared session store: one `sled` database hosting every filesystem's
//! sampling session under a `fs:<hash8(fs_path)>:` key prefix (spec §4.6).
//!
//! Key layout within a session:
//! - `m:<field>` — metadata (path, total size, timestamps, sample count,
//!   running time), fixed-size little-endian encodings.
//! - `p:<absolute_path>` — a 96-byte [`PathStats`] blob.
//!
//! The accumulator batches writes in memory and flushes to `sled` on a
//! timer; reads merge the accumulator over the stored value so callers
//! always observe their own just-written samples (read-your-writes).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crc::{Crc, CRC_32_ISCSI};
use log::error;
use parking_lot::{Mutex, RwLock};

use crate::error::EngineError;
use crate::path_resolver::SampleType;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);
const PATH_STATS_SIZE: usize = 96;
const FLUSH_PATH_THRESHOLD: usize = 10_000;
const RECENT_OFFSETS_RING: usize = 3;

pub fn hash8(fs_path: &str) -> String {
    let digest = CRC.checksum(fs_path.as_bytes());
    format!("{:08x}", digest)
}

/// Per-(sample-type) counters for one path, additively mergeable: merging
/// two records sums counts and durations and keeps the most-recent offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TypeCounters {
    pub samples: u64,
    pub duration_nanos: u64,
}

/// 96-byte fixed layout: five [`TypeCounters`] pairs (one per [`SampleType`]
/// slot) plus two f64 distributed-credit fields reserved for fractional
/// attribution of shared extents. The update logic for those two fields is
/// intentionally never invoked; they round-trip unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PathStats {
    pub by_type: [TypeCounters; 5],
    pub distributed_samples: f64,
    pub distributed_duration: f64,
}

impl PathStats {
    pub fn add_sample(&mut self, sample_type: SampleType, duration: Duration) {
        let slot = &mut self.by_type[sample_type.slot()];
        slot.samples += 1;
        slot.duration_nanos += duration.as_nanos() as u64;
    }

    pub fn total_samples(&self) -> u64 {
        self.by_type.iter().map(|c| c.samples).sum()
    }

    pub fn represented(&self) -> TypeCounters {
        self.by_type[SampleType::Represented.slot()]
    }

    pub fn merge(&mut self, other: &PathStats) {
        for i in 0..5 {
            self.by_type[i].samples += other.by_type[i].samples;
            self.by_type[i].duration_nanos += other.by_type[i].duration_nanos;
        }
        if other.total_samples() > 0 {
            self.distributed_samples = other.distributed_samples;
            self.distributed_duration = other.distributed_duration;
        }
    }

    pub fn encode(&self) -> [u8; PATH_STATS_SIZE] {
        let mut buf = [0u8; PATH_STATS_SIZE];
        let mut off = 0;
        for c in &self.by_type {
            buf[off..off + 8].copy_from_slice(&c.samples.to_le_bytes());
            off += 8;
        }
        for c in &self.by_type {
            buf[off..off + 8].copy_from_slice(&c.duration_nanos.to_le_bytes());
            off += 8;
        }
        buf[off..off + 8].copy_from_slice(&self.distributed_samples.to_le_bytes());
        off += 8;
        buf[off..off + 8].copy_from_slice(&self.distributed_duration.to_le_bytes());
        buf
    }

    /// Decodes a stored blob. Tolerates a shorter-but-nonempty legacy blob
    /// by decoding as many fields as fit and zeroing the rest (spec §4.6).
    pub fn decode(bytes: &[u8]) -> PathStats {
        if bytes.is_empty() {
            return PathStats::default();
        }
        let mut stats = PathStats::default();
        let mut off = 0;
        for i in 0..5 {
            if off + 8 > bytes.len() {
                return stats;
            }
            stats.by_type[i].samples = u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
            off += 8;
        }
        for i in 0..5 {
            if off + 8 > bytes.len() {
                return stats;
            }
            stats.by_type[i].duration_nanos =
                u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
            off += 8;
        }
        if off + 8 <= bytes.len() {
            stats.distributed_samples = f64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
            off += 8;
        }
        if off + 8 <= bytes.len() {
            stats.distributed_duration =
                f64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());
        }
        stats
    }
}

/// One sample ready to be folded into the accumulator.
#[derive(Debug, Clone)]
pub struct SampleRecord {
    pub path: String,
    pub sample_type: SampleType,
    pub duration: Duration,
}

/// Ancestor decomposition of `/a/b/c` is `["/", "/a", "/a/b", "/a/b/c"]`
/// (spec §4.6 path-segment contract).
fn ancestors(path: &str) -> Vec<String> {
    if path == "/" || path.is_empty() || path.starts_with('<') {
        return vec!["/".to_string()];
    }
    let trimmed = path.trim_start_matches('/');
    let mut out = vec!["/".to_string()];
    let mut acc = String::new();
    for segment in trimmed.split('/') {
        if segment.is_empty() {
            continue;
        }
        acc.push('/');
        acc.push_str(segment);
        out.push(acc.clone());
    }
    out
}

#[derive(Debug, Default)]
struct Metadata {
    fs_path: String,
    total_size: u64,
    start_time_nanos: u64,
    last_updated_nanos: u64,
    sample_count: u64,
    running_time_nanos: u64,
    run_start: Option<Instant>,
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// One filesystem's isolated view into the shared `sled` store.
pub struct Session {
    db: sled::Db,
    prefix: String,
    accumulator: Mutex<HashMap<String, PathStats>>,
    metadata: RwLock<Metadata>,
}

impl Session {
    pub fn open(db: sled::Db, fs_path: &Path, total_size: u64) -> Result<Self, EngineError> {
        let fs_path_str = fs_path.to_string_lossy().into_owned();
        let prefix = format!("fs:{}:", hash8(&fs_path_str));

        let session = Session {
            db,
            prefix,
            accumulator: Mutex::new(HashMap::new()),
            metadata: RwLock::new(Metadata::default()),
        };

        let stored_path = session.read_meta_string("fs_path")?;
        match stored_path {
            Some(stored) if stored != fs_path_str => {
                return Err(EngineError::SessionMismatch {
                    stored: PathBuf::from(stored),
                    requested: fs_path.to_path_buf(),
                });
            }
            Some(_) => {
                // Resuming: pick up stored counters, but let total_size
                // drift forward if the filesystem has grown (spec §4.5).
                let mut meta = session.metadata.write();
                meta.fs_path = fs_path_str;
                meta.total_size = session.read_meta_u64("total_size")?.unwrap_or(total_size).max(total_size);
                meta.start_time_nanos = session.read_meta_u64("start_time")?.unwrap_or_else(now_nanos);
                meta.sample_count = session.read_meta_u64("sample_count")?.unwrap_or(0);
                meta.running_time_nanos = session.read_meta_u64("running_time")?.unwrap_or(0);
            }
            None => {
                let mut meta = session.metadata.write();
                meta.fs_path = fs_path_str;
                meta.total_size = total_size;
                meta.start_time_nanos = now_nanos();
            }
        }

        session.write_meta_string("fs_path", &session.metadata.read().fs_path)?;
        session.write_meta_u64("total_size", session.metadata.read().total_size)?;
        session.write_meta_u64("start_time", session.metadata.read().start_time_nanos)?;

        Ok(session)
    }

    fn meta_key(&self, field: &str) -> Vec<u8> {
        format!("{}m:{}", self.prefix, field).into_bytes()
    }

    fn path_key(&self, path: &str) -> Vec<u8> {
        format!("{}p:{}", self.prefix, path).into_bytes()
    }

    fn read_meta_u64(&self, field: &str) -> Result<Option<u64>, EngineError> {
        let raw = self
            .db
            .get(self.meta_key(field))
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        Ok(raw.and_then(|v| v.as_ref().try_into().ok()).map(u64::from_le_bytes))
    }

    fn read_meta_string(&self, field: &str) -> Result<Option<String>, EngineError> {
        let raw = self
            .db
            .get(self.meta_key(field))
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        Ok(raw.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    fn write_meta_u64(&self, field: &str, value: u64) -> Result<(), EngineError> {
        self.db
            .insert(self.meta_key(field), &value.to_le_bytes())
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    fn write_meta_string(&self, field: &str, value: &str) -> Result<(), EngineError> {
        self.db
            .insert(self.meta_key(field), value.as_bytes())
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Folds a batch of samples into the in-memory accumulator, crediting
    /// every ancestor of each record's path under one mutex hold so no
    /// observer can see a leaf update without its parents' (spec §5).
    pub fn add_sample_batch(&self, records: &[SampleRecord]) -> Result<(), EngineError> {
        {
            let mut acc = self.accumulator.lock();
            for record in records {
                for ancestor in ancestors(&record.path) {
                    acc.entry(ancestor)
                        .or_default()
                        .add_sample(record.sample_type, record.duration);
                }
            }
        }

        {
            let mut meta = self.metadata.write();
            meta.sample_count += records.len() as u64;
            meta.last_updated_nanos = now_nanos();
            if let Some(run_start) = meta.run_start {
                let now = Instant::now();
                meta.running_time_nanos += now.duration_since(run_start).as_nanos() as u64;
                meta.run_start = Some(now);
            }
        }
        self.write_meta_u64("sample_count", self.metadata.read().sample_count)?;
        self.write_meta_u64("last_updated", self.metadata.read().last_updated_nanos)?;

        if self.accumulator.lock().len() >= FLUSH_PATH_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }

    /// Atomically swaps out the accumulator, merges it into stored stats,
    /// and writes back in one batch. On any write failure the accumulator
    /// is restored so no samples are lost (spec §4.11).
    pub fn flush(&self) -> Result<(), EngineError> {
        let drained = {
            let mut acc = self.accumulator.lock();
            std::mem::take(&mut *acc)
        };
        if drained.is_empty() {
            return Ok(());
        }

        let mut batch = sled::Batch::default();
        for (path, delta) in &drained {
            let mut stats = self.read_stored_stats(path)?;
            stats.merge(delta);
            batch.insert(self.path_key(path), stats.encode().to_vec());
        }

        if let Err(e) = self.db.apply_batch(batch) {
            let mut acc = self.accumulator.lock();
            for (path, delta) in drained {
                acc.entry(path).or_default().merge(&delta);
            }
            return Err(EngineError::StoreUnavailable(e.to_string()));
        }
        Ok(())
    }

    fn read_stored_stats(&self, path: &str) -> Result<PathStats, EngineError> {
        let raw = self
            .db
            .get(self.path_key(path))
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        Ok(match raw {
            Some(bytes) if bytes.len() >= PATH_STATS_SIZE => PathStats::decode(&bytes),
            Some(bytes) if !bytes.is_empty() => PathStats::decode(&bytes),
            _ => PathStats::default(),
        })
    }

    /// Reads stored stats merged with any unflushed accumulator delta
    /// (read-your-writes).
    pub fn get_path_stats(&self, path: &str) -> Result<PathStats, EngineError> {
        let mut stats = self.read_stored_stats(path)?;
        if let Some(delta) = self.accumulator.lock().get(path) {
            stats.merge(delta);
        }
        Ok(stats)
    }

    /// Direct children of `parent` only: `p:<parent>/<name>` with no further
    /// `/` in the remainder.
    pub fn get_children(&self, parent: &str) -> Result<Vec<(String, String, PathStats)>, EngineError> {
        let parent_norm = if parent == "/" { "" } else { parent };
        let scan_prefix = format!("{}p:{}/", self.prefix, parent_norm);

        let mut out: HashMap<String, PathStats> = HashMap::new();
        for kv in self.db.scan_prefix(scan_prefix.as_bytes()) {
            let (key, value) = kv.map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
            let key_str = String::from_utf8_lossy(&key);
            let remainder = &key_str[scan_prefix.len()..];
            if remainder.is_empty() || remainder.contains('/') {
                continue;
            }
            out.insert(remainder.to_string(), PathStats::decode(&value));
        }

        let acc = self.accumulator.lock();
        for (path, delta) in acc.iter() {
            if let Some(remainder) = path.strip_prefix(&format!("{}/", parent_norm)) {
                if remainder.is_empty() || remainder.contains('/') {
                    continue;
                }
                out.entry(remainder.to_string()).or_default().merge(delta);
            }
        }

        Ok(out
            .into_iter()
            .map(|(name, stats)| {
                let full_path = if parent_norm.is_empty() {
                    format!("/{}", name)
                } else {
                    format!("{}/{}", parent_norm, name)
                };
                (name, full_path, stats)
            })
            .collect())
    }

    pub fn sample_count(&self) -> u64 {
        self.metadata.read().sample_count
    }

    pub fn total_size(&self) -> u64 {
        self.metadata.read().total_size
    }

    pub fn start_run(&self) {
        self.metadata.write().run_start = Some(Instant::now());
    }

    pub fn stop_run(&self) -> Result<(), EngineError> {
        let mut meta = self.metadata.write();
        if let Some(run_start) = meta.run_start.take() {
            meta.running_time_nanos += Instant::now().duration_since(run_start).as_nanos() as u64;
        }
        let running = meta.running_time_nanos;
        drop(meta);
        self.write_meta_u64("running_time", running)
    }

    pub fn running_time(&self) -> Duration {
        let meta = self.metadata.read();
        let mut nanos = meta.running_time_nanos;
        if let Some(run_start) = meta.run_start {
            nanos += Instant::now().duration_since(run_start).as_nanos() as u64;
        }
        Duration::from_nanos(nanos)
    }

    pub fn close(&self) -> Result<(), EngineError> {
        self.flush()?;
        self.stop_run()?;
        self.db
            .flush()
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        Ok(())
    }
}

/// Opens the one shared KV store directory for the process. Tuned per spec
/// §4.6: large in-memory cache, no forced fsync on every write.
pub fn open_store(dir: &Path) -> Result<sled::Db, EngineError> {
    sled::Config::new()
        .path(dir)
        .cache_capacity(64 * 1024 * 1024)
        .flush_every_ms(None)
        .open()
        .map_err(|e| {
            error!("failed to open session store at {:?}: {}", dir, e);
            EngineError::StoreUnavailable(e.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session(dir: &Path) -> Session {
        let db = open_store(dir).unwrap();
        Session::open(db, Path::new("/mnt/test"), 1000).unwrap()
    }

    #[test]
    fn empty_session_has_zero_stats() {
        let tmp = tempfile::tempdir().unwrap();
        let session = new_session(tmp.path());
        assert_eq!(session.get_path_stats("/").unwrap(), PathStats::default());
        assert!(session.get_children("/").unwrap().is_empty());
        assert_eq!(session.sample_count(), 0);
    }

    #[test]
    fn single_sample_credits_all_ancestors() {
        let tmp = tempfile::tempdir().unwrap();
        let session = new_session(tmp.path());
        session
            .add_sample_batch(&[SampleRecord {
                path: "/a/b/file".to_string(),
                sample_type: SampleType::Represented,
                duration: Duration::from_millis(1),
            }])
            .unwrap();

        assert_eq!(session.get_path_stats("/a/b/file").unwrap().represented().samples, 1);
        assert_eq!(session.get_path_stats("/a/b").unwrap().represented().samples, 1);
        assert_eq!(session.get_path_stats("/a").unwrap().represented().samples, 1);
        assert_eq!(session.get_path_stats("/").unwrap().represented().samples, 1);
    }

    #[test]
    fn read_your_writes_without_flush() {
        let tmp = tempfile::tempdir().unwrap();
        let session = new_session(tmp.path());
        session
            .add_sample_batch(&[SampleRecord {
                path: "/x".to_string(),
                sample_type: SampleType::Shared,
                duration: Duration::from_micros(5),
            }])
            .unwrap();
        assert_eq!(session.get_path_stats("/x").unwrap().by_type[SampleType::Shared.slot()].samples, 1);
    }

    #[test]
    fn flush_preserves_accumulated_stats() {
        let tmp = tempfile::tempdir().unwrap();
        let session = new_session(tmp.path());
        session
            .add_sample_batch(&[SampleRecord {
                path: "/a".to_string(),
                sample_type: SampleType::Represented,
                duration: Duration::from_millis(1),
            }])
            .unwrap();
        session.flush().unwrap();
        assert_eq!(session.get_path_stats("/a").unwrap().represented().samples, 1);

        session
            .add_sample_batch(&[SampleRecord {
                path: "/a".to_string(),
                sample_type: SampleType::Represented,
                duration: Duration::from_millis(1),
            }])
            .unwrap();
        session.flush().unwrap();
        assert_eq!(session.get_path_stats("/a").unwrap().represented().samples, 2);
    }

    #[test]
    fn get_children_excludes_grandchildren() {
        let tmp = tempfile::tempdir().unwrap();
        let session = new_session(tmp.path());
        session
            .add_sample_batch(&[
                SampleRecord {
                    path: "/a/b".to_string(),
                    sample_type: SampleType::Represented,
                    duration: Duration::from_millis(1),
                },
                SampleRecord {
                    path: "/a/b/c".to_string(),
                    sample_type: SampleType::Represented,
                    duration: Duration::from_millis(1),
                },
            ])
            .unwrap();
        session.flush().unwrap();

        let children = session.get_children("/a").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].0, "b");
    }

    #[test]
    fn path_stats_round_trips_through_encode_decode() {
        let mut stats = PathStats::default();
        stats.add_sample(SampleType::Represented, Duration::from_nanos(42));
        stats.distributed_samples = 1.5;
        let encoded = stats.encode();
        let decoded = PathStats::decode(&encoded);
        assert_eq!(stats, decoded);
    }

    #[test]
    fn path_stats_decodes_legacy_short_blob() {
        let mut short = vec![0u8; 40];
        short[0..8].copy_from_slice(&7u64.to_le_bytes());
        let stats = PathStats::decode(&short);
        assert_eq!(stats.by_type[0].samples, 7);
        assert_eq!(stats.distributed_samples, 0.0);
    }

    #[test]
    fn resuming_same_path_keeps_sample_count() {
        let tmp = tempfile::tempdir().unwrap();
        let db = open_store(tmp.path()).unwrap();
        {
            let session = Session::open(db.clone(), Path::new("/mnt/a"), 100).unwrap();
            session
                .add_sample_batch(&[SampleRecord {
                    path: "/f".to_string(),
                    sample_type: SampleType::Represented,
                    duration: Duration::from_millis(1),
                }])
                .unwrap();
        }
        let resumed = Session::open(db, Path::new("/mnt/a"), 100).unwrap();
        assert_eq!(resumed.sample_count(), 1);
    }

    #[test]
    fn total_size_grows_but_never_shrinks_on_resume() {
        let tmp = tempfile::tempdir().unwrap();
        let db = open_store(tmp.path()).unwrap();
        Session::open(db.clone(), Path::new("/mnt/a"), 100).unwrap();
        let resumed = Session::open(db, Path::new("/mnt/a"), 50).unwrap();
        assert_eq!(resumed.total_size(), 100);
    }
}
