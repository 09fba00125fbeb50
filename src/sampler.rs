//! Sustained uniform sampling of data-chunk address space (spec §4.5).
//!
//! Deliberately threaded, not async: ioctls are blocking syscalls and a
//! cooperative single-threaded runtime would serialize them behind one
//! thread, collapsing throughput (spec §9). Each worker owns its own PRNG
//! seeded from the clock and its index, so workers never share sampling
//! state beyond the chunk index (immutable) and the session accumulator
//! (its own short-held mutex).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::chunk_index::ChunkIndex;
use crate::decode::SubvolumePathResolver;
use crate::error::EngineError;
use crate::ioctl::IoctlTransport;
use crate::path_resolver;
use crate::session::{SampleRecord, Session};

pub const DEFAULT_WORKER_COUNT: usize = 8;
const BATCH_SIZE: usize = 32;
const RING_SLOTS: usize = 32;
const RATE_TICK: Duration = Duration::from_secs(1);
const FLUSH_TICK: Duration = Duration::from_secs(5);

/// Tunables for a sampling run (spec §4.5). `Default` matches the literal
/// defaults named there: 8 workers, 32-record batches, a 5s flush interval,
/// a 1Hz rate tick, and a 32-slot recent-path ring. The out-of-scope
/// CLI/RPC layer constructs this programmatically; there is no config-file
/// surface here.
#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub worker_count: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub rate_tick_interval: Duration,
    pub ring_size: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            worker_count: DEFAULT_WORKER_COUNT,
            batch_size: BATCH_SIZE,
            flush_interval: FLUSH_TICK,
            rate_tick_interval: RATE_TICK,
            ring_size: RING_SLOTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Running,
    Stopped,
}

/// Lock-free ring of recently sampled paths. Slots are plain atomics;
/// last-writer-wins races between workers are immaterial (spec §4.5).
struct RecentPathRing {
    slots: Vec<parking_lot::Mutex<String>>,
    sequence: AtomicU64,
    capacity: usize,
}

impl RecentPathRing {
    fn new(capacity: usize) -> Self {
        RecentPathRing {
            slots: (0..capacity).map(|_| parking_lot::Mutex::new(String::new())).collect(),
            sequence: AtomicU64::new(0),
            capacity,
        }
    }

    fn push(&self, path: &str) {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let slot = seq as usize % self.capacity;
        *self.slots[slot].lock() = path.to_string();
    }

    fn current(&self) -> String {
        let seq = self.sequence.load(Ordering::Relaxed);
        if seq == 0 {
            return String::new();
        }
        let slot = (seq - 1) as usize % self.capacity;
        self.slots[slot].lock().clone()
    }

    /// Last `n` entries, most-recent-first. Best-effort: torn reads under
    /// concurrent writers are tolerated.
    fn recent(&self, n: usize) -> Vec<String> {
        let seq = self.sequence.load(Ordering::Relaxed);
        let count = n.min(self.capacity).min(seq as usize);
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let idx = (seq - 1 - i as u64) as usize % self.capacity;
            out.push(self.slots[idx].lock().clone());
        }
        out
    }
}

struct SharedState {
    cancel: AtomicBool,
    recent: RecentPathRing,
    rate: AtomicU64,
    last_rate_sample_count: AtomicU64,
    active_workers: AtomicU32,
}

/// Owns the worker pool, coordinator timers, and the session this run
/// writes to. Construction enumerates data chunks; [`Sampler::start`]
/// refuses to proceed if none are found.
pub struct Sampler {
    fs_path: PathBuf,
    session: Arc<Session>,
    chunk_index: Arc<ChunkIndex>,
    shared: Arc<SharedState>,
    state: SamplerState,
    workers: Vec<JoinHandle<()>>,
    coordinator: Option<JoinHandle<()>>,
    config: SamplerConfig,
}

impl Sampler {
    pub fn new(
        fs_path: &Path,
        session: Arc<Session>,
        chunk_index: ChunkIndex,
        config: SamplerConfig,
    ) -> Result<Self, EngineError> {
        if chunk_index.is_empty() {
            return Err(EngineError::NoAllocatedChunks {
                path: fs_path.to_path_buf(),
            });
        }
        Ok(Sampler {
            fs_path: fs_path.to_path_buf(),
            session,
            chunk_index: Arc::new(chunk_index),
            shared: Arc::new(SharedState {
                cancel: AtomicBool::new(false),
                recent: RecentPathRing::new(config.ring_size),
                rate: AtomicU64::new(0),
                last_rate_sample_count: AtomicU64::new(0),
                active_workers: AtomicU32::new(0),
            }),
            state: SamplerState::Idle,
            workers: Vec::new(),
            coordinator: None,
            config,
        })
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    /// Spawns the worker pool and coordinator. Errors if already running.
    pub fn start(&mut self, transport: Arc<IoctlTransport>, subvols: Arc<SubvolumePathResolver>) -> Result<(), EngineError> {
        if self.state == SamplerState::Running {
            return Err(EngineError::AlreadyRunning {
                path: self.fs_path.clone(),
            });
        }

        self.shared.cancel.store(false, Ordering::SeqCst);
        self.session.start_run();

        for i in 0..self.config.worker_count {
            let shared = self.shared.clone();
            let chunk_index = self.chunk_index.clone();
            let session = self.session.clone();
            let transport = transport.clone();
            let subvols = subvols.clone();
            let batch_size = self.config.batch_size;

            shared.active_workers.fetch_add(1, Ordering::SeqCst);
            let handle = std::thread::Builder::new()
                .name(format!("btrfs-scope-sampler-{}", i))
                .spawn(move || {
                    run_worker(i, shared, chunk_index, session, transport, subvols, batch_size);
                })
                .expect("failed to spawn sampler worker thread");
            self.workers.push(handle);
        }

        let shared = self.shared.clone();
        let session = self.session.clone();
        let rate_tick_interval = self.config.rate_tick_interval;
        let flush_interval = self.config.flush_interval;
        self.coordinator = Some(
            std::thread::Builder::new()
                .name("btrfs-scope-coordinator".to_string())
                .spawn(move || run_coordinator(shared, session, rate_tick_interval, flush_interval))
                .expect("failed to spawn coordinator thread"),
        );

        self.state = SamplerState::Running;
        Ok(())
    }

    /// Requests cancellation, joins every worker and the coordinator, then
    /// flushes the session. Blocks until all of that completes.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        if self.state != SamplerState::Running {
            return Ok(());
        }
        self.shared.cancel.store(true, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.coordinator.take() {
            let _ = handle.join();
        }
        self.session.flush()?;
        self.session.stop_run()?;
        self.state = SamplerState::Stopped;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.state = SamplerState::Idle;
    }

    pub fn current_path(&self) -> String {
        self.shared.recent.current()
    }

    pub fn recent_paths(&self, n: usize) -> Vec<String> {
        self.shared.recent.recent(n)
    }

    pub fn samples_per_second(&self) -> f64 {
        f64::from_bits(self.shared.rate.load(Ordering::Relaxed))
    }

    pub fn running(&self) -> bool {
        self.state == SamplerState::Running
    }
}

fn run_worker(
    index: usize,
    shared: Arc<SharedState>,
    chunk_index: Arc<ChunkIndex>,
    session: Arc<Session>,
    transport: Arc<IoctlTransport>,
    subvols: Arc<SubvolumePathResolver>,
    batch_size: usize,
) {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
        ^ (index as u64).wrapping_mul(0x9E3779B97F4A7C15);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut batch: Vec<SampleRecord> = Vec::with_capacity(batch_size);

    loop {
        if shared.cancel.load(Ordering::Relaxed) {
            break;
        }

        let p: u64 = rng.gen_range(0..chunk_index.total_size);
        let Some((_, logical)) = chunk_index.sample_position(p) else {
            continue;
        };

        let started = Instant::now();
        let resolved = match path_resolver::resolve(&transport, &subvols, logical) {
            Ok(r) => r,
            Err(e) => {
                warn!("logical_ino resolve failed for {}: {}", logical, e);
                continue;
            }
        };
        let duration = started.elapsed();

        shared.recent.push(&resolved.path);

        if shared.cancel.load(Ordering::Relaxed) {
            break;
        }

        batch.push(SampleRecord {
            path: resolved.path,
            sample_type: resolved.sample_type,
            duration,
        });

        if batch.len() >= batch_size {
            publish_batch(&session, &mut batch);
        }
    }

    if !batch.is_empty() {
        publish_batch(&session, &mut batch);
    }
    shared.active_workers.fetch_sub(1, Ordering::SeqCst);
}

fn publish_batch(session: &Session, batch: &mut Vec<SampleRecord>) {
    if let Err(e) = session.add_sample_batch(batch) {
        warn!("failed to publish sample batch: {}", e);
    }
    batch.clear();
}

fn run_coordinator(shared: Arc<SharedState>, session: Arc<Session>, rate_tick_interval: Duration, flush_interval: Duration) {
    let mut last_rate_tick = Instant::now();
    let mut last_flush_tick = Instant::now();

    loop {
        if shared.cancel.load(Ordering::Relaxed) && shared.active_workers.load(Ordering::SeqCst) == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));

        let now = Instant::now();
        if now.duration_since(last_rate_tick) >= rate_tick_interval {
            let current = session.sample_count();
            let previous = shared.last_rate_sample_count.swap(current, Ordering::SeqCst);
            let elapsed = now.duration_since(last_rate_tick).as_secs_f64();
            let rate = if elapsed > 0.0 {
                (current.saturating_sub(previous)) as f64 / elapsed
            } else {
                0.0
            };
            shared.rate.store(rate.to_bits(), Ordering::Relaxed);
            last_rate_tick = now;
        }

        if now.duration_since(last_flush_tick) >= flush_interval {
            if let Err(e) = session.flush() {
                warn!("periodic session flush failed: {}", e);
            }
            last_flush_tick = now;
        }

        if shared.cancel.load(Ordering::Relaxed) {
            break;
        }
    }

    if let Err(e) = session.flush() {
        warn!("final session flush on shutdown failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recent_ring_reports_most_recent_first() {
        let ring = RecentPathRing::new(RING_SLOTS);
        ring.push("/a");
        ring.push("/b");
        ring.push("/c");
        assert_eq!(ring.current(), "/c");
        assert_eq!(ring.recent(3), vec!["/c", "/b", "/a"]);
    }

    #[test]
    fn empty_ring_has_no_current() {
        let ring = RecentPathRing::new(RING_SLOTS);
        assert_eq!(ring.current(), "");
        assert!(ring.recent(5).is_empty());
    }

    #[test]
    fn ring_wraps_after_capacity() {
        let ring = RecentPathRing::new(RING_SLOTS);
        for i in 0..(RING_SLOTS + 5) {
            ring.push(&format!("/p{}", i));
        }
        assert_eq!(ring.current(), format!("/p{}", RING_SLOTS + 4));
        assert_eq!(ring.recent(RING_SLOTS).len(), RING_SLOTS);
    }

    #[test]
    fn sampler_config_default_matches_literal_defaults() {
        let config = SamplerConfig::default();
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.flush_interval, Duration::from_secs(5));
        assert_eq!(config.rate_tick_interval, Duration::from_secs(1));
        assert_eq!(config.ring_size, 32);
    }
}
