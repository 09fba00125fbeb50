//! The top-level entry point implementing every inbound operation external
//! collaborators (CLI, RPC, catalog) call into (spec §6). Everything here
//! returns a typed [`EngineResult`]; no raw kernel errno or `sled` error
//! ever crosses this boundary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chunk_index::ChunkIndex;
use crate::decode::SubvolumePathResolver;
use crate::error::{EngineError, EngineResult};
use crate::file_frag::{self, FileFragInfo};
use crate::fragmentation::{self, BlockMap, FragmentationReport, HeatMapCell};
use crate::ioctl::IoctlTransport;
use crate::sampler::{Sampler, SamplerConfig, SamplerState};
use crate::session::{self, Session};
use crate::usage_query::{self, SortBy, UsageTree};

pub struct SubvolumeInfo {
    pub root_id: u64,
    pub path: String,
}

pub struct FilesystemUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub devices: Vec<crate::ioctl::DevInfo>,
}

pub struct DeviceStats {
    pub devid: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
}

pub struct StartSamplingResult {
    pub started: bool,
    pub resumed: bool,
    pub existing_samples: u64,
}

pub struct SamplingStatus {
    pub running: bool,
    pub current_path: String,
    pub samples_per_second: f64,
    pub recent_paths: Vec<String>,
    pub sample_count: u64,
    pub total_size: u64,
    pub running_seconds: f64,
}

/// A filesystem's session is always backed by the shared KV store alone;
/// `transport`/`subvols` are populated lazily, only once an operation that
/// genuinely needs a live mounted filesystem asks for them (spec §7: a
/// session that was never mounted in this process still answers queries
/// against whatever is already in the store).
struct FsContext {
    transport: Option<Arc<IoctlTransport>>,
    subvols: Option<Arc<SubvolumePathResolver>>,
    session: Arc<Session>,
    sampler: Option<Sampler>,
}

/// Owns the one shared KV store and per-filesystem runtime state (open
/// ioctl transports, cached subvolume maps, active samplers). Cheaply
/// cloneable handles into it are not provided; callers share one `Engine`
/// behind their own `Arc` if they need that.
pub struct Engine {
    db: sled::Db,
    contexts: Mutex<HashMap<PathBuf, FsContext>>,
}

impl Engine {
    /// Opens the shared KV store directory. Per spec §4.11, a failure here
    /// is fatal: the engine cannot run without its store.
    pub fn open(store_dir: &Path) -> EngineResult<Self> {
        let db = session::open_store(store_dir)?;
        Ok(Engine {
            db,
            contexts: Mutex::new(HashMap::new()),
        })
    }

    /// Ensures a session-backed context exists for `fs_path`, without
    /// touching the kernel at all. Safe to call for a path that isn't
    /// currently a mounted btrfs filesystem.
    fn ensure_session<'a>(
        &self,
        contexts: &'a mut HashMap<PathBuf, FsContext>,
        fs_path: &Path,
    ) -> EngineResult<&'a mut FsContext> {
        if !contexts.contains_key(fs_path) {
            let session = Arc::new(Session::open(self.db.clone(), fs_path, 0)?);
            contexts.insert(
                fs_path.to_path_buf(),
                FsContext {
                    transport: None,
                    subvols: None,
                    session,
                    sampler: None,
                },
            );
        }
        Ok(contexts.get_mut(fs_path).expect("just inserted"))
    }

    /// Ensures a context exists and that its `transport`/`subvols` are
    /// populated, opening the filesystem and walking its subvolumes if this
    /// is the first operation against `fs_path` that needs a live mount.
    fn ensure_live<'a>(
        &self,
        contexts: &'a mut HashMap<PathBuf, FsContext>,
        fs_path: &Path,
    ) -> EngineResult<&'a mut FsContext> {
        self.ensure_session(contexts, fs_path)?;
        let ctx = contexts.get_mut(fs_path).expect("just ensured");
        if ctx.transport.is_none() {
            let transport = Arc::new(IoctlTransport::open(fs_path)?);
            transport.fs_info()?;
            let subvols = Arc::new(SubvolumePathResolver::build(&transport)?);
            ctx.transport = Some(transport);
            ctx.subvols = Some(subvols);
        }
        Ok(ctx)
    }

    pub fn list_subvolumes(&self, fs_path: &Path) -> EngineResult<Vec<SubvolumeInfo>> {
        let mut contexts = self.contexts.lock();
        let ctx = self.ensure_live(&mut contexts, fs_path)?;
        let subvols = ctx.subvols.as_ref().expect("ensure_live guarantees subvols");
        let mut out: Vec<SubvolumeInfo> = subvols
            .all_ids()
            .into_iter()
            .filter_map(|root_id| {
                subvols.path_for(root_id).map(|path| SubvolumeInfo {
                    root_id,
                    path: path.to_string(),
                })
            })
            .collect();
        out.sort_by_key(|s| s.root_id);
        Ok(out)
    }

    pub fn filesystem_usage(&self, fs_path: &Path) -> EngineResult<FilesystemUsage> {
        let mut contexts = self.contexts.lock();
        let ctx = self.ensure_live(&mut contexts, fs_path)?;
        let transport = ctx.transport.as_ref().expect("ensure_live guarantees transport");
        let fs_info = transport.fs_info()?;

        let mut devices = Vec::new();
        let mut total_bytes = 0u64;
        let mut used_bytes = 0u64;
        for devid in 1..=fs_info.max_devid {
            if let Ok(dev) = transport.dev_info(devid) {
                total_bytes += dev.total_bytes;
                used_bytes += dev.bytes_used;
                devices.push(dev);
            }
        }

        Ok(FilesystemUsage {
            total_bytes,
            used_bytes,
            devices,
        })
    }

    /// Hex-encoded filesystem uuid, for callers that read the scrub status
    /// file or sysfs directly (those interfaces sit outside the inbound
    /// contract; see `scrub` and `sysfs`).
    pub fn fs_uuid_hex(&self, fs_path: &Path) -> EngineResult<String> {
        let mut contexts = self.contexts.lock();
        let ctx = self.ensure_live(&mut contexts, fs_path)?;
        let transport = ctx.transport.as_ref().expect("ensure_live guarantees transport");
        Ok(transport.fs_info()?.uuid_hex())
    }

    pub fn device_stats(&self, fs_path: &Path, devid: u64) -> EngineResult<DeviceStats> {
        let mut contexts = self.contexts.lock();
        let ctx = self.ensure_live(&mut contexts, fs_path)?;
        let dev = ctx.transport.as_ref().expect("ensure_live guarantees transport").dev_info(devid)?;
        Ok(DeviceStats {
            devid: dev.devid,
            total_bytes: dev.total_bytes,
            bytes_used: dev.bytes_used,
        })
    }

    /// Starts a sampler for `fs_path`. Errors with `AlreadyRunning` if one
    /// is already active. `resume` affects only whether the prior session's
    /// sample count is reported back; the session itself is always resumed
    /// from the store if one exists (spec §4.5, §7).
    pub fn start_sampling(&self, fs_path: &Path, resume: bool) -> EngineResult<StartSamplingResult> {
        let mut contexts = self.contexts.lock();
        let ctx = self.ensure_live(&mut contexts, fs_path)?;

        if let Some(sampler) = &ctx.sampler {
            if sampler.running() {
                return Err(EngineError::AlreadyRunning {
                    path: fs_path.to_path_buf(),
                });
            }
        }

        let transport = ctx.transport.clone().expect("ensure_live guarantees transport");
        let subvols = ctx.subvols.clone().expect("ensure_live guarantees subvols");
        let chunk_index = ChunkIndex::build(&transport)?;
        let existing_samples = ctx.session.sample_count();

        let mut sampler = Sampler::new(
            fs_path,
            ctx.session.clone(),
            chunk_index,
            SamplerConfig::default(),
        )?;
        sampler.start(transport, subvols)?;
        ctx.sampler = Some(sampler);

        Ok(StartSamplingResult {
            started: true,
            resumed: resume && existing_samples > 0,
            existing_samples,
        })
    }

    pub fn stop_sampling(&self, fs_path: &Path) -> EngineResult<()> {
        let mut contexts = self.contexts.lock();
        let ctx = contexts
            .get_mut(fs_path)
            .ok_or_else(|| EngineError::NotFound(fs_path.display().to_string()))?;
        if let Some(sampler) = &mut ctx.sampler {
            sampler.stop()?;
        }
        Ok(())
    }

    pub fn sampling_status(&self, fs_path: &Path) -> EngineResult<SamplingStatus> {
        let contexts = self.contexts.lock();
        let Some(ctx) = contexts.get(fs_path) else {
            return Ok(SamplingStatus {
                running: false,
                current_path: String::new(),
                samples_per_second: 0.0,
                recent_paths: Vec::new(),
                sample_count: 0,
                total_size: 0,
                running_seconds: 0.0,
            });
        };

        let (running, current_path, rate, recent_paths) = match &ctx.sampler {
            Some(sampler) if sampler.state() == SamplerState::Running => (
                true,
                sampler.current_path(),
                sampler.samples_per_second(),
                sampler.recent_paths(32),
            ),
            _ => (false, String::new(), 0.0, Vec::new()),
        };

        Ok(SamplingStatus {
            running,
            current_path,
            samples_per_second: rate,
            recent_paths,
            sample_count: ctx.session.sample_count(),
            total_size: ctx.session.total_size(),
            running_seconds: ctx.session.running_time().as_secs_f64(),
        })
    }

    /// Queries against a session that has never been opened return an
    /// empty result with `total_samples = 0`, not an error (spec §7). This
    /// reads the session straight from the KV store and never needs a live
    /// mount, unlike the fragmentation queries below.
    pub fn usage_tree(
        &self,
        fs_path: &Path,
        path: &str,
        sort_by: SortBy,
        sort_desc: bool,
        limit: Option<usize>,
    ) -> EngineResult<UsageTree> {
        let mut contexts = self.contexts.lock();
        let ctx = self.ensure_session(&mut contexts, fs_path)?;
        Ok(usage_query::usage_tree(&ctx.session, path, sort_by, sort_desc, limit))
    }

    /// Unlike `usage_tree`, there is no stored fragmentation data to fall
    /// back to: block groups and device extents are read live off the
    /// device, so this genuinely requires a mounted filesystem.
    pub fn scan_fragmentation(&self, fs_path: &Path) -> EngineResult<HashMap<u64, FragmentationReport>> {
        let mut contexts = self.contexts.lock();
        let ctx = self.ensure_live(&mut contexts, fs_path)?;
        let transport = ctx.transport.as_ref().expect("ensure_live guarantees transport");
        let fs_info = transport.fs_info()?;

        let mut out = HashMap::new();
        for devid in 1..=fs_info.max_devid {
            let Ok(dev) = transport.dev_info(devid) else {
                continue;
            };
            let map = fragmentation::build_block_map(transport, devid, dev.total_bytes)?;
            let stats = fragmentation::compute_stats(&map);
            let report = fragmentation::classify_free_space(&map, &stats);
            out.insert(devid, report);
        }
        Ok(out)
    }

    pub fn device_block_map(&self, fs_path: &Path, devid: u64) -> EngineResult<BlockMap> {
        let mut contexts = self.contexts.lock();
        let ctx = self.ensure_live(&mut contexts, fs_path)?;
        let transport = ctx.transport.as_ref().expect("ensure_live guarantees transport");
        let dev = transport.dev_info(devid)?;
        fragmentation::build_block_map(transport, devid, dev.total_bytes)
    }

    pub fn heat_map(&self, fs_path: &Path, devid: u64, resolution: usize) -> EngineResult<Vec<HeatMapCell>> {
        let map = self.device_block_map(fs_path, devid)?;
        Ok(fragmentation::heat_map(&map, resolution))
    }

    pub fn file_fragmentation(&self, path: &Path) -> EngineResult<FileFragInfo> {
        let size = std::fs::metadata(path)
            .map(|m| m.len())
            .unwrap_or(0);
        let extents = file_frag::read_extents(path);
        Ok(file_frag::analyze(size, &extents))
    }

    /// Flushes and releases every open filesystem context. Does not close
    /// the shared store itself (spec §4.6: sessions are lightweight views).
    pub fn close_all(&self) -> EngineResult<()> {
        let mut contexts = self.contexts.lock();
        for (_, mut ctx) in contexts.drain() {
            if let Some(sampler) = &mut ctx.sampler {
                let _ = sampler.stop();
            }
            ctx.session.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (Engine, tempfile::TempDir) {
        let store_dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(store_dir.path()).unwrap();
        (engine, store_dir)
    }

    /// `fs_path` here is a real directory, but not a mounted btrfs
    /// filesystem, and was never sampled into by this process. `usage_tree`
    /// must still answer from the store rather than opening the path.
    #[test]
    fn usage_tree_on_unopened_session_is_empty_not_an_error() {
        let (engine, _store_dir) = engine();
        let fs_dir = tempfile::tempdir().unwrap();

        let tree = engine.usage_tree(fs_dir.path(), "/", SortBy::Size, true, None).unwrap();
        assert_eq!(tree.total_samples, 0);
        assert!(tree.children.is_empty());
    }

    /// A second call reuses the same session-only context and still avoids
    /// touching the kernel.
    #[test]
    fn usage_tree_is_idempotent_without_a_live_mount() {
        let (engine, _store_dir) = engine();
        let fs_dir = tempfile::tempdir().unwrap();

        engine.usage_tree(fs_dir.path(), "/", SortBy::Size, true, None).unwrap();
        let tree = engine.usage_tree(fs_dir.path(), "/", SortBy::Size, true, None).unwrap();
        assert_eq!(tree.total_samples, 0);
    }

    /// `list_subvolumes` genuinely needs a live mount; against a directory
    /// that isn't a btrfs filesystem it must surface the ioctl failure
    /// rather than silently returning nothing.
    #[test]
    fn list_subvolumes_on_non_btrfs_path_fails() {
        let (engine, _store_dir) = engine();
        let fs_dir = tempfile::tempdir().unwrap();

        let err = engine.list_subvolumes(fs_dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::IoctlFailed { .. }));
    }

    #[test]
    fn sampling_status_on_unknown_path_is_idle() {
        let (engine, _store_dir) = engine();
        let fs_dir = tempfile::tempdir().unwrap();

        let status = engine.sampling_status(fs_dir.path()).unwrap();
        assert!(!status.running);
        assert_eq!(status.sample_count, 0);
    }

    #[test]
    fn stop_sampling_on_unknown_path_is_not_found() {
        let (engine, _store_dir) = engine();
        let fs_dir = tempfile::tempdir().unwrap();

        let err = engine.stop_sampling(fs_dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
