//! Per-file fragmentation via `FIEMAP` (spec §4.9): extent enumeration,
//! degree-of-fragmentation metrics, and a directory-wide aggregate view.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use log::debug;

const FIEMAP_MAX_EXTENTS: u32 = 256;
const FIEMAP_FLAG_SYNC: u32 = 0x0000_0001;
const FIEMAP_EXTENT_LAST: u32 = 0x0000_0001;
const FIEMAP_EXTENT_UNKNOWN: u32 = 0x0000_0002;
const FIEMAP_EXTENT_DELALLOC: u32 = 0x0000_0004;
const FIEMAP_EXTENT_DATA_INLINE: u32 = 0x0000_0040;

const BTRFS_MAX_EXTENT_SIZE: u64 = 128 * 1024 * 1024;

nix::ioctl_readwrite!(fiemap_ioctl, b'f', 11, fiemap_request);

#[repr(C)]
struct fiemap_request {
    start: u64,
    length: u64,
    flags: u32,
    mapped_extents: u32,
    extent_count: u32,
    reserved: u32,
    // `extent_count` [`fiemap_extent`] records follow, allocated by the
    // caller as part of the same buffer.
}
static_assertions::assert_eq_size!([u8; 32], fiemap_request);

#[repr(C)]
#[derive(Clone, Copy)]
struct fiemap_extent {
    logical: u64,
    physical: u64,
    length: u64,
    reserved64: [u64; 2],
    flags: u32,
    reserved32: [u32; 3],
}
static_assertions::assert_eq_size!([u8; 56], fiemap_extent);

#[derive(Debug, Clone, Copy)]
pub struct Extent {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
    pub unknown: bool,
    pub delalloc: bool,
    pub inline: bool,
}

/// Runs the FIEMAP ioctl loop over a file's full extent range, 256 extents
/// per call, advancing `start` past the last seen extent each round
/// (spec §4.9). Returns an empty list (not an error) if the file doesn't
/// support FIEMAP, per the failure-semantics table.
pub fn read_extents(path: &Path) -> Vec<Extent> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            debug!("fiemap: cannot open {:?}: {}", path, e);
            return Vec::new();
        }
    };

    let mut extents = Vec::new();
    let mut start = 0u64;

    loop {
        let buf_len = std::mem::size_of::<fiemap_request>()
            + FIEMAP_MAX_EXTENTS as usize * std::mem::size_of::<fiemap_extent>();
        let mut buf = vec![0u8; buf_len];
        {
            let req = unsafe { &mut *(buf.as_mut_ptr() as *mut fiemap_request) };
            req.start = start;
            req.length = u64::MAX;
            req.flags = FIEMAP_FLAG_SYNC;
            req.extent_count = FIEMAP_MAX_EXTENTS;
        }

        let req_ptr = buf.as_mut_ptr() as *mut fiemap_request;
        if unsafe { fiemap_ioctl(file.as_raw_fd(), req_ptr) }.is_err() {
            debug!("fiemap: ioctl failed for {:?}", path);
            break;
        }

        let mapped = unsafe { (*req_ptr).mapped_extents };
        if mapped == 0 {
            break;
        }

        let extents_start = std::mem::size_of::<fiemap_request>();
        let mut last: Option<fiemap_extent> = None;
        for i in 0..mapped as usize {
            let off = extents_start + i * std::mem::size_of::<fiemap_extent>();
            if off + std::mem::size_of::<fiemap_extent>() > buf.len() {
                break;
            }
            let raw = unsafe { std::ptr::read_unaligned(buf.as_ptr().add(off) as *const fiemap_extent) };
            extents.push(Extent {
                logical: raw.logical,
                physical: raw.physical,
                length: raw.length,
                unknown: raw.flags & FIEMAP_EXTENT_UNKNOWN != 0,
                delalloc: raw.flags & FIEMAP_EXTENT_DELALLOC != 0,
                inline: raw.flags & FIEMAP_EXTENT_DATA_INLINE != 0,
            });
            last = Some(raw);
        }

        match last {
            Some(raw) if raw.flags & FIEMAP_EXTENT_LAST != 0 => break,
            Some(raw) => start = raw.logical + raw.length,
            None => break,
        }
    }

    extents
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileFragInfo {
    pub extent_count: usize,
    pub file_size: u64,
    pub ideal_extents: u64,
    pub degree_of_fragmentation: f64,
    pub fragmentation_pct: f64,
    pub out_of_order_pct: f64,
    pub contiguous_bytes: u64,
}

/// Computes DoF and related metrics for a file from its size and FIEMAP
/// extents. If extents is empty, returns `DoF = 1.0` (spec §4.11 failure
/// semantics: unreadable/unsupported files get an empty-extents, DoF-1.0
/// result rather than an error).
pub fn analyze(file_size: u64, extents: &[Extent]) -> FileFragInfo {
    let ideal_extents = ((file_size + BTRFS_MAX_EXTENT_SIZE - 1) / BTRFS_MAX_EXTENT_SIZE).max(1);

    if extents.is_empty() {
        return FileFragInfo {
            extent_count: 0,
            file_size,
            ideal_extents,
            degree_of_fragmentation: 1.0,
            fragmentation_pct: 0.0,
            out_of_order_pct: 0.0,
            contiguous_bytes: 0,
        };
    }

    let n = extents.len();
    let dof = n as f64 / ideal_extents as f64;

    let mut discontinuities = 0u64;
    let mut backwards = 0u64;
    let mut contiguous_bytes = extents[0].length;

    for pair in extents.windows(2) {
        let prev = pair[0];
        let curr = pair[1];
        if curr.physical != prev.physical + prev.length {
            discontinuities += 1;
            if curr.physical < prev.physical {
                backwards += 1;
            }
        } else {
            contiguous_bytes += curr.length;
        }
    }

    let fragmentation_pct = if n > 1 {
        100.0 * discontinuities as f64 / (n - 1) as f64
    } else {
        0.0
    };
    let out_of_order_pct = if discontinuities > 0 {
        100.0 * backwards as f64 / discontinuities as f64
    } else {
        0.0
    };

    FileFragInfo {
        extent_count: n,
        file_size,
        ideal_extents,
        degree_of_fragmentation: dof,
        fragmentation_pct,
        out_of_order_pct,
        contiguous_bytes,
    }
}

#[derive(Debug, Clone, Default)]
pub struct DofHistogram {
    pub at_one: usize,
    pub one_to_two: usize,
    pub two_to_five: usize,
    pub five_to_ten: usize,
    pub above_ten: usize,
}

impl DofHistogram {
    fn record(&mut self, dof: f64) {
        if dof <= 1.0 {
            self.at_one += 1;
        } else if dof <= 2.0 {
            self.one_to_two += 1;
        } else if dof <= 5.0 {
            self.two_to_five += 1;
        } else if dof <= 10.0 {
            self.five_to_ten += 1;
        } else {
            self.above_ten += 1;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AggregateFragReport {
    pub file_count: usize,
    pub average_dof: f64,
    pub max_dof: f64,
    pub histogram: DofHistogram,
}

/// Walks a directory tree, skipping files that fail to open or don't
/// support FIEMAP (they contribute `DoF = 1.0` silently, per spec §4.11).
pub fn aggregate_directory(root: &Path) -> AggregateFragReport {
    let mut report = AggregateFragReport::default();
    let mut total_dof = 0.0;
    let mut files: Vec<PathBuf> = Vec::new();
    collect_files(root, &mut files);

    for path in &files {
        let size = match std::fs::metadata(path) {
            Ok(m) => m.len(),
            Err(_) => continue,
        };
        let extents = read_extents(path);
        let info = analyze(size, &extents);
        report.file_count += 1;
        total_dof += info.degree_of_fragmentation;
        report.max_dof = report.max_dof.max(info.degree_of_fragmentation);
        report.histogram.record(info.degree_of_fragmentation);
    }

    if report.file_count > 0 {
        report.average_dof = total_dof / report.file_count as f64;
    }
    report
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else if path.is_file() {
            out.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(physical: u64, length: u64) -> Extent {
        Extent {
            logical: 0,
            physical,
            length,
            unknown: false,
            delalloc: false,
            inline: false,
        }
    }

    #[test]
    fn single_contiguous_extent_is_optimal() {
        let info = analyze(128 * 1024 * 1024, &[ext(0, 128 * 1024 * 1024)]);
        assert_eq!(info.degree_of_fragmentation, 1.0);
        assert_eq!(info.fragmentation_pct, 0.0);
        assert_eq!(info.out_of_order_pct, 0.0);
    }

    #[test]
    fn two_contiguous_extents_are_optimal() {
        let size = 256 * 1024 * 1024;
        let extents = vec![ext(0, 128 * 1024 * 1024), ext(128 * 1024 * 1024, 128 * 1024 * 1024)];
        let info = analyze(size, &extents);
        assert_eq!(info.ideal_extents, 2);
        assert_eq!(info.degree_of_fragmentation, 1.0);
        assert_eq!(info.fragmentation_pct, 0.0);
    }

    #[test]
    fn swapped_physical_order_is_fully_fragmented() {
        let size = 256 * 1024 * 1024;
        let extents = vec![ext(128 * 1024 * 1024, 128 * 1024 * 1024), ext(0, 128 * 1024 * 1024)];
        let info = analyze(size, &extents);
        assert_eq!(info.fragmentation_pct, 100.0);
        assert_eq!(info.out_of_order_pct, 100.0);
    }

    #[test]
    fn no_extents_reports_optimal_dof() {
        let info = analyze(1000, &[]);
        assert_eq!(info.degree_of_fragmentation, 1.0);
    }

    #[test]
    fn histogram_buckets_classify_correctly() {
        let mut hist = DofHistogram::default();
        for dof in [1.0, 1.5, 3.0, 7.0, 20.0] {
            hist.record(dof);
        }
        assert_eq!(hist.at_one, 1);
        assert_eq!(hist.one_to_two, 1);
        assert_eq!(hist.two_to_five, 1);
        assert_eq!(hist.five_to_ten, 1);
        assert_eq!(hist.above_ten, 1);
    }
}
