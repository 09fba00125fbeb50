//! Read-only parsers for `/sys/fs/btrfs/<uuid>/...` key-value text files
//! (spec §6). No writes; the engine never touches sysfs knobs.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

fn parse_kv_lines(contents: &str) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        // Each file under devinfo/allocation is one bare key per file in
        // real sysfs, but the engine also accepts a combined "key value"
        // or "key: value" form for fixture-driven tests.
        if let Some((k, v)) = line.split_once(':').or_else(|| line.split_once(' ')) {
            if let Ok(n) = v.trim().parse::<u64>() {
                out.insert(k.trim().to_string(), n);
            }
        } else if let Ok(n) = line.parse::<u64>() {
            out.insert("value".to_string(), n);
        }
    }
    out
}

fn read_dir_as_kv(dir: &Path) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return out,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Ok(contents) = fs::read_to_string(&path) {
            if let Ok(n) = contents.trim().parse::<u64>() {
                out.insert(name.to_string(), n);
            }
        }
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct DeviceErrorStats {
    pub fields: HashMap<String, u64>,
}

pub fn read_device_error_stats(fs_uuid: &str, devid: u64) -> DeviceErrorStats {
    let path = PathBuf::from(format!(
        "/sys/fs/btrfs/{}/devinfo/{}/error_stats",
        fs_uuid, devid
    ));
    read_device_error_stats_from(&path)
}

pub fn read_device_error_stats_from(path: &Path) -> DeviceErrorStats {
    let fields = match fs::read_to_string(path) {
        Ok(contents) => parse_kv_lines(&contents),
        Err(_) => HashMap::new(),
    };
    DeviceErrorStats { fields }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    Data,
    Metadata,
    System,
}

impl AllocationKind {
    fn dirname(self) -> &'static str {
        match self {
            AllocationKind::Data => "data",
            AllocationKind::Metadata => "metadata",
            AllocationKind::System => "system",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AllocationStats {
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub disk_total: u64,
    pub disk_used: u64,
}

pub fn read_allocation_stats(fs_uuid: &str, kind: AllocationKind) -> AllocationStats {
    let dir = PathBuf::from(format!(
        "/sys/fs/btrfs/{}/allocation/{}",
        fs_uuid,
        kind.dirname()
    ));
    read_allocation_stats_from(&dir)
}

pub fn read_allocation_stats_from(dir: &Path) -> AllocationStats {
    let kv = read_dir_as_kv(dir);
    AllocationStats {
        total_bytes: kv.get("total_bytes").copied().unwrap_or(0),
        bytes_used: kv.get("bytes_used").copied().unwrap_or(0),
        disk_total: kv.get("disk_total").copied().unwrap_or(0),
        disk_used: kv.get("disk_used").copied().unwrap_or(0),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalReserve {
    pub size: u64,
    pub reserved: u64,
}

pub fn read_global_reserve(fs_uuid: &str) -> GlobalReserve {
    let dir = PathBuf::from(format!("/sys/fs/btrfs/{}/allocation", fs_uuid));
    read_global_reserve_from(&dir)
}

pub fn read_global_reserve_from(dir: &Path) -> GlobalReserve {
    let kv = read_dir_as_kv(dir);
    GlobalReserve {
        size: kv.get("global_rsv_size").copied().unwrap_or(0),
        reserved: kv.get("global_rsv_reserved").copied().unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_error_stats_file_is_empty() {
        let stats = read_device_error_stats_from(Path::new("/nonexistent/error_stats"));
        assert!(stats.fields.is_empty());
    }

    #[test]
    fn parses_colon_separated_error_stats() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file(), "write_errs: 1\nread_errs: 0\ncorruption_errs: 2").unwrap();
        let stats = read_device_error_stats_from(tmp.path());
        assert_eq!(stats.fields.get("write_errs"), Some(&1));
        assert_eq!(stats.fields.get("corruption_errs"), Some(&2));
    }

    #[test]
    fn reads_allocation_dir_as_per_file_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("total_bytes"), "1000\n").unwrap();
        std::fs::write(tmp.path().join("bytes_used"), "400\n").unwrap();
        let stats = read_allocation_stats_from(tmp.path());
        assert_eq!(stats.total_bytes, 1000);
        assert_eq!(stats.bytes_used, 400);
    }
}
