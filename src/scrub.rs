//! Parses the external scrub status file at
//! `/var/lib/btrfs/scrub.status.<fs_uuid>` (spec §4.10, §6). Read-only;
//! this module never starts, stops, or otherwise drives a scrub itself.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubState {
    NeverRun,
    Finished,
    Aborted,
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct ScrubStatus {
    pub state_hint: Option<ScrubState>,
    pub data_bytes_scrubbed: u64,
    pub tree_bytes_scrubbed: u64,
    pub read_errors: u64,
    pub csum_errors: u64,
    pub verify_errors: u64,
    pub uncorrectable_errors: u64,
    pub corrected_errors: u64,
    pub last_physical: u64,
    pub duration_secs: u64,
}

/// One device's parsed line from the status file.
#[derive(Debug, Clone, Default)]
struct DeviceLine {
    fields: HashMap<String, String>,
}

impl DeviceLine {
    fn u64(&self, key: &str) -> u64 {
        self.fields.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }

    fn bool(&self, key: &str) -> bool {
        self.fields.get(key).map(|v| v == "1" || v == "true").unwrap_or(false)
    }
}

/// Reads and sums scrub counters across every device line in the status
/// file. A missing file means scrub has never run on this filesystem.
pub fn read_status(fs_uuid: &str) -> ScrubStatus {
    let path = format!("/var/lib/btrfs/scrub.status.{}", fs_uuid);
    read_status_from(Path::new(&path))
}

/// Testable entry point taking an explicit path instead of deriving one
/// from a uuid.
pub fn read_status_from(path: &Path) -> ScrubStatus {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => {
            return ScrubStatus {
                state_hint: Some(ScrubState::NeverRun),
                ..Default::default()
            }
        }
    };
    parse_status(&contents)
}

fn parse_status(contents: &str) -> ScrubStatus {
    let mut lines = contents.lines();
    match lines.next() {
        Some(header) if header.trim() == "scrub status:1" => {}
        _ => {
            return ScrubStatus {
                state_hint: Some(ScrubState::Unknown),
                ..Default::default()
            }
        }
    }

    let mut devices = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = HashMap::new();
        for pair in line.split('|') {
            if let Some((k, v)) = pair.split_once(':') {
                fields.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
        devices.push(DeviceLine { fields });
    }

    if devices.is_empty() {
        return ScrubStatus {
            state_hint: Some(ScrubState::Unknown),
            ..Default::default()
        };
    }

    let mut status = ScrubStatus::default();
    let mut all_finished = true;
    let mut any_aborted = false;

    for dev in &devices {
        status.data_bytes_scrubbed += dev.u64("data_bytes_scrubbed");
        status.tree_bytes_scrubbed += dev.u64("tree_bytes_scrubbed");
        status.read_errors += dev.u64("read_errors");
        status.csum_errors += dev.u64("csum_errors");
        status.verify_errors += dev.u64("verify_errors");
        status.uncorrectable_errors += dev.u64("uncorrectable_errors");
        status.corrected_errors += dev.u64("corrected_errors");
        status.last_physical = status.last_physical.max(dev.u64("last_physical"));
        status.duration_secs = status.duration_secs.max(dev.u64("duration"));

        let finished = dev.bool("finished");
        let canceled = dev.bool("canceled");
        if !finished {
            all_finished = false;
        }
        if canceled && !finished {
            any_aborted = true;
        }
    }

    status.state_hint = Some(if all_finished {
        ScrubState::Finished
    } else if any_aborted {
        ScrubState::Aborted
    } else {
        ScrubState::Unknown
    });

    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_never_run() {
        let status = read_status_from(Path::new("/nonexistent/scrub.status.xxx"));
        assert_eq!(status.state_hint, Some(ScrubState::NeverRun));
    }

    #[test]
    fn all_devices_finished_sums_counters() {
        let contents = "scrub status:1\n\
            data_bytes_scrubbed:100|tree_bytes_scrubbed:10|read_errors:0|csum_errors:0|verify_errors:0|uncorrectable_errors:0|corrected_errors:0|last_physical:500|duration:10|canceled:0|finished:1\n\
            data_bytes_scrubbed:200|tree_bytes_scrubbed:20|read_errors:1|csum_errors:0|verify_errors:0|uncorrectable_errors:0|corrected_errors:1|last_physical:700|duration:15|canceled:0|finished:1\n";
        let status = parse_status(contents);
        assert_eq!(status.state_hint, Some(ScrubState::Finished));
        assert_eq!(status.data_bytes_scrubbed, 300);
        assert_eq!(status.read_errors, 1);
        assert_eq!(status.last_physical, 700);
        assert_eq!(status.duration_secs, 15);
    }

    #[test]
    fn canceled_device_reports_aborted() {
        let contents = "scrub status:1\n\
            data_bytes_scrubbed:100|canceled:1|finished:0|last_physical:100|duration:5\n";
        let status = parse_status(contents);
        assert_eq!(status.state_hint, Some(ScrubState::Aborted));
    }

    #[test]
    fn incomplete_without_cancel_is_unknown() {
        let contents = "scrub status:1\n\
            data_bytes_scrubbed:100|canceled:0|finished:0|last_physical:100|duration:5\n";
        let status = parse_status(contents);
        assert_eq!(status.state_hint, Some(ScrubState::Unknown));
    }
}
