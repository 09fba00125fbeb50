//! Resolves a logical address into a path and a [`SampleType`], composing
//! `LOGICAL_INO` + `INO_LOOKUP` + subvolume path mapping per the algorithm
//! in spec §4.5. Grounded in `oandrew-btdu-rs`'s representative-path
//! selection (shortest path, then lexicographic tiebreak).

use crate::error::EngineError;
use crate::ioctl::IoctlTransport;
use crate::decode::SubvolumePathResolver;

/// Classification of a resolved sample.
///
/// `resolve` below only ever produces `Represented`, `Shared`, `Unresolved`,
/// or `Unreachable`. `Exclusive` is a fifth tag carried in the stats layout
/// for forward compatibility but never assigned by this resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    /// Exactly one resolved path is credited.
    Represented,
    /// Reserved tag, not produced by this resolver.
    Exclusive,
    /// More than one inode shares the address; recorded under the
    /// representative path with this tag instead of `Represented`.
    Shared,
    /// `LOGICAL_INO` found no inodes: free space, or metadata/system chunk.
    Unresolved,
    /// Inodes exist but no path resolves them (orphaned or deleted).
    Unreachable,
}

impl SampleType {
    pub const ALL: [SampleType; 5] = [
        SampleType::Represented,
        SampleType::Exclusive,
        SampleType::Shared,
        SampleType::Unresolved,
        SampleType::Unreachable,
    ];

    pub fn slot(self) -> usize {
        match self {
            SampleType::Represented => 0,
            SampleType::Exclusive => 1,
            SampleType::Shared => 2,
            SampleType::Unresolved => 3,
            SampleType::Unreachable => 4,
        }
    }
}

pub const FREE_PATH: &str = "<free>";
pub const UNREACHABLE_PATH: &str = "<unreachable>";

#[derive(Debug, Clone)]
pub struct ResolvedSample {
    pub path: String,
    pub sample_type: SampleType,
}

/// Chooses one path to credit when an address is shared by multiple
/// inodes: shortest byte length wins, ties broken lexicographically.
fn select_representative(mut paths: Vec<String>) -> String {
    paths.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    paths.into_iter().next().unwrap_or_default()
}

/// Composes `LOGICAL_INO` + subvolume path map + `INO_LOOKUP` into a fully
/// qualified path and a [`SampleType`] for one logical address.
pub fn resolve(
    transport: &IoctlTransport,
    subvols: &SubvolumePathResolver,
    logical_addr: u64,
) -> Result<ResolvedSample, EngineError> {
    let inodes = transport.logical_ino(logical_addr)?;
    if inodes.is_empty() {
        return Ok(ResolvedSample {
            path: FREE_PATH.to_string(),
            sample_type: SampleType::Unresolved,
        });
    }

    let mut paths = Vec::new();
    for inode in &inodes {
        let name = match transport.ino_lookup(inode.root_id, inode.inum) {
            Ok(n) => n,
            Err(_) => continue,
        };
        let subvol_path = subvols.path_for(inode.root_id).unwrap_or("");
        let full = match (subvol_path.is_empty(), name.is_empty()) {
            (true, true) => "/".to_string(),
            (true, false) => format!("/{}", name.trim_start_matches('/')),
            (false, true) => format!("/{}", subvol_path),
            (false, false) => format!("/{}/{}", subvol_path, name.trim_start_matches('/')),
        };
        paths.push(full);
    }

    if paths.is_empty() {
        return Ok(ResolvedSample {
            path: UNREACHABLE_PATH.to_string(),
            sample_type: SampleType::Unreachable,
        });
    }

    let sample_type = if paths.len() == 1 {
        SampleType::Represented
    } else {
        SampleType::Shared
    };

    let representative = select_representative(paths);
    Ok(ResolvedSample {
        path: representative,
        sample_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn representative_prefers_shorter_path() {
        let chosen = select_representative(vec![
            "/x/snap/orig".to_string(),
            "/x/orig".to_string(),
        ]);
        assert_eq!(chosen, "/x/orig");
    }

    #[test]
    fn representative_breaks_ties_lexicographically() {
        let chosen = select_representative(vec!["/b/c".to_string(), "/a/d".to_string()]);
        assert_eq!(chosen, "/a/d");
    }

    #[test]
    fn representative_of_empty_is_empty() {
        assert_eq!(select_representative(Vec::new()), "");
    }
}
