//! Answers `usage_tree(fs_path, path, sort, limit)` by reading a session's
//! accumulated stats (spec §4.7). Read-only: never touches the sampler.

use crate::session::{PathStats, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Size,
    Samples,
    Name,
}

#[derive(Debug, Clone)]
pub struct ChildUsage {
    pub name: String,
    pub full_path: String,
    pub samples: u64,
    pub estimated_size: u64,
    pub percentage: f64,
    pub has_children: bool,
}

#[derive(Debug, Clone)]
pub struct UsageTree {
    pub children: Vec<ChildUsage>,
    pub current_path: String,
    pub total_samples: u64,
    pub total_size: u64,
}

pub const DEFAULT_LIMIT: usize = 100;

pub fn usage_tree(
    session: &Session,
    path: &str,
    sort_by: SortBy,
    sort_desc: bool,
    limit: Option<usize>,
) -> UsageTree {
    let total_samples = session.sample_count();
    let total_size = session.total_size();
    let limit = limit.unwrap_or(DEFAULT_LIMIT);

    let mut children: Vec<(String, String, PathStats)> =
        session.get_children(path).unwrap_or_default();

    children.sort_by(|a, b| {
        let ord = match sort_by {
            SortBy::Size => estimate_size(&a.2, total_size, total_samples)
                .cmp(&estimate_size(&b.2, total_size, total_samples)),
            SortBy::Samples => a.2.total_samples().cmp(&b.2.total_samples()),
            SortBy::Name => a.0.cmp(&b.0),
        };
        if sort_desc {
            ord.reverse()
        } else {
            ord
        }
    });
    children.truncate(limit);

    let children = children
        .into_iter()
        .map(|(name, full_path, stats)| {
            let samples = stats.total_samples();
            let estimated_size = estimate_size(&stats, total_size, total_samples);
            let percentage = if total_size > 0 {
                100.0 * estimated_size as f64 / total_size as f64
            } else {
                0.0
            };
            let has_children = !session.get_children(&full_path).unwrap_or_default().is_empty();
            ChildUsage {
                name,
                full_path,
                samples,
                estimated_size,
                percentage,
                has_children,
            }
        })
        .collect();

    UsageTree {
        children,
        current_path: path.to_string(),
        total_samples,
        total_size,
    }
}

fn estimate_size(stats: &PathStats, total_size: u64, total_samples: u64) -> u64 {
    if total_samples == 0 {
        return 0;
    }
    (total_size as u128 * stats.total_samples() as u128 / total_samples as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_resolver::SampleType;
    use crate::session::{open_store, SampleRecord};
    use std::path::Path;
    use std::time::Duration;

    fn fixture_session(dir: &Path) -> Session {
        let db = open_store(dir).unwrap();
        Session::open(db, Path::new("/mnt/x"), 1_000_000).unwrap()
    }

    #[test]
    fn empty_session_yields_empty_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let session = fixture_session(tmp.path());
        let tree = usage_tree(&session, "/", SortBy::Size, true, None);
        assert!(tree.children.is_empty());
        assert_eq!(tree.total_samples, 0);
    }

    #[test]
    fn size_descending_sorts_bigger_child_first() {
        let tmp = tempfile::tempdir().unwrap();
        let session = fixture_session(tmp.path());
        session
            .add_sample_batch(&[
                SampleRecord {
                    path: "/small".to_string(),
                    sample_type: SampleType::Represented,
                    duration: Duration::from_millis(1),
                },
                SampleRecord {
                    path: "/big".to_string(),
                    sample_type: SampleType::Represented,
                    duration: Duration::from_millis(1),
                },
                SampleRecord {
                    path: "/big".to_string(),
                    sample_type: SampleType::Represented,
                    duration: Duration::from_millis(1),
                },
            ])
            .unwrap();
        session.flush().unwrap();

        let tree = usage_tree(&session, "/", SortBy::Size, true, None);
        assert_eq!(tree.children[0].name, "big");
        assert_eq!(tree.children[0].samples, 2);
    }

    #[test]
    fn limit_truncates_children() {
        let tmp = tempfile::tempdir().unwrap();
        let session = fixture_session(tmp.path());
        let records: Vec<SampleRecord> = (0..5)
            .map(|i| SampleRecord {
                path: format!("/f{}", i),
                sample_type: SampleType::Represented,
                duration: Duration::from_micros(1),
            })
            .collect();
        session.add_sample_batch(&records).unwrap();
        session.flush().unwrap();

        let tree = usage_tree(&session, "/", SortBy::Name, false, Some(2));
        assert_eq!(tree.children.len(), 2);
    }
}
