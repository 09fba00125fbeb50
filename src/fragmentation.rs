//! Per-device free-space and allocation analysis (spec §4.8): block-group
//! usage lookup, block-map construction, adaptive free-space classification,
//! and heat-map rendering.

use std::collections::HashMap;

use crate::decode::{decode_block_group_item, decode_chunk_item, decode_dev_extent};
use crate::error::EngineError;
use crate::ioctl::{IoctlTransport, SearchItem, SearchKey};
use crate::structures::{
    BtrfsItemType, BTRFS_BLOCK_GROUP_TYPE_MASK, BTRFS_CHUNK_TREE_OBJECTID, BTRFS_DEV_TREE_OBJECTID,
    BTRFS_EXTENT_TREE_OBJECTID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockGroupRole {
    Data,
    Metadata,
    System,
    Mixed,
}

fn role_from_flags(flags: u64) -> BlockGroupRole {
    let masked = flags & BTRFS_BLOCK_GROUP_TYPE_MASK;
    let data = masked & crate::structures::BTRFS_BLOCK_GROUP_DATA != 0;
    let metadata = masked & crate::structures::BTRFS_BLOCK_GROUP_METADATA != 0;
    let system = masked & crate::structures::BTRFS_BLOCK_GROUP_SYSTEM != 0;
    match (data, metadata, system) {
        (true, false, false) => BlockGroupRole::Data,
        (false, true, false) => BlockGroupRole::Metadata,
        (false, false, true) => BlockGroupRole::System,
        _ => BlockGroupRole::Mixed,
    }
}

#[derive(Debug, Clone, Copy)]
pub enum BlockMapEntry {
    Allocated {
        offset: u64,
        length: u64,
        chunk_offset: u64,
        role: BlockGroupRole,
        used_bytes: u64,
    },
    Free {
        offset: u64,
        length: u64,
    },
}

impl BlockMapEntry {
    pub fn offset(&self) -> u64 {
        match self {
            BlockMapEntry::Allocated { offset, .. } => *offset,
            BlockMapEntry::Free { offset, .. } => *offset,
        }
    }

    pub fn length(&self) -> u64 {
        match self {
            BlockMapEntry::Allocated { length, .. } => *length,
            BlockMapEntry::Free { length, .. } => *length,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockMap {
    pub devid: u64,
    pub device_total_bytes: u64,
    pub entries: Vec<BlockMapEntry>,
}

struct ChunkMeta {
    flags: u64,
}

/// `logical_offset → used_bytes` from a single `BLOCK_GROUP_ITEM` search
/// over the extent tree (spec §4.8).
pub fn block_group_usage(transport: &IoctlTransport) -> Result<HashMap<u64, u64>, EngineError> {
    let mut usage = HashMap::new();
    transport.tree_search(
        SearchKey::by_type(BTRFS_EXTENT_TREE_OBJECTID, BtrfsItemType::BLOCK_GROUP_ITEM as u8),
        |item: &SearchItem| {
            if let Ok(bg) = decode_block_group_item(&item.key, &item.payload) {
                usage.insert(bg.logical_offset, bg.used);
            }
            true
        },
    )?;
    Ok(usage)
}

fn chunk_flags_by_offset(transport: &IoctlTransport) -> Result<HashMap<u64, ChunkMeta>, EngineError> {
    let mut out = HashMap::new();
    transport.tree_search(
        SearchKey::by_type(BTRFS_CHUNK_TREE_OBJECTID, BtrfsItemType::CHUNK_ITEM as u8),
        |item: &SearchItem| {
            if let Ok(chunk) = decode_chunk_item(&item.key, &item.payload) {
                out.insert(chunk.logical_offset, ChunkMeta { flags: chunk.flags });
            }
            true
        },
    )?;
    Ok(out)
}

/// Builds the block map for one device: sorted device extents, with Free
/// entries filling every gap and a trailing Free to `device_total_bytes`
/// (spec §4.8). Entries cover the device exactly once with no gaps.
pub fn build_block_map(
    transport: &IoctlTransport,
    devid: u64,
    device_total_bytes: u64,
) -> Result<BlockMap, EngineError> {
    let chunk_flags = chunk_flags_by_offset(transport)?;
    let bg_usage = block_group_usage(transport)?;

    let mut extents = Vec::new();
    transport.tree_search(
        SearchKey::by_objid_and_type(BTRFS_DEV_TREE_OBJECTID, devid, BtrfsItemType::DEV_EXTENT as u8),
        |item: &SearchItem| {
            if let Ok(ext) = decode_dev_extent(&item.key, &item.payload) {
                if ext.devid == devid {
                    extents.push(ext);
                }
            }
            true
        },
    )?;
    extents.sort_by_key(|e| e.physical_offset);

    let mut entries = Vec::with_capacity(extents.len() * 2);
    let mut cursor = 0u64;
    for ext in &extents {
        if ext.physical_offset > cursor {
            entries.push(BlockMapEntry::Free {
                offset: cursor,
                length: ext.physical_offset - cursor,
            });
        }
        let flags = chunk_flags.get(&ext.chunk_offset).map(|m| m.flags).unwrap_or(0);
        let used = bg_usage.get(&ext.chunk_offset).copied().unwrap_or(0);
        entries.push(BlockMapEntry::Allocated {
            offset: ext.physical_offset,
            length: ext.length,
            chunk_offset: ext.chunk_offset,
            role: role_from_flags(flags),
            used_bytes: used,
        });
        cursor = ext.physical_offset + ext.length;
    }
    if cursor < device_total_bytes {
        entries.push(BlockMapEntry::Free {
            offset: cursor,
            length: device_total_bytes - cursor,
        });
    }

    Ok(BlockMap {
        devid,
        device_total_bytes,
        entries,
    })
}

#[derive(Debug, Clone, Default)]
pub struct BlockMapStats {
    pub allocated_bytes: u64,
    pub free_bytes: u64,
    pub extent_count: usize,
    pub free_region_count: usize,
    pub largest_free_region: u64,
    pub smallest_free_region: u64,
    pub average_free_region: f64,
    pub allocated_by_role: HashMap<BlockGroupRole, u64>,
}

pub fn compute_stats(map: &BlockMap) -> BlockMapStats {
    let mut stats = BlockMapStats {
        smallest_free_region: u64::MAX,
        ..Default::default()
    };
    let mut free_total = 0u64;
    let mut free_count = 0usize;

    for entry in &map.entries {
        match entry {
            BlockMapEntry::Allocated { length, role, .. } => {
                stats.allocated_bytes += length;
                stats.extent_count += 1;
                *stats.allocated_by_role.entry(*role).or_insert(0) += length;
            }
            BlockMapEntry::Free { length, .. } => {
                stats.free_bytes += length;
                stats.free_region_count += 1;
                free_total += length;
                free_count += 1;
                stats.largest_free_region = stats.largest_free_region.max(*length);
                stats.smallest_free_region = stats.smallest_free_region.min(*length);
            }
        }
    }

    if free_count == 0 {
        stats.smallest_free_region = 0;
    } else {
        stats.average_free_region = free_total as f64 / free_count as f64;
    }
    stats
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeSpaceClass {
    Tiny,
    Small,
    Large,
}

#[derive(Debug, Clone, Default)]
pub struct FragmentationReport {
    pub tiny_pct: f64,
    pub small_pct: f64,
    pub large_pct: f64,
    pub unusable_score: f64,
    pub scatter_score: f64,
}

pub fn classify_free_space(map: &BlockMap, stats: &BlockMapStats) -> FragmentationReport {
    let mut free_lengths: Vec<u64> = map
        .entries
        .iter()
        .filter_map(|e| match e {
            BlockMapEntry::Free { length, .. } => Some(*length),
            _ => None,
        })
        .collect();
    if free_lengths.is_empty() {
        return FragmentationReport::default();
    }
    free_lengths.sort_unstable();
    let median = free_lengths[free_lengths.len() / 2] as f64;
    let tiny_threshold = median / 10.0;
    let small_threshold = median / 2.0;

    let mut tiny_bytes = 0u64;
    let mut small_bytes = 0u64;
    let mut large_bytes = 0u64;
    for &len in &free_lengths {
        let class = classify_one(len as f64, tiny_threshold, small_threshold);
        match class {
            FreeSpaceClass::Tiny => tiny_bytes += len,
            FreeSpaceClass::Small => small_bytes += len,
            FreeSpaceClass::Large => large_bytes += len,
        }
    }

    let total_free = stats.free_bytes.max(1) as f64;
    let tiny_pct = 100.0 * tiny_bytes as f64 / total_free;
    let small_pct = 100.0 * small_bytes as f64 / total_free;
    let large_pct = 100.0 * large_bytes as f64 / total_free;

    let unusable_score = (tiny_pct * 1.0 + small_pct * 0.5).min(100.0);
    let extent_count = stats.extent_count.max(1) as f64;
    let scatter_score = (100.0 * stats.free_region_count as f64 / extent_count).min(100.0);

    let _ = large_bytes;
    FragmentationReport {
        tiny_pct,
        small_pct,
        large_pct,
        unusable_score,
        scatter_score,
    }
}

fn classify_one(len: f64, tiny_threshold: f64, small_threshold: f64) -> FreeSpaceClass {
    if len <= tiny_threshold {
        FreeSpaceClass::Tiny
    } else if len <= small_threshold {
        FreeSpaceClass::Small
    } else {
        FreeSpaceClass::Large
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FragmentationBand {
    Healthy,
    Moderate,
    Fragmented,
    SeverelyFragmented,
}

pub fn band(score: f64) -> FragmentationBand {
    if score >= 80.0 {
        FragmentationBand::SeverelyFragmented
    } else if score >= 50.0 {
        FragmentationBand::Fragmented
    } else if score >= 20.0 {
        FragmentationBand::Moderate
    } else {
        FragmentationBand::Healthy
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeatMapCell {
    pub allocated_bytes: u64,
    pub free_bytes: u64,
    pub utilization: f64,
}

/// Partitions `[0, device_total_bytes)` into `resolution` equal cells and
/// accumulates each block-map entry's overlap into the touched cells.
/// The sum over cells of `allocated + free` equals `device_total_bytes`
/// modulo integer division of cell boundaries (spec §4.8).
pub fn heat_map(map: &BlockMap, resolution: usize) -> Vec<HeatMapCell> {
    let resolution = resolution.max(1);
    let mut cells = vec![HeatMapCell::default(); resolution];
    if map.device_total_bytes == 0 {
        return cells;
    }
    let cell_size = map.device_total_bytes as f64 / resolution as f64;

    for entry in &map.entries {
        let start = entry.offset();
        let end = entry.offset() + entry.length();
        let first_cell = (start as f64 / cell_size) as usize;
        let last_cell = (((end.saturating_sub(1)) as f64 / cell_size) as usize).min(resolution - 1);

        for cell_idx in first_cell.min(resolution - 1)..=last_cell {
            let cell_start = (cell_idx as f64 * cell_size) as u64;
            let cell_end = (((cell_idx + 1) as f64 * cell_size) as u64).min(map.device_total_bytes);
            let overlap_start = start.max(cell_start);
            let overlap_end = end.min(cell_end);
            if overlap_end <= overlap_start {
                continue;
            }
            let overlap = overlap_end - overlap_start;
            match entry {
                BlockMapEntry::Allocated { .. } => cells[cell_idx].allocated_bytes += overlap,
                BlockMapEntry::Free { .. } => cells[cell_idx].free_bytes += overlap,
            }
        }
    }

    for cell in &mut cells {
        let total = cell.allocated_bytes + cell.free_bytes;
        cell.utilization = if total > 0 {
            cell.allocated_bytes as f64 / total as f64
        } else {
            0.0
        };
    }
    cells
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_map() -> BlockMap {
        BlockMap {
            devid: 1,
            device_total_bytes: 1000,
            entries: vec![
                BlockMapEntry::Allocated {
                    offset: 0,
                    length: 100,
                    chunk_offset: 10,
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
                    chunk_offset: 20,
                    role: BlockGroupRole::Data,
                    used_bytes: 50,
                },
                BlockMapEntry::Free {
                    offset: 400,
                    length: 600,
                },
            ],
        }
    }

    #[test]
    fn block_map_covers_device_exactly() {
        let map = fixture_map();
        let total: u64 = map.entries.iter().map(|e| e.length()).sum();
        assert_eq!(total, map.device_total_bytes);
    }

    #[test]
    fn stats_count_allocated_and_free() {
        let map = fixture_map();
        let stats = compute_stats(&map);
        assert_eq!(stats.allocated_bytes, 200);
        assert_eq!(stats.free_bytes, 800);
        assert_eq!(stats.extent_count, 2);
        assert_eq!(stats.free_region_count, 2);
        assert_eq!(stats.largest_free_region, 600);
        assert_eq!(stats.smallest_free_region, 200);
    }

    #[test]
    fn heat_map_sums_to_device_total() {
        let map = fixture_map();
        let cells = heat_map(&map, 10);
        let total: u64 = cells.iter().map(|c| c.allocated_bytes + c.free_bytes).sum();
        assert_eq!(total, map.device_total_bytes);
    }

    #[test]
    fn more_small_free_regions_raises_unusable_score() {
        let healthy = BlockMap {
            devid: 1,
            device_total_bytes: 1000,
            entries: vec![BlockMapEntry::Free {
                offset: 0,
                length: 1000,
            }],
        };
        let fragmented = BlockMap {
            devid: 1,
            device_total_bytes: 1000,
            entries: (0..20)
                .flat_map(|i| {
                    vec![
                        BlockMapEntry::Allocated {
                            offset: i * 50,
                            length: 40,
                            chunk_offset: i,
                            role: BlockGroupRole::Data,
                            used_bytes: 40,
                        },
                        BlockMapEntry::Free {
                            offset: i * 50 + 40,
                            length: 10,
                        },
                    ]
                })
                .collect(),
        };

        let healthy_stats = compute_stats(&healthy);
        let fragmented_stats = compute_stats(&fragmented);
        let healthy_report = classify_free_space(&healthy, &healthy_stats);
        let fragmented_report = classify_free_space(&fragmented, &fragmented_stats);
        assert!(fragmented_report.unusable_score >= healthy_report.unusable_score);
    }
}
