//! The list of allocated data chunks a sampling run draws logical addresses
//! from, and the mapping from a uniformly drawn offset back to a chunk.
//!
//! Grounded in the `btdu`-style sampler's `total_chunk_length` + linear scan
//! (reference: `oandrew-btdu-rs`'s `btrfs_sample`), generalized to binary
//! search over a prefix-sum table once the chunk count makes a linear scan
//! worth skipping (spec §4.4).

use crate::decode::decode_chunk_item;
use crate::error::EngineError;
use crate::ioctl::{IoctlTransport, SearchItem, SearchKey};
use crate::structures::{BtrfsItemType, BTRFS_BLOCK_GROUP_DATA, BTRFS_CHUNK_TREE_OBJECTID};

/// Above this many chunks, `sample_position` switches from a linear scan to
/// a binary search over the prefix-sum table.
const LINEAR_SCAN_THRESHOLD: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct Chunk {
    pub logical_offset: u64,
    pub length: u64,
    pub flags: u64,
}

/// Allocated data chunks, sorted by logical offset, with a running prefix
/// sum of lengths so a logical byte position can be mapped back to its
/// containing chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkIndex {
    chunks: Vec<Chunk>,
    prefix_sums: Vec<u64>,
    pub total_size: u64,
}

impl ChunkIndex {
    /// Walks the chunk tree once, keeping only chunks tagged
    /// `BTRFS_BLOCK_GROUP_DATA`.
    pub fn build(transport: &IoctlTransport) -> Result<Self, EngineError> {
        let mut chunks = Vec::new();
        transport.tree_search(
            SearchKey::by_type(BTRFS_CHUNK_TREE_OBJECTID, BtrfsItemType::CHUNK_ITEM as u8),
            |item: &SearchItem| {
                if let Ok(rec) = decode_chunk_item(&item.key, &item.payload) {
                    if rec.flags & BTRFS_BLOCK_GROUP_DATA != 0 {
                        chunks.push(Chunk {
                            logical_offset: rec.logical_offset,
                            length: rec.length,
                            flags: rec.flags,
                        });
                    }
                }
                true
            },
        )?;

        chunks.sort_by_key(|c| c.logical_offset);

        let mut prefix_sums = Vec::with_capacity(chunks.len());
        let mut running = 0u64;
        for c in &chunks {
            running += c.length;
            more_asserts::assert_ge!(running, c.length);
            prefix_sums.push(running);
        }

        Ok(ChunkIndex {
            chunks,
            prefix_sums,
            total_size: running,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Given a position `p` drawn uniformly from `[0, total_size)`, returns
    /// the chunk containing it and the logical address within that chunk.
    pub fn sample_position(&self, p: u64) -> Option<(Chunk, u64)> {
        if self.chunks.is_empty() || p >= self.total_size {
            return None;
        }

        let idx = if self.chunks.len() <= LINEAR_SCAN_THRESHOLD {
            self.prefix_sums.iter().position(|&cum| p < cum)?
        } else {
            self.prefix_sums.partition_point(|&cum| cum <= p)
        };

        let chunk = self.chunks[idx];
        let chunk_start = self.prefix_sums[idx] - chunk.length;
        let logical_addr = chunk.logical_offset + (p - chunk_start);
        Some((chunk, logical_addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(chunks: Vec<(u64, u64)>) -> ChunkIndex {
        let mut running = 0u64;
        let mut prefix_sums = Vec::new();
        let chunks: Vec<Chunk> = chunks
            .into_iter()
            .map(|(off, len)| {
                running += len;
                prefix_sums.push(running);
                Chunk {
                    logical_offset: off,
                    length: len,
                    flags: BTRFS_BLOCK_GROUP_DATA,
                }
            })
            .collect();
        ChunkIndex {
            chunks,
            prefix_sums,
            total_size: running,
        }
    }

    #[test]
    fn empty_index_samples_nothing() {
        let index = ChunkIndex::default();
        assert!(index.is_empty());
        assert_eq!(index.sample_position(0), None);
    }

    #[test]
    fn sample_maps_into_correct_chunk() {
        let index = idx(vec![(1_000_000, 100), (2_000_000, 200)]);
        let (chunk, addr) = index.sample_position(50).unwrap();
        assert_eq!(chunk.logical_offset, 1_000_000);
        assert_eq!(addr, 1_000_050);

        let (chunk, addr) = index.sample_position(150).unwrap();
        assert_eq!(chunk.logical_offset, 2_000_000);
        assert_eq!(addr, 2_000_050);
    }

    #[test]
    fn sample_out_of_range_is_none() {
        let index = idx(vec![(0, 100)]);
        assert_eq!(index.sample_position(100), None);
        assert_eq!(index.sample_position(1000), None);
    }

    #[test]
    fn binary_search_path_agrees_with_linear_for_many_chunks() {
        let chunks: Vec<(u64, u64)> = (0..200).map(|i| (i * 1_000, 500)).collect();
        let index = idx(chunks);
        assert_eq!(index.chunks.len(), 200);
        let (chunk, addr) = index.sample_position(199 * 500 + 10).unwrap();
        assert_eq!(chunk.logical_offset, 199_000);
        assert_eq!(addr, 199_010);
    }
}
