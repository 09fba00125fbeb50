//! Decoders from raw item payload bytes (as handed back by [`crate::ioctl`])
//! into typed records, plus subvolume path resolution built on top of
//! `ROOT_BACKREF` items.
//!
//! Every decoder here takes `&[u8]` and returns `Result<_, EngineError>`,
//! rejecting payloads shorter than the fixed portion of the struct it reads.
//! None of them copy more than they need, and none of them trust `len` fields
//! embedded in the payload without bounds-checking them first.

use std::collections::HashMap;

use crate::error::EngineError;
use crate::ioctl::{IoctlTransport, SearchItem, SearchKey};
use crate::structures::*;

fn read_struct<T: Copy>(buf: &[u8], item_type: &'static str) -> Result<T, EngineError> {
    if buf.len() < std::mem::size_of::<T>() {
        return Err(EngineError::DecodeFailed {
            item_type,
            length: buf.len(),
        });
    }
    // SAFETY: all structs passed in are `#[repr(C, packed)]` plain byte
    // layouts with no padding or pointers, and we've checked `buf` is at
    // least `size_of::<T>()` bytes.
    Ok(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) })
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkRecord {
    pub logical_offset: u64,
    pub length: u64,
    pub flags: u64,
    pub num_stripes: u16,
}

pub fn decode_chunk_item(key: &BtrfsDiskKey, payload: &[u8]) -> Result<ChunkRecord, EngineError> {
    let chunk: btrfs_chunk = read_struct(payload, "chunk_item")?;
    Ok(ChunkRecord {
        logical_offset: key.offset,
        length: chunk.length,
        flags: chunk.r#type,
        num_stripes: chunk.num_stripes,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct DevExtentRecord {
    pub devid: u64,
    pub physical_offset: u64,
    pub length: u64,
    pub chunk_offset: u64,
}

pub fn decode_dev_extent(key: &BtrfsDiskKey, payload: &[u8]) -> Result<DevExtentRecord, EngineError> {
    let ext: btrfs_dev_extent = read_struct(payload, "dev_extent")?;
    Ok(DevExtentRecord {
        devid: key.objectid,
        physical_offset: key.offset,
        length: ext.length,
        chunk_offset: ext.chunk_offset,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct BlockGroupRecord {
    pub logical_offset: u64,
    pub length: u64,
    pub used: u64,
    pub flags: u64,
}

pub fn decode_block_group_item(
    key: &BtrfsDiskKey,
    payload: &[u8],
) -> Result<BlockGroupRecord, EngineError> {
    let bg: btrfs_block_group_item = read_struct(payload, "block_group_item")?;
    Ok(BlockGroupRecord {
        logical_offset: key.objectid,
        length: key.offset,
        used: bg.used,
        flags: bg.flags,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct DevItemRecord {
    pub devid: u64,
    pub total_bytes: u64,
    pub bytes_used: u64,
}

pub fn decode_dev_item(payload: &[u8]) -> Result<DevItemRecord, EngineError> {
    let dev: btrfs_dev_item = read_struct(payload, "dev_item")?;
    Ok(DevItemRecord {
        devid: dev.devid,
        total_bytes: dev.total_bytes,
        bytes_used: dev.bytes_used,
    })
}

#[derive(Debug, Clone)]
pub struct RootItemRecord {
    pub root_id: u64,
    pub dirid: u64,
    pub bytes_used: u64,
    pub flags: u64,
}

/// Decodes a `ROOT_ITEM` payload, tolerating the legacy 239-byte layout that
/// predates the uuid/timestamp tail (spec §4.2).
pub fn decode_root_item(key: &BtrfsDiskKey, payload: &[u8]) -> Result<RootItemRecord, EngineError> {
    if payload.len() < BTRFS_ROOT_ITEM_MIN_SIZE {
        return Err(EngineError::DecodeFailed {
            item_type: "root_item",
            length: payload.len(),
        });
    }
    let inode: btrfs_inode_item = read_struct(payload, "root_item.inode")?;
    let dirid_off = std::mem::size_of::<btrfs_inode_item>() + 8;
    let bytes_used_off = dirid_off + 8 + 8 + 8;
    let flags_off = bytes_used_off + 8 + 8;
    let dirid = u64::from_le_bytes(payload[dirid_off..dirid_off + 8].try_into().unwrap());
    let bytes_used =
        u64::from_le_bytes(payload[bytes_used_off..bytes_used_off + 8].try_into().unwrap());
    let flags = u64::from_le_bytes(payload[flags_off..flags_off + 8].try_into().unwrap());
    let _ = inode;
    Ok(RootItemRecord {
        root_id: key.objectid,
        dirid,
        bytes_used,
        flags,
    })
}

#[derive(Debug, Clone)]
pub struct RootBackrefRecord {
    pub child_root_id: u64,
    pub parent_root_id: u64,
    pub parent_dirid: u64,
    pub name: String,
}

/// Decodes a `ROOT_BACKREF` item: fixed head plus a `name_len`-byte name.
/// `key.objectid` is the child subvolume's root id; `key.offset` is the
/// parent's root id.
pub fn decode_root_backref(
    key: &BtrfsDiskKey,
    payload: &[u8],
) -> Result<RootBackrefRecord, EngineError> {
    let head: btrfs_root_ref = read_struct(payload, "root_backref")?;
    let head_size = std::mem::size_of::<btrfs_root_ref>();
    let name_len = head.name_len as usize;
    if payload.len() < head_size + name_len {
        return Err(EngineError::DecodeFailed {
            item_type: "root_backref.name",
            length: payload.len(),
        });
    }
    let name =
        String::from_utf8_lossy(&payload[head_size..head_size + name_len]).into_owned();
    Ok(RootBackrefRecord {
        child_root_id: key.objectid,
        parent_root_id: key.offset,
        parent_dirid: head.dirid,
        name,
    })
}

/// Maps subvolume root ids to their full path relative to the top-level
/// filesystem root, built by walking `ROOT_BACKREF` items from each
/// subvolume up to id 5 (spec §4.3). Built once per [`crate::session`] and
/// reused across samples; cheap enough to rebuild if the engine ever needs
/// to pick up newly created subvolumes.
#[derive(Debug, Default)]
pub struct SubvolumePathResolver {
    paths: HashMap<u64, String>,
}

impl SubvolumePathResolver {
    /// Walks the whole root tree's `ROOT_BACKREF` range once and resolves
    /// every subvolume it finds.
    pub fn build(transport: &IoctlTransport) -> Result<Self, EngineError> {
        let mut backrefs: HashMap<u64, RootBackrefRecord> = HashMap::new();
        transport.tree_search(
            SearchKey::by_type(BTRFS_ROOT_TREE_OBJECTID, BtrfsItemType::ROOT_BACKREF as u8),
            |item: &SearchItem| {
                if let Ok(rec) = decode_root_backref(&item.key, &item.payload) {
                    backrefs.insert(rec.child_root_id, rec);
                }
                true
            },
        )?;

        let mut resolver = SubvolumePathResolver::default();
        resolver.paths.insert(BTRFS_FS_TREE_OBJECTID, String::new());

        let ids: Vec<u64> = backrefs.keys().copied().collect();
        for id in ids {
            resolver.resolve_recursive(id, &backrefs, &mut Vec::new());
        }
        Ok(resolver)
    }

    fn resolve_recursive(
        &mut self,
        root_id: u64,
        backrefs: &HashMap<u64, RootBackrefRecord>,
        visiting: &mut Vec<u64>,
    ) -> String {
        if let Some(p) = self.paths.get(&root_id) {
            return p.clone();
        }
        if visiting.contains(&root_id) {
            // Cycle in backref graph; shouldn't happen on a sane filesystem.
            return String::new();
        }
        visiting.push(root_id);

        let path = match backrefs.get(&root_id) {
            Some(rec) => {
                let parent_path = self.resolve_recursive(rec.parent_root_id, backrefs, visiting);
                if parent_path.is_empty() {
                    rec.name.clone()
                } else {
                    format!("{}/{}", parent_path, rec.name)
                }
            }
            None => String::new(),
        };

        visiting.pop();
        self.paths.insert(root_id, path.clone());
        path
    }

    pub fn path_for(&self, root_id: u64) -> Option<&str> {
        self.paths.get(&root_id).map(|s| s.as_str())
    }

    /// Every subvolume root id this resolver knows a path for, including
    /// the top-level fs tree (id 5, path `""`).
    pub fn all_ids(&self) -> Vec<u64> {
        self.paths.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_backref_decodes_name() {
        let head = btrfs_root_ref {
            dirid: 256,
            sequence: 1,
            name_len: 4,
        };
        let mut payload = Vec::new();
        payload.extend_from_slice(&head.dirid.to_le_bytes());
        payload.extend_from_slice(&head.sequence.to_le_bytes());
        payload.extend_from_slice(&head.name_len.to_le_bytes());
        payload.extend_from_slice(b"home");

        let key = BtrfsDiskKey {
            objectid: 300,
            item_type: BtrfsItemType::ROOT_BACKREF as u8,
            offset: 5,
        };
        let rec = decode_root_backref(&key, &payload).unwrap();
        assert_eq!(rec.name, "home");
        assert_eq!(rec.child_root_id, 300);
        assert_eq!(rec.parent_root_id, 5);
        assert_eq!(rec.parent_dirid, 256);
    }

    #[test]
    fn root_backref_rejects_truncated_name() {
        let mut payload = vec![0u8; 18];
        payload[16] = 10; // name_len = 10, but no bytes follow
        let key = BtrfsDiskKey {
            objectid: 1,
            item_type: BtrfsItemType::ROOT_BACKREF as u8,
            offset: 5,
        };
        assert!(decode_root_backref(&key, &payload).is_err());
    }

    #[test]
    fn resolver_composes_nested_paths() {
        let mut backrefs = HashMap::new();
        backrefs.insert(
            300,
            RootBackrefRecord {
                child_root_id: 300,
                parent_root_id: 5,
                parent_dirid: 256,
                name: "home".to_string(),
            },
        );
        backrefs.insert(
            301,
            RootBackrefRecord {
                child_root_id: 301,
                parent_root_id: 300,
                parent_dirid: 256,
                name: "nested".to_string(),
            },
        );

        let mut resolver = SubvolumePathResolver::default();
        resolver.paths.insert(BTRFS_FS_TREE_OBJECTID, String::new());
        let path = resolver.resolve_recursive(301, &backrefs, &mut Vec::new());
        assert_eq!(path, "home/nested");
    }
}
