//! On-disk btrfs item payloads, as returned inside a tree-search result buffer.
//!
//! These are the same byte layouts the kernel uses on disk (little-endian,
//! naturally aligned within their packed representation); the ioctl transport
//! hands us the payload bytes for one item at a time and this module is only
//! concerned with reinterpreting them as typed records. Decoders never mutate
//! the buffers they're given.

pub const BTRFS_UUID_SIZE: usize = 16;
pub const BTRFS_FSID_SIZE: usize = 16;

pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
pub const BTRFS_EXTENT_TREE_OBJECTID: u64 = 2;
pub const BTRFS_CHUNK_TREE_OBJECTID: u64 = 3;
pub const BTRFS_DEV_TREE_OBJECTID: u64 = 4;
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;

pub const BTRFS_FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

/// Low bits of a chunk/block-group `type_flags` word select the role.
pub const BTRFS_BLOCK_GROUP_DATA: u64 = 1 << 0;
pub const BTRFS_BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
pub const BTRFS_BLOCK_GROUP_METADATA: u64 = 1 << 2;
pub const BTRFS_BLOCK_GROUP_TYPE_MASK: u64 =
    BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_SYSTEM | BTRFS_BLOCK_GROUP_METADATA;

/// RAID-profile bits, higher up the same word.
pub const BTRFS_BLOCK_GROUP_RAID0: u64 = 1 << 3;
pub const BTRFS_BLOCK_GROUP_RAID1: u64 = 1 << 4;
pub const BTRFS_BLOCK_GROUP_DUP: u64 = 1 << 5;
pub const BTRFS_BLOCK_GROUP_RAID10: u64 = 1 << 6;
pub const BTRFS_BLOCK_GROUP_RAID5: u64 = 1 << 7;
pub const BTRFS_BLOCK_GROUP_RAID6: u64 = 1 << 8;
pub const BTRFS_BLOCK_GROUP_RAID1C3: u64 = 1 << 9;
pub const BTRFS_BLOCK_GROUP_RAID1C4: u64 = 1 << 10;
pub const BTRFS_BLOCK_GROUP_PROFILE_MASK: u64 = !BTRFS_BLOCK_GROUP_TYPE_MASK;

/*
  repr(u8) won't round-trip on big-endian architectures without extra care.
  We could work around that with target_endian config, swapping the declared
  values on big-endian systems. Not going to write code I can't test.
*/
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[allow(dead_code, non_camel_case_types)]
pub enum BtrfsItemType {
    MIN = 0x00,
    INODE_ITEM = 0x01,
    INODE_REF = 0x0c,
    XATTR_ITEM = 0x18,
    DIR_ITEM = 0x54,
    DIR_INDEX = 0x60,
    EXTENT_DATA = 0x6c,
    CSUM_ITEM = 0x78,
    ROOT_ITEM = 0x84,
    ROOT_BACKREF = 0x90,
    ROOT_REF = 0x9c,
    EXTENT_ITEM = 0xa8,
    METADATA_ITEM = 0xa9,
    BLOCK_GROUP_ITEM = 0xc0,
    FREE_SPACE_INFO = 0xc6,
    FREE_SPACE_EXTENT = 0xc7,
    FREE_SPACE_BITMAP = 0xc8,
    DEV_EXTENT = 0xcc,
    DEV_ITEM = 0xd8,
    CHUNK_ITEM = 0xe4,
    STRING_ITEM = 0xfd,
    MAX = 0xff,
}

impl TryFrom<u8> for BtrfsItemType {
    type Error = ();

    fn try_from(v: u8) -> Result<Self, ()> {
        use BtrfsItemType::*;
        Ok(match v {
            0x00 => MIN,
            0x01 => INODE_ITEM,
            0x0c => INODE_REF,
            0x18 => XATTR_ITEM,
            0x54 => DIR_ITEM,
            0x60 => DIR_INDEX,
            0x6c => EXTENT_DATA,
            0x78 => CSUM_ITEM,
            0x84 => ROOT_ITEM,
            0x90 => ROOT_BACKREF,
            0x9c => ROOT_REF,
            0xa8 => EXTENT_ITEM,
            0xa9 => METADATA_ITEM,
            0xc0 => BLOCK_GROUP_ITEM,
            0xc6 => FREE_SPACE_INFO,
            0xc7 => FREE_SPACE_EXTENT,
            0xc8 => FREE_SPACE_BITMAP,
            0xcc => DEV_EXTENT,
            0xd8 => DEV_ITEM,
            0xe4 => CHUNK_ITEM,
            0xfd => STRING_ITEM,
            0xff => MAX,
            _ => return Err(()),
        })
    }
}

pub type LE16 = u16;
pub type LE32 = u32;
pub type LE64 = u64;

pub type BtrfsUuid = [u8; BTRFS_UUID_SIZE];
pub type BtrfsFsid = [u8; BTRFS_FSID_SIZE];

/// A tree-search key: `(objectid, item_type, offset)`, ordered lexicographically
/// in that order. This is the logical key a caller builds to describe a search;
/// the 104-byte on-disk ioctl search key lives in [`crate::ioctl`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BtrfsDiskKey {
    pub objectid: LE64,
    pub item_type: u8,
    pub offset: LE64,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_stripe {
    pub devid: LE64,
    pub offset: LE64,
    pub dev_uuid: BtrfsUuid,
}
static_assertions::assert_eq_size!([u8; 32], btrfs_stripe);

/// `CHUNK_ITEM` fixed head; `num_stripes` [`btrfs_stripe`] records follow.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_chunk {
    pub length: LE64,
    pub owner: LE64,
    pub stripe_len: LE64,
    pub r#type: LE64,
    pub io_align: LE32,
    pub io_width: LE32,
    pub sector_size: LE32,
    pub num_stripes: LE16,
    pub sub_stripes: LE16,
}
static_assertions::assert_eq_size!([u8; 48], btrfs_chunk);

/// `DEV_ITEM` payload; 98 bytes, packed.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_dev_item {
    pub devid: LE64,
    pub total_bytes: LE64,
    pub bytes_used: LE64,
    pub io_align: LE32,
    pub io_width: LE32,
    pub sector_size: LE32,
    pub r#type: LE64,
    pub generation: LE64,
    pub start_offset: LE64,
    pub dev_group: LE32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub uuid: BtrfsUuid,
    pub fsid: BtrfsFsid,
}
static_assertions::assert_eq_size!([u8; 98], btrfs_dev_item);

/// `DEV_EXTENT` payload: a physical range on one device backing part of a
/// chunk's logical range.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_dev_extent {
    pub chunk_tree: LE64,
    pub chunk_objectid: LE64,
    pub chunk_offset: LE64,
    pub length: LE64,
    pub chunk_tree_uuid: BtrfsUuid,
}
static_assertions::assert_eq_size!([u8; 48], btrfs_dev_extent);

/// `BLOCK_GROUP_ITEM` payload: point-in-time usage metric for one chunk.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_block_group_item {
    pub used: LE64,
    pub chunk_objectid: LE64,
    pub flags: LE64,
}
static_assertions::assert_eq_size!([u8; 24], btrfs_block_group_item);

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_timespec {
    pub sec: LE64,
    pub nsec: LE32,
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_inode_item {
    pub generation: LE64,
    pub transid: LE64,
    pub size: LE64,
    pub nbytes: LE64,
    pub block_group: LE64,
    pub nlink: LE32,
    pub uid: LE32,
    pub gid: LE32,
    pub mode: LE32,
    pub rdev: LE64,
    pub flags: LE64,
    pub sequence: LE64,
    pub __reserved: [LE64; 4],
    pub atime: btrfs_timespec,
    pub ctime: btrfs_timespec,
    pub mtime: btrfs_timespec,
    pub otime: btrfs_timespec,
}
static_assertions::assert_eq_size!([u8; 160], btrfs_inode_item);

/// Raw on-disk key layout embedded inside [`btrfs_root_item::drop_progress`];
/// distinct from [`BtrfsDiskKey`] because it needs to be `#[repr(C, packed)]`
/// to sit inline in the struct.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct BtrfsDiskKeyRaw {
    pub objectid: LE64,
    pub item_type: u8,
    pub offset: LE64,
}

/// `ROOT_ITEM` payload, minimum 239 bytes; at >=375 bytes also carries the
/// uuid triple and four timestamps (spec §4.2). This is the full modern
/// layout; the decoder falls back to the inode-only prefix for shorter,
/// legacy records.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_root_item {
    pub inode: btrfs_inode_item,
    pub generation: LE64,
    pub root_dirid: LE64,
    pub bytenr: LE64,
    pub byte_limit: LE64,
    pub bytes_used: LE64,
    pub last_snapshot: LE64,
    pub flags: LE64,
    pub refs: LE32,
    pub drop_progress: BtrfsDiskKeyRaw,
    pub drop_level: u8,
    pub level: u8,
    pub generation_v2: LE64,
    pub uuid: BtrfsUuid,
    pub parent_uuid: BtrfsUuid,
    pub received_uuid: BtrfsUuid,
    pub ctransid: LE64,
    pub otransid: LE64,
    pub stransid: LE64,
    pub rtransid: LE64,
    pub ctime: btrfs_timespec,
    pub otime: btrfs_timespec,
    pub stime: btrfs_timespec,
    pub rtime: btrfs_timespec,
}

pub const BTRFS_ROOT_ITEM_MIN_SIZE: usize = 239;
pub const BTRFS_ROOT_ITEM_WITH_UUIDS_SIZE: usize = 375;

/// `ROOT_BACKREF` fixed head; a name of `name_len` bytes follows, used to
/// reconstruct the path from a subvolume to its parent.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_root_ref {
    pub dirid: LE64,
    pub sequence: LE64,
    pub name_len: LE16,
}
static_assertions::assert_eq_size!([u8; 18], btrfs_root_ref);

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct btrfs_extent_item {
    pub refs: LE64,
    pub generation: LE64,
    pub flags: LE64,
}
static_assertions::assert_eq_size!([u8; 24], btrfs_extent_item);
