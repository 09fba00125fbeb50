//! Typed wrappers around the btrfs ioctls the engine consumes.
//!
//! Struct layouts here must match the kernel's `linux/btrfs.h` UAPI bit for
//! bit: `ioctl_search_args` (104-byte key + 3992-byte buffer), `ioctl_search_header`
//! (32 bytes), `ioctl_dev_info_args`, `ioctl_fs_info_args`, `ioctl_logical_ino_args`,
//! `ioctl_ino_lookup_args`, `space_info`, and the FIEMAP request/extent structs.
//! Every parsed structure is little-endian and naturally aligned; decoders here
//! tolerate trailing bytes from future kernel extensions and reject anything
//! shorter than the fields they read.

use std::ffi::CStr;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use log::debug;

use crate::error::EngineError;
use crate::structures::BtrfsDiskKey;

const BTRFS_IOCTL_MAGIC: u8 = 0x94;

pub const BTRFS_SEARCH_BUF_SIZE: usize = 3992;
pub const BTRFS_PATH_NAME_MAX: usize = 4080;

/// The 104-byte on-disk search key embedded at the front of
/// `ioctl_search_args`/`ioctl_search_args_v2`.
#[repr(C)]
#[derive(Clone, Copy)]
struct btrfs_ioctl_search_key {
    tree_id: u64,
    min_objectid: u64,
    max_objectid: u64,
    min_offset: u64,
    max_offset: u64,
    min_transid: u64,
    max_transid: u64,
    min_type: u32,
    max_type: u32,
    nr_items: u32,
    unused: u32,
    unused1: u64,
    unused2: u64,
    unused3: u64,
    unused4: u64,
}
static_assertions::assert_eq_size!([u8; 104], btrfs_ioctl_search_key);

#[repr(C)]
struct btrfs_ioctl_search_args {
    key: btrfs_ioctl_search_key,
    buf: [u8; BTRFS_SEARCH_BUF_SIZE],
}
static_assertions::assert_eq_size!([u8; 4096], btrfs_ioctl_search_args);

/// The 32-byte header preceding each item's payload in a search result buffer.
#[repr(C)]
#[derive(Clone, Copy)]
struct btrfs_ioctl_search_header {
    transid: u64,
    objectid: u64,
    offset: u64,
    r#type: u32,
    len: u32,
}
static_assertions::assert_eq_size!([u8; 32], btrfs_ioctl_search_header);

nix::ioctl_readwrite!(btrfs_tree_search, BTRFS_IOCTL_MAGIC, 17, btrfs_ioctl_search_args);

#[repr(C)]
struct btrfs_ioctl_fs_info_args {
    max_id: u64,
    num_devices: u64,
    fsid: [u8; 16],
    nodesize: u32,
    sectorsize: u32,
    clone_alignment: u32,
    reserved32: u32,
    generation: u64,
    metadata_uuid: [u8; 16],
    reserved: [u64; 115],
}
static_assertions::assert_eq_size!([u8; 1024], btrfs_ioctl_fs_info_args);

nix::ioctl_read!(btrfs_fs_info_raw, BTRFS_IOCTL_MAGIC, 31, btrfs_ioctl_fs_info_args);

#[repr(C)]
struct btrfs_ioctl_dev_info_args {
    devid: u64,
    uuid: [u8; 16],
    bytes_used: u64,
    total_bytes: u64,
    unused: [u64; 379],
    path: [u8; 1024],
}
static_assertions::assert_eq_size!([u8; 3264], btrfs_ioctl_dev_info_args);

nix::ioctl_readwrite!(btrfs_dev_info_raw, BTRFS_IOCTL_MAGIC, 30, btrfs_ioctl_dev_info_args);

#[repr(C)]
struct btrfs_ioctl_space_args {
    space_slots: u64,
    total_spaces: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct btrfs_ioctl_space_info {
    flags: u64,
    total_bytes: u64,
    used_bytes: u64,
}
static_assertions::assert_eq_size!([u8; 24], btrfs_ioctl_space_info);

nix::ioctl_readwrite!(btrfs_space_info_raw, BTRFS_IOCTL_MAGIC, 20, btrfs_ioctl_space_args);

const BTRFS_LOGICAL_INO_CONTAINER_SIZE: usize = 4096;

#[repr(C)]
struct btrfs_ioctl_logical_ino_args {
    logical: u64,
    size: u64,
    reserved: [u64; 4],
    inodes: u64,
}
static_assertions::assert_eq_size!([u8; 56], btrfs_ioctl_logical_ino_args);

nix::ioctl_readwrite!(btrfs_logical_ino_raw, BTRFS_IOCTL_MAGIC, 36, btrfs_ioctl_logical_ino_args);

#[repr(C)]
struct btrfs_ioctl_ino_lookup_args {
    treeid: u64,
    objectid: u64,
    name: [u8; BTRFS_PATH_NAME_MAX],
}
static_assertions::assert_eq_size!([u8; 4096], btrfs_ioctl_ino_lookup_args);

nix::ioctl_readwrite!(btrfs_ino_lookup_raw, BTRFS_IOCTL_MAGIC, 18, btrfs_ioctl_ino_lookup_args);

/// `{uuid, num_devices, max_devid, node_size, sector_size, generation, metadata_uuid}`.
#[derive(Debug, Clone)]
pub struct FsInfo {
    pub uuid: [u8; 16],
    pub num_devices: u64,
    pub max_devid: u64,
    pub node_size: u32,
    pub sector_size: u32,
    pub generation: u64,
    pub metadata_uuid: [u8; 16],
}

impl FsInfo {
    /// Lowercase hex rendering of the filesystem uuid, as used in the
    /// scrub status file name and sysfs paths.
    pub fn uuid_hex(&self) -> String {
        hex::encode(self.uuid)
    }
}

/// `{uuid, total_bytes, bytes_used, path}`.
#[derive(Debug, Clone)]
pub struct DevInfo {
    pub devid: u64,
    pub uuid: [u8; 16],
    pub total_bytes: u64,
    pub bytes_used: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SpaceInfoEntry {
    pub flags: u64,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct LogicalInoResult {
    pub inum: u64,
    pub offset: u64,
    pub root_id: u64,
}

/// One `(header, payload_bytes)` tuple read from a search-result page.
#[derive(Debug, Clone)]
pub struct SearchItem {
    pub key: BtrfsDiskKey,
    pub payload: Vec<u8>,
}

/// Input to a tree search, per spec §4.1: `{tree_id, min_objid, max_objid,
/// min_type, max_type, min_offset, max_offset}`.
#[derive(Debug, Clone, Copy)]
pub struct SearchKey {
    pub tree_id: u64,
    pub min_objid: u64,
    pub max_objid: u64,
    pub min_type: u8,
    pub max_type: u8,
    pub min_offset: u64,
    pub max_offset: u64,
}

impl SearchKey {
    /// A search spanning the whole key space of one tree.
    pub fn whole_tree(tree_id: u64) -> Self {
        SearchKey {
            tree_id,
            min_objid: 0,
            max_objid: u64::MAX,
            min_type: 0,
            max_type: u8::MAX,
            min_offset: 0,
            max_offset: u64::MAX,
        }
    }

    pub fn exact(tree_id: u64, objid: u64, item_type: u8, offset: u64) -> Self {
        SearchKey {
            tree_id,
            min_objid: objid,
            max_objid: objid,
            min_type: item_type,
            max_type: item_type,
            min_offset: offset,
            max_offset: offset,
        }
    }

    pub fn by_type(tree_id: u64, item_type: u8) -> Self {
        SearchKey {
            tree_id,
            min_objid: 0,
            max_objid: u64::MAX,
            min_type: item_type,
            max_type: item_type,
            min_offset: 0,
            max_offset: u64::MAX,
        }
    }

    /// All items of one type belonging to a single object id, spanning the
    /// whole offset range (e.g. every `DEV_EXTENT` for one device id).
    pub fn by_objid_and_type(tree_id: u64, objid: u64, item_type: u8) -> Self {
        SearchKey {
            tree_id,
            min_objid: objid,
            max_objid: objid,
            min_type: item_type,
            max_type: item_type,
            min_offset: 0,
            max_offset: u64::MAX,
        }
    }
}

/// Owns the open file descriptor for a btrfs mount point and exposes the
/// small set of typed ioctl operations the engine needs. Each method returns
/// either a typed result or a categorized [`EngineError`], never a raw
/// kernel error number.
pub struct IoctlTransport {
    file: File,
}

impl IoctlTransport {
    pub fn open(mount_path: &std::path::Path) -> Result<Self, EngineError> {
        let file = File::open(mount_path).map_err(|e| {
            debug!("open({:?}) failed: {}", mount_path, e);
            EngineError::NotBtrfs {
                path: mount_path.to_path_buf(),
            }
        })?;
        Ok(IoctlTransport { file })
    }

    pub fn fs_info(&self) -> Result<FsInfo, EngineError> {
        let mut args: btrfs_ioctl_fs_info_args = unsafe { std::mem::zeroed() };
        let ret = unsafe { btrfs_fs_info_raw(self.file.as_raw_fd(), &mut args) };
        match ret {
            Ok(_) => Ok(FsInfo {
                uuid: args.fsid,
                num_devices: args.num_devices,
                max_devid: args.max_id,
                node_size: args.nodesize,
                sector_size: args.sectorsize,
                generation: args.generation,
                metadata_uuid: args.metadata_uuid,
            }),
            Err(nix::errno::Errno::ENOTTY) => Err(EngineError::NotBtrfs {
                path: PathBuf::new(),
            }),
            Err(e) => Err(EngineError::IoctlFailed {
                op: "FS_INFO",
                raw: e.to_string(),
            }),
        }
    }

    pub fn dev_info(&self, devid: u64) -> Result<DevInfo, EngineError> {
        let mut args: btrfs_ioctl_dev_info_args = unsafe { std::mem::zeroed() };
        args.devid = devid;
        let ret = unsafe { btrfs_dev_info_raw(self.file.as_raw_fd(), &mut args) };
        match ret {
            Ok(_) => {
                let cpath = unsafe { CStr::from_ptr(args.path.as_ptr() as *const libc::c_char) };
                Ok(DevInfo {
                    devid: args.devid,
                    uuid: args.uuid,
                    total_bytes: args.total_bytes,
                    bytes_used: args.bytes_used,
                    path: PathBuf::from(cpath.to_string_lossy().into_owned()),
                })
            }
            Err(e) => Err(EngineError::IoctlFailed {
                op: "DEV_INFO",
                raw: e.to_string(),
            }),
        }
    }

    /// Two-phase space-info query: first call discovers the slot count, the
    /// second fills the space-info array (spec §4.1).
    pub fn space_info(&self) -> Result<Vec<SpaceInfoEntry>, EngineError> {
        let mut probe = btrfs_ioctl_space_args {
            space_slots: 0,
            total_spaces: 0,
        };
        unsafe { btrfs_space_info_raw(self.file.as_raw_fd(), &mut probe) }.map_err(|e| {
            EngineError::IoctlFailed {
                op: "SPACE_INFO(probe)",
                raw: e.to_string(),
            }
        })?;

        let count = probe.total_spaces as usize;
        if count == 0 {
            return Ok(Vec::new());
        }

        let byte_len = std::mem::size_of::<btrfs_ioctl_space_args>()
            + count * std::mem::size_of::<btrfs_ioctl_space_info>();
        let mut buf = vec![0u8; byte_len];
        {
            let header = unsafe { &mut *(buf.as_mut_ptr() as *mut btrfs_ioctl_space_args) };
            header.space_slots = count as u64;
        }
        let args_ptr = buf.as_mut_ptr() as *mut btrfs_ioctl_space_args;
        unsafe { btrfs_space_info_raw(self.file.as_raw_fd(), args_ptr) }.map_err(|e| {
            EngineError::IoctlFailed {
                op: "SPACE_INFO",
                raw: e.to_string(),
            }
        })?;

        let header = unsafe { &*args_ptr };
        let returned = header.total_spaces.min(count as u64) as usize;
        let infos_start = std::mem::size_of::<btrfs_ioctl_space_args>();
        let mut out = Vec::with_capacity(returned);
        for i in 0..returned {
            let off = infos_start + i * std::mem::size_of::<btrfs_ioctl_space_info>();
            let info = unsafe { &*(buf.as_ptr().add(off) as *const btrfs_ioctl_space_info) };
            out.push(SpaceInfoEntry {
                flags: info.flags,
                total_bytes: info.total_bytes,
                used_bytes: info.used_bytes,
            });
        }
        Ok(out)
    }

    /// `LOGICAL_INO`: maps a logical byte address to the inodes whose extents
    /// cover it. An empty result means the address is free or metadata/system.
    pub fn logical_ino(&self, logical: u64) -> Result<Vec<LogicalInoResult>, EngineError> {
        let mut container = vec![0u8; BTRFS_LOGICAL_INO_CONTAINER_SIZE];
        let mut args = btrfs_ioctl_logical_ino_args {
            logical,
            size: container.len() as u64,
            reserved: [0; 4],
            inodes: container.as_mut_ptr() as u64,
        };
        let ret = unsafe { btrfs_logical_ino_raw(self.file.as_raw_fd(), &mut args) };
        if let Err(e) = ret {
            return Err(EngineError::IoctlFailed {
                op: "LOGICAL_INO",
                raw: e.to_string(),
            });
        }

        // Container: 16-byte header (bytes_left, bytes_missing, elem_cnt,
        // elem_missed) followed by `elem_cnt/3` 24-byte (inum, offset, root)
        // records.
        if container.len() < 16 {
            return Err(EngineError::DecodeFailed {
                item_type: "logical_ino_container",
                length: container.len(),
            });
        }
        let elem_cnt = u64::from_ne_bytes(container[0..8].try_into().unwrap());
        let record_count = (elem_cnt / 3) as usize;
        let mut out = Vec::with_capacity(record_count);
        let records_start = 16usize;
        for i in 0..record_count {
            let off = records_start + i * 24;
            if off + 24 > container.len() {
                break;
            }
            let inum = u64::from_ne_bytes(container[off..off + 8].try_into().unwrap());
            let offset = u64::from_ne_bytes(container[off + 8..off + 16].try_into().unwrap());
            let root_id = u64::from_ne_bytes(container[off + 16..off + 24].try_into().unwrap());
            out.push(LogicalInoResult {
                inum,
                offset,
                root_id,
            });
        }
        Ok(out)
    }

    /// `INO_LOOKUP`: returns the path of an inode relative to its subvolume
    /// root, as a NUL-terminated string of at most 4080 bytes.
    pub fn ino_lookup(&self, tree_id: u64, objectid: u64) -> Result<String, EngineError> {
        let mut args: btrfs_ioctl_ino_lookup_args = unsafe { std::mem::zeroed() };
        args.treeid = tree_id;
        args.objectid = objectid;
        let ret = unsafe { btrfs_ino_lookup_raw(self.file.as_raw_fd(), &mut args) };
        if let Err(e) = ret {
            return Err(EngineError::IoctlFailed {
                op: "INO_LOOKUP",
                raw: e.to_string(),
            });
        }
        let cstr = unsafe { CStr::from_ptr(args.name.as_ptr() as *const libc::c_char) };
        Ok(cstr.to_string_lossy().into_owned())
    }

    /// Paged tree search over `[min_key, max_key]`. Pagination per spec §4.1:
    /// advance `min_offset = last.offset + 1`; at `last.offset == MAX_U64`,
    /// advance `min_type`; at `min_type > max_type`, advance `min_objid` and
    /// reset type/offset. Terminates when the kernel reports zero items for a
    /// page, or the caller's closure returns `false` to abort early.
    pub fn tree_search(
        &self,
        mut key: SearchKey,
        mut on_item: impl FnMut(&SearchItem) -> bool,
    ) -> Result<(), EngineError> {
        loop {
            let mut args: Box<btrfs_ioctl_search_args> = Box::new(unsafe { std::mem::zeroed() });
            args.key = btrfs_ioctl_search_key {
                tree_id: key.tree_id,
                min_objectid: key.min_objid,
                max_objectid: key.max_objid,
                min_offset: key.min_offset,
                max_offset: key.max_offset,
                min_transid: 0,
                max_transid: u64::MAX,
                min_type: key.min_type as u32,
                max_type: key.max_type as u32,
                nr_items: u32::MAX,
                unused: 0,
                unused1: 0,
                unused2: 0,
                unused3: 0,
                unused4: 0,
            };

            debug!(
                "tree_search: tree {} obj [{}, {}] type [{}, {}] off [{}, {}]",
                key.tree_id, key.min_objid, key.max_objid, key.min_type, key.max_type,
                key.min_offset, key.max_offset
            );

            let ret = unsafe { btrfs_tree_search(self.file.as_raw_fd(), args.as_mut()) };
            ret.map_err(|e| EngineError::IoctlFailed {
                op: "TREE_SEARCH",
                raw: e.to_string(),
            })?;

            let nr_items = args.key.nr_items as usize;
            if nr_items == 0 {
                return Ok(());
            }

            let mut cursor = 0usize;
            let mut last_header: Option<btrfs_ioctl_search_header> = None;
            for _ in 0..nr_items {
                if cursor + std::mem::size_of::<btrfs_ioctl_search_header>() > args.buf.len() {
                    return Err(EngineError::DecodeFailed {
                        item_type: "search_header",
                        length: args.buf.len() - cursor,
                    });
                }
                let header = unsafe {
                    &*(args.buf.as_ptr().add(cursor) as *const btrfs_ioctl_search_header)
                };
                cursor += std::mem::size_of::<btrfs_ioctl_search_header>();

                let len = header.len as usize;
                if cursor + len > args.buf.len() {
                    return Err(EngineError::DecodeFailed {
                        item_type: "search_item_payload",
                        length: len,
                    });
                }
                let payload = args.buf[cursor..cursor + len].to_vec();
                cursor += len;

                let item_type = header.r#type as u8;
                if item_type >= key.min_type && item_type <= key.max_type {
                    let item = SearchItem {
                        key: BtrfsDiskKey {
                            objectid: header.objectid,
                            item_type,
                            offset: header.offset,
                        },
                        payload,
                    };
                    if !on_item(&item) {
                        return Ok(());
                    }
                }
                last_header = Some(*header);
            }

            let last = last_header.expect("nr_items > 0 implies at least one header parsed");
            if last.offset == u64::MAX {
                // min_type/max_type are u8; last.r#type == 0xff would wrap to 0 on
                // `+ 1 as u8`, so the objid advance has to trigger at the u8 boundary,
                // not just at the wider u32::MAX the header field is stored as.
                if last.r#type >= u8::MAX as u32 {
                    key.min_objid = key.min_objid.saturating_add(1);
                    key.min_type = 0;
                    key.min_offset = 0;
                } else {
                    key.min_type = (last.r#type + 1) as u8;
                    key.min_offset = 0;
                }
            } else {
                key.min_offset = last.offset + 1;
            }

            if key.min_type as u32 > key.max_type as u32 && key.min_offset == 0 {
                key.min_objid = key.min_objid.saturating_add(1);
                key.min_type = 0;
            }

            if key.min_objid > key.max_objid {
                return Ok(());
            }
        }
    }
}
