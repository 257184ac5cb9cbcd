//! Catalog B-tree records and lookups.
//!
//! The catalog maps (parent CNID, name) to file/folder records and CNID to
//! thread records. Hard links are ordinary file records whose Finder type/
//! creator mark them as stubs pointing into the volume's private metadata
//! directories.

use std::cmp::Ordering;
use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};

use crate::btree::{BTree, Direction};
use crate::device::DeviceRead;
use crate::error::{HfsError, Result};
use crate::extents::{read_fork_data, ForkData};
use crate::unicode;
use crate::volume::Geometry;

/// Well-known catalog node IDs.
pub const CNID_ROOT_PARENT: u32 = 1;
pub const CNID_ROOT_FOLDER: u32 = 2;
pub const CNID_EXTENTS_FILE: u32 = 3;
pub const CNID_CATALOG_FILE: u32 = 4;
pub const CNID_BAD_BLOCKS_FILE: u32 = 5;
pub const CNID_ALLOCATION_FILE: u32 = 6;
pub const CNID_STARTUP_FILE: u32 = 7;
pub const CNID_ATTRIBUTES_FILE: u32 = 8;
pub const CNID_FIRST_USER: u32 = 16;

pub const RECORD_TYPE_FOLDER: u16 = 0x0001;
pub const RECORD_TYPE_FILE: u16 = 0x0002;
pub const RECORD_TYPE_FOLDER_THREAD: u16 = 0x0003;
pub const RECORD_TYPE_FILE_THREAD: u16 = 0x0004;

/// Finder type/creator pairs marking hard-link stubs.
pub const CREATOR_HFS_PLUS: u32 = 0x6866_732B; // 'hfs+'
pub const TYPE_FILE_HARDLINK: u32 = 0x686C_6E6B; // 'hlnk'
pub const CREATOR_MACS: u32 = 0x4D41_4353; // 'MACS'
pub const TYPE_DIR_HARDLINK: u32 = 0x6664_7270; // 'fdrp'

/// Root-level private directory holding file hard-link targets.
pub const FILE_LINK_DIR: &str = "\u{0}\u{0}\u{0}\u{0}HFS+ Private Data";
/// Root-level private directory holding directory hard-link targets.
pub const DIR_LINK_DIR: &str = ".HFS+ Private Directory Data\r";

/// BSD file modes (subset used for record classification).
pub mod mode {
    pub const S_IFMT: u16 = 0o170000;
    pub const S_IFIFO: u16 = 0o010000;
    pub const S_IFCHR: u16 = 0o020000;
    pub const S_IFDIR: u16 = 0o040000;
    pub const S_IFBLK: u16 = 0o060000;
    pub const S_IFREG: u16 = 0o100000;
    pub const S_IFLNK: u16 = 0o120000;
    pub const S_IFSOCK: u16 = 0o140000;
}

/// BSD-style permissions block.
#[derive(Debug, Clone, Copy, Default)]
pub struct BsdInfo {
    pub owner_id: u32,
    pub group_id: u32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: u16,
    /// Union: raw device for char/block nodes, link count for hard-link
    /// targets, indirect inode number for link stubs.
    pub special: u32,
}

impl BsdInfo {
    pub fn is_device_node(&self) -> bool {
        matches!(self.file_mode & mode::S_IFMT, mode::S_IFCHR | mode::S_IFBLK)
    }
}

/// Catalog file record. The 32 bytes of user + Finder info are kept raw:
/// they are surfaced verbatim as the FinderInfo xattr, and the link
/// sentinels only need the leading type/creator words.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub flags: u16,
    pub cnid: u32,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub bsd: BsdInfo,
    pub finder_info: [u8; 32],
    pub text_encoding: u32,
    pub data_fork: ForkData,
    pub rsrc_fork: ForkData,
}

impl FileRecord {
    pub fn file_type(&self) -> u32 {
        u32::from_be_bytes([
            self.finder_info[0],
            self.finder_info[1],
            self.finder_info[2],
            self.finder_info[3],
        ])
    }

    pub fn creator(&self) -> u32 {
        u32::from_be_bytes([
            self.finder_info[4],
            self.finder_info[5],
            self.finder_info[6],
            self.finder_info[7],
        ])
    }

    /// Indirect file link stub ('hfs+'/'hlnk'); the target inode number
    /// is in `bsd.special`.
    pub fn is_file_hardlink(&self) -> bool {
        self.creator() == CREATOR_HFS_PLUS && self.file_type() == TYPE_FILE_HARDLINK
    }

    /// Directory link stub ('MACS'/'fdrp').
    pub fn is_dir_hardlink(&self) -> bool {
        self.creator() == CREATOR_MACS && self.file_type() == TYPE_DIR_HARDLINK
    }

    pub fn is_symlink(&self) -> bool {
        self.bsd.file_mode & mode::S_IFMT == mode::S_IFLNK
    }
}

/// Catalog folder record.
#[derive(Debug, Clone)]
pub struct FolderRecord {
    pub flags: u16,
    pub valence: u32,
    pub cnid: u32,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub bsd: BsdInfo,
    pub finder_info: [u8; 32],
    pub text_encoding: u32,
}

/// Thread record: back-pointer from a CNID to its (parent, name).
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub parent_cnid: u32,
    pub name: Vec<u16>,
}

#[derive(Debug, Clone)]
pub enum CatalogRecord {
    Folder(FolderRecord),
    File(FileRecord),
    FolderThread(ThreadRecord),
    FileThread(ThreadRecord),
}

impl CatalogRecord {
    pub fn cnid(&self) -> Option<u32> {
        match self {
            CatalogRecord::Folder(f) => Some(f.cnid),
            CatalogRecord::File(f) => Some(f.cnid),
            _ => None,
        }
    }
}

/// Catalog key: (parent CNID, name).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogKey {
    pub parent_cnid: u32,
    pub name: Vec<u16>,
}

/// Parse a catalog key from the front of a leaf/index record. Returns the
/// key and the offset of the record payload (key length padded to even).
pub fn parse_key(data: &[u8]) -> Result<(CatalogKey, usize)> {
    if data.len() < 8 {
        return Err(HfsError::Corrupt("catalog key too short".into()));
    }
    let key_length = u16::from_be_bytes([data[0], data[1]]) as usize;
    let parent_cnid = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
    let name_length = u16::from_be_bytes([data[6], data[7]]) as usize;

    let name_end = 8 + name_length * 2;
    if name_length > unicode::MAX_NAME_UNITS || name_end > data.len() || name_end > 2 + key_length
    {
        return Err(HfsError::Corrupt(format!(
            "catalog key name overruns record (length {name_length})"
        )));
    }
    let name = unicode::utf16be_to_u16(&data[8..name_end]);

    let payload = 2 + key_length + (key_length & 1);
    Ok((CatalogKey { parent_cnid, name }, payload))
}

/// Order a stored catalog key against (parent, name): parent CNID
/// unsigned-first, then the volume's name ordering.
pub fn key_compare<'a>(
    parent_cnid: u32,
    name: &'a [u16],
    case_sensitive: bool,
) -> impl Fn(&[u8]) -> Ordering + 'a {
    move |record: &[u8]| {
        let Ok((key, _)) = parse_key(record) else {
            return Ordering::Less;
        };
        key.parent_cnid.cmp(&parent_cnid).then_with(|| {
            if case_sensitive {
                unicode::compare_binary(&key.name, name)
            } else {
                unicode::compare_folded(&key.name, name)
            }
        })
    }
}

fn read_bsd_info(cursor: &mut Cursor<&[u8]>) -> Result<BsdInfo> {
    Ok(BsdInfo {
        owner_id: cursor.read_u32::<BigEndian>()?,
        group_id: cursor.read_u32::<BigEndian>()?,
        admin_flags: cursor.read_u8()?,
        owner_flags: cursor.read_u8()?,
        file_mode: cursor.read_u16::<BigEndian>()?,
        special: cursor.read_u32::<BigEndian>()?,
    })
}

/// Parse a catalog record payload (bytes after the key).
pub fn parse_record(data: &[u8]) -> Result<CatalogRecord> {
    if data.len() < 2 {
        return Err(HfsError::Corrupt("catalog record too short".into()));
    }
    let record_type = u16::from_be_bytes([data[0], data[1]]);
    let mut cursor = Cursor::new(data);
    cursor.set_position(2);

    match record_type {
        RECORD_TYPE_FOLDER => {
            let flags = cursor.read_u16::<BigEndian>()?;
            let valence = cursor.read_u32::<BigEndian>()?;
            let cnid = cursor.read_u32::<BigEndian>()?;
            let create_date = cursor.read_u32::<BigEndian>()?;
            let content_mod_date = cursor.read_u32::<BigEndian>()?;
            let attribute_mod_date = cursor.read_u32::<BigEndian>()?;
            let access_date = cursor.read_u32::<BigEndian>()?;
            let backup_date = cursor.read_u32::<BigEndian>()?;
            let bsd = read_bsd_info(&mut cursor)?;
            let mut finder_info = [0u8; 32];
            cursor.read_exact(&mut finder_info)?;
            let text_encoding = cursor.read_u32::<BigEndian>()?;

            Ok(CatalogRecord::Folder(FolderRecord {
                flags,
                valence,
                cnid,
                create_date,
                content_mod_date,
                attribute_mod_date,
                access_date,
                backup_date,
                bsd,
                finder_info,
                text_encoding,
            }))
        }
        RECORD_TYPE_FILE => {
            let flags = cursor.read_u16::<BigEndian>()?;
            let _reserved = cursor.read_u32::<BigEndian>()?;
            let cnid = cursor.read_u32::<BigEndian>()?;
            let create_date = cursor.read_u32::<BigEndian>()?;
            let content_mod_date = cursor.read_u32::<BigEndian>()?;
            let attribute_mod_date = cursor.read_u32::<BigEndian>()?;
            let access_date = cursor.read_u32::<BigEndian>()?;
            let backup_date = cursor.read_u32::<BigEndian>()?;
            let bsd = read_bsd_info(&mut cursor)?;
            let mut finder_info = [0u8; 32];
            cursor.read_exact(&mut finder_info)?;
            let text_encoding = cursor.read_u32::<BigEndian>()?;
            let _reserved2 = cursor.read_u32::<BigEndian>()?;
            let data_fork = read_fork_data(&mut cursor)?;
            let rsrc_fork = read_fork_data(&mut cursor)?;

            Ok(CatalogRecord::File(FileRecord {
                flags,
                cnid,
                create_date,
                content_mod_date,
                attribute_mod_date,
                access_date,
                backup_date,
                bsd,
                finder_info,
                text_encoding,
                data_fork,
                rsrc_fork,
            }))
        }
        RECORD_TYPE_FOLDER_THREAD | RECORD_TYPE_FILE_THREAD => {
            let _reserved = cursor.read_u16::<BigEndian>()?;
            let parent_cnid = cursor.read_u32::<BigEndian>()?;
            let name_length = cursor.read_u16::<BigEndian>()? as usize;
            if name_length > unicode::MAX_NAME_UNITS {
                return Err(HfsError::Corrupt(format!(
                    "thread name length {name_length} out of range"
                )));
            }
            let mut raw = vec![0u8; name_length * 2];
            cursor.read_exact(&mut raw)?;
            let name = unicode::utf16be_to_u16(&raw);
            let thread = ThreadRecord { parent_cnid, name };
            if record_type == RECORD_TYPE_FOLDER_THREAD {
                Ok(CatalogRecord::FolderThread(thread))
            } else {
                Ok(CatalogRecord::FileThread(thread))
            }
        }
        other => Err(HfsError::Corrupt(format!(
            "unknown catalog record type 0x{other:04X}"
        ))),
    }
}

/// Look up a record by (parent CNID, name). `Ok(None)` means the key is
/// absent, which callers translate to their own `NotFound`.
pub fn lookup<D: DeviceRead>(
    dev: &D,
    geo: &Geometry,
    tree: &BTree,
    parent_cnid: u32,
    name: &[u16],
) -> Result<Option<(CatalogKey, CatalogRecord)>> {
    let compare = key_compare(parent_cnid, name, tree.case_sensitive());
    match tree.find(dev, geo, &compare)? {
        Some((node, index)) => {
            let record = node.record(index)?;
            let (key, payload) = parse_key(record)?;
            Ok(Some((key, parse_record(&record[payload..])?)))
        }
        None => Ok(None),
    }
}

/// Fetch the thread record for a CNID: the catalog key {cnid, ""}.
pub fn thread_for_cnid<D: DeviceRead>(
    dev: &D,
    geo: &Geometry,
    tree: &BTree,
    cnid: u32,
) -> Result<Option<ThreadRecord>> {
    match lookup(dev, geo, tree, cnid, &[])? {
        Some((_, CatalogRecord::FolderThread(t))) | Some((_, CatalogRecord::FileThread(t))) => {
            Ok(Some(t))
        }
        Some(_) => Err(HfsError::Corrupt(format!(
            "cnid {cnid} thread slot holds a non-thread record"
        ))),
        None => Ok(None),
    }
}

/// Look up a record by CNID: thread first, then the real record through
/// the thread's (parent, name) back-pointer.
pub fn find_by_cnid<D: DeviceRead>(
    dev: &D,
    geo: &Geometry,
    tree: &BTree,
    cnid: u32,
) -> Result<Option<(CatalogKey, CatalogRecord)>> {
    let Some(thread) = thread_for_cnid(dev, geo, tree, cnid)? else {
        return Ok(None);
    };
    match lookup(dev, geo, tree, thread.parent_cnid, &thread.name)? {
        Some(found) => Ok(Some(found)),
        None => Err(HfsError::Corrupt(format!(
            "dangling thread: cnid {cnid} names a missing record under parent {}",
            thread.parent_cnid
        ))),
    }
}

/// List a folder's children in catalog key order. Thread records are
/// skipped; the caller gets (key, record) pairs it owns.
pub fn list_directory<D: DeviceRead>(
    dev: &D,
    geo: &Geometry,
    tree: &BTree,
    folder_cnid: u32,
) -> Result<Vec<(CatalogKey, CatalogRecord)>> {
    let compare = key_compare(folder_cnid, &[], tree.case_sensitive());
    let Some((node, index)) = tree.find_first_ge(dev, geo, &compare)? else {
        return Ok(Vec::new());
    };

    let mut entries = Vec::new();
    for raw in tree.records_from(dev, geo, node, index, Direction::Forward) {
        let raw = raw?;
        let (key, payload) = parse_key(&raw)?;
        if key.parent_cnid != folder_cnid {
            break;
        }
        match parse_record(&raw[payload..])? {
            CatalogRecord::FolderThread(_) | CatalogRecord::FileThread(_) => continue,
            record => entries.push((key, record)),
        }
    }
    Ok(entries)
}

/// Resolve a file hard-link stub to its target record in the private
/// metadata directory ("iNode<n>").
pub fn resolve_file_hardlink<D: DeviceRead>(
    dev: &D,
    geo: &Geometry,
    tree: &BTree,
    private_dir_cnid: u32,
    inode_num: u32,
) -> Result<FileRecord> {
    let name = unicode::string_to_utf16(&format!("iNode{inode_num}"))?;
    match lookup(dev, geo, tree, private_dir_cnid, &name)? {
        Some((_, CatalogRecord::File(target))) => Ok(target),
        Some(_) => Err(HfsError::Corrupt(format!(
            "hard-link target iNode{inode_num} is not a file"
        ))),
        None => Err(HfsError::NotFound(format!(
            "hard-link target iNode{inode_num}"
        ))),
    }
}

/// Resolve a directory hard-link stub to its target folder in the private
/// directory-link directory ("dir_<n>").
pub fn resolve_dir_hardlink<D: DeviceRead>(
    dev: &D,
    geo: &Geometry,
    tree: &BTree,
    private_dir_cnid: u32,
    inode_num: u32,
) -> Result<FolderRecord> {
    let name = unicode::string_to_utf16(&format!("dir_{inode_num}"))?;
    match lookup(dev, geo, tree, private_dir_cnid, &name)? {
        Some((_, CatalogRecord::Folder(target))) => Ok(target),
        Some(_) => Err(HfsError::Corrupt(format!(
            "hard-link target dir_{inode_num} is not a folder"
        ))),
        None => Err(HfsError::NotFound(format!(
            "hard-link target dir_{inode_num}"
        ))),
    }
}
