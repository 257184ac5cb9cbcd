//! Read-only HFS+ / HFSX volume reader.
//!
//! Opens a raw device or disk image, walks the Catalog and Extents
//! Overflow B-trees, resolves POSIX-shaped paths with HFS+ Unicode rules,
//! follows file and directory hard links, and surfaces Finder info,
//! resource forks and named attributes as extended attributes. Nothing is
//! ever written; a journaled volume that was not cleanly unmounted is
//! readable but logs a warning (the journal is not replayed).

pub mod attr;
pub mod btree;
pub mod catalog;
pub mod device;
pub mod error;
pub mod extents;
pub mod path;
pub mod unicode;
pub mod volume;

pub use catalog::{CatalogKey, CatalogRecord, FileRecord, FolderRecord};
pub use device::{BlockCache, BlockCacheConfig, Device, DeviceRead};
pub use error::{HfsError, Result};
pub use extents::{ExtentDescriptor, ForkData, ForkKind};
pub use path::ResolvedPath;
pub use volume::{JournalInfoBlock, VolumeHeader};

use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use log::warn;

use crate::btree::BTree;
use crate::extents::ForkExtents;
use crate::path::RecordCache;
use crate::volume::{to_unix_time, Geometry};

/// Entry kind in the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// A directory entry returned by `read_dir`. Hard-link stubs are already
/// resolved: `cnid` and `size` describe the link target.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Entry name in UNIX form (on-disk '/' shown as ':').
    pub name: String,
    pub cnid: u32,
    pub kind: EntryKind,
    /// Data fork logical size (0 for directories).
    pub size: u64,
    /// HFS+ creation date (seconds since 1904-01-01).
    pub create_date: u32,
    pub modify_date: u32,
}

/// POSIX-shaped attributes for a resolved record.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub cnid: u32,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub rdev: u32,
    pub size: u64,
    /// 512-byte units, the way stat(2) counts them.
    pub blocks: u64,
    pub blksize: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub birthtime: i64,
    pub bsd_flags: u32,
}

/// Options for opening a volume.
#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    /// Read-coalescing cache in front of the device; `None` disables it.
    pub block_cache: Option<BlockCacheConfig>,
    /// Capacity of the resolved-path record cache.
    pub record_cache_capacity: usize,
    /// Byte offset of the volume inside the device (partition start).
    pub volume_offset: u64,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            block_cache: Some(BlockCacheConfig::default()),
            record_cache_capacity: path::DEFAULT_CACHE_CAPACITY,
            volume_offset: 0,
        }
    }
}

/// An open volume. Owns its device, tree handles and record cache; all
/// read operations take `&self` and are safe to call concurrently.
/// Dropping the volume releases everything.
pub struct Volume<D: DeviceRead = Box<dyn DeviceRead>> {
    pub(crate) dev: D,
    pub(crate) geo: Geometry,
    pub(crate) header: VolumeHeader,
    pub(crate) catalog: BTree,
    pub(crate) extents_tree: BTree,
    pub(crate) cache: RecordCache,
    attributes: OnceLock<Option<BTree>>,
    name: OnceLock<String>,
    root: OnceLock<(CatalogKey, FolderRecord)>,
    file_link_dir: OnceLock<Option<u32>>,
    dir_link_dir: OnceLock<Option<u32>>,
}

impl Volume<Box<dyn DeviceRead>> {
    /// Open a volume from a device path or image file with defaults.
    pub fn open<P: AsRef<Path>>(device_path: P) -> Result<Self> {
        Self::open_with(device_path, MountOptions::default())
    }

    /// Open a volume with explicit options.
    pub fn open_with<P: AsRef<Path>>(device_path: P, options: MountOptions) -> Result<Self> {
        let dev = Device::open(device_path)?;
        let boxed: Box<dyn DeviceRead> = match options.block_cache {
            Some(config) => Box::new(BlockCache::new(dev, config)),
            None => Box::new(dev),
        };
        Self::open_device_with(boxed, options)
    }
}

impl<D: DeviceRead> Volume<D> {
    /// Open a volume over an existing device capability.
    pub fn open_device(dev: D) -> Result<Self> {
        Self::open_device_with(dev, MountOptions::default())
    }

    pub fn open_device_with(dev: D, options: MountOptions) -> Result<Self> {
        let (header, offset) = volume::find_volume(&dev, options.volume_offset)?;
        if header.is_dirty() {
            if header.is_journaled() {
                warn!("journaled volume was not cleanly unmounted; reading without replaying the journal");
            } else {
                warn!("volume was not cleanly unmounted; contents may be inconsistent");
            }
        }
        let geo = header.geometry(offset);

        // The extents file must be reachable from its inline descriptors
        // alone; the catalog may spill into the extents tree.
        let extents_fork = ForkExtents::from_inline(
            catalog::CNID_EXTENTS_FILE,
            ForkKind::Data,
            &header.extents_file,
        );
        extents_fork.verify_complete(&geo)?;
        let extents_tree = BTree::open(&dev, &geo, extents_fork)?;

        let catalog_fork = extents::materialize(
            &dev,
            &geo,
            &extents_tree,
            catalog::CNID_CATALOG_FILE,
            ForkKind::Data,
            &header.catalog_file,
        )?;
        let catalog = BTree::open(&dev, &geo, catalog_fork)?;

        Ok(Volume {
            dev,
            geo,
            header,
            catalog,
            extents_tree,
            cache: RecordCache::new(options.record_cache_capacity),
            attributes: OnceLock::new(),
            name: OnceLock::new(),
            root: OnceLock::new(),
            file_link_dir: OnceLock::new(),
            dir_link_dir: OnceLock::new(),
        })
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    pub fn is_journaled(&self) -> bool {
        self.header.is_journaled()
    }

    pub fn is_dirty(&self) -> bool {
        self.header.is_dirty()
    }

    /// The volume name, from the root folder's thread record.
    pub fn name(&self) -> Result<&str> {
        if let Some(name) = self.name.get() {
            return Ok(name);
        }
        let (key, _) = self.root_record()?;
        let name = unicode::name_to_unix(&unicode::utf16_to_string_lossy(&key.name));
        Ok(self.name.get_or_init(|| name))
    }

    /// Resolve a path to its record, key and fork selector.
    pub fn lookup(&self, path: &str) -> Result<ResolvedPath> {
        path::resolve(self, path)
    }

    /// Look up a record by CNID through its thread record.
    pub fn find_by_cnid(&self, cnid: u32) -> Result<ResolvedPath> {
        match catalog::find_by_cnid(&self.dev, &self.geo, &self.catalog, cnid)? {
            Some((key, record)) => Ok(ResolvedPath {
                key,
                record,
                fork: ForkKind::Data,
            }),
            None => Err(HfsError::NotFound(format!("cnid {cnid}"))),
        }
    }

    /// List a folder's children in catalog key order.
    pub fn read_dir(&self, folder_cnid: u32) -> Result<Vec<DirEntry>> {
        let raw = catalog::list_directory(&self.dev, &self.geo, &self.catalog, folder_cnid)?;
        let mut entries = Vec::with_capacity(raw.len());
        for (key, record) in raw {
            let name = unicode::name_to_unix(&unicode::utf16_to_string_lossy(&key.name));
            let entry = match record {
                CatalogRecord::Folder(f) => DirEntry {
                    name,
                    cnid: f.cnid,
                    kind: EntryKind::Directory,
                    size: 0,
                    create_date: f.create_date,
                    modify_date: f.content_mod_date,
                },
                CatalogRecord::File(f) if f.is_dir_hardlink() => {
                    let target = catalog::resolve_dir_hardlink(
                        &self.dev,
                        &self.geo,
                        &self.catalog,
                        self.dir_link_dir_cnid()?,
                        f.bsd.special,
                    )?;
                    DirEntry {
                        name,
                        cnid: target.cnid,
                        kind: EntryKind::Directory,
                        size: 0,
                        create_date: target.create_date,
                        modify_date: target.content_mod_date,
                    }
                }
                CatalogRecord::File(f) if f.is_file_hardlink() => {
                    let target = catalog::resolve_file_hardlink(
                        &self.dev,
                        &self.geo,
                        &self.catalog,
                        self.file_link_dir_cnid()?,
                        f.bsd.special,
                    )?;
                    DirEntry {
                        name,
                        cnid: target.cnid,
                        kind: EntryKind::File,
                        size: target.data_fork.logical_size,
                        create_date: target.create_date,
                        modify_date: target.content_mod_date,
                    }
                }
                CatalogRecord::File(f) => DirEntry {
                    name,
                    cnid: f.cnid,
                    kind: if f.is_symlink() {
                        EntryKind::Symlink
                    } else {
                        EntryKind::File
                    },
                    size: f.data_fork.logical_size,
                    create_date: f.create_date,
                    modify_date: f.content_mod_date,
                },
                _ => continue,
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    /// POSIX-shaped attributes for a record.
    pub fn stat(&self, record: &CatalogRecord, fork: ForkKind) -> Result<Stat> {
        let blocks_per_sector = (self.geo.block_size / 512) as u64;
        match record {
            CatalogRecord::Folder(f) => Ok(Stat {
                cnid: f.cnid,
                mode: effective_mode(f.bsd.file_mode, catalog::mode::S_IFDIR | 0o755),
                uid: f.bsd.owner_id,
                gid: f.bsd.group_id,
                nlink: f.valence + 2,
                rdev: 0,
                size: 0,
                blocks: 0,
                blksize: self.geo.block_size,
                atime: to_unix_time(f.access_date),
                mtime: to_unix_time(f.content_mod_date),
                ctime: to_unix_time(f.attribute_mod_date),
                birthtime: to_unix_time(f.create_date),
                bsd_flags: bsd_flags(f.bsd.owner_flags, f.bsd.admin_flags),
            }),
            CatalogRecord::File(f) => {
                let fork_data = match fork {
                    ForkKind::Data => &f.data_fork,
                    ForkKind::Resource => &f.rsrc_fork,
                };
                let device_node = f.bsd.is_device_node();
                Ok(Stat {
                    cnid: f.cnid,
                    mode: effective_mode(f.bsd.file_mode, catalog::mode::S_IFREG | 0o644),
                    uid: f.bsd.owner_id,
                    gid: f.bsd.group_id,
                    nlink: if device_node { 1 } else { f.bsd.special.max(1) },
                    rdev: if device_node { f.bsd.special } else { 0 },
                    size: fork_data.logical_size,
                    blocks: fork_data.total_blocks as u64 * blocks_per_sector,
                    blksize: self.geo.block_size,
                    atime: to_unix_time(f.access_date),
                    mtime: to_unix_time(f.content_mod_date),
                    ctime: to_unix_time(f.attribute_mod_date),
                    birthtime: to_unix_time(f.create_date),
                    bsd_flags: bsd_flags(f.bsd.owner_flags, f.bsd.admin_flags),
                })
            }
            _ => Err(HfsError::Corrupt("stat of a thread record".into())),
        }
    }

    /// The complete, ordered extent list of a fork. The caller owns it.
    pub fn extents(
        &self,
        cnid: u32,
        fork: ForkKind,
        fork_data: &ForkData,
    ) -> Result<Vec<ExtentDescriptor>> {
        let materialized = extents::materialize(
            &self.dev,
            &self.geo,
            &self.extents_tree,
            cnid,
            fork,
            fork_data,
        )?;
        Ok(materialized.extents)
    }

    /// Read from a file's fork at `offset`. Returns the number of bytes
    /// delivered, clamped at the fork's logical size.
    pub fn read(
        &self,
        file: &FileRecord,
        fork: ForkKind,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.fork_extents(file, fork)?
            .read_at(&self.dev, &self.geo, buf, offset)
    }

    /// Stream an entire fork to a writer. Returns the bytes written.
    pub fn read_to<W: Write>(&self, file: &FileRecord, fork: ForkKind, writer: &mut W) -> Result<u64> {
        let fe = self.fork_extents(file, fork)?;
        let mut buf = vec![0u8; self.geo.block_size as usize];
        let mut offset = 0u64;
        loop {
            let n = fe.read_at(&self.dev, &self.geo, &mut buf, offset)?;
            if n == 0 {
                return Ok(offset);
            }
            writer.write_all(&buf[..n])?;
            offset += n as u64;
        }
    }

    /// Read an entire fork into memory.
    pub fn read_fork(&self, file: &FileRecord, fork: ForkKind) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to(file, fork, &mut out)?;
        Ok(out)
    }

    /// Fetch one extended attribute.
    pub fn getxattr(&self, record: &CatalogRecord, name: &str) -> Result<Vec<u8>> {
        match name {
            attr::XATTR_FINDER_INFO => attr::finder_info_bytes(record)
                .map(|b| b.to_vec())
                .ok_or_else(|| HfsError::NotFound(name.into())),
            attr::XATTR_RESOURCE_FORK => match record {
                CatalogRecord::File(f) if attr::has_resource_fork(f) => {
                    self.read_fork(f, ForkKind::Resource)
                }
                _ => Err(HfsError::NotFound(name.into())),
            },
            attr::XATTR_CREATION_DATE => match record {
                CatalogRecord::File(f) => Ok(attr::timestamp_bytes(f.create_date).to_vec()),
                CatalogRecord::Folder(f) => Ok(attr::timestamp_bytes(f.create_date).to_vec()),
                _ => Err(HfsError::NotFound(name.into())),
            },
            attr::XATTR_CONTENT_CHANGE_DATE => match record {
                CatalogRecord::File(f) => Ok(attr::timestamp_bytes(f.content_mod_date).to_vec()),
                CatalogRecord::Folder(f) => Ok(attr::timestamp_bytes(f.content_mod_date).to_vec()),
                _ => Err(HfsError::NotFound(name.into())),
            },
            _ => {
                let cnid = record
                    .cnid()
                    .ok_or_else(|| HfsError::NotFound(name.into()))?;
                if let Some(tree) = self.attributes_tree()? {
                    if let Some(data) = attr::get_named(&self.dev, &self.geo, tree, cnid, name)? {
                        return Ok(data);
                    }
                }
                Err(HfsError::NotFound(name.into()))
            }
        }
    }

    /// List all attribute names visible on a record.
    pub fn listxattr(&self, record: &CatalogRecord) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if let Some(info) = attr::finder_info_bytes(record) {
            if info.iter().any(|&b| b != 0) {
                names.push(attr::XATTR_FINDER_INFO.to_string());
            }
        }
        if let CatalogRecord::File(f) = record {
            if attr::has_resource_fork(f) {
                names.push(attr::XATTR_RESOURCE_FORK.to_string());
            }
        }
        names.push(attr::XATTR_CREATION_DATE.to_string());
        names.push(attr::XATTR_CONTENT_CHANGE_DATE.to_string());

        if let Some(cnid) = record.cnid() {
            if let Some(tree) = self.attributes_tree()? {
                names.extend(attr::list_named(&self.dev, &self.geo, tree, cnid)?);
            }
        }
        Ok(names)
    }

    /// All attribute mutation fails: the volume is read-only.
    pub fn setxattr(&self, _record: &CatalogRecord, _name: &str, _value: &[u8]) -> Result<()> {
        Err(HfsError::ReadOnly)
    }

    /// Build the absolute path of a CNID by walking thread records up to
    /// the root folder.
    pub fn path_of(&self, cnid: u32) -> Result<String> {
        if cnid == catalog::CNID_ROOT_FOLDER {
            return Ok("/".to_string());
        }
        let mut components = Vec::new();
        let mut current = cnid;
        while current != catalog::CNID_ROOT_FOLDER {
            if components.len() > unicode::MAX_NAME_UNITS {
                return Err(HfsError::Corrupt(format!(
                    "thread chain from cnid {cnid} does not reach the root"
                )));
            }
            let thread = catalog::thread_for_cnid(&self.dev, &self.geo, &self.catalog, current)?
                .ok_or_else(|| HfsError::NotFound(format!("cnid {current}")))?;
            components.push(unicode::name_to_unix(&unicode::utf16_to_string_lossy(
                &thread.name,
            )));
            current = thread.parent_cnid;
        }
        components.reverse();
        Ok(format!("/{}", components.join("/")))
    }

    /// Journal info block, when the volume is journaled.
    pub fn journal_info(&self) -> Result<Option<JournalInfoBlock>> {
        if !self.header.is_journaled() || self.header.journal_info_block == 0 {
            return Ok(None);
        }
        let mut raw = vec![0u8; 180];
        let offset = self.geo.offset
            + self.header.journal_info_block as u64 * self.geo.block_size as u64;
        self.dev.read_exact_at(&mut raw, offset)?;
        Ok(Some(JournalInfoBlock::parse(&raw)?))
    }

    // --- crate-internal helpers ---

    fn fork_extents(&self, file: &FileRecord, fork: ForkKind) -> Result<ForkExtents> {
        let fork_data = match fork {
            ForkKind::Data => &file.data_fork,
            ForkKind::Resource => &file.rsrc_fork,
        };
        extents::materialize(
            &self.dev,
            &self.geo,
            &self.extents_tree,
            file.cnid,
            fork,
            fork_data,
        )
    }

    pub(crate) fn root_record(&self) -> Result<&(CatalogKey, FolderRecord)> {
        if let Some(root) = self.root.get() {
            return Ok(root);
        }
        let (key, record) =
            catalog::find_by_cnid(&self.dev, &self.geo, &self.catalog, catalog::CNID_ROOT_FOLDER)?
                .ok_or_else(|| HfsError::Corrupt("volume has no root folder".into()))?;
        let CatalogRecord::Folder(folder) = record else {
            return Err(HfsError::Corrupt("root record is not a folder".into()));
        };
        Ok(self.root.get_or_init(|| (key, folder)))
    }

    /// Thread-derived catalog key of a CNID.
    pub(crate) fn key_of_cnid(&self, cnid: u32) -> Result<CatalogKey> {
        let thread = catalog::thread_for_cnid(&self.dev, &self.geo, &self.catalog, cnid)?
            .ok_or_else(|| HfsError::NotFound(format!("cnid {cnid}")))?;
        Ok(CatalogKey {
            parent_cnid: thread.parent_cnid,
            name: thread.name,
        })
    }

    pub(crate) fn file_link_dir_cnid(&self) -> Result<u32> {
        self.private_dir_cnid(&self.file_link_dir, catalog::FILE_LINK_DIR)
    }

    pub(crate) fn dir_link_dir_cnid(&self) -> Result<u32> {
        self.private_dir_cnid(&self.dir_link_dir, catalog::DIR_LINK_DIR)
    }

    fn private_dir_cnid(&self, cell: &OnceLock<Option<u32>>, name: &str) -> Result<u32> {
        if let Some(cached) = cell.get() {
            return cached.ok_or_else(|| HfsError::NotFound(format!("private directory {name:?}")));
        }
        let units = unicode::string_to_utf16(name)?;
        let found = catalog::lookup(
            &self.dev,
            &self.geo,
            &self.catalog,
            catalog::CNID_ROOT_FOLDER,
            &units,
        )?;
        let cnid = match found {
            Some((_, CatalogRecord::Folder(f))) => Some(f.cnid),
            _ => None,
        };
        cell.get_or_init(|| cnid)
            .ok_or_else(|| HfsError::NotFound(format!("private directory {name:?}")))
    }

    fn attributes_tree(&self) -> Result<Option<&BTree>> {
        if let Some(tree) = self.attributes.get() {
            return Ok(tree.as_ref());
        }
        if self.header.attributes_file.logical_size == 0 {
            return Ok(self.attributes.get_or_init(|| None).as_ref());
        }
        let fork = extents::materialize(
            &self.dev,
            &self.geo,
            &self.extents_tree,
            catalog::CNID_ATTRIBUTES_FILE,
            ForkKind::Data,
            &self.header.attributes_file,
        )?;
        let tree = BTree::open(&self.dev, &self.geo, fork)?;
        Ok(self.attributes.get_or_init(|| Some(tree)).as_ref())
    }
}

fn effective_mode(file_mode: u16, default: u16) -> u16 {
    if file_mode & catalog::mode::S_IFMT == 0 {
        default
    } else {
        file_mode
    }
}

/// st_flags packing: owner flags low, super-user (admin) flags high.
fn bsd_flags(owner_flags: u8, admin_flags: u8) -> u32 {
    owner_flags as u32 | (admin_flags as u32) << 16
}
