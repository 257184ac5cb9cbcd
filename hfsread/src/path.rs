//! Pathname resolution and the resolved-record cache.
//!
//! Paths are decomposed on '/', each element mapped to its on-disk form
//! (':' back to '/', then HFS+ NFD) and looked up in the catalog.
//! Directory hard-link stubs re-enter the descent at their target folder;
//! a trailing "rsrc" element selects a file's resource fork; a final file
//! hard-link stub resolves to its target record.

use std::sync::RwLock;

use crate::catalog::{self, CatalogKey, CatalogRecord};
use crate::device::DeviceRead;
use crate::error::{HfsError, Result};
use crate::extents::ForkKind;
use crate::unicode;
use crate::Volume;

/// Path suffix selecting the resource fork.
pub const RSRC_SUFFIX: &str = "rsrc";

/// Default resolved-record cache capacity.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// A resolved path: the record, its catalog key, and which fork the
/// path addressed.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    pub key: CatalogKey,
    pub record: CatalogRecord,
    pub fork: ForkKind,
}

#[derive(Clone)]
struct CacheEntry {
    path: String,
    key: CatalogKey,
    record: CatalogRecord,
}

struct CacheRing {
    slots: Vec<Option<CacheEntry>>,
    tail: usize,
}

/// Fixed-capacity ring of resolved paths under a reader-writer lock.
/// Insertion overwrites the oldest slot in place; the cache is a pure
/// accelerator and is never consulted for resource-fork paths.
pub struct RecordCache {
    ring: RwLock<CacheRing>,
}

impl RecordCache {
    pub fn new(capacity: usize) -> Self {
        RecordCache {
            ring: RwLock::new(CacheRing {
                slots: vec![None; capacity.max(1)],
                tail: 0,
            }),
        }
    }

    pub fn get(&self, path: &str) -> Option<(CatalogKey, CatalogRecord)> {
        let ring = self.ring.read().unwrap();
        ring.slots
            .iter()
            .flatten()
            .find(|entry| entry.path == path)
            .map(|entry| (entry.key.clone(), entry.record.clone()))
    }

    pub fn insert(&self, path: &str, key: CatalogKey, record: CatalogRecord) {
        let mut ring = self.ring.write().unwrap();
        let tail = ring.tail;
        ring.slots[tail] = Some(CacheEntry {
            path: path.to_string(),
            key,
            record,
        });
        ring.tail = (tail + 1) % ring.slots.len();
    }
}

/// Convert a UNIX path element to HFS+-normalized UTF-16 key form.
fn element_to_units(element: &str) -> Result<Vec<u16>> {
    let on_disk = unicode::unix_to_name(element);
    unicode::string_to_utf16(&unicode::hfs_nfd(&on_disk))
}

/// Resolve `path` against the volume's catalog.
pub fn resolve<D: DeviceRead>(vol: &Volume<D>, path: &str) -> Result<ResolvedPath> {
    let elements: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let cacheable = elements.last() != Some(&RSRC_SUFFIX);

    if cacheable {
        if let Some((key, record)) = vol.cache.get(path) {
            return Ok(ResolvedPath {
                key,
                record,
                fork: ForkKind::Data,
            });
        }
    }

    let (root_key, root) = vol.root_record()?;
    let mut key = root_key.clone();
    let mut record = CatalogRecord::Folder(root.clone());
    let mut fork = ForkKind::Data;

    let mut index = 0;
    while index < elements.len() {
        let folder_cnid = match &record {
            CatalogRecord::Folder(f) => f.cnid,
            CatalogRecord::File(_) => {
                if index == elements.len() - 1 && elements[index] == RSRC_SUFFIX {
                    fork = ForkKind::Resource;
                    index += 1;
                    break;
                }
                return Err(HfsError::NotADirectory(elements[..index].join("/")));
            }
            _ => {
                return Err(HfsError::Corrupt(
                    "thread record reached during path walk".into(),
                ))
            }
        };

        let units = element_to_units(elements[index])?;
        let Some((found_key, found)) =
            catalog::lookup(&vol.dev, &vol.geo, &vol.catalog, folder_cnid, &units)?
        else {
            return Err(HfsError::NotFound(elements[..=index].join("/")));
        };

        // A directory hard-link stub redirects the walk to its target.
        record = match found {
            CatalogRecord::File(f) if f.is_dir_hardlink() => {
                let target = catalog::resolve_dir_hardlink(
                    &vol.dev,
                    &vol.geo,
                    &vol.catalog,
                    vol.dir_link_dir_cnid()?,
                    f.bsd.special,
                )?;
                key = vol.key_of_cnid(target.cnid)?;
                CatalogRecord::Folder(target)
            }
            other => {
                key = found_key;
                other
            }
        };
        index += 1;
    }

    // A file hard-link stub at the tail resolves to the target record.
    if let CatalogRecord::File(f) = &record {
        if f.is_file_hardlink() {
            let target = catalog::resolve_file_hardlink(
                &vol.dev,
                &vol.geo,
                &vol.catalog,
                vol.file_link_dir_cnid()?,
                f.bsd.special,
            )?;
            record = CatalogRecord::File(target);
        }
    }

    if cacheable {
        vol.cache.insert(path, key.clone(), record.clone());
    }

    Ok(ResolvedPath { key, record, fork })
}
