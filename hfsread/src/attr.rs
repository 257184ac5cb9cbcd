//! Extended attributes.
//!
//! Three attributes are synthesized from the catalog record (Finder info,
//! resource fork, timestamps); anything else comes from the Attributes
//! B-tree, whose inline-data records carry the value bytes directly.

use std::cmp::Ordering;

use crate::btree::{BTree, Direction};
use crate::catalog::{CatalogRecord, FileRecord};
use crate::device::DeviceRead;
use crate::error::{HfsError, Result};
use crate::unicode;
use crate::volume::{to_unix_time, Geometry};

pub const XATTR_FINDER_INFO: &str = "com.apple.FinderInfo";
pub const XATTR_RESOURCE_FORK: &str = "com.apple.ResourceFork";
pub const XATTR_CREATION_DATE: &str = "com.apple.metadata:kMDItemFSCreationDate";
pub const XATTR_CONTENT_CHANGE_DATE: &str = "com.apple.metadata:kMDItemFSContentChangeDate";

/// Attribute record types in the Attributes tree.
const ATTR_INLINE_DATA: u32 = 0x10;

/// The 32 Finder-info bytes of a record, exactly as stored on disk
/// (big-endian field order for both the file and folder layouts).
pub fn finder_info_bytes(record: &CatalogRecord) -> Option<[u8; 32]> {
    match record {
        CatalogRecord::File(f) => Some(f.finder_info),
        CatalogRecord::Folder(f) => Some(f.finder_info),
        _ => None,
    }
}

/// 8-byte big-endian POSIX timestamp payload.
pub fn timestamp_bytes(hfs_time: u32) -> [u8; 8] {
    to_unix_time(hfs_time).to_be_bytes()
}

/// Whether a file's resource fork exists (and with it the
/// com.apple.ResourceFork attribute).
pub fn has_resource_fork(file: &FileRecord) -> bool {
    file.rsrc_fork.logical_size > 0
}

/// Parse an Attributes-tree key: {key_length, pad, cnid, start_block,
/// name}. Returns (cnid, start_block, name, payload offset).
fn parse_attr_key(data: &[u8]) -> Result<(u32, u32, Vec<u16>, usize)> {
    if data.len() < 14 {
        return Err(HfsError::Corrupt("attribute key too short".into()));
    }
    let key_length = u16::from_be_bytes([data[0], data[1]]) as usize;
    let cnid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let start_block = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let name_length = u16::from_be_bytes([data[12], data[13]]) as usize;
    let name_end = 14 + name_length * 2;
    if name_length > unicode::MAX_NAME_UNITS || name_end > data.len() || name_end > 2 + key_length {
        return Err(HfsError::Corrupt("attribute name overruns key".into()));
    }
    let name = unicode::utf16be_to_u16(&data[14..name_end]);
    let payload = 2 + key_length + (key_length & 1);
    Ok((cnid, start_block, name, payload))
}

/// Attribute keys order by CNID, then name (binary), then start block.
fn attr_key_compare<'a>(cnid: u32, name: &'a [u16]) -> impl Fn(&[u8]) -> Ordering + 'a {
    move |record: &[u8]| {
        let Ok((rec_cnid, rec_start, rec_name, _)) = parse_attr_key(record) else {
            return Ordering::Less;
        };
        rec_cnid
            .cmp(&cnid)
            .then_with(|| unicode::compare_binary(&rec_name, name))
            .then(rec_start.cmp(&0))
    }
}

/// Inline-data payload: {record_type, reserved×2, size, bytes}.
fn parse_inline_data(payload: &[u8]) -> Result<Option<Vec<u8>>> {
    if payload.len() < 16 {
        return Err(HfsError::Corrupt("attribute record too short".into()));
    }
    let record_type = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if record_type != ATTR_INLINE_DATA {
        // Fork-based attribute data is rare and not served.
        return Ok(None);
    }
    let size = u32::from_be_bytes([payload[12], payload[13], payload[14], payload[15]]) as usize;
    let data = payload
        .get(16..16 + size)
        .ok_or_else(|| HfsError::Corrupt("attribute data overruns record".into()))?;
    Ok(Some(data.to_vec()))
}

/// Fetch one named attribute for a CNID from the Attributes tree.
pub fn get_named<D: DeviceRead>(
    dev: &D,
    geo: &Geometry,
    tree: &BTree,
    cnid: u32,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    let units = unicode::string_to_utf16(name)?;
    let compare = attr_key_compare(cnid, &units);
    match tree.find(dev, geo, &compare)? {
        Some((node, index)) => {
            let record = node.record(index)?;
            let (_, _, _, payload) = parse_attr_key(record)?;
            parse_inline_data(&record[payload..])
        }
        None => Ok(None),
    }
}

/// List attribute names recorded for a CNID, in tree order.
pub fn list_named<D: DeviceRead>(
    dev: &D,
    geo: &Geometry,
    tree: &BTree,
    cnid: u32,
) -> Result<Vec<String>> {
    let compare = attr_key_compare(cnid, &[]);
    let Some((node, index)) = tree.find_first_ge(dev, geo, &compare)? else {
        return Ok(Vec::new());
    };

    let mut names = Vec::new();
    for raw in tree.records_from(dev, geo, node, index, Direction::Forward) {
        let raw = raw?;
        let (rec_cnid, start_block, name, _) = parse_attr_key(&raw)?;
        if rec_cnid != cnid {
            break;
        }
        // Overflow records of a large attribute share its name.
        if start_block == 0 {
            names.push(unicode::utf16_to_string_lossy(&name));
        }
    }
    Ok(names)
}
