//! Fork data and extent mapping.
//!
//! A fork carries up to eight inline extent descriptors; anything beyond
//! lives in the Extents Overflow tree keyed by (fork type, CNID, starting
//! allocation block). `materialize` flattens both sources into one ordered
//! extent list, which is what all fork reads run against.

use std::cmp::Ordering;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::btree::BTree;
use crate::device::DeviceRead;
use crate::error::{HfsError, Result};
use crate::volume::Geometry;

/// A contiguous run of allocation blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

/// Fork data as embedded in the volume header and catalog file records.
#[derive(Debug, Clone, Default)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: [ExtentDescriptor; 8],
}

/// Which of a file's two forks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkKind {
    Data,
    Resource,
}

impl ForkKind {
    /// Key byte in the Extents Overflow tree.
    pub fn key_byte(self) -> u8 {
        match self {
            ForkKind::Data => 0x00,
            ForkKind::Resource => 0xFF,
        }
    }
}

pub(crate) fn read_extent_descriptor(cursor: &mut Cursor<&[u8]>) -> Result<ExtentDescriptor> {
    Ok(ExtentDescriptor {
        start_block: cursor.read_u32::<BigEndian>()?,
        block_count: cursor.read_u32::<BigEndian>()?,
    })
}

pub(crate) fn read_fork_data(cursor: &mut Cursor<&[u8]>) -> Result<ForkData> {
    let logical_size = cursor.read_u64::<BigEndian>()?;
    let clump_size = cursor.read_u32::<BigEndian>()?;
    let total_blocks = cursor.read_u32::<BigEndian>()?;
    let mut extents = [ExtentDescriptor::default(); 8];
    for extent in &mut extents {
        *extent = read_extent_descriptor(cursor)?;
    }
    Ok(ForkData {
        logical_size,
        clump_size,
        total_blocks,
        extents,
    })
}

/// A fork with its complete, ordered extent list. The list is owned by
/// whoever asked for it; nothing references back into the volume.
#[derive(Debug, Clone)]
pub struct ForkExtents {
    pub cnid: u32,
    pub kind: ForkKind,
    pub logical_size: u64,
    pub total_blocks: u32,
    pub extents: Vec<ExtentDescriptor>,
}

impl ForkExtents {
    /// Build from the inline descriptors alone. A zero descriptor
    /// terminates the list.
    pub fn from_inline(cnid: u32, kind: ForkKind, fork: &ForkData) -> Self {
        let mut extents = Vec::new();
        for extent in &fork.extents {
            if extent.block_count == 0 {
                break;
            }
            extents.push(*extent);
        }
        ForkExtents {
            cnid,
            kind,
            logical_size: fork.logical_size,
            total_blocks: fork.total_blocks,
            extents,
        }
    }

    fn covered_blocks(&self) -> u64 {
        self.extents.iter().map(|e| e.block_count as u64).sum()
    }

    /// Require the extent list to cover the fork completely and to stay
    /// inside the volume. Special files must satisfy this from their
    /// inline extents alone.
    pub fn verify_complete(&self, geo: &Geometry) -> Result<()> {
        for extent in &self.extents {
            check_extent(extent, geo, self.cnid)?;
        }
        if self.covered_blocks() < self.total_blocks as u64 {
            return Err(HfsError::Corrupt(format!(
                "fork of cnid {} covers {} of {} blocks",
                self.cnid,
                self.covered_blocks(),
                self.total_blocks
            )));
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes at logical `offset`, clamped to the
    /// fork's logical size. Returns the number of bytes delivered.
    pub fn read_at<D: DeviceRead>(
        &self,
        dev: &D,
        geo: &Geometry,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        if offset >= self.logical_size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.logical_size - offset) as usize;
        let block_size = geo.block_size as u64;

        let mut done = 0usize;
        let mut extent_start = 0u64; // logical byte where the extent begins
        for extent in &self.extents {
            let extent_len = extent.block_count as u64 * block_size;
            let extent_end = extent_start + extent_len;
            let pos = offset + done as u64;
            if pos < extent_end && done < want {
                check_extent(extent, geo, self.cnid)?;
                let within = pos - extent_start;
                let chunk = ((extent_len - within) as usize).min(want - done);
                let dev_offset =
                    geo.offset + extent.start_block as u64 * block_size + within;
                dev.read_exact_at(&mut buf[done..done + chunk], dev_offset)?;
                done += chunk;
            }
            extent_start = extent_end;
            if done == want {
                break;
            }
        }

        if done < want {
            return Err(HfsError::Corrupt(format!(
                "extent list of cnid {} ends {} bytes short of logical size",
                self.cnid,
                want - done
            )));
        }
        Ok(done)
    }

    /// Read exactly `buf.len()` bytes; used for tree nodes, where a short
    /// read means a broken tree file.
    pub fn read_exact_at<D: DeviceRead>(
        &self,
        dev: &D,
        geo: &Geometry,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<()> {
        let n = self.read_at(dev, geo, buf, offset)?;
        if n != buf.len() {
            return Err(HfsError::Corrupt(format!(
                "short fork read: {n} of {} bytes at {offset} (cnid {})",
                buf.len(),
                self.cnid
            )));
        }
        Ok(())
    }
}

fn check_extent(extent: &ExtentDescriptor, geo: &Geometry, cnid: u32) -> Result<()> {
    let end = extent.start_block as u64 + extent.block_count as u64;
    if end > geo.total_blocks as u64 {
        return Err(HfsError::Corrupt(format!(
            "extent {}+{} of cnid {cnid} exceeds volume ({} blocks)",
            extent.start_block, extent.block_count, geo.total_blocks
        )));
    }
    Ok(())
}

/// Comparator for Extents Overflow keys: (file CNID, fork type, start
/// block), all unsigned.
fn extents_key_compare(
    cnid: u32,
    fork_type: u8,
    start_block: u32,
) -> impl Fn(&[u8]) -> Ordering {
    move |record: &[u8]| {
        // Key: key_length(2) fork_type(1) pad(1) cnid(4) start_block(4).
        if record.len() < 12 {
            return Ordering::Less;
        }
        let rec_fork_type = record[2];
        let rec_cnid = u32::from_be_bytes([record[4], record[5], record[6], record[7]]);
        let rec_start = u32::from_be_bytes([record[8], record[9], record[10], record[11]]);
        rec_cnid
            .cmp(&cnid)
            .then(rec_fork_type.cmp(&fork_type))
            .then(rec_start.cmp(&start_block))
    }
}

/// Flatten a fork's full extent list: inline descriptors, then Extents
/// Overflow records until `total_blocks` is covered.
pub fn materialize<D: DeviceRead>(
    dev: &D,
    geo: &Geometry,
    extents_tree: &BTree,
    cnid: u32,
    kind: ForkKind,
    fork: &ForkData,
) -> Result<ForkExtents> {
    let mut out = ForkExtents::from_inline(cnid, kind, fork);
    for extent in &out.extents {
        check_extent(extent, geo, cnid)?;
    }

    let mut covered = out.covered_blocks();
    while covered < out.total_blocks as u64 {
        let compare = extents_key_compare(cnid, kind.key_byte(), covered as u32);
        let Some((node, index)) = extents_tree.find(dev, geo, &compare)? else {
            return Err(HfsError::Corrupt(format!(
                "no overflow extents for cnid {cnid} at block {covered} ({} expected)",
                out.total_blocks
            )));
        };
        let record = node.record(index)?;
        let key_length = u16::from_be_bytes([record[0], record[1]]) as usize;
        let data = record
            .get(2 + key_length..)
            .ok_or_else(|| HfsError::Corrupt("overflow record missing payload".into()))?;
        if data.len() < 64 {
            return Err(HfsError::Corrupt("overflow extent record too short".into()));
        }

        let mut cursor = Cursor::new(data);
        let before = covered;
        for _ in 0..8 {
            let extent = read_extent_descriptor(&mut cursor)?;
            if extent.block_count == 0 {
                break;
            }
            check_extent(&extent, geo, cnid)?;
            covered += extent.block_count as u64;
            out.extents.push(extent);
            if covered >= out.total_blocks as u64 {
                break;
            }
        }
        if covered == before {
            return Err(HfsError::Corrupt(format!(
                "empty overflow extent record for cnid {cnid} at block {covered}"
            )));
        }
    }
    Ok(out)
}
