use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use log::debug;

use crate::device::DeviceRead;
use crate::error::{HfsError, Result};
use crate::extents::{read_fork_data, ForkData};

/// HFS+ volume header offset from the start of the volume.
pub const VOLUME_HEADER_OFFSET: u64 = 1024;

/// "H+" — HFS+ (case-insensitive).
pub const HFS_PLUS_SIGNATURE: u16 = 0x482B;
/// "HX" — HFSX (case-sensitive).
pub const HFSX_SIGNATURE: u16 = 0x4858;
/// "BD" — classic HFS master directory block, possibly wrapping HFS+.
pub const HFS_MDB_SIGNATURE: u16 = 0x4244;

pub const HFS_PLUS_VERSION: u16 = 4;
pub const HFSX_VERSION: u16 = 5;

/// Seconds between 1904-01-01 and 1970-01-01.
pub const HFS_EPOCH_DELTA: i64 = 2_082_844_800;

/// Convert an HFS+ timestamp to POSIX time.
pub fn to_unix_time(hfs_time: u32) -> i64 {
    hfs_time as i64 - HFS_EPOCH_DELTA
}

/// Volume attribute bits (TN1150).
pub mod attributes {
    pub const HARDWARE_LOCK: u32 = 1 << 7;
    pub const UNMOUNTED: u32 = 1 << 8;
    pub const SPARED_BLOCKS: u32 = 1 << 9;
    pub const NO_CACHE_REQUIRED: u32 = 1 << 10;
    pub const BOOT_INCONSISTENT: u32 = 1 << 11;
    pub const CNIDS_RECYCLED: u32 = 1 << 12;
    pub const JOURNALED: u32 = 1 << 13;
    pub const SOFTWARE_LOCK: u32 = 1 << 15;
}

/// Placement of the volume inside its device, plus block accounting.
/// Everything below the volume header works in these terms.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// Byte offset of the volume inside the device (nonzero for HFS
    /// wrappers or callers pointing at a partition start).
    pub offset: u64,
    pub block_size: u32,
    pub total_blocks: u32,
}

/// The HFS+ volume header: 512 bytes at offset 1024.
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    pub signature: u16,
    pub version: u16,
    pub attributes: u32,
    pub last_mounted_version: u32,
    pub journal_info_block: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub checked_date: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_allocation: u32,
    pub rsrc_clump_size: u32,
    pub data_clump_size: u32,
    pub next_catalog_id: u32,
    pub write_count: u32,
    pub encoding_bitmap: u64,
    pub finder_info: [u32; 8],
    pub allocation_file: ForkData,
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
    pub attributes_file: ForkData,
    pub startup_file: ForkData,
}

impl VolumeHeader {
    /// Parse a volume header from its 512 raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let signature = cursor.read_u16::<BigEndian>()?;
        match signature {
            HFS_PLUS_SIGNATURE | HFSX_SIGNATURE => {}
            other => return Err(HfsError::NotHfs(other)),
        }

        let version = cursor.read_u16::<BigEndian>()?;
        match version {
            HFS_PLUS_VERSION | HFSX_VERSION => {}
            other => return Err(HfsError::UnsupportedVersion(other)),
        }

        let attributes = cursor.read_u32::<BigEndian>()?;
        let last_mounted_version = cursor.read_u32::<BigEndian>()?;
        let journal_info_block = cursor.read_u32::<BigEndian>()?;
        let create_date = cursor.read_u32::<BigEndian>()?;
        let modify_date = cursor.read_u32::<BigEndian>()?;
        let backup_date = cursor.read_u32::<BigEndian>()?;
        let checked_date = cursor.read_u32::<BigEndian>()?;
        let file_count = cursor.read_u32::<BigEndian>()?;
        let folder_count = cursor.read_u32::<BigEndian>()?;
        let block_size = cursor.read_u32::<BigEndian>()?;
        let total_blocks = cursor.read_u32::<BigEndian>()?;
        let free_blocks = cursor.read_u32::<BigEndian>()?;
        let next_allocation = cursor.read_u32::<BigEndian>()?;
        let rsrc_clump_size = cursor.read_u32::<BigEndian>()?;
        let data_clump_size = cursor.read_u32::<BigEndian>()?;
        let next_catalog_id = cursor.read_u32::<BigEndian>()?;
        let write_count = cursor.read_u32::<BigEndian>()?;
        let encoding_bitmap = cursor.read_u64::<BigEndian>()?;

        let mut finder_info = [0u32; 8];
        for word in &mut finder_info {
            *word = cursor.read_u32::<BigEndian>()?;
        }

        let allocation_file = read_fork_data(&mut cursor)?;
        let extents_file = read_fork_data(&mut cursor)?;
        let catalog_file = read_fork_data(&mut cursor)?;
        let attributes_file = read_fork_data(&mut cursor)?;
        let startup_file = read_fork_data(&mut cursor)?;

        if !block_size.is_power_of_two() || !(512..=1 << 20).contains(&block_size) {
            return Err(HfsError::Corrupt(format!(
                "invalid allocation block size {block_size}"
            )));
        }

        Ok(VolumeHeader {
            signature,
            version,
            attributes,
            last_mounted_version,
            journal_info_block,
            create_date,
            modify_date,
            backup_date,
            checked_date,
            file_count,
            folder_count,
            block_size,
            total_blocks,
            free_blocks,
            next_allocation,
            rsrc_clump_size,
            data_clump_size,
            next_catalog_id,
            write_count,
            encoding_bitmap,
            finder_info,
            allocation_file,
            extents_file,
            catalog_file,
            attributes_file,
            startup_file,
        })
    }

    pub fn is_hfsx(&self) -> bool {
        self.signature == HFSX_SIGNATURE
    }

    pub fn is_journaled(&self) -> bool {
        self.attributes & attributes::JOURNALED != 0
    }

    /// A volume is dirty when it was not unmounted cleanly or the boot
    /// inconsistency flag is raised.
    pub fn is_dirty(&self) -> bool {
        self.attributes & attributes::UNMOUNTED == 0
            || self.attributes & attributes::BOOT_INCONSISTENT != 0
    }

    pub fn is_locked(&self) -> bool {
        self.attributes & (attributes::HARDWARE_LOCK | attributes::SOFTWARE_LOCK) != 0
    }

    pub fn geometry(&self, offset: u64) -> Geometry {
        Geometry {
            offset,
            block_size: self.block_size,
            total_blocks: self.total_blocks,
        }
    }
}

/// Locate and parse the volume header, translating through a classic HFS
/// wrapper when one is present. Returns the header and the volume's byte
/// offset inside the device.
pub fn find_volume<D: DeviceRead>(dev: &D, base_offset: u64) -> Result<(VolumeHeader, u64)> {
    let mut raw = [0u8; 512];
    dev.read_exact_at(&mut raw, base_offset + VOLUME_HEADER_OFFSET)?;

    let signature = u16::from_be_bytes([raw[0], raw[1]]);
    if signature == HFS_MDB_SIGNATURE {
        let inner = embedded_volume_offset(&raw)?;
        let offset = base_offset + inner;
        debug!("HFS wrapper detected, embedded HFS+ volume at +{inner}");
        dev.read_exact_at(&mut raw, offset + VOLUME_HEADER_OFFSET)?;
        return Ok((VolumeHeader::parse(&raw)?, offset));
    }

    Ok((VolumeHeader::parse(&raw)?, base_offset))
}

/// Byte offset of the HFS+ volume embedded in a classic HFS wrapper,
/// from the master directory block.
fn embedded_volume_offset(mdb: &[u8]) -> Result<u64> {
    let alloc_block_size = u32::from_be_bytes([mdb[20], mdb[21], mdb[22], mdb[23]]);
    let alloc_block_start = u16::from_be_bytes([mdb[28], mdb[29]]);
    let embed_signature = u16::from_be_bytes([mdb[124], mdb[125]]);
    let embed_start = u16::from_be_bytes([mdb[126], mdb[127]]);

    if embed_signature != HFS_PLUS_SIGNATURE {
        // Plain HFS without an embedded volume is out of scope.
        return Err(HfsError::NotHfs(HFS_MDB_SIGNATURE));
    }
    Ok(alloc_block_start as u64 * 512 + embed_start as u64 * alloc_block_size as u64)
}

/// Journal info block, read for inspection only; the journal is never
/// replayed.
#[derive(Debug, Clone)]
pub struct JournalInfoBlock {
    pub flags: u32,
    pub journal_offset: u64,
    pub journal_size: u64,
}

pub mod journal_flags {
    pub const IN_FS: u32 = 1 << 0;
    pub const ON_OTHER_DEVICE: u32 = 1 << 1;
    pub const NEED_INIT: u32 = 1 << 2;
}

impl JournalInfoBlock {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let flags = cursor.read_u32::<BigEndian>()?;
        for _ in 0..8 {
            let _device_signature = cursor.read_u32::<BigEndian>()?;
        }
        let journal_offset = cursor.read_u64::<BigEndian>()?;
        let journal_size = cursor.read_u64::<BigEndian>()?;
        Ok(JournalInfoBlock {
            flags,
            journal_offset,
            journal_size,
        })
    }
}
