//! End-to-end tests against a synthetic HFS+ image.
//!
//! The fixture builder lays out a minimal but structurally honest volume:
//! a catalog tree with root, private hard-link directories, a Time
//! Machine-style directory hard link, a resource fork, decomposed Unicode
//! names, an on-disk '/' name, and a fragmented file whose extents spill
//! into the Extents Overflow tree, plus a small Attributes tree.

use std::cmp::Ordering;
use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};
use tempfile::NamedTempFile;

use hfsread::catalog::{
    CREATOR_HFS_PLUS, CREATOR_MACS, DIR_LINK_DIR, FILE_LINK_DIR, TYPE_DIR_HARDLINK,
    TYPE_FILE_HARDLINK,
};
use hfsread::unicode::{compare_folded, string_to_utf16};
use hfsread::{CatalogRecord, EntryKind, ForkKind, HfsError, Volume};

const BLOCK_SIZE: u32 = 512;
const TOTAL_BLOCKS: u32 = 120;

const CATALOG_START: u32 = 16;
const CATALOG_BLOCKS: u32 = 64;
const CATALOG_NODE_SIZE: u16 = 8192;
const EXTENTS_START: u32 = 80;
const EXTENTS_BLOCKS: u32 = 4;
const ATTRIBUTES_START: u32 = 110;
const ATTRIBUTES_BLOCKS: u32 = 4;

const DATE: u32 = 3_700_000_000;

// CNIDs used by the fixture.
const CNID_ROOT: u32 = 2;
const CNID_A_TXT: u32 = 16;
const CNID_FILE_LINK_DIR: u32 = 17;
const CNID_INODE100: u32 = 18;
const CNID_DIR_LINK_DIR: u32 = 19;
const CNID_DIR200: u32 = 20;
const CNID_INSIDE: u32 = 21;
const CNID_BACKUPS: u32 = 22;
const CNID_CAFE: u32 = 23;
const CNID_FRAG: u32 = 24;
const CNID_HLNK: u32 = 25;
const CNID_RSRCFILE: u32 = 26;
const CNID_SLASH: u32 = 27;
const CNID_SNAPSHOT: u32 = 28;

const A_CONTENT: &[u8] = b"alpha beta gamma\n";
const RSRC_CONTENT: &[u8] = b"RESOURCE-FORK-BYTES";

fn utf16(name: &str) -> Vec<u16> {
    string_to_utf16(name).unwrap()
}

fn catalog_key(parent: u32, name: &[u16]) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u16::<BigEndian>(6 + name.len() as u16 * 2).unwrap();
    out.write_u32::<BigEndian>(parent).unwrap();
    out.write_u16::<BigEndian>(name.len() as u16).unwrap();
    for unit in name {
        out.write_u16::<BigEndian>(*unit).unwrap();
    }
    out
}

fn bsd_info(out: &mut Vec<u8>, mode: u16, special: u32) {
    out.write_u32::<BigEndian>(501).unwrap(); // uid
    out.write_u32::<BigEndian>(20).unwrap(); // gid
    out.write_u8(0).unwrap(); // admin flags
    out.write_u8(0).unwrap(); // owner flags
    out.write_u16::<BigEndian>(mode).unwrap();
    out.write_u32::<BigEndian>(special).unwrap();
}

fn fork_bytes(out: &mut Vec<u8>, logical_size: u64, extents: &[(u32, u32)]) {
    assert!(extents.len() <= 8);
    let block_size = BLOCK_SIZE as u64;
    out.write_u64::<BigEndian>(logical_size).unwrap();
    out.write_u32::<BigEndian>(0).unwrap(); // clump
    // Total blocks counts the whole fork, overflow extents included.
    out.write_u32::<BigEndian>(logical_size.div_ceil(block_size) as u32)
        .unwrap();
    for i in 0..8 {
        let (start, count) = extents.get(i).copied().unwrap_or((0, 0));
        out.write_u32::<BigEndian>(start).unwrap();
        out.write_u32::<BigEndian>(count).unwrap();
    }
}

fn folder_body(cnid: u32, valence: u32) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u16::<BigEndian>(0x0001).unwrap(); // folder record
    out.write_u16::<BigEndian>(0).unwrap(); // flags
    out.write_u32::<BigEndian>(valence).unwrap();
    out.write_u32::<BigEndian>(cnid).unwrap();
    for _ in 0..5 {
        out.write_u32::<BigEndian>(DATE).unwrap();
    }
    bsd_info(&mut out, 0o040755, 0);
    out.extend_from_slice(&[0u8; 32]); // user + finder info
    out.write_u32::<BigEndian>(0).unwrap(); // text encoding
    out.write_u32::<BigEndian>(0).unwrap(); // reserved
    out
}

#[allow(clippy::too_many_arguments)]
fn file_body(
    cnid: u32,
    mode: u16,
    special: u32,
    finder_type: u32,
    creator: u32,
    data: (u64, &[(u32, u32)]),
    rsrc: (u64, &[(u32, u32)]),
) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u16::<BigEndian>(0x0002).unwrap(); // file record
    out.write_u16::<BigEndian>(0x0002).unwrap(); // flags: thread exists
    out.write_u32::<BigEndian>(0).unwrap(); // reserved
    out.write_u32::<BigEndian>(cnid).unwrap();
    for _ in 0..5 {
        out.write_u32::<BigEndian>(DATE).unwrap();
    }
    bsd_info(&mut out, mode, special);
    let mut info = [0u8; 32];
    info[..4].copy_from_slice(&finder_type.to_be_bytes());
    info[4..8].copy_from_slice(&creator.to_be_bytes());
    out.extend_from_slice(&info);
    out.write_u32::<BigEndian>(0).unwrap(); // text encoding
    out.write_u32::<BigEndian>(0).unwrap(); // reserved
    fork_bytes(&mut out, data.0, data.1);
    fork_bytes(&mut out, rsrc.0, rsrc.1);
    out
}

fn thread_body(is_folder: bool, parent: u32, name: &[u16]) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u16::<BigEndian>(if is_folder { 0x0003 } else { 0x0004 })
        .unwrap();
    out.write_u16::<BigEndian>(0).unwrap();
    out.write_u32::<BigEndian>(parent).unwrap();
    out.write_u16::<BigEndian>(name.len() as u16).unwrap();
    for unit in name {
        out.write_u16::<BigEndian>(*unit).unwrap();
    }
    out
}

/// Assemble one node: descriptor, even-aligned records, offset table.
fn make_node(node_size: usize, kind: u8, height: u8, forward: u32, records: &[Vec<u8>]) -> Vec<u8> {
    let mut node = vec![0u8; node_size];
    {
        let mut cur = std::io::Cursor::new(&mut node[..]);
        cur.write_u32::<BigEndian>(forward).unwrap();
        cur.write_u32::<BigEndian>(0).unwrap();
        cur.write_u8(kind).unwrap();
        cur.write_u8(height).unwrap();
        cur.write_u16::<BigEndian>(records.len() as u16).unwrap();
    }
    let mut at = 14usize;
    let mut offsets = vec![at as u16];
    for record in records {
        let len = record.len() + (record.len() & 1);
        node[at..at + record.len()].copy_from_slice(record);
        at += len;
        offsets.push(at as u16);
    }
    assert!(at + (offsets.len()) * 2 <= node_size, "node overflow");
    for (i, offset) in offsets.iter().enumerate() {
        let pos = node_size - (i + 1) * 2;
        node[pos..pos + 2].copy_from_slice(&offset.to_be_bytes());
    }
    node
}

fn header_node(
    node_size: usize,
    root: u32,
    leaf: u32,
    leaf_records: u32,
    total_nodes: u32,
    key_compare: u8,
) -> Vec<u8> {
    let mut rec = Vec::new();
    rec.write_u16::<BigEndian>(1).unwrap(); // depth
    rec.write_u32::<BigEndian>(root).unwrap();
    rec.write_u32::<BigEndian>(leaf_records).unwrap();
    rec.write_u32::<BigEndian>(leaf).unwrap();
    rec.write_u32::<BigEndian>(leaf).unwrap();
    rec.write_u16::<BigEndian>(node_size as u16).unwrap();
    rec.write_u16::<BigEndian>(516).unwrap(); // max key length
    rec.write_u32::<BigEndian>(total_nodes).unwrap();
    rec.write_u32::<BigEndian>(total_nodes - 2).unwrap(); // free nodes
    rec.write_u16::<BigEndian>(0).unwrap();
    rec.write_u32::<BigEndian>(0).unwrap(); // clump
    rec.write_u8(0).unwrap(); // tree type
    rec.write_u8(key_compare).unwrap();
    rec.write_u32::<BigEndian>(0x0000_0002).unwrap(); // big keys
    rec.resize(106, 0);
    make_node(node_size, 0x01, 0, 0, &[rec])
}

/// Catalog leaf records, sorted the way the comparator expects them.
fn catalog_records() -> Vec<Vec<u8>> {
    let cafe_decomposed = "cafe\u{301}";
    let mut entries: Vec<(u32, Vec<u16>, Vec<u8>)> = vec![
        // Root folder under the root parent, named like the volume.
        (1, utf16("TestVol"), folder_body(CNID_ROOT, 9)),
        (CNID_ROOT, vec![], thread_body(true, 1, &utf16("TestVol"))),
        // Root children.
        (
            CNID_ROOT,
            utf16(FILE_LINK_DIR),
            folder_body(CNID_FILE_LINK_DIR, 1),
        ),
        (
            CNID_ROOT,
            utf16(DIR_LINK_DIR),
            folder_body(CNID_DIR_LINK_DIR, 1),
        ),
        (
            CNID_ROOT,
            utf16("a.txt"),
            file_body(
                CNID_A_TXT,
                0o100644,
                100,
                TYPE_FILE_HARDLINK,
                CREATOR_HFS_PLUS,
                (0, &[]),
                (0, &[]),
            ),
        ),
        (
            CNID_ROOT,
            utf16("Backups.backupdb"),
            folder_body(CNID_BACKUPS, 1),
        ),
        (
            CNID_ROOT,
            utf16(cafe_decomposed),
            file_body(CNID_CAFE, 0o100644, 0, 0, 0, (8, &[(85, 1)]), (0, &[])),
        ),
        (
            CNID_ROOT,
            utf16("frag.bin"),
            file_body(
                CNID_FRAG,
                0o100644,
                0,
                0,
                0,
                (
                    10 * BLOCK_SIZE as u64,
                    &[
                        (90, 1),
                        (92, 1),
                        (94, 1),
                        (96, 1),
                        (98, 1),
                        (100, 1),
                        (102, 1),
                        (104, 1),
                    ],
                ),
                (0, &[]),
            ),
        ),
        (
            CNID_ROOT,
            utf16("hlnk_to_a"),
            file_body(
                CNID_HLNK,
                0o100644,
                100,
                TYPE_FILE_HARDLINK,
                CREATOR_HFS_PLUS,
                (0, &[]),
                (0, &[]),
            ),
        ),
        (
            CNID_ROOT,
            utf16("rsrcfile"),
            file_body(
                CNID_RSRCFILE,
                0o100644,
                0,
                0x5445_5854, // 'TEXT'
                0x7474_7874, // 'ttxt'
                (4, &[(86, 1)]),
                (RSRC_CONTENT.len() as u64, &[(87, 1)]),
            ),
        ),
        (
            CNID_ROOT,
            utf16("sl/ash"),
            file_body(CNID_SLASH, 0o100644, 0, 0, 0, (5, &[(88, 1)]), (0, &[])),
        ),
        // File hard-link target.
        (
            CNID_FILE_LINK_DIR,
            utf16("iNode100"),
            file_body(
                CNID_INODE100,
                0o100644,
                2,
                0,
                0,
                (A_CONTENT.len() as u64, &[(84, 1)]),
                (0, &[]),
            ),
        ),
        // Directory hard-link target with one child.
        (
            CNID_DIR_LINK_DIR,
            utf16("dir_200"),
            folder_body(CNID_DIR200, 1),
        ),
        (
            CNID_DIR200,
            utf16("inside.txt"),
            file_body(CNID_INSIDE, 0o100644, 0, 0, 0, (14, &[(89, 1)]), (0, &[])),
        ),
        // Time Machine-style snapshot: a directory hard-link stub.
        (
            CNID_BACKUPS,
            utf16("2020-01-01-000000"),
            file_body(
                CNID_SNAPSHOT,
                0o100644,
                200,
                TYPE_DIR_HARDLINK,
                CREATOR_MACS,
                (0, &[]),
                (0, &[]),
            ),
        ),
        // Thread records.
        (CNID_A_TXT, vec![], thread_body(false, CNID_ROOT, &utf16("a.txt"))),
        (
            CNID_FILE_LINK_DIR,
            vec![],
            thread_body(true, CNID_ROOT, &utf16(FILE_LINK_DIR)),
        ),
        (
            CNID_INODE100,
            vec![],
            thread_body(false, CNID_FILE_LINK_DIR, &utf16("iNode100")),
        ),
        (
            CNID_DIR_LINK_DIR,
            vec![],
            thread_body(true, CNID_ROOT, &utf16(DIR_LINK_DIR)),
        ),
        (
            CNID_DIR200,
            vec![],
            thread_body(true, CNID_DIR_LINK_DIR, &utf16("dir_200")),
        ),
        (
            CNID_INSIDE,
            vec![],
            thread_body(false, CNID_DIR200, &utf16("inside.txt")),
        ),
        (
            CNID_BACKUPS,
            vec![],
            thread_body(true, CNID_ROOT, &utf16("Backups.backupdb")),
        ),
        (
            CNID_CAFE,
            vec![],
            thread_body(false, CNID_ROOT, &utf16(cafe_decomposed)),
        ),
        (CNID_FRAG, vec![], thread_body(false, CNID_ROOT, &utf16("frag.bin"))),
        (CNID_HLNK, vec![], thread_body(false, CNID_ROOT, &utf16("hlnk_to_a"))),
        (
            CNID_RSRCFILE,
            vec![],
            thread_body(false, CNID_ROOT, &utf16("rsrcfile")),
        ),
        (CNID_SLASH, vec![], thread_body(false, CNID_ROOT, &utf16("sl/ash"))),
        (
            CNID_SNAPSHOT,
            vec![],
            thread_body(false, CNID_BACKUPS, &utf16("2020-01-01-000000")),
        ),
    ];

    entries.sort_by(|a, b| match a.0.cmp(&b.0) {
        Ordering::Equal => compare_folded(&a.1, &b.1),
        other => other,
    });

    entries
        .into_iter()
        .map(|(parent, name, body)| {
            let mut record = catalog_key(parent, &name);
            record.extend_from_slice(&body);
            record
        })
        .collect()
}

/// One overflow record continuing frag.bin past its eight inline extents.
fn extents_leaf_record() -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u16::<BigEndian>(10).unwrap(); // key length
    out.write_u8(0).unwrap(); // data fork
    out.write_u8(0).unwrap(); // pad
    out.write_u32::<BigEndian>(CNID_FRAG).unwrap();
    out.write_u32::<BigEndian>(8).unwrap(); // start block
    for extent in [(106u32, 1u32), (108, 1), (0, 0), (0, 0), (0, 0), (0, 0), (0, 0), (0, 0)] {
        out.write_u32::<BigEndian>(extent.0).unwrap();
        out.write_u32::<BigEndian>(extent.1).unwrap();
    }
    out
}

/// One inline-data attribute on rsrcfile.
fn attributes_leaf_record() -> Vec<u8> {
    let name = utf16("user.tag");
    let mut out = Vec::new();
    out.write_u16::<BigEndian>(12 + name.len() as u16 * 2).unwrap();
    out.write_u16::<BigEndian>(0).unwrap(); // pad
    out.write_u32::<BigEndian>(CNID_RSRCFILE).unwrap();
    out.write_u32::<BigEndian>(0).unwrap(); // start block
    out.write_u16::<BigEndian>(name.len() as u16).unwrap();
    for unit in &name {
        out.write_u16::<BigEndian>(*unit).unwrap();
    }
    out.write_u32::<BigEndian>(0x10).unwrap(); // inline data
    out.write_u32::<BigEndian>(0).unwrap();
    out.write_u32::<BigEndian>(0).unwrap();
    out.write_u32::<BigEndian>(5).unwrap();
    out.extend_from_slice(b"green");
    out
}

fn write_volume_header(image: &mut [u8], dirty: bool) {
    let mut vh = Vec::with_capacity(512);
    vh.write_u16::<BigEndian>(0x482B).unwrap(); // "H+"
    vh.write_u16::<BigEndian>(4).unwrap();
    let mut attributes = 1u32 << 13; // journaled
    if !dirty {
        attributes |= 1 << 8; // unmounted cleanly
    }
    vh.write_u32::<BigEndian>(attributes).unwrap();
    vh.write_u32::<BigEndian>(0x4846_534A).unwrap(); // 'HFSJ'
    vh.write_u32::<BigEndian>(0).unwrap(); // journal info block
    for _ in 0..4 {
        vh.write_u32::<BigEndian>(DATE).unwrap();
    }
    vh.write_u32::<BigEndian>(9).unwrap(); // files
    vh.write_u32::<BigEndian>(5).unwrap(); // folders
    vh.write_u32::<BigEndian>(BLOCK_SIZE).unwrap();
    vh.write_u32::<BigEndian>(TOTAL_BLOCKS).unwrap();
    vh.write_u32::<BigEndian>(6).unwrap(); // free blocks
    vh.write_u32::<BigEndian>(114).unwrap(); // next allocation
    vh.write_u32::<BigEndian>(0).unwrap();
    vh.write_u32::<BigEndian>(0).unwrap();
    vh.write_u32::<BigEndian>(29).unwrap(); // next cnid
    vh.write_u32::<BigEndian>(1).unwrap(); // write count
    vh.write_u64::<BigEndian>(1).unwrap(); // encodings
    for _ in 0..8 {
        vh.write_u32::<BigEndian>(0).unwrap(); // finder info
    }
    // Allocation file (never read by the reader).
    fork_bytes(&mut vh, 0, &[]);
    // Extents overflow file.
    fork_bytes(
        &mut vh,
        EXTENTS_BLOCKS as u64 * BLOCK_SIZE as u64,
        &[(EXTENTS_START, EXTENTS_BLOCKS)],
    );
    // Catalog file.
    fork_bytes(
        &mut vh,
        CATALOG_BLOCKS as u64 * BLOCK_SIZE as u64,
        &[(CATALOG_START, CATALOG_BLOCKS)],
    );
    // Attributes file.
    fork_bytes(
        &mut vh,
        ATTRIBUTES_BLOCKS as u64 * BLOCK_SIZE as u64,
        &[(ATTRIBUTES_START, ATTRIBUTES_BLOCKS)],
    );
    // Startup file.
    fork_bytes(&mut vh, 0, &[]);
    vh.resize(512, 0);
    image[1024..1536].copy_from_slice(&vh);
}

fn write_at(image: &mut [u8], block: u32, data: &[u8]) {
    let at = block as usize * BLOCK_SIZE as usize;
    image[at..at + data.len()].copy_from_slice(data);
}

fn build_image(dirty: bool) -> Vec<u8> {
    let mut image = vec![0u8; TOTAL_BLOCKS as usize * BLOCK_SIZE as usize];
    write_volume_header(&mut image, dirty);

    // Catalog: header node + one leaf holding every record.
    let records = catalog_records();
    let leaf_count = records.len() as u32;
    write_at(
        &mut image,
        CATALOG_START,
        &header_node(CATALOG_NODE_SIZE as usize, 1, 1, leaf_count, 4, 0xCF),
    );
    let leaf = make_node(CATALOG_NODE_SIZE as usize, 0xFF, 1, 0, &records);
    let at = CATALOG_START as usize * BLOCK_SIZE as usize + CATALOG_NODE_SIZE as usize;
    image[at..at + leaf.len()].copy_from_slice(&leaf);

    // Extents overflow tree.
    write_at(&mut image, EXTENTS_START, &header_node(512, 1, 1, 1, 4, 0xBC));
    write_at(
        &mut image,
        EXTENTS_START + 1,
        &make_node(512, 0xFF, 1, 0, &[extents_leaf_record()]),
    );

    // Attributes tree.
    write_at(
        &mut image,
        ATTRIBUTES_START,
        &header_node(512, 1, 1, 1, 4, 0xBC),
    );
    write_at(
        &mut image,
        ATTRIBUTES_START + 1,
        &make_node(512, 0xFF, 1, 0, &[attributes_leaf_record()]),
    );

    // File contents.
    write_at(&mut image, 84, A_CONTENT);
    write_at(&mut image, 85, b"unicode!");
    write_at(&mut image, 86, b"DATA");
    write_at(&mut image, 87, RSRC_CONTENT);
    write_at(&mut image, 88, b"slash");
    write_at(&mut image, 89, b"backup payload");
    for logical in 0..10u32 {
        let block = if logical < 8 { 90 + 2 * logical } else { 106 + 2 * (logical - 8) };
        let content = vec![block as u8; BLOCK_SIZE as usize];
        write_at(&mut image, block, &content);
    }

    image
}

fn open_fixture(dirty: bool) -> (NamedTempFile, Volume) {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&build_image(dirty)).unwrap();
    file.flush().unwrap();
    let vol = Volume::open(file.path()).unwrap();
    (file, vol)
}

#[test]
fn volume_header_and_name() {
    let (_file, vol) = open_fixture(false);
    assert_eq!(vol.header().block_size, BLOCK_SIZE);
    assert_eq!(vol.header().total_blocks, TOTAL_BLOCKS);
    assert!(vol.is_journaled());
    assert!(!vol.is_dirty());
    assert_eq!(vol.name().unwrap(), "TestVol");
}

#[test]
fn root_listing_in_key_order() {
    let (_file, vol) = open_fixture(false);
    let entries = vol.read_dir(CNID_ROOT).unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            DIR_LINK_DIR,
            "a.txt",
            "Backups.backupdb",
            "cafe\u{301}",
            "frag.bin",
            FILE_LINK_DIR,
            "hlnk_to_a",
            "rsrcfile",
            "sl:ash",
        ]
    );

    let root = vol.lookup("/").unwrap();
    let st = vol.stat(&root.record, ForkKind::Data).unwrap();
    assert_eq!(st.mode & 0o170000, 0o040000);
    assert_eq!(st.nlink, 9 + 2);
}

#[test]
fn file_hardlinks_resolve_to_target() {
    let (_file, vol) = open_fixture(false);

    let link = vol.lookup("/hlnk_to_a").unwrap();
    let CatalogRecord::File(linked) = &link.record else {
        panic!("expected a file record");
    };
    assert_eq!(linked.cnid, CNID_INODE100);

    let a = vol.lookup("/a.txt").unwrap();
    let CatalogRecord::File(a_file) = &a.record else {
        panic!("expected a file record");
    };
    assert_eq!(a_file.cnid, CNID_INODE100);

    assert_eq!(vol.read_fork(linked, ForkKind::Data).unwrap(), A_CONTENT);
    assert_eq!(vol.read_fork(a_file, ForkKind::Data).unwrap(), A_CONTENT);

    let st = vol.stat(&link.record, ForkKind::Data).unwrap();
    assert_eq!(st.nlink, 2);
}

#[test]
fn directory_hardlink_traversal() {
    let (_file, vol) = open_fixture(false);

    let snapshot = vol.lookup("/Backups.backupdb/2020-01-01-000000").unwrap();
    let CatalogRecord::Folder(folder) = &snapshot.record else {
        panic!("directory hard link should resolve to a folder");
    };
    assert_eq!(folder.cnid, CNID_DIR200);

    let children = vol.read_dir(folder.cnid).unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].name, "inside.txt");

    // The listing of the containing folder shows the link as a directory.
    let listing = vol.read_dir(CNID_BACKUPS).unwrap();
    assert_eq!(listing[0].kind, EntryKind::Directory);
    assert_eq!(listing[0].cnid, CNID_DIR200);

    // Descent through the link reaches the backing directory's children.
    let inside = vol
        .lookup("/Backups.backupdb/2020-01-01-000000/inside.txt")
        .unwrap();
    let CatalogRecord::File(f) = &inside.record else {
        panic!("expected a file record");
    };
    assert_eq!(vol.read_fork(f, ForkKind::Data).unwrap(), b"backup payload");
}

#[test]
fn resource_fork_via_suffix_and_xattr() {
    let (_file, vol) = open_fixture(false);

    let rsrc = vol.lookup("/rsrcfile/rsrc").unwrap();
    assert_eq!(rsrc.fork, ForkKind::Resource);
    let CatalogRecord::File(f) = &rsrc.record else {
        panic!("expected a file record");
    };
    assert_eq!(vol.read_fork(f, ForkKind::Resource).unwrap(), RSRC_CONTENT);

    let plain = vol.lookup("/rsrcfile").unwrap();
    assert_eq!(plain.fork, ForkKind::Data);
    assert_eq!(
        vol.getxattr(&plain.record, "com.apple.ResourceFork").unwrap(),
        RSRC_CONTENT
    );

    let st = vol.stat(&rsrc.record, ForkKind::Resource).unwrap();
    assert_eq!(st.size, RSRC_CONTENT.len() as u64);
}

#[test]
fn unicode_lookup_normalizes_input() {
    let (_file, vol) = open_fixture(false);

    // Precomposed é finds the decomposed on-disk name.
    let precomposed = vol.lookup("/caf\u{e9}").unwrap();
    assert_eq!(precomposed.record.cnid(), Some(CNID_CAFE));

    // The decomposed spelling works too.
    let decomposed = vol.lookup("/cafe\u{301}").unwrap();
    assert_eq!(decomposed.record.cnid(), Some(CNID_CAFE));
}

#[test]
fn colon_and_slash_are_swapped() {
    let (_file, vol) = open_fixture(false);

    let found = vol.lookup("/sl:ash").unwrap();
    let CatalogRecord::File(f) = &found.record else {
        panic!("expected a file record");
    };
    assert_eq!(f.cnid, CNID_SLASH);
    assert_eq!(vol.read_fork(f, ForkKind::Data).unwrap(), b"slash");

    assert!(matches!(
        vol.lookup("/sl/ash"),
        Err(HfsError::NotFound(_))
    ));
}

#[test]
fn dirty_volume_opens_and_reads() {
    let (_file, vol) = open_fixture(true);
    assert!(vol.is_dirty());

    let found = vol.lookup("/rsrcfile").unwrap();
    let CatalogRecord::File(f) = &found.record else {
        panic!("expected a file record");
    };
    assert_eq!(vol.read_fork(f, ForkKind::Data).unwrap(), b"DATA");
}

#[test]
fn fragmented_file_reads_across_overflow_boundary() {
    let (_file, vol) = open_fixture(false);

    let found = vol.lookup("/frag.bin").unwrap();
    let CatalogRecord::File(f) = &found.record else {
        panic!("expected a file record");
    };

    let extents = vol.extents(f.cnid, ForkKind::Data, &f.data_fork).unwrap();
    assert_eq!(extents.len(), 10);

    let data = vol.read_fork(f, ForkKind::Data).unwrap();
    assert_eq!(data.len(), 10 * BLOCK_SIZE as usize);
    for logical in 0..10usize {
        let expected = if logical < 8 { 90 + 2 * logical } else { 106 + 2 * (logical - 8) } as u8;
        let chunk = &data[logical * BLOCK_SIZE as usize..(logical + 1) * BLOCK_SIZE as usize];
        assert!(chunk.iter().all(|&b| b == expected), "block {logical}");
    }

    // A read crossing the inline/overflow seam.
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    let seam = 8 * BLOCK_SIZE as u64 - 256;
    assert_eq!(vol.read(f, ForkKind::Data, seam, &mut buf).unwrap(), buf.len());
    assert!(buf[..256].iter().all(|&b| b == 104));
    assert!(buf[256..].iter().all(|&b| b == 106));
}

#[test]
fn path_of_inverts_lookup() {
    let (_file, vol) = open_fixture(false);

    assert_eq!(vol.path_of(CNID_ROOT).unwrap(), "/");
    assert_eq!(vol.path_of(CNID_RSRCFILE).unwrap(), "/rsrcfile");
    assert_eq!(vol.path_of(CNID_CAFE).unwrap(), "/cafe\u{301}");
    assert_eq!(
        vol.path_of(CNID_INSIDE).unwrap(),
        format!("/{DIR_LINK_DIR}/dir_200/inside.txt")
    );
    // On-disk '/' surfaces as ':'.
    assert_eq!(vol.path_of(CNID_SLASH).unwrap(), "/sl:ash");
}

#[test]
fn find_by_cnid_round_trips() {
    let (_file, vol) = open_fixture(false);
    let found = vol.find_by_cnid(CNID_RSRCFILE).unwrap();
    assert_eq!(found.record.cnid(), Some(CNID_RSRCFILE));
    assert_eq!(found.key.parent_cnid, CNID_ROOT);
}

#[test]
fn xattrs_virtual_and_named() {
    let (_file, vol) = open_fixture(false);
    let found = vol.lookup("/rsrcfile").unwrap();

    let names = vol.listxattr(&found.record).unwrap();
    assert!(names.contains(&"com.apple.FinderInfo".to_string()));
    assert!(names.contains(&"com.apple.ResourceFork".to_string()));
    assert!(names.contains(&"com.apple.metadata:kMDItemFSCreationDate".to_string()));
    assert!(names.contains(&"user.tag".to_string()));

    let finder_info = vol.getxattr(&found.record, "com.apple.FinderInfo").unwrap();
    assert_eq!(finder_info.len(), 32);
    assert_eq!(&finder_info[..4], b"TEXT");
    assert_eq!(&finder_info[4..8], b"ttxt");

    let created = vol
        .getxattr(&found.record, "com.apple.metadata:kMDItemFSCreationDate")
        .unwrap();
    assert_eq!(created, (DATE as i64 - 2_082_844_800).to_be_bytes());

    assert_eq!(vol.getxattr(&found.record, "user.tag").unwrap(), b"green");
    assert!(matches!(
        vol.getxattr(&found.record, "user.absent"),
        Err(HfsError::NotFound(_))
    ));
    assert!(matches!(
        vol.setxattr(&found.record, "user.tag", b"red"),
        Err(HfsError::ReadOnly)
    ));
}

#[test]
fn error_kinds_for_bad_paths() {
    let (_file, vol) = open_fixture(false);
    assert!(matches!(vol.lookup("/nope"), Err(HfsError::NotFound(_))));
    assert!(matches!(
        vol.lookup("/a.txt/child"),
        Err(HfsError::NotADirectory(_))
    ));
}

#[test]
fn concurrent_lookups_agree() {
    let (_file, vol) = open_fixture(false);
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                scope.spawn(|| {
                    let found = vol.lookup("/Backups.backupdb/2020-01-01-000000/inside.txt").unwrap();
                    let CatalogRecord::File(f) = found.record else {
                        panic!("expected a file record");
                    };
                    (f.cnid, vol.read_fork(&f, ForkKind::Data).unwrap())
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for (cnid, data) in &results {
            assert_eq!(*cnid, CNID_INSIDE);
            assert_eq!(data, &results[0].1);
        }
    });
}

#[test]
fn hfs_wrapper_translates_to_embedded_volume() {
    // Wrap the volume in a classic HFS shell: MDB at 1024, embedded
    // HFS+ at drAlBlSt * 512 + start * drAlBlkSiz = 16 * 512 = 8192.
    let inner = build_image(false);
    let mut outer = vec![0u8; 8192 + inner.len()];
    outer[1024] = 0x42; // 'B'
    outer[1025] = 0x44; // 'D'
    outer[1044..1048].copy_from_slice(&512u32.to_be_bytes()); // drAlBlkSiz
    outer[1052..1054].copy_from_slice(&16u16.to_be_bytes()); // drAlBlSt
    outer[1148..1150].copy_from_slice(&0x482Bu16.to_be_bytes()); // embed signature
    outer[1150..1152].copy_from_slice(&0u16.to_be_bytes()); // embed start block
    outer[8192..].copy_from_slice(&inner);

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(&outer).unwrap();
    file.flush().unwrap();

    let vol = Volume::open(file.path()).unwrap();
    assert_eq!(vol.name().unwrap(), "TestVol");
    let found = vol.lookup("/rsrcfile").unwrap();
    let CatalogRecord::File(f) = &found.record else {
        panic!("expected a file record");
    };
    assert_eq!(vol.read_fork(f, ForkKind::Data).unwrap(), b"DATA");
}
