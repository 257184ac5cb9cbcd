//! Generic HFS+ B-tree walker.
//!
//! One engine serves the Catalog, Extents Overflow and Attributes trees:
//! nodes are fetched through the tree file's extent map, keys are compared
//! through a caller-supplied ordering, and iteration follows the leaf
//! sibling links. The engine holds no cache and no interior state, so
//! concurrent lookups only contend on the device layer.

use std::cmp::Ordering;
use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::device::DeviceRead;
use crate::error::{HfsError, Result};
use crate::extents::ForkExtents;
use crate::volume::Geometry;

pub const NODE_KIND_LEAF: u8 = 0xFF;
pub const NODE_KIND_INDEX: u8 = 0x00;
pub const NODE_KIND_HEADER: u8 = 0x01;
pub const NODE_KIND_MAP: u8 = 0x02;

/// Key-compare type bytes from the tree header.
pub const KEY_COMPARE_CASE_FOLDING: u8 = 0xCF;
pub const KEY_COMPARE_BINARY: u8 = 0xBC;

const NODE_DESCRIPTOR_LEN: usize = 14;

/// B-tree header record (record 0 of the header node).
#[derive(Debug, Clone)]
pub struct BTreeHeaderRecord {
    pub tree_depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf_node: u32,
    pub last_leaf_node: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub key_compare_type: u8,
    pub attributes: u32,
}

/// Node descriptor: the 14 bytes at the start of every node.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub forward_link: u32,
    pub backward_link: u32,
    pub kind: u8,
    pub height: u8,
    pub num_records: u16,
}

/// A fetched node: descriptor, raw bytes, and the validated record
/// offset table from the node tail.
#[derive(Debug)]
pub struct Node {
    pub number: u32,
    pub descriptor: NodeDescriptor,
    data: Vec<u8>,
    offsets: Vec<u16>,
}

impl Node {
    /// Raw bytes of record `index` (key included).
    pub fn record(&self, index: usize) -> Result<&[u8]> {
        if index >= self.descriptor.num_records as usize {
            return Err(HfsError::Corrupt(format!(
                "record index {index} out of range in node {}",
                self.number
            )));
        }
        let start = self.offsets[index] as usize;
        let end = self.offsets[index + 1] as usize;
        Ok(&self.data[start..end])
    }
}

fn parse_node_descriptor(data: &[u8]) -> Result<NodeDescriptor> {
    let mut cursor = Cursor::new(data);
    Ok(NodeDescriptor {
        forward_link: cursor.read_u32::<BigEndian>()?,
        backward_link: cursor.read_u32::<BigEndian>()?,
        kind: cursor.read_u8()?,
        height: cursor.read_u8()?,
        num_records: {
            let n = cursor.read_u16::<BigEndian>()?;
            let _reserved = cursor.read_u16::<BigEndian>()?;
            n
        },
    })
}

/// A B-tree bound to the extent map of its backing file.
pub struct BTree {
    pub desc: BTreeHeaderRecord,
    pub fork: ForkExtents,
}

impl BTree {
    /// Open a tree by reading its header node through `fork`.
    pub fn open<D: DeviceRead>(dev: &D, geo: &Geometry, fork: ForkExtents) -> Result<BTree> {
        // Node size is unknown until the header record is read, so start
        // with the minimum node size.
        let mut head = vec![0u8; 512];
        fork.read_exact_at(dev, geo, &mut head, 0)?;

        let descriptor = parse_node_descriptor(&head)?;
        if descriptor.kind != NODE_KIND_HEADER {
            return Err(HfsError::Corrupt(format!(
                "expected header node, got kind 0x{:02X}",
                descriptor.kind
            )));
        }

        let mut cursor = Cursor::new(&head[NODE_DESCRIPTOR_LEN..]);
        let tree_depth = cursor.read_u16::<BigEndian>()?;
        let root_node = cursor.read_u32::<BigEndian>()?;
        let leaf_records = cursor.read_u32::<BigEndian>()?;
        let first_leaf_node = cursor.read_u32::<BigEndian>()?;
        let last_leaf_node = cursor.read_u32::<BigEndian>()?;
        let node_size = cursor.read_u16::<BigEndian>()?;
        let max_key_length = cursor.read_u16::<BigEndian>()?;
        let total_nodes = cursor.read_u32::<BigEndian>()?;
        let free_nodes = cursor.read_u32::<BigEndian>()?;
        let _reserved = cursor.read_u16::<BigEndian>()?;
        let _clump_size = cursor.read_u32::<BigEndian>()?;
        let _btree_type = cursor.read_u8()?;
        let key_compare_type = cursor.read_u8()?;
        let attributes = cursor.read_u32::<BigEndian>()?;

        if !node_size.is_power_of_two() || node_size < 512 {
            return Err(HfsError::Corrupt(format!(
                "invalid B-tree node size {node_size}"
            )));
        }

        Ok(BTree {
            desc: BTreeHeaderRecord {
                tree_depth,
                root_node,
                leaf_records,
                first_leaf_node,
                last_leaf_node,
                node_size,
                max_key_length,
                total_nodes,
                free_nodes,
                key_compare_type,
                attributes,
            },
            fork,
        })
    }

    /// Whether key comparison for this tree is binary (HFSX catalog).
    pub fn case_sensitive(&self) -> bool {
        self.desc.key_compare_type == KEY_COMPARE_BINARY
    }

    /// Fetch and validate node `number`.
    pub fn node<D: DeviceRead>(&self, dev: &D, geo: &Geometry, number: u32) -> Result<Node> {
        if number >= self.desc.total_nodes {
            return Err(HfsError::Corrupt(format!(
                "node {number} out of range (tree has {})",
                self.desc.total_nodes
            )));
        }
        let node_size = self.desc.node_size as usize;
        let mut data = vec![0u8; node_size];
        self.fork
            .read_exact_at(dev, geo, &mut data, number as u64 * node_size as u64)?;

        let descriptor = parse_node_descriptor(&data)?;
        let num = descriptor.num_records as usize;

        // Offset table at the node tail, one entry per record plus the
        // free-space offset, growing toward the descriptor.
        let table_len = (num + 1) * 2;
        if NODE_DESCRIPTOR_LEN + table_len > node_size {
            return Err(HfsError::Corrupt(format!(
                "record count {num} overflows node {number}"
            )));
        }
        let mut offsets = Vec::with_capacity(num + 1);
        for i in 0..=num {
            let pos = node_size - (i + 1) * 2;
            offsets.push(u16::from_be_bytes([data[pos], data[pos + 1]]));
        }

        let limit = (node_size - table_len) as u16;
        for pair in offsets.windows(2) {
            if pair[0] >= pair[1] {
                return Err(HfsError::Corrupt(format!(
                    "non-monotonic record offsets in node {number}"
                )));
            }
        }
        if offsets[0] as usize != NODE_DESCRIPTOR_LEN || offsets[num] > limit {
            return Err(HfsError::Corrupt(format!(
                "record offsets out of bounds in node {number}"
            )));
        }

        Ok(Node {
            number,
            descriptor,
            data,
            offsets,
        })
    }

    /// Exact-match search. The comparator orders a stored record's key
    /// against the target: `Less` means the record sorts before it.
    pub fn find<D, F>(&self, dev: &D, geo: &Geometry, compare: &F) -> Result<Option<(Node, usize)>>
    where
        D: DeviceRead,
        F: Fn(&[u8]) -> Ordering,
    {
        let Some(leaf) = self.descend(dev, geo, compare, false)? else {
            return Ok(None);
        };
        for i in 0..leaf.descriptor.num_records as usize {
            match compare(leaf.record(i)?) {
                Ordering::Equal => return Ok(Some((leaf, i))),
                Ordering::Greater => return Ok(None),
                Ordering::Less => continue,
            }
        }
        Ok(None)
    }

    /// Position at the first leaf record whose key is >= the target.
    /// Returns the containing node and record index, or None when every
    /// record in the tree sorts before the target.
    pub fn find_first_ge<D, F>(
        &self,
        dev: &D,
        geo: &Geometry,
        compare: &F,
    ) -> Result<Option<(Node, usize)>>
    where
        D: DeviceRead,
        F: Fn(&[u8]) -> Ordering,
    {
        let Some(mut leaf) = self.descend(dev, geo, compare, true)? else {
            return Ok(None);
        };
        let mut hops = 0u32;
        loop {
            for i in 0..leaf.descriptor.num_records as usize {
                if compare(leaf.record(i)?) != Ordering::Less {
                    return Ok(Some((leaf, i)));
                }
            }
            let next = leaf.descriptor.forward_link;
            if next == 0 {
                return Ok(None);
            }
            hops += 1;
            if hops > self.desc.total_nodes {
                return Err(HfsError::Corrupt("leaf sibling cycle".into()));
            }
            leaf = self.node(dev, geo, next)?;
            if leaf.descriptor.kind != NODE_KIND_LEAF {
                return Err(HfsError::Corrupt(format!(
                    "leaf sibling {} has kind 0x{:02X}",
                    leaf.number, leaf.descriptor.kind
                )));
            }
        }
    }

    /// Descend index nodes picking the rightmost child whose separator is
    /// <= the target. With `for_ge`, an undershot target falls back to the
    /// leftmost child instead of failing.
    fn descend<D, F>(
        &self,
        dev: &D,
        geo: &Geometry,
        compare: &F,
        for_ge: bool,
    ) -> Result<Option<Node>>
    where
        D: DeviceRead,
        F: Fn(&[u8]) -> Ordering,
    {
        if self.desc.root_node == 0 {
            return Ok(None);
        }
        let mut current = self.desc.root_node;
        let mut depth = 0u16;
        loop {
            depth += 1;
            if depth > self.desc.tree_depth.max(1) + 1 {
                return Err(HfsError::Corrupt("index descent exceeds tree depth".into()));
            }
            let node = self.node(dev, geo, current)?;
            match node.descriptor.kind {
                NODE_KIND_LEAF => return Ok(Some(node)),
                NODE_KIND_INDEX => {
                    let mut child = None;
                    for i in 0..node.descriptor.num_records as usize {
                        let record = node.record(i)?;
                        match compare(record) {
                            Ordering::Less | Ordering::Equal => {
                                child = Some(index_child(record)?);
                            }
                            Ordering::Greater => break,
                        }
                    }
                    current = match child {
                        Some(c) => c,
                        None if for_ge && node.descriptor.num_records > 0 => {
                            index_child(node.record(0)?)?
                        }
                        None => return Ok(None),
                    };
                }
                other => {
                    return Err(HfsError::Corrupt(format!(
                        "unexpected node kind 0x{other:02X} during descent"
                    )))
                }
            }
        }
    }

    /// Iterate leaf records starting at (`node`, `index`).
    pub fn records_from<'a, D: DeviceRead>(
        &'a self,
        dev: &'a D,
        geo: &'a Geometry,
        node: Node,
        index: usize,
        direction: Direction,
    ) -> LeafRecords<'a, D> {
        LeafRecords {
            tree: self,
            dev,
            geo,
            node: Some(node),
            index,
            direction,
            hops: 0,
            failed: false,
        }
    }

    /// Iterate every leaf record in key order, from the first leaf.
    pub fn records<'a, D: DeviceRead>(
        &'a self,
        dev: &'a D,
        geo: &'a Geometry,
    ) -> Result<LeafRecords<'a, D>> {
        let node = if self.desc.first_leaf_node == 0 {
            None
        } else {
            Some(self.node(dev, geo, self.desc.first_leaf_node)?)
        };
        Ok(LeafRecords {
            tree: self,
            dev,
            geo,
            node,
            index: 0,
            direction: Direction::Forward,
            hops: 0,
            failed: false,
        })
    }
}

/// Child pointer of an index record: a u32 after the padded key.
fn index_child(record: &[u8]) -> Result<u32> {
    if record.len() < 2 {
        return Err(HfsError::Corrupt("index record too short".into()));
    }
    let key_length = u16::from_be_bytes([record[0], record[1]]) as usize;
    let at = 2 + key_length + (key_length & 1);
    if at + 4 > record.len() {
        return Err(HfsError::Corrupt(format!(
            "index record too short for child pointer (key length {key_length})"
        )));
    }
    Ok(u32::from_be_bytes([
        record[at],
        record[at + 1],
        record[at + 2],
        record[at + 3],
    ]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Lazy leaf-record iterator bounded by the sibling links.
pub struct LeafRecords<'a, D: DeviceRead> {
    tree: &'a BTree,
    dev: &'a D,
    geo: &'a Geometry,
    node: Option<Node>,
    index: usize,
    direction: Direction,
    hops: u32,
    failed: bool,
}

impl<D: DeviceRead> LeafRecords<'_, D> {
    fn advance(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let Some(node) = &self.node else {
                return Ok(None);
            };
            let num = node.descriptor.num_records as usize;
            if self.index < num {
                let bytes = node.record(self.index)?.to_vec();
                self.index = match self.direction {
                    Direction::Forward => self.index + 1,
                    // usize::MAX marks the current node exhausted.
                    Direction::Backward => self.index.checked_sub(1).unwrap_or(usize::MAX),
                };
                return Ok(Some(bytes));
            }

            let link = match self.direction {
                Direction::Forward => node.descriptor.forward_link,
                Direction::Backward => node.descriptor.backward_link,
            };
            if link == 0 {
                self.node = None;
                return Ok(None);
            }
            self.hops += 1;
            if self.hops > self.tree.desc.total_nodes {
                return Err(HfsError::Corrupt("leaf sibling cycle".into()));
            }
            let next = self.tree.node(self.dev, self.geo, link)?;
            if next.descriptor.kind != NODE_KIND_LEAF {
                return Err(HfsError::Corrupt(format!(
                    "leaf sibling {} has kind 0x{:02X}",
                    next.number, next.descriptor.kind
                )));
            }
            self.index = match self.direction {
                Direction::Forward => 0,
                Direction::Backward => (next.descriptor.num_records as usize).wrapping_sub(1),
            };
            self.node = Some(next);
        }
    }
}

impl<D: DeviceRead> Iterator for LeafRecords<'_, D> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(Some(bytes)) => Some(Ok(bytes)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
