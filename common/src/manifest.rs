//! Read-only navigation of the flattened device tree that carries the FF-A manifest.
//!
//! The blob comes from the partition manager and is not trusted: every offset and length
//! read from it is checked against the blob before it is used, and every failure is reported
//! to the caller.

use crate::BootError;
use core::{fmt, slice};
use thiserror::Error;

const FDT_MAGIC: u32 = 0xd00d_feed;
const HEADER_SIZE: usize = 40;
/// Newest layout version whose readers can parse the blob; version 17 readers understand 16.
const LAST_COMPATIBLE_VERSION: u32 = 17;
/// Oldest layout with the strings block size in its header.
const FIRST_SUPPORTED_VERSION: u32 = 16;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

/// The `compatible` value of the FF-A partition manifest node.
pub const FFA_MANIFEST_COMPATIBLE: &str = "arm,ffa-manifest-1.0";

/// Failure while reading the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("manifest address is null")]
    NullAddress,
    #[error("manifest has bad magic {0:#x}")]
    BadMagic(u32),
    #[error("manifest layout version {0} is not supported")]
    BadVersion(u32),
    #[error("manifest is truncated")]
    Truncated,
    #[error("malformed manifest structure at offset {0:#x}")]
    BadStructure(usize),
    #[error("manifest node not found")]
    NotFound,
    #[error("manifest property missing")]
    MissingProperty,
    #[error("manifest property has {len} bytes, at least {expected} expected")]
    BadProperty { len: usize, expected: usize },
}

impl From<ManifestError> for BootError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::NotFound => BootError::NotFound,
            _ => BootError::InvalidParameter,
        }
    }
}

/// Offset of a node inside the structure block of a [`Manifest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeOffset(usize);

/// A token of the structure block, together with the offset of the token that follows it.
#[derive(Debug, Clone, Copy)]
enum Token<'a> {
    BeginNode { name: &'a [u8] },
    EndNode,
    Property { name_offset: u32, value: &'a [u8] },
    End,
}

/// A flattened device tree blob.
#[derive(Clone, Copy)]
pub struct Manifest<'a> {
    bytes: &'a [u8],
    structure: &'a [u8],
    strings: &'a [u8],
}

impl fmt::Debug for Manifest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manifest")
            .field("address", &self.bytes.as_ptr())
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl<'a> Manifest<'a> {
    /// Validates the header of the device tree in `bytes`.
    ///
    /// The blob may be followed by unrelated data; only `totalsize` bytes are used.
    pub fn new(bytes: &'a [u8]) -> Result<Self, ManifestError> {
        let header = bytes.get(..HEADER_SIZE).ok_or(ManifestError::Truncated)?;
        let field = |index: usize| be_u32(header, index * 4).ok_or(ManifestError::Truncated);

        let magic = field(0)?;
        if magic != FDT_MAGIC {
            return Err(ManifestError::BadMagic(magic));
        }
        let version = field(5)?;
        if version < FIRST_SUPPORTED_VERSION {
            return Err(ManifestError::BadVersion(version));
        }
        let last_compatible_version = field(6)?;
        if last_compatible_version > LAST_COMPATIBLE_VERSION {
            return Err(ManifestError::BadVersion(last_compatible_version));
        }

        let total_size = field(1)? as usize;
        let bytes = bytes.get(..total_size).ok_or(ManifestError::Truncated)?;
        let structure_offset = field(2)? as usize;
        let strings_offset = field(3)? as usize;
        let strings_size = field(8)? as usize;
        let structure_size = field(9)? as usize;

        let structure = block(bytes, structure_offset, structure_size)?;
        let strings = block(bytes, strings_offset, strings_size)?;

        Ok(Self {
            bytes,
            structure,
            strings,
        })
    }

    /// Reads the device tree the partition manager placed at `address`.
    ///
    /// ## Safety
    ///
    /// `address` must point to readable memory holding at least a device tree header, and the
    /// `totalsize` bytes announced by that header must be readable for the lifetime `'a`.
    pub unsafe fn from_address(address: u64) -> Result<Self, ManifestError> {
        if address == 0 {
            return Err(ManifestError::NullAddress);
        }
        let ptr = address as usize as *const u8;
        let header = unsafe {
            // SAFETY: the caller guarantees that a header is readable at `address`.
            slice::from_raw_parts(ptr, HEADER_SIZE)
        };
        let total_size = be_u32(header, 4).ok_or(ManifestError::Truncated)? as usize;
        let bytes = unsafe {
            // SAFETY: the caller guarantees that `totalsize` bytes are readable.
            slice::from_raw_parts(ptr, total_size.max(HEADER_SIZE))
        };
        Self::new(bytes)
    }

    /// The address of the blob in memory.
    pub fn address(&self) -> u64 {
        self.bytes.as_ptr() as usize as u64
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// The root node of the tree.
    pub fn root(&self) -> Result<NodeOffset, ManifestError> {
        // leading NOPs are skipped by `token`, so the root may not sit at offset zero
        let mut offset = 0;
        while be_u32(self.structure, offset) == Some(FDT_NOP) {
            offset += 4;
        }
        match self.token(offset)? {
            (Token::BeginNode { .. }, _) => Ok(NodeOffset(offset)),
            _ => Err(ManifestError::BadStructure(offset)),
        }
    }

    /// Returns the first node, in document order, whose `compatible` list contains `tag`.
    pub fn node_by_compatible(&self, tag: &str) -> Result<NodeOffset, ManifestError> {
        let mut offset = 0;
        loop {
            let (token, next) = self.token(offset)?;
            match token {
                Token::BeginNode { .. } => {
                    let node = NodeOffset(offset);
                    match self.property(node, "compatible") {
                        Ok(list) if string_list_contains(list, tag) => return Ok(node),
                        Ok(_) | Err(ManifestError::MissingProperty) => {}
                        Err(err) => return Err(err),
                    }
                }
                Token::End => return Err(ManifestError::NotFound),
                Token::EndNode | Token::Property { .. } => {}
            }
            offset = next;
        }
    }

    /// Returns the direct child of `parent` called `name`.
    ///
    /// A child named `name@unit` also matches if `name` carries no unit address itself.
    pub fn subnode(&self, parent: NodeOffset, name: &str) -> Result<NodeOffset, ManifestError> {
        for child in self.children(parent) {
            let child = child?;
            if node_name_matches(self.node_name(child)?, name.as_bytes()) {
                return Ok(child);
            }
        }
        Err(ManifestError::NotFound)
    }

    /// The name of `node`, without the terminating NUL.
    pub fn node_name(&self, node: NodeOffset) -> Result<&'a [u8], ManifestError> {
        match self.token(node.0)? {
            (Token::BeginNode { name }, _) => Ok(name),
            _ => Err(ManifestError::BadStructure(node.0)),
        }
    }

    /// The first child of `node`, if it has any.
    pub fn first_child(&self, node: NodeOffset) -> Result<Option<NodeOffset>, ManifestError> {
        let mut offset = self.after_begin(node)?;
        loop {
            let (token, next) = self.token(offset)?;
            match token {
                Token::Property { .. } => offset = next,
                Token::BeginNode { .. } => return Ok(Some(NodeOffset(offset))),
                Token::EndNode => return Ok(None),
                Token::End => return Err(ManifestError::BadStructure(offset)),
            }
        }
    }

    /// The sibling that follows `node`, if any.
    pub fn next_sibling(&self, node: NodeOffset) -> Result<Option<NodeOffset>, ManifestError> {
        let offset = self.skip_node(node)?;
        match self.token(offset)? {
            (Token::BeginNode { .. }, _) => Ok(Some(NodeOffset(offset))),
            (Token::EndNode, _) | (Token::End, _) => Ok(None),
            (Token::Property { .. }, _) => Err(ManifestError::BadStructure(offset)),
        }
    }

    /// Iterates over the direct children of `node` in declaration order.
    ///
    /// The iterator stops after yielding the first error.
    pub fn children(&self, node: NodeOffset) -> Children<'_, 'a> {
        Children {
            manifest: self,
            state: ChildrenState::Start(node),
        }
    }

    /// The raw value of the property `name` of `node`.
    pub fn property(&self, node: NodeOffset, name: &str) -> Result<&'a [u8], ManifestError> {
        let mut offset = self.after_begin(node)?;
        loop {
            let (token, next) = self.token(offset)?;
            match token {
                Token::Property { name_offset, value } => {
                    if self.string(name_offset)? == name.as_bytes() {
                        return Ok(value);
                    }
                }
                Token::BeginNode { .. } | Token::EndNode => {
                    return Err(ManifestError::MissingProperty)
                }
                Token::End => return Err(ManifestError::BadStructure(offset)),
            }
            offset = next;
        }
    }

    /// Reads a big-endian 32-bit property.
    pub fn read_u32(&self, node: NodeOffset, name: &str) -> Result<u32, ManifestError> {
        let value = self.property(node, name)?;
        be_u32(value, 0).ok_or(ManifestError::BadProperty {
            len: value.len(),
            expected: 4,
        })
    }

    /// Reads a big-endian 64-bit property.
    pub fn read_u64(&self, node: NodeOffset, name: &str) -> Result<u64, ManifestError> {
        let value = self.property(node, name)?;
        be_u64(value, 0).ok_or(ManifestError::BadProperty {
            len: value.len(),
            expected: 8,
        })
    }

    /// Offset of the first token after the `FDT_BEGIN_NODE` token of `node`.
    fn after_begin(&self, node: NodeOffset) -> Result<usize, ManifestError> {
        match self.token(node.0)? {
            (Token::BeginNode { .. }, next) => Ok(next),
            _ => Err(ManifestError::BadStructure(node.0)),
        }
    }

    /// Offset of the first token after the `FDT_END_NODE` that closes `node`.
    fn skip_node(&self, node: NodeOffset) -> Result<usize, ManifestError> {
        let mut depth = 0usize;
        let mut offset = node.0;
        loop {
            let (token, next) = self.token(offset)?;
            match token {
                Token::BeginNode { .. } => depth += 1,
                Token::EndNode => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or(ManifestError::BadStructure(offset))?;
                    if depth == 0 {
                        return Ok(next);
                    }
                }
                Token::Property { .. } => {}
                Token::End => return Err(ManifestError::BadStructure(offset)),
            }
            offset = next;
        }
    }

    /// Decodes the token at `offset`, skipping `FDT_NOP` tokens.
    fn token(&self, mut offset: usize) -> Result<(Token<'a>, usize), ManifestError> {
        loop {
            let tag = be_u32(self.structure, offset).ok_or(ManifestError::Truncated)?;
            let body = offset + 4;
            let token = match tag {
                FDT_NOP => {
                    offset = body;
                    continue;
                }
                FDT_BEGIN_NODE => {
                    let rest = self.structure.get(body..).ok_or(ManifestError::Truncated)?;
                    let len = rest
                        .iter()
                        .position(|&b| b == 0)
                        .ok_or(ManifestError::Truncated)?;
                    (Token::BeginNode { name: &rest[..len] }, align4(body + len + 1))
                }
                FDT_END_NODE => (Token::EndNode, body),
                FDT_PROP => {
                    let len = be_u32(self.structure, body).ok_or(ManifestError::Truncated)?;
                    let name_offset =
                        be_u32(self.structure, body + 4).ok_or(ManifestError::Truncated)?;
                    let start = body + 8;
                    let end = start
                        .checked_add(len as usize)
                        .ok_or(ManifestError::BadStructure(offset))?;
                    let value = self
                        .structure
                        .get(start..end)
                        .ok_or(ManifestError::Truncated)?;
                    (Token::Property { name_offset, value }, align4(end))
                }
                FDT_END => (Token::End, body),
                _ => return Err(ManifestError::BadStructure(offset)),
            };
            return Ok(token);
        }
    }

    /// The NUL-terminated string at `offset` in the strings block, without the terminator.
    fn string(&self, offset: u32) -> Result<&'a [u8], ManifestError> {
        let rest = self
            .strings
            .get(offset as usize..)
            .ok_or(ManifestError::Truncated)?;
        let len = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ManifestError::Truncated)?;
        Ok(&rest[..len])
    }
}

/// Iterator over the children of a node, see [`Manifest::children`].
pub struct Children<'m, 'a> {
    manifest: &'m Manifest<'a>,
    state: ChildrenState,
}

enum ChildrenState {
    Start(NodeOffset),
    Next(NodeOffset),
    Done,
}

impl Iterator for Children<'_, '_> {
    type Item = Result<NodeOffset, ManifestError>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = match self.state {
            ChildrenState::Start(parent) => self.manifest.first_child(parent),
            ChildrenState::Next(previous) => self.manifest.next_sibling(previous),
            ChildrenState::Done => return None,
        };
        match next {
            Ok(Some(child)) => {
                self.state = ChildrenState::Next(child);
                Some(Ok(child))
            }
            Ok(None) => {
                self.state = ChildrenState::Done;
                None
            }
            Err(err) => {
                self.state = ChildrenState::Done;
                Some(Err(err))
            }
        }
    }
}

fn block(bytes: &[u8], offset: usize, size: usize) -> Result<&[u8], ManifestError> {
    let end = offset.checked_add(size).ok_or(ManifestError::Truncated)?;
    bytes.get(offset..end).ok_or(ManifestError::Truncated)
}

fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}

fn be_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let mut raw = [0; 4];
    raw.copy_from_slice(bytes.get(offset..offset.checked_add(4)?)?);
    Some(u32::from_be_bytes(raw))
}

fn be_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let mut raw = [0; 8];
    raw.copy_from_slice(bytes.get(offset..offset.checked_add(8)?)?);
    Some(u64::from_be_bytes(raw))
}

fn string_list_contains(list: &[u8], tag: &str) -> bool {
    list.split(|&b| b == 0).any(|entry| entry == tag.as_bytes())
}

fn node_name_matches(node_name: &[u8], name: &[u8]) -> bool {
    if node_name == name {
        return true;
    }
    !name.contains(&b'@')
        && node_name.len() > name.len()
        && node_name.starts_with(name)
        && node_name[name.len()] == b'@'
}
