//! Builds flattened device tree blobs, the format read by [`Manifest`](crate::manifest::Manifest).

use alloc::vec::Vec;
use thiserror::Error;

const FDT_MAGIC: u32 = 0xd00d_feed;
const HEADER_SIZE: usize = 40;
const RESERVE_MAP_SIZE: usize = 16;
const VERSION: u32 = 17;
const LAST_COMPATIBLE_VERSION: u32 = 16;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_END: u32 = 0x9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FdtWriterError {
    #[error("{0} node(s) are still open")]
    UnclosedNodes(usize),
    #[error("end_node called without an open node")]
    UnbalancedEnd,
    #[error("property written outside of a node")]
    PropertyOutsideNode,
    #[error("a second root node was started")]
    MultipleRoots,
    #[error("blob exceeds the 32-bit size limit")]
    TooLarge,
}

/// Incrementally writes the structure block of a device tree.
///
/// Misuse is recorded and reported by [`finish`](Self::finish) so calls can be chained.
#[derive(Debug, Default)]
pub struct FdtWriter {
    structure: Vec<u8>,
    strings: Vec<u8>,
    depth: usize,
    roots: usize,
    error: Option<FdtWriterError>,
}

impl FdtWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_node(&mut self, name: &str) -> &mut Self {
        if self.depth == 0 {
            self.roots += 1;
            if self.roots > 1 {
                self.fail(FdtWriterError::MultipleRoots);
            }
        }
        self.depth += 1;
        self.token(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad();
        self
    }

    pub fn end_node(&mut self) -> &mut Self {
        match self.depth.checked_sub(1) {
            Some(depth) => {
                self.depth = depth;
                self.token(FDT_END_NODE);
            }
            None => self.fail(FdtWriterError::UnbalancedEnd),
        }
        self
    }

    /// Adds a property with a raw value to the open node.
    pub fn property(&mut self, name: &str, value: &[u8]) -> &mut Self {
        if self.depth == 0 {
            self.fail(FdtWriterError::PropertyOutsideNode);
            return self;
        }
        let name_offset = self.string_offset(name);
        self.token(FDT_PROP);
        self.token(value.len() as u32);
        self.token(name_offset);
        self.structure.extend_from_slice(value);
        self.pad();
        self
    }

    pub fn property_u32(&mut self, name: &str, value: u32) -> &mut Self {
        self.property(name, &value.to_be_bytes())
    }

    pub fn property_u64(&mut self, name: &str, value: u64) -> &mut Self {
        self.property(name, &value.to_be_bytes())
    }

    /// Adds a NUL-terminated string property.
    pub fn property_string(&mut self, name: &str, value: &str) -> &mut Self {
        self.property_string_list(name, &[value])
    }

    /// Adds a string list property, each entry NUL-terminated.
    pub fn property_string_list(&mut self, name: &str, values: &[&str]) -> &mut Self {
        let mut value = Vec::new();
        for entry in values {
            value.extend_from_slice(entry.as_bytes());
            value.push(0);
        }
        self.property(name, &value)
    }

    /// Assembles header, empty memory reservation map, structure and strings blocks.
    pub fn finish(&mut self) -> Result<Vec<u8>, FdtWriterError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.depth != 0 {
            return Err(FdtWriterError::UnclosedNodes(self.depth));
        }

        let mut structure = core::mem::take(&mut self.structure);
        structure.extend_from_slice(&FDT_END.to_be_bytes());

        let structure_offset = HEADER_SIZE + RESERVE_MAP_SIZE;
        let strings_offset = structure_offset + structure.len();
        let total_size = strings_offset + self.strings.len();
        let size = |value: usize| u32::try_from(value).map_err(|_| FdtWriterError::TooLarge);

        let header = [
            FDT_MAGIC,
            size(total_size)?,
            size(structure_offset)?,
            size(strings_offset)?,
            size(HEADER_SIZE)?,
            VERSION,
            LAST_COMPATIBLE_VERSION,
            0,
            size(self.strings.len())?,
            size(structure.len())?,
        ];

        let mut blob = Vec::with_capacity(total_size);
        for field in header {
            blob.extend_from_slice(&field.to_be_bytes());
        }
        blob.extend_from_slice(&[0; RESERVE_MAP_SIZE]);
        blob.extend_from_slice(&structure);
        blob.extend_from_slice(&self.strings);
        Ok(blob)
    }

    fn token(&mut self, value: u32) {
        self.structure.extend_from_slice(&value.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    fn fail(&mut self, err: FdtWriterError) {
        self.error.get_or_insert(err);
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        let mut offset = 0;
        for entry in self.strings.split(|&b| b == 0) {
            if entry == name.as_bytes() && offset < self.strings.len() {
                return offset as u32;
            }
            offset += entry.len() + 1;
        }
        let offset = self.strings.len();
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        offset as u32
    }
}
