/// Boot information extracted from the FF-A manifest of the partition.
///
/// Created once per boot and never modified afterwards. All extents are byte addresses and
/// byte sizes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
#[non_exhaustive]
pub struct BootInfo {
    /// Start of the partition image in memory (`load-address + entrypoint-offset`).
    ///
    /// The firmware volume that contains the partition executable starts here.
    pub memory_base: u64,
    /// Size of the partition image (`image-size`).
    pub memory_size: u64,
    /// Start of the heap region, or zero if the manifest does not describe one.
    pub heap_base: u64,
    /// Size of the heap region in bytes, or zero if the manifest does not describe one.
    pub heap_size: u64,
    /// The translation granule the partition manager set up for this partition.
    pub granule: Granule,
}

impl BootInfo {
    /// Creates a boot info structure without a heap region.
    pub const fn new(memory_base: u64, memory_size: u64, granule: Granule) -> Self {
        Self {
            memory_base,
            memory_size,
            heap_base: 0,
            heap_size: 0,
            granule,
        }
    }

    /// Returns a copy with the heap extent set to the given region.
    pub const fn with_heap(mut self, heap: MemoryRegion) -> Self {
        self.heap_base = heap.base;
        self.heap_size = heap.size;
        self
    }

    /// The size of one page of the partition's translation regime, in bytes.
    pub const fn page_size(&self) -> u64 {
        self.granule.page_size()
    }

    /// The memory the partition image occupies.
    pub const fn image_region(&self) -> MemoryRegion {
        MemoryRegion::new(self.memory_base, self.memory_size)
    }
}

/// Translation granule sizes supported by FF-A, encoded as `xlat-granule` in the manifest.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Granule {
    /// 4 KiB pages (`xlat-granule = 0`).
    Size4KiB = 0,
    /// 16 KiB pages (`xlat-granule = 1`).
    Size16KiB = 1,
    /// 64 KiB pages (`xlat-granule = 2`).
    Size64KiB = 2,
}

impl Granule {
    /// Decodes the `xlat-granule` manifest value.
    ///
    /// Returns `None` for values other than 0, 1 and 2.
    pub const fn from_manifest(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Size4KiB),
            1 => Some(Self::Size16KiB),
            2 => Some(Self::Size64KiB),
            _ => None,
        }
    }

    pub const fn page_size(self) -> u64 {
        match self {
            Self::Size4KiB => 4 * 1024,
            Self::Size16KiB => 16 * 1024,
            Self::Size64KiB => 64 * 1024,
        }
    }
}

/// A range of memory assigned to the partition.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct MemoryRegion {
    /// The start address of the region.
    pub base: u64,
    /// The size of the region in bytes.
    pub size: u64,
}

impl MemoryRegion {
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }

    /// Creates a new empty memory region (with length 0).
    pub const fn empty() -> Self {
        Self::new(0, 0)
    }

    /// The end address (exclusive) of the region, or `None` if it wraps the address space.
    pub const fn end(&self) -> Option<u64> {
        self.base.checked_add(self.size)
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }
}
