//! Page and pool allocation on top of the partition's memory service.

use crate::{memory_regions, BootError, Constructor, ServicesRecord};
use core::{cmp, ptr};
use sp_boot_api::MemoryRegion;
use thiserror::Error;

/// Unit of all page counts of the allocation functions.
pub const PAGE_SIZE: u64 = 4096;

/// What an allocation is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Memory used by the partition's services.
    Runtime,
    /// Memory that must never be handed out again.
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("allocation of zero pages")]
    ZeroPages,
    #[error("out of memory")]
    OutOfMemory,
    #[error("alignment {0:#x} is not a power of two")]
    InvalidAlignment(usize),
    #[error("allocation size overflows")]
    Overflow,
    #[error("null buffer")]
    NullBuffer,
    #[error("reserved memory cannot be allocated")]
    Unsupported,
    #[error("address was not allocated by the memory service")]
    InvalidAddress,
}

impl From<AllocError> for BootError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::Unsupported => BootError::Unsupported,
            _ => BootError::InvalidParameter,
        }
    }
}

/// The page and pool allocator of the partition.
///
/// ## Safety
///
/// Ranges returned by the allocation functions must be readable and writable for their full
/// size, and must not overlap any other live allocation.
pub unsafe trait MemoryService {
    /// Allocates `pages` contiguous 4 KiB pages and returns the address of the first one.
    fn allocate_pages(&mut self, kind: MemoryKind, pages: usize) -> Result<u64, AllocError>;

    /// Returns `pages` pages starting at `address`, which may be part of a larger allocation.
    fn free_pages(&mut self, address: u64, pages: usize) -> Result<(), AllocError>;

    /// Allocates `size` bytes. A size of zero yields a valid, empty buffer.
    fn allocate_pool(&mut self, kind: MemoryKind, size: usize) -> Result<u64, AllocError>;

    fn free_pool(&mut self, address: u64) -> Result<(), AllocError>;

    /// Hands the free memory regions to the service. Called once before any allocation.
    fn initialize(&mut self, regions: &[MemoryRegion]);
}

/// Allocation helpers of the partition, and the constructor that brings up the memory service.
pub struct MemoryAllocator<'a, M> {
    service: M,
    heap_region: &'a str,
    initialized: bool,
}

impl<'a, M: MemoryService> MemoryAllocator<'a, M> {
    /// Creates an allocator whose service is initialized with the manifest region described
    /// as `heap_region`.
    pub fn new(service: M, heap_region: &'a str) -> Self {
        Self {
            service,
            heap_region,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn service(&self) -> &M {
        &self.service
    }

    pub fn allocate_pages(&mut self, pages: usize) -> Result<u64, AllocError> {
        self.allocate_pages_of(MemoryKind::Runtime, pages)
    }

    pub fn allocate_runtime_pages(&mut self, pages: usize) -> Result<u64, AllocError> {
        self.allocate_pages_of(MemoryKind::Runtime, pages)
    }

    /// Reserved memory is not available to the partition.
    pub fn allocate_reserved_pages(&mut self, _pages: usize) -> Result<u64, AllocError> {
        Err(AllocError::Unsupported)
    }

    /// ## Safety
    ///
    /// The pages must come from a page allocation of this allocator and must not be used
    /// afterwards.
    pub unsafe fn free_pages(&mut self, address: u64, pages: usize) -> Result<(), AllocError> {
        if pages == 0 {
            return Err(AllocError::ZeroPages);
        }
        if address == 0 {
            return Err(AllocError::NullBuffer);
        }
        self.service.free_pages(address, pages)
    }

    /// Allocates `pages` pages whose start is aligned to `alignment` bytes.
    ///
    /// An alignment of zero or anything up to the page size yields page alignment.
    pub fn allocate_aligned_pages(
        &mut self,
        pages: usize,
        alignment: usize,
    ) -> Result<u64, AllocError> {
        self.allocate_aligned_pages_of(MemoryKind::Runtime, pages, alignment)
    }

    pub fn allocate_aligned_runtime_pages(
        &mut self,
        pages: usize,
        alignment: usize,
    ) -> Result<u64, AllocError> {
        self.allocate_aligned_pages_of(MemoryKind::Runtime, pages, alignment)
    }

    pub fn allocate_aligned_reserved_pages(
        &mut self,
        _pages: usize,
        _alignment: usize,
    ) -> Result<u64, AllocError> {
        Err(AllocError::Unsupported)
    }

    /// ## Safety
    ///
    /// See [`free_pages`](Self::free_pages).
    pub unsafe fn free_aligned_pages(
        &mut self,
        address: u64,
        pages: usize,
    ) -> Result<(), AllocError> {
        unsafe { self.free_pages(address, pages) }
    }

    pub fn allocate_pool(&mut self, size: usize) -> Result<u64, AllocError> {
        self.service.allocate_pool(MemoryKind::Runtime, size)
    }

    pub fn allocate_runtime_pool(&mut self, size: usize) -> Result<u64, AllocError> {
        self.service.allocate_pool(MemoryKind::Runtime, size)
    }

    pub fn allocate_reserved_pool(&mut self, _size: usize) -> Result<u64, AllocError> {
        Err(AllocError::Unsupported)
    }

    /// Allocates `size` bytes and clears them.
    pub fn allocate_zero_pool(&mut self, size: usize) -> Result<u64, AllocError> {
        let address = self.allocate_pool(size)?;
        unsafe {
            // SAFETY: the memory service hands out writable memory of the requested size.
            ptr::write_bytes(address as usize as *mut u8, 0, size);
        }
        Ok(address)
    }

    /// Allocates a buffer holding a copy of `source`.
    pub fn allocate_copy_pool(&mut self, source: &[u8]) -> Result<u64, AllocError> {
        let address = self.allocate_pool(source.len())?;
        unsafe {
            // SAFETY: the new buffer is writable, `source.len()` bytes long and cannot overlap
            // the borrowed `source`.
            ptr::copy_nonoverlapping(source.as_ptr(), address as usize as *mut u8, source.len());
        }
        Ok(address)
    }

    /// Moves a pool buffer of `old_size` bytes into a new zeroed buffer of `new_size` bytes.
    ///
    /// The old buffer is freed only if the new one could be allocated.
    ///
    /// ## Safety
    ///
    /// `old` must be a live pool allocation of at least `old_size` bytes. It must not be used
    /// after this function succeeded.
    pub unsafe fn reallocate_pool(
        &mut self,
        old_size: usize,
        new_size: usize,
        old: Option<u64>,
    ) -> Result<u64, AllocError> {
        let new = self.allocate_zero_pool(new_size)?;
        if let Some(old) = old {
            unsafe {
                // SAFETY: `old` holds `old_size` bytes, `new` holds `new_size` bytes, and two
                // live allocations never overlap.
                ptr::copy_nonoverlapping(
                    old as usize as *const u8,
                    new as usize as *mut u8,
                    cmp::min(old_size, new_size),
                );
                self.free_pool(old)?;
            }
        }
        Ok(new)
    }

    /// ## Safety
    ///
    /// `address` must come from a pool allocation of this allocator and must not be used
    /// afterwards.
    pub unsafe fn free_pool(&mut self, address: u64) -> Result<(), AllocError> {
        if address == 0 {
            return Err(AllocError::NullBuffer);
        }
        self.service.free_pool(address)
    }

    fn allocate_pages_of(&mut self, kind: MemoryKind, pages: usize) -> Result<u64, AllocError> {
        if pages == 0 {
            return Err(AllocError::ZeroPages);
        }
        self.service.allocate_pages(kind, pages)
    }

    /// Over-allocates by the alignment and returns the unaligned head and the unused tail.
    fn allocate_aligned_pages_of(
        &mut self,
        kind: MemoryKind,
        pages: usize,
        alignment: usize,
    ) -> Result<u64, AllocError> {
        if alignment != 0 && !alignment.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(alignment));
        }
        if pages == 0 {
            return Err(AllocError::ZeroPages);
        }
        if alignment as u64 <= PAGE_SIZE {
            return self.service.allocate_pages(kind, pages);
        }

        let mask = alignment as u64 - 1;
        let real_pages = pages
            .checked_add(size_to_pages(alignment as u64))
            .ok_or(AllocError::Overflow)?;
        let memory = self.service.allocate_pages(kind, real_pages)?;
        let aligned = memory.checked_add(mask).ok_or(AllocError::Overflow)? & !mask;

        let head = size_to_pages(aligned - memory);
        if head > 0 {
            self.service.free_pages(memory, head)?;
        }
        let tail = real_pages - pages - head;
        if tail > 0 {
            self.service
                .free_pages(aligned + pages as u64 * PAGE_SIZE, tail)?;
        }
        Ok(aligned)
    }
}

impl<M: MemoryService> Constructor for MemoryAllocator<'_, M> {
    /// Initializes the memory service with the heap region from the manifest, once.
    fn construct(&mut self, services: &ServicesRecord) -> Result<(), BootError> {
        if self.initialized {
            log::warn!("memory service is already initialized");
            return Ok(());
        }
        let heap = memory_regions::discover(
            services.manifest(),
            self.heap_region,
            services.boot_info().page_size(),
        )
        .map_err(|err| {
            log::error!("failed to read the `{}` region: {}", self.heap_region, err);
            err
        })?;
        log::info!(
            "initializing memory service with {:#x}..{:#x}",
            heap.base,
            heap.base.saturating_add(heap.size)
        );
        self.service.initialize(&[heap]);
        self.initialized = true;
        Ok(())
    }
}

fn size_to_pages(size: u64) -> usize {
    size.div_ceil(PAGE_SIZE) as usize
}
