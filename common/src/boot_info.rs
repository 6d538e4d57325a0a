//! The FF-A boot information blob handed to the partition in its first argument register,
//! and the [`BootInfo`] summary derived from the manifest it points to.

use crate::{
    manifest::{Manifest, ManifestError, NodeOffset, FFA_MANIFEST_COMPATIBLE},
    memory_regions, BootError,
};
use core::ptr;
use sp_boot_api::{BootInfo, Granule};

/// Magic value of [`BootInfoHeader::magic`].
pub const BOOT_INFO_MAGIC: u32 = 0x0000_0ffa;
/// Version of the boot information layout written by [`BootInfoBlob`].
pub const BOOT_INFO_VERSION: u32 = 0x0001_0001;

/// Descriptor kind of a standard descriptor whose content is the manifest device tree.
pub const KIND_STANDARD_FDT: u8 = 0;
/// Descriptor kind of a standard descriptor whose content is a hand-off block list.
pub const KIND_STANDARD_HOB: u8 = 1;
/// Set in a descriptor kind to mark an implementation defined descriptor.
pub const KIND_IMPLEMENTATION_DEFINED: u8 = 1 << 7;

/// Header of the boot information blob. Native endianness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BootInfoHeader {
    pub magic: u32,
    pub version: u32,
    pub blob_size: u32,
    pub descriptor_size: u32,
    pub descriptor_count: u32,
    pub descriptor_offset: u32,
    pub reserved: u64,
}

/// One entry of the descriptor array that follows the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BootInfoDescriptor {
    pub name: [u8; 16],
    /// Bit 7 selects standard (0) or implementation defined (1) descriptors, bits 6..0 the
    /// kind of content.
    pub kind: u8,
    pub reserved: u8,
    pub flags: u16,
    pub size: u32,
    /// Address of the content.
    pub content: u64,
}

/// Finds the address of the manifest in the boot information at `boot_info_address`.
///
/// Only the first descriptor is inspected, and it must describe a device tree.
///
/// ## Safety
///
/// If `boot_info_address` is not null it must point to a readable [`BootInfoHeader`]. If the
/// magic matches, a [`BootInfoDescriptor`] must be readable at `descriptor_offset` bytes past
/// the header.
pub unsafe fn manifest_address(boot_info_address: *const u8) -> Result<u64, BootError> {
    if boot_info_address.is_null() {
        log::error!("boot information address is null");
        return Err(BootError::InvalidParameter);
    }
    let header = unsafe {
        // SAFETY: the header is readable according to the contract above.
        ptr::read_unaligned(boot_info_address.cast::<BootInfoHeader>())
    };
    if header.magic != BOOT_INFO_MAGIC {
        log::error!("bad boot information magic {:#x}", header.magic);
        return Err(BootError::InvalidParameter);
    }
    if header.descriptor_count == 0 {
        log::error!("boot information has no descriptors");
        return Err(BootError::NotFound);
    }

    let descriptor = unsafe {
        // SAFETY: the magic matched, so the first descriptor is readable.
        ptr::read_unaligned(
            boot_info_address
                .add(header.descriptor_offset as usize)
                .cast::<BootInfoDescriptor>(),
        )
    };
    if descriptor.kind != KIND_STANDARD_FDT {
        log::error!(
            "first boot information descriptor has kind {:#x}, expected a device tree",
            descriptor.kind
        );
        return Err(BootError::NotFound);
    }
    log::debug!("manifest at {:#x}", descriptor.content);
    Ok(descriptor.content)
}

/// Reads the image placement and translation granule of the partition from its manifest.
///
/// The heap extent is looked up by the `description` `heap_name`. A partition without such a
/// region boots with an empty heap.
pub fn populate_boot_info(manifest: &Manifest, heap_name: &str) -> Result<BootInfo, BootError> {
    let node = manifest
        .node_by_compatible(FFA_MANIFEST_COMPATIBLE)
        .map_err(|err| {
            log::error!("missing FF-A boot information in manifest: {}", err);
            BootError::from(err)
        })?;

    let load_address = required(manifest.read_u64(node, "load-address"), "load-address")?;
    let entrypoint_offset = required(
        manifest.read_u32(node, "entrypoint-offset"),
        "entrypoint-offset",
    )?;
    let image_size = required(manifest.read_u64(node, "image-size"), "image-size")?;
    let granule = read_granule(manifest, node)?;

    let memory_base = load_address
        .checked_add(entrypoint_offset.into())
        .ok_or_else(|| {
            log::error!("entrypoint-offset overflows the load address");
            BootError::InvalidParameter
        })?;
    log::info!(
        "partition image at {:#x}, {:#x} bytes, {} byte pages",
        memory_base,
        image_size,
        granule.page_size()
    );

    let info = BootInfo::new(memory_base, image_size, granule);
    match memory_regions::discover(manifest, heap_name, granule.page_size()) {
        Ok(heap) => {
            log::info!("heap at {:#x}, {:#x} bytes", heap.base, heap.size);
            Ok(info.with_heap(heap))
        }
        Err(err) => {
            log::warn!("no usable `{}` region, skip heap: {}", heap_name, err);
            Ok(info)
        }
    }
}

fn read_granule(manifest: &Manifest, node: NodeOffset) -> Result<Granule, BootError> {
    let raw = required(manifest.read_u32(node, "xlat-granule"), "xlat-granule")?;
    Granule::from_manifest(raw).ok_or_else(|| {
        log::error!("unknown xlat-granule {}", raw);
        BootError::InvalidParameter
    })
}

/// Every manifest property is mandatory, so a missing one is an invalid parameter.
fn required<T>(value: Result<T, ManifestError>, name: &str) -> Result<T, BootError> {
    value.map_err(|err| {
        log::error!("cannot read manifest property `{}`: {}", name, err);
        BootError::InvalidParameter
    })
}

#[cfg(any(test, feature = "alloc"))]
pub use blob::BootInfoBlob;

#[cfg(any(test, feature = "alloc"))]
mod blob {
    use super::*;
    use alloc::vec::Vec;
    use core::mem::size_of;

    /// Builds boot information blobs.
    #[derive(Debug, Clone, Default)]
    pub struct BootInfoBlob {
        descriptors: Vec<BootInfoDescriptor>,
    }

    impl BootInfoBlob {
        pub fn new() -> Self {
            Self::default()
        }

        /// Appends a descriptor. Names longer than 16 bytes are truncated.
        pub fn descriptor(&mut self, name: &str, kind: u8, content: u64, size: u32) -> &mut Self {
            let mut raw_name = [0; 16];
            let len = name.len().min(raw_name.len());
            raw_name[..len].copy_from_slice(&name.as_bytes()[..len]);
            self.descriptors.push(BootInfoDescriptor {
                name: raw_name,
                kind,
                reserved: 0,
                flags: 0,
                size,
                content,
            });
            self
        }

        /// Appends the descriptor of a manifest device tree.
        pub fn manifest(&mut self, content: u64, size: u32) -> &mut Self {
            self.descriptor("manifest", KIND_STANDARD_FDT, content, size)
        }

        pub fn to_bytes(&self) -> Vec<u8> {
            let header_size = size_of::<BootInfoHeader>();
            let descriptor_size = size_of::<BootInfoDescriptor>();
            let blob_size = header_size + descriptor_size * self.descriptors.len();

            let mut bytes = Vec::with_capacity(blob_size);
            for field in [
                BOOT_INFO_MAGIC,
                BOOT_INFO_VERSION,
                blob_size as u32,
                descriptor_size as u32,
                self.descriptors.len() as u32,
                header_size as u32,
            ] {
                bytes.extend_from_slice(&field.to_ne_bytes());
            }
            bytes.extend_from_slice(&0u64.to_ne_bytes());

            for descriptor in &self.descriptors {
                bytes.extend_from_slice(&descriptor.name);
                bytes.push(descriptor.kind);
                bytes.push(descriptor.reserved);
                bytes.extend_from_slice(&descriptor.flags.to_ne_bytes());
                bytes.extend_from_slice(&descriptor.size.to_ne_bytes());
                bytes.extend_from_slice(&descriptor.content.to_ne_bytes());
            }
            bytes
        }
    }
}
