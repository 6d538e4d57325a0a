//! Lookup of the memory regions the partition manager assigned to the partition.

use crate::{
    manifest::{Manifest, NodeOffset, FFA_MANIFEST_COMPATIBLE},
    BootError,
};
use sp_boot_api::MemoryRegion;

/// Finds the child of `memory-regions` whose `description` is `name`.
///
/// The region size is `pages-count` pages of `page_size` bytes.
pub fn discover(manifest: &Manifest, name: &str, page_size: u64) -> Result<MemoryRegion, BootError> {
    let node = manifest.node_by_compatible(FFA_MANIFEST_COMPATIBLE)?;
    let regions = manifest.subnode(node, "memory-regions").map_err(|err| {
        log::error!("manifest has no memory-regions node: {}", err);
        BootError::InvalidParameter
    })?;

    for child in manifest.children(regions) {
        let child = child?;
        let description = match manifest.property(child, "description") {
            Ok(description) => description,
            Err(err) => {
                log::debug!("skip memory region without description: {}", err);
                continue;
            }
        };
        if description_matches(description, name) {
            return read_region(manifest, child, page_size);
        }
    }
    log::debug!("no memory region named `{}`", name);
    Err(BootError::NotFound)
}

/// Compares the stored `description` with `name` and its NUL terminator over the shorter of
/// both lengths.
pub fn description_matches(description: &[u8], name: &str) -> bool {
    let name = name.as_bytes();
    let len = description.len().min(name.len() + 1);
    description[..len]
        .iter()
        .zip(name.iter().chain(Some(&0)))
        .all(|(stored, wanted)| stored == wanted)
}

fn read_region(
    manifest: &Manifest,
    node: NodeOffset,
    page_size: u64,
) -> Result<MemoryRegion, BootError> {
    let base = manifest.read_u64(node, "base-address").map_err(|err| {
        log::error!("memory region without base-address: {}", err);
        BootError::InvalidParameter
    })?;
    let pages = manifest.read_u32(node, "pages-count").map_err(|err| {
        log::error!("memory region without pages-count: {}", err);
        BootError::InvalidParameter
    })?;
    let size = u64::from(pages).checked_mul(page_size).ok_or_else(|| {
        log::error!("memory region of {} pages overflows", pages);
        BootError::InvalidParameter
    })?;
    Ok(MemoryRegion::new(base, size))
}
