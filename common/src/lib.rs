#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;

use crate::{
    ffa::Transport,
    load_image::{ImageLoader, MemoryPermissions},
    manifest::Manifest,
};
use sp_boot_api::{BootInfo, BootOutcome};

pub use error::BootError;
pub use sp_boot_config::BootConfig;

/// Reads the FF-A boot information blob and derives [`BootInfo`] from the manifest.
pub mod boot_info;
/// Runs ELF partition images in place.
pub mod elf;
mod error;
/// Writes device tree blobs.
#[cfg(any(test, feature = "alloc"))]
pub mod fdt_writer;
/// Register level access to the partition manager.
pub mod ffa;
/// Protects and relocates the partition image.
pub mod load_image;
/// Provides a logger that writes text lines to a locked sink.
pub mod logger;
/// Changes memory permissions through the partition manager.
pub mod mem_perm;
/// Page and pool allocation helpers.
pub mod memory;
/// Looks up named regions of the manifest.
pub mod memory_regions;
/// Reads the device tree manifest.
pub mod manifest;
/// Negotiates the FF-A version.
pub mod version;

/// What the boot sequence publishes to the services built on top of it.
///
/// Created once, after the partition image is protected and relocated.
#[derive(Debug, Clone, Copy)]
pub struct ServicesRecord<'a> {
    manifest: Manifest<'a>,
    boot_info: BootInfo,
}

impl<'a> ServicesRecord<'a> {
    pub(crate) fn new(manifest: Manifest<'a>, boot_info: BootInfo) -> Self {
        Self {
            manifest,
            boot_info,
        }
    }

    pub fn manifest(&self) -> &Manifest<'a> {
        &self.manifest
    }

    pub fn manifest_address(&self) -> u64 {
        self.manifest.address()
    }

    pub fn boot_info(&self) -> &BootInfo {
        &self.boot_info
    }
}

/// Initialization that runs before any entry point, such as bringing up the memory service.
pub trait Constructor {
    fn construct(&mut self, services: &ServicesRecord) -> Result<(), BootError>;
}

/// Receives control once boot completed, usually to run the request dispatch loop.
pub trait EntryPoint {
    fn enter(&mut self, services: &ServicesRecord);
}

/// The collaborators of the boot sequence.
pub struct Platform<'p> {
    pub transport: &'p mut dyn Transport,
    pub loader: &'p mut dyn ImageLoader,
    pub permissions: &'p mut dyn MemoryPermissions,
}

/// How the boot sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootReport {
    pub outcome: BootOutcome,
    pub status: Result<(), BootError>,
    /// Set if the manifest was read successfully.
    pub boot_info: Option<BootInfo>,
}

/// Runs the cold boot sequence of the partition.
///
/// Negotiates the FF-A version, reads the manifest through the boot information at
/// `boot_info_address`, protects and relocates the partition image, and then runs every
/// constructor followed by every entry point. Boot stops at the first failing step; failing
/// constructors are logged and skipped.
///
/// ## Safety
///
/// If the partition manager implements the full protocol, `boot_info_address` must satisfy
/// the contract of [`boot_info::manifest_address`], and the manifest it points to must be
/// readable as described by [`Manifest::from_address`].
pub unsafe fn boot(
    platform: Platform<'_>,
    boot_info_address: *const u8,
    config: &BootConfig,
    constructors: &mut [&mut dyn Constructor],
    entry_points: &mut [&mut dyn EntryPoint],
) -> BootReport {
    let mut boot_info = None;
    let status = unsafe {
        run(
            platform,
            boot_info_address,
            config,
            constructors,
            entry_points,
            &mut boot_info,
        )
    };
    finish(status, boot_info)
}

/// Stores the [`BootInfo`] in `read` as soon as the manifest was read, so it is reported even
/// if a later step fails.
unsafe fn run(
    platform: Platform<'_>,
    boot_info_address: *const u8,
    config: &BootConfig,
    constructors: &mut [&mut dyn Constructor],
    entry_points: &mut [&mut dyn EntryPoint],
    read: &mut Option<BootInfo>,
) -> Result<(), BootError> {
    let compatibility = version::negotiate(platform.transport)?;
    if !compatibility.full_protocol {
        log::warn!(
            "partition manager {} does not implement the full protocol, nothing more to do",
            compatibility.manager
        );
        return Ok(());
    }

    let manifest_address = unsafe { boot_info::manifest_address(boot_info_address) }?;
    let manifest = unsafe { Manifest::from_address(manifest_address) }.map_err(|err| {
        log::error!("cannot read manifest at {:#x}: {}", manifest_address, err);
        BootError::from(err)
    })?;
    let boot_info = boot_info::populate_boot_info(&manifest, config.heap_region)?;
    *read = Some(boot_info);

    let image = load_image::initialize_image(
        boot_info.image_region(),
        platform.loader,
        platform.permissions,
    )?;
    log::debug!("{:#x?}", image);

    let services = ServicesRecord::new(manifest, boot_info);
    for constructor in constructors.iter_mut() {
        if let Err(err) = constructor.construct(&services) {
            log::error!("constructor failed: {}", err);
        }
    }
    for entry_point in entry_points.iter_mut() {
        entry_point.enter(&services);
    }
    Ok(())
}

fn finish(status: Result<(), BootError>, boot_info: Option<BootInfo>) -> BootReport {
    let outcome = match status {
        Ok(()) => BootOutcome::Success,
        Err(err) => err.outcome(),
    };
    match status {
        Ok(()) => log::info!("partition boot finished: {}", outcome),
        Err(err) => log::error!("partition boot failed: {} ({})", err, outcome),
    }
    BootReport {
        outcome,
        status,
        boot_info,
    }
}
