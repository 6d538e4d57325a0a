//! Brings the partition executable into its final state: sections protected and, if the image
//! does not run where it was linked, relocated.

use crate::BootError;
use core::ops::Add;
use sp_boot_api::MemoryRegion;
use thiserror::Error;

/// Size of the page at the start of the image that is made writable for relocation.
const RELOCATION_PAGE_SIZE: u64 = 4096;

/// The executable as found in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawImage {
    /// The address the executable data starts at.
    pub address: u64,
    pub len: u64,
}

impl RawImage {
    pub fn end(&self) -> Option<u64> {
        self.address.checked_add(self.len)
    }
}

/// Placement information read from the image headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    /// The base address sections are relative to, as linked.
    pub nominal_base: u64,
    /// The address the headers claim the executable data starts at.
    pub image_address: u64,
    /// Where the section table starts, relative to the executable data.
    pub section_header_offset: u64,
    pub section_count: u16,
}

/// A section of the image, as described by its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    /// Address relative to the image load base.
    pub address: u64,
    pub size: u64,
    pub writable: bool,
    pub executable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed to relocate the partition image: {0}")]
pub struct RelocationError(pub &'static str);

/// Parses the executable format of the partition image.
pub trait ImageLoader {
    /// Finds the executable inside the firmware volume that holds the partition image.
    fn locate(&mut self, volume: MemoryRegion) -> Result<RawImage, &'static str>;

    /// Reads the placement information from the headers of `image`.
    fn layout(&mut self, image: &RawImage) -> Result<ImageLayout, &'static str>;

    /// Reads section `index`. Returns `None` for entries that describe no memory.
    fn section(
        &mut self,
        image: &RawImage,
        layout: &ImageLayout,
        index: u16,
    ) -> Result<Option<Section>, &'static str>;

    /// Applies the relocations of `image` for a load base of `load_base`.
    fn relocate(
        &mut self,
        image: &RawImage,
        layout: &ImageLayout,
        load_base: u64,
    ) -> Result<(), RelocationError>;
}

/// Changes the access permissions of the partition's own memory.
///
/// All ranges are page aligned.
pub trait MemoryPermissions {
    fn set_no_exec(&mut self, base: u64, len: u64) -> Result<(), BootError>;
    fn set_read_only(&mut self, base: u64, len: u64) -> Result<(), BootError>;
    fn clear_read_only(&mut self, base: u64, len: u64) -> Result<(), BootError>;
}

impl<T: MemoryPermissions + ?Sized> MemoryPermissions for &mut T {
    fn set_no_exec(&mut self, base: u64, len: u64) -> Result<(), BootError> {
        (**self).set_no_exec(base, len)
    }

    fn set_read_only(&mut self, base: u64, len: u64) -> Result<(), BootError> {
        (**self).set_read_only(base, len)
    }

    fn clear_read_only(&mut self, base: u64, len: u64) -> Result<(), BootError> {
        (**self).clear_read_only(base, len)
    }
}

/// Difference between where the image is and where its headers claim it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageOffset {
    image_offset: i128,
}

impl ImageOffset {
    pub fn zero() -> Self {
        Self::new(0)
    }

    pub fn new(image_offset: i128) -> Self {
        Self { image_offset }
    }

    /// The offset that moves `claimed` onto `actual`.
    pub fn between(actual: u64, claimed: u64) -> Self {
        Self::new(i128::from(actual) - i128::from(claimed))
    }

    pub fn image_offset(&self) -> i128 {
        self.image_offset
    }
}

impl Add<u64> for ImageOffset {
    /// `None` if the result leaves the 64-bit address space.
    type Output = Option<u64>;

    fn add(self, address: u64) -> Self::Output {
        let sum = self.image_offset.checked_add(i128::from(address))?;
        u64::try_from(sum).ok()
    }
}

/// What the initializer did to the image. Only written by [`initialize_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLoadState {
    pub raw: RawImage,
    pub offset: ImageOffset,
    /// The address every section address is relative to.
    pub load_base: u64,
    pub section_header_offset: u64,
    pub section_count: u16,
    /// Whether the section permissions have been applied.
    pub protected: bool,
    pub relocated: bool,
}

/// Locates the image in `volume`, applies the permissions of its sections and relocates it
/// when it was not loaded at its linked address.
///
/// Once this returns, no section is both writable and executable.
///
/// ## Panics
///
/// Panics if relocation fails. At that point parts of the image have been rewritten and it
/// cannot be run.
pub fn initialize_image<L, P>(
    volume: MemoryRegion,
    loader: &mut L,
    permissions: &mut P,
) -> Result<ImageLoadState, BootError>
where
    L: ImageLoader + ?Sized,
    P: MemoryPermissions + ?Sized,
{
    let raw = loader.locate(volume).map_err(|err| {
        log::error!("cannot locate partition image in {:#x?}: {}", volume, err);
        BootError::Load(err)
    })?;
    let layout = loader.layout(&raw).map_err(|err| {
        log::error!("cannot read partition image headers: {}", err);
        BootError::Load(err)
    })?;

    let offset = ImageOffset::between(raw.address, layout.image_address);
    let load_base = (offset + layout.nominal_base).ok_or(BootError::Load(
        "image load base is outside the address space",
    ))?;
    log::info!(
        "partition image at {:#x}, linked for {:#x}, load base {:#x}",
        raw.address,
        layout.image_address,
        load_base
    );

    let mut state = ImageLoadState {
        raw,
        offset,
        load_base,
        section_header_offset: layout.section_header_offset,
        section_count: layout.section_count,
        protected: false,
        relocated: false,
    };

    let code_in_relocation_page = protect_sections(&state, &layout, loader, permissions)?;
    state.protected = true;

    if layout.image_address != raw.address {
        if code_in_relocation_page {
            log::error!("code shares the first image page, which relocation makes writable");
            return Err(BootError::Load("code in first image page"));
        }
        permissions.set_no_exec(load_base, RELOCATION_PAGE_SIZE)?;
        permissions.clear_read_only(load_base, RELOCATION_PAGE_SIZE)?;

        if let Err(err) = loader.relocate(&raw, &layout, load_base) {
            panic!("{}", err);
        }
        state.relocated = true;
        log::debug!("relocated partition image by {:#x}", offset.image_offset());
    }

    Ok(state)
}

/// Applies the permissions of every section. Returns whether an executable section overlaps
/// the first page at the load base.
fn protect_sections<L, P>(
    state: &ImageLoadState,
    layout: &ImageLayout,
    loader: &mut L,
    permissions: &mut P,
) -> Result<bool, BootError>
where
    L: ImageLoader + ?Sized,
    P: MemoryPermissions + ?Sized,
{
    let image_end = state
        .raw
        .end()
        .ok_or(BootError::Load("image wraps the address space"))?;
    let relocation_page_end = state.load_base.saturating_add(RELOCATION_PAGE_SIZE);
    let mut code_in_relocation_page = false;

    for index in 0..layout.section_count {
        let section = match loader.section(&state.raw, layout, index) {
            Ok(Some(section)) => section,
            Ok(None) => continue,
            Err(err) => {
                log::error!("cannot read section {}: {}", index, err);
                return Err(BootError::Load(err));
            }
        };
        if section.size == 0 {
            continue;
        }

        let base = state
            .load_base
            .checked_add(section.address)
            .ok_or(BootError::Load("section address overflows"))?;
        let end = base
            .checked_add(section.size)
            .ok_or(BootError::Load("section size overflows"))?;
        if base < state.raw.address || end > image_end {
            log::error!(
                "section {} at {:#x}..{:#x} lies outside the image",
                index,
                base,
                end
            );
            return Err(BootError::Load("section outside the image"));
        }

        log::debug!(
            "section {}: {:#x}..{:#x} {}{}",
            index,
            base,
            end,
            if section.writable { "W" } else { "-" },
            if section.executable { "X" } else { "-" },
        );
        if section.executable {
            if section.writable {
                log::error!("section {} is writable and executable", index);
                return Err(BootError::Load("writable and executable section"));
            }
            permissions.set_read_only(base, section.size)?;
            if base < relocation_page_end && end > state.load_base {
                code_in_relocation_page = true;
            }
        } else {
            permissions.set_no_exec(base, section.size)?;
            if section.writable {
                permissions.clear_read_only(base, section.size)?;
            } else {
                permissions.set_read_only(base, section.size)?;
            }
        }
    }
    Ok(code_in_relocation_page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::RefCell, rc::Rc};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        NoExec(u64, u64),
        ReadOnly(u64, u64),
        ReadWrite(u64, u64),
        Relocate(u64),
    }

    type Log = Rc<RefCell<Vec<Event>>>;

    struct MockLoader {
        raw: RawImage,
        layout: ImageLayout,
        sections: Vec<Option<Section>>,
        relocation: Result<(), RelocationError>,
        log: Log,
    }

    impl ImageLoader for MockLoader {
        fn locate(&mut self, volume: MemoryRegion) -> Result<RawImage, &'static str> {
            if volume.is_empty() {
                return Err("empty volume");
            }
            Ok(self.raw)
        }

        fn layout(&mut self, _image: &RawImage) -> Result<ImageLayout, &'static str> {
            Ok(self.layout)
        }

        fn section(
            &mut self,
            _image: &RawImage,
            _layout: &ImageLayout,
            index: u16,
        ) -> Result<Option<Section>, &'static str> {
            self.sections
                .get(usize::from(index))
                .copied()
                .ok_or("no such section")
        }

        fn relocate(
            &mut self,
            _image: &RawImage,
            _layout: &ImageLayout,
            load_base: u64,
        ) -> Result<(), RelocationError> {
            self.log.borrow_mut().push(Event::Relocate(load_base));
            self.relocation
        }
    }

    struct RecordingPermissions {
        log: Log,
        fail: bool,
    }

    impl MemoryPermissions for RecordingPermissions {
        fn set_no_exec(&mut self, base: u64, len: u64) -> Result<(), BootError> {
            self.record(Event::NoExec(base, len))
        }

        fn set_read_only(&mut self, base: u64, len: u64) -> Result<(), BootError> {
            self.record(Event::ReadOnly(base, len))
        }

        fn clear_read_only(&mut self, base: u64, len: u64) -> Result<(), BootError> {
            self.record(Event::ReadWrite(base, len))
        }
    }

    impl RecordingPermissions {
        fn record(&mut self, event: Event) -> Result<(), BootError> {
            if self.fail {
                return Err(BootError::Transport(-6));
            }
            self.log.borrow_mut().push(event);
            Ok(())
        }
    }

    const VOLUME: MemoryRegion = MemoryRegion::new(0x4000_0000, 0x10_0000);

    fn code(address: u64, size: u64) -> Option<Section> {
        Some(Section {
            address,
            size,
            writable: false,
            executable: true,
        })
    }

    fn rodata(address: u64, size: u64) -> Option<Section> {
        Some(Section {
            address,
            size,
            writable: false,
            executable: false,
        })
    }

    fn data(address: u64, size: u64) -> Option<Section> {
        Some(Section {
            address,
            size,
            writable: true,
            executable: false,
        })
    }

    /// An image stored 0x1000 bytes into the volume, with its first section after a header page.
    fn loader(image_address: u64, sections: Vec<Option<Section>>, log: &Log) -> MockLoader {
        MockLoader {
            raw: RawImage {
                address: VOLUME.base + 0x1000,
                len: 0x8000,
            },
            layout: ImageLayout {
                nominal_base: image_address,
                image_address,
                section_header_offset: 0x80,
                section_count: sections.len() as u16,
            },
            sections,
            relocation: Ok(()),
            log: log.clone(),
        }
    }

    fn run(loader: &mut MockLoader, log: &Log) -> Result<ImageLoadState, BootError> {
        let mut permissions = RecordingPermissions {
            log: log.clone(),
            fail: false,
        };
        initialize_image(VOLUME, loader, &mut permissions)
    }

    #[test]
    fn identity_loaded_image_is_only_protected() {
        let log = Log::default();
        let sections = vec![
            code(0x1000, 0x2000),
            rodata(0x3000, 0x1000),
            data(0x4000, 0x1000),
        ];
        let mut loader = loader(VOLUME.base + 0x1000, sections, &log);
        let state = run(&mut loader, &log).unwrap();

        let base = VOLUME.base + 0x1000;
        assert_eq!(state.load_base, base);
        assert_eq!(state.offset, ImageOffset::zero());
        assert!(state.protected);
        assert!(!state.relocated);
        assert_eq!(
            *log.borrow(),
            [
                Event::ReadOnly(base + 0x1000, 0x2000),
                Event::NoExec(base + 0x3000, 0x1000),
                Event::ReadOnly(base + 0x3000, 0x1000),
                Event::NoExec(base + 0x4000, 0x1000),
                Event::ReadWrite(base + 0x4000, 0x1000),
            ]
        );
    }

    #[test]
    fn moved_image_is_relocated_after_protection() {
        let log = Log::default();
        let sections = vec![code(0x1000, 0x1000), data(0x2000, 0x1000)];
        let mut loader = loader(0x10_0000, sections, &log);
        let state = run(&mut loader, &log).unwrap();

        let base = VOLUME.base + 0x1000;
        assert_eq!(state.load_base, base);
        assert_eq!(
            state.offset.image_offset(),
            i128::from(base) - 0x10_0000
        );
        assert!(state.relocated);
        assert_eq!(
            *log.borrow(),
            [
                Event::ReadOnly(base + 0x1000, 0x1000),
                Event::NoExec(base + 0x2000, 0x1000),
                Event::ReadWrite(base + 0x2000, 0x1000),
                Event::NoExec(base, 0x1000),
                Event::ReadWrite(base, 0x1000),
                Event::Relocate(base),
            ]
        );
    }

    #[test]
    fn header_address_differs_from_nominal_base() {
        // headers stripped from the front of the image: the nominal base lies before the data
        let log = Log::default();
        let mut loader = loader(0x10_0000, vec![rodata(0x1200, 0x100)], &log);
        loader.layout.nominal_base = 0x10_0000 - 0x200;
        let state = run(&mut loader, &log).unwrap();
        assert_eq!(state.load_base, VOLUME.base + 0x1000 - 0x200);
        assert_eq!(log.borrow()[0], Event::NoExec(VOLUME.base + 0x2000, 0x100));
    }

    #[test]
    fn empty_and_missing_sections_are_skipped() {
        let log = Log::default();
        let sections = vec![None, rodata(0x1000, 0), data(0x2000, 0x1000)];
        let mut loader = loader(VOLUME.base + 0x1000, sections, &log);
        run(&mut loader, &log).unwrap();
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn code_in_first_page_is_not_made_writable() {
        let log = Log::default();
        let mut loader = loader(0x10_0000, vec![code(0, 0x2000)], &log);
        assert_eq!(
            run(&mut loader, &log),
            Err(BootError::Load("code in first image page"))
        );
        assert!(!log.borrow().iter().any(|e| matches!(e, Event::Relocate(_))));
    }

    #[test]
    fn writable_code_is_rejected() {
        let log = Log::default();
        let section = Some(Section {
            address: 0x1000,
            size: 0x1000,
            writable: true,
            executable: true,
        });
        let mut loader = loader(VOLUME.base + 0x1000, vec![section], &log);
        assert!(matches!(run(&mut loader, &log), Err(BootError::Load(_))));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn sections_outside_the_image_are_rejected() {
        let log = Log::default();
        let mut loader = loader(VOLUME.base + 0x1000, vec![data(0x7000, 0x2000)], &log);
        assert_eq!(
            run(&mut loader, &log),
            Err(BootError::Load("section outside the image"))
        );
    }

    #[test]
    fn locate_failure_is_a_load_error() {
        let log = Log::default();
        let mut loader = loader(0, vec![], &log);
        let mut permissions = RecordingPermissions {
            log: log.clone(),
            fail: false,
        };
        assert_eq!(
            initialize_image(MemoryRegion::empty(), &mut loader, &mut permissions),
            Err(BootError::Load("empty volume"))
        );
    }

    #[test]
    fn permission_failures_propagate() {
        let log = Log::default();
        let mut loader = loader(VOLUME.base + 0x1000, vec![data(0x1000, 0x1000)], &log);
        let mut permissions = RecordingPermissions {
            log: log.clone(),
            fail: true,
        };
        assert_eq!(
            initialize_image(VOLUME, &mut loader, &mut permissions),
            Err(BootError::Transport(-6))
        );
    }

    #[test]
    #[should_panic(expected = "bad relocation")]
    fn relocation_failure_panics() {
        let log = Log::default();
        let mut loader = loader(0x10_0000, vec![data(0x1000, 0x1000)], &log);
        loader.relocation = Err(RelocationError("bad relocation"));
        let _ = run(&mut loader, &log);
    }

    #[test]
    fn offset_addition_is_checked() {
        assert_eq!(ImageOffset::new(-0x1000) + 0x3000, Some(0x2000));
        assert_eq!(ImageOffset::new(-0x1000) + 0x800, None);
        assert_eq!(ImageOffset::new(1) + u64::MAX, None);
        assert_eq!(ImageOffset::between(0x1000, 0x3000).image_offset(), -0x2000);
    }
}
