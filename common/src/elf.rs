//! [`ImageLoader`] for partitions shipped as ELF executables that run in place.

use crate::load_image::{ImageLayout, ImageLoader, ImageOffset, RawImage, RelocationError, Section};
use core::{mem::size_of, ptr, slice};
use sp_boot_api::MemoryRegion;
use xmas_elf::{
    dynamic, header,
    program::{self, ProgramHeader, SegmentData, Type},
    sections::Rela,
    ElfFile,
};

const PAGE_SIZE: u64 = 4096;

/// `R_AARCH64_RELATIVE`
const R_AARCH64_RELATIVE: u32 = 1027;
/// `R_X86_64_RELATIVE`
const R_X86_64_RELATIVE: u32 = 8;

/// Runs an ELF executable from the firmware volume it is stored in.
///
/// The file must start at the beginning of the volume, and every loadable segment must be laid
/// out in memory exactly like in the file, so that the file can be executed where it is. The
/// sections handed to the image initializer are the `PT_LOAD` program headers.
#[derive(Debug)]
pub struct ElfImageLoader {
    located: Option<RawImage>,
}

impl ElfImageLoader {
    /// ## Safety
    ///
    /// Every volume passed to [`ImageLoader::locate`] must be mapped and readable, and nothing
    /// else may access it while the image is initialized. Pages made writable by the caller
    /// must stay writable until [`ImageLoader::relocate`] returns.
    pub unsafe fn new() -> Self {
        Self { located: None }
    }

    fn elf_file(&self, image: &RawImage) -> Result<ElfFile<'_>, &'static str> {
        if self.located != Some(*image) {
            return Err("image was not located by this loader");
        }
        let len = usize::try_from(image.len).map_err(|_| "image does not fit the address space")?;
        let bytes = unsafe {
            // SAFETY: the image lies in a volume that is readable according to the contract
            // of `new`.
            slice::from_raw_parts(image.address as usize as *const u8, len)
        };
        ElfFile::new(bytes)
    }
}

impl ImageLoader for ElfImageLoader {
    fn locate(&mut self, volume: MemoryRegion) -> Result<RawImage, &'static str> {
        if volume.base == 0 || volume.is_empty() {
            return Err("partition image volume is empty");
        }
        if volume.base % PAGE_SIZE != 0 {
            return Err("partition image is not sufficiently aligned");
        }
        volume.end().ok_or("partition image wraps the address space")?;
        let image = RawImage {
            address: volume.base,
            len: volume.size,
        };
        self.located = Some(image);
        if let Err(err) = self.elf_file(&image) {
            self.located = None;
            return Err(err);
        }
        log::info!("ELF file found at {:#x}", image.address);
        Ok(image)
    }

    fn layout(&mut self, image: &RawImage) -> Result<ImageLayout, &'static str> {
        let elf_file = self.elf_file(image)?;
        header::sanity_check(&elf_file)?;
        match elf_file.header.pt2.type_().as_type() {
            header::Type::Executable | header::Type::SharedObject => {}
            _ => return Err("partition image is not an executable"),
        }

        let mut link_base = None;
        for program_header in elf_file.program_iter() {
            program::sanity_check(program_header, &elf_file)?;
            if !matches!(program_header.get_type()?, Type::Load) {
                continue;
            }
            if program_header.mem_size() != program_header.file_size() {
                return Err("segment memory size differs from its file size");
            }
            let base = program_header
                .virtual_addr()
                .checked_sub(program_header.offset())
                .ok_or("segment is mapped below its file offset")?;
            match link_base {
                None => link_base = Some(base),
                Some(link_base) if link_base == base => {}
                Some(_) => return Err("segments are not laid out like the file"),
            }
        }
        let link_base = link_base.ok_or("partition image has no loadable segment")?;

        Ok(ImageLayout {
            nominal_base: link_base,
            image_address: link_base,
            section_header_offset: elf_file.header.pt2.ph_offset(),
            section_count: elf_file.header.pt2.ph_count(),
        })
    }

    fn section(
        &mut self,
        image: &RawImage,
        layout: &ImageLayout,
        index: u16,
    ) -> Result<Option<Section>, &'static str> {
        let elf_file = self.elf_file(image)?;
        let segment = elf_file.program_header(index)?;
        if !matches!(segment.get_type()?, Type::Load) {
            return Ok(None);
        }
        let address = segment
            .virtual_addr()
            .checked_sub(layout.nominal_base)
            .ok_or("segment below the link base")?;
        Ok(Some(Section {
            address,
            size: segment.mem_size(),
            writable: segment.flags().is_write(),
            executable: segment.flags().is_execute(),
        }))
    }

    fn relocate(
        &mut self,
        image: &RawImage,
        layout: &ImageLayout,
        load_base: u64,
    ) -> Result<(), RelocationError> {
        // all checks read through the file slice, which must be gone before the first write
        let relocations = {
            let elf_file = self.elf_file(image).map_err(RelocationError)?;
            Relocations::find(&elf_file, layout).map_err(RelocationError)?
        };
        let Some(relocations) = relocations else {
            log::debug!("partition image has no relocations");
            return Ok(());
        };
        log::debug!("applying {} relocations", relocations.count);
        unsafe {
            // SAFETY: the table and every target were checked to lie inside loadable segments
            // of the image, which is exclusively ours according to the contract of `new`.
            relocations.apply(image, layout, load_base)
        }
    }
}

/// The `Rela` table of an image, validated against its loadable segments.
#[derive(Debug, Clone, Copy)]
struct Relocations {
    /// Offset of the table from the start of the image.
    table: u64,
    count: u64,
}

impl Relocations {
    fn find(elf_file: &ElfFile, layout: &ImageLayout) -> Result<Option<Self>, &'static str> {
        let mut dynamic_segment = None;
        for program_header in elf_file.program_iter() {
            if matches!(program_header.get_type()?, Type::Dynamic) {
                if dynamic_segment.replace(program_header).is_some() {
                    return Err("more than one dynamic segment");
                }
            }
        }
        let Some(segment) = dynamic_segment else {
            return Ok(None);
        };
        let relocation_type = relative_relocation_type(elf_file)?;

        let Some((table, total_size, entry_size)) = rela_entries(segment, elf_file)? else {
            return Ok(None);
        };
        if entry_size != size_of::<Rela<u64>>() as u64 {
            return Err("unsupported relocation entry size");
        }
        let count = total_size / entry_size;

        check_is_in_load(elf_file, table)?;
        let table = table
            .checked_sub(layout.nominal_base)
            .ok_or("relocation table below the link base")?;
        let table_end = table
            .checked_add(total_size)
            .filter(|end| *end <= elf_file.input.len() as u64)
            .ok_or("relocation table is outside the image")?;

        for idx in 0..count {
            let rela = read_relocation(elf_file.input, table + idx * entry_size)?;
            if rela.get_symbol_table_index() != 0 {
                return Err("relocations using the symbol table are not supported");
            }
            if rela.get_type() != relocation_type {
                return Err("unsupported relocation type");
            }
            let last_byte = rela
                .get_offset()
                .checked_add(7)
                .ok_or("relocation target overflows")?;
            check_is_writable(elf_file, layout, rela.get_offset(), last_byte)?;
            let target = rela.get_offset() - layout.nominal_base;
            if target + 8 > table && target < table_end {
                return Err("relocation overwrites the relocation table");
            }
        }

        Ok(Some(Self { table, count }))
    }

    /// ## Safety
    ///
    /// The relocations must have been validated against `image` by [`Relocations::find`], and
    /// the image memory must be writable at every relocation target.
    unsafe fn apply(
        &self,
        image: &RawImage,
        layout: &ImageLayout,
        load_base: u64,
    ) -> Result<(), RelocationError> {
        let delta = ImageOffset::between(load_base, layout.nominal_base);
        let image_start = image.address as usize as *const u8;
        let load_start = load_base as usize as *mut u8;
        let entry_size = size_of::<Rela<u64>>();

        for idx in 0..self.count as usize {
            let rela = unsafe {
                // SAFETY: the table lies inside the image, and any bit pattern is a valid
                // `Rela<u64>`.
                ptr::read_unaligned(
                    image_start
                        .add(self.table as usize + idx * entry_size)
                        .cast::<Rela<u64>>(),
                )
            };
            let target = (rela.get_offset() - layout.nominal_base) as usize;
            let value = (delta + rela.get_addend())
                .ok_or(RelocationError("relocated value is out of range"))?;
            unsafe {
                // SAFETY: the target was checked to lie inside a loadable segment.
                ptr::write_unaligned(load_start.add(target).cast::<u64>(), value);
            }
        }
        Ok(())
    }
}

fn relative_relocation_type(elf_file: &ElfFile) -> Result<u32, &'static str> {
    match elf_file.header.pt2.machine().as_machine() {
        header::Machine::AArch64 => Ok(R_AARCH64_RELATIVE),
        header::Machine::X86_64 => Ok(R_X86_64_RELATIVE),
        _ => Err("unsupported machine for relocation"),
    }
}

/// Finds the `Rela`, `RelaSize` and `RelaEnt` entries of the dynamic segment.
fn rela_entries(
    segment: ProgramHeader,
    elf_file: &ElfFile,
) -> Result<Option<(u64, u64, u64)>, &'static str> {
    let data = match segment.get_data(elf_file)? {
        SegmentData::Dynamic64(data) => data,
        _ => return Err("expected Dynamic64 segment"),
    };

    let mut rela = None;
    let mut rela_size = None;
    let mut rela_ent = None;
    for rel in data {
        match rel.get_tag()? {
            dynamic::Tag::Rela => {
                if rela.replace(rel.get_ptr()?).is_some() {
                    return Err("Dynamic section contains more than one Rela entry");
                }
            }
            dynamic::Tag::RelaSize => {
                if rela_size.replace(rel.get_val()?).is_some() {
                    return Err("Dynamic section contains more than one RelaSize entry");
                }
            }
            dynamic::Tag::RelaEnt => {
                if rela_ent.replace(rel.get_val()?).is_some() {
                    return Err("Dynamic section contains more than one RelaEnt entry");
                }
            }
            _ => {}
        }
    }

    let Some(rela) = rela else {
        if rela_size.is_some() || rela_ent.is_some() {
            return Err("Rela entry is missing but RelaSize or RelaEnt have been provided");
        }
        return Ok(None);
    };
    let total_size = rela_size.ok_or("RelaSize entry is missing")?;
    let entry_size = rela_ent.ok_or("RelaEnt entry is missing")?;
    Ok(Some((rela, total_size, entry_size)))
}

fn read_relocation(input: &[u8], offset: u64) -> Result<Rela<u64>, &'static str> {
    let start = usize::try_from(offset).map_err(|_| "relocation outside the image")?;
    let bytes = input
        .get(start..start + size_of::<Rela<u64>>())
        .ok_or("relocation outside the image")?;
    Ok(unsafe {
        // SAFETY: Any bitpattern is valid for `Rela<u64>` and bytes is valid for reads.
        ptr::read_unaligned(bytes.as_ptr().cast::<Rela<u64>>())
    })
}

/// Check that `first..=last` lies in memory that is writable while relocations are applied:
/// a single writable, non-executable load segment, or the first page of the image.
fn check_is_writable(
    elf_file: &ElfFile,
    layout: &ImageLayout,
    first: u64,
    last: u64,
) -> Result<(), &'static str> {
    let first_page = layout.nominal_base..layout.nominal_base.saturating_add(PAGE_SIZE);
    if first_page.contains(&first) && first_page.contains(&last) {
        return Ok(());
    }
    for program_header in elf_file.program_iter() {
        if !matches!(program_header.get_type()?, Type::Load) {
            continue;
        }
        let start = program_header.virtual_addr();
        let end = start.saturating_add(program_header.mem_size());
        if start <= first && last < end {
            let flags = program_header.flags();
            if flags.is_write() && !flags.is_execute() {
                return Ok(());
            }
            return Err("relocation target is not in a writable segment");
        }
    }
    Err("offset is not in load segment")
}

/// Check that the virtual offset belongs to a load segment.
fn check_is_in_load(elf_file: &ElfFile, virt_offset: u64) -> Result<(), &'static str> {
    for program_header in elf_file.program_iter() {
        if let Type::Load = program_header.get_type()? {
            if program_header.virtual_addr() <= virt_offset {
                let offset_in_segment = virt_offset - program_header.virtual_addr();
                if offset_in_segment < program_header.mem_size() {
                    return Ok(());
                }
            }
        }
    }
    Err("offset is not in load segment")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        load_image::{initialize_image, MemoryPermissions},
        BootError,
    };

    const LINK_BASE: u64 = 0x10_0000;
    const VOLUME_SIZE: usize = 0x4000;
    const EM_AARCH64: u16 = 183;

    const PT_LOAD: u32 = 1;
    const PT_DYNAMIC: u32 = 2;
    const PF_X: u32 = 1;
    const PF_W: u32 = 2;
    const PF_R: u32 = 4;

    const RELA_TABLE: usize = 0x2100;
    const RELOCATION_TARGET: usize = 0x2200;

    #[repr(C, align(4096))]
    struct Volume([u8; VOLUME_SIZE]);

    impl Volume {
        fn region(&mut self) -> MemoryRegion {
            MemoryRegion::new(self.0.as_mut_ptr() as u64, VOLUME_SIZE as u64)
        }

        fn put(&mut self, offset: usize, bytes: &[u8]) {
            self.0[offset..offset + bytes.len()].copy_from_slice(bytes);
        }

        fn read_u64(&self, offset: usize) -> u64 {
            u64::from_le_bytes(self.0[offset..offset + 8].try_into().unwrap())
        }
    }

    fn program_header(kind: u32, flags: u32, offset: u64, size: u64, link_base: u64) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&kind.to_le_bytes());
        bytes.extend_from_slice(&flags.to_le_bytes());
        for field in [offset, link_base + offset, link_base + offset, size, size, 8] {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        bytes
    }

    /// A position independent AArch64 executable: a read-only page with the headers, a code
    /// page and a data page that holds the dynamic table, one relocation and its target.
    fn build_image(link_base: u64, machine: u16) -> Box<Volume> {
        let mut volume = Box::new(Volume([0; VOLUME_SIZE]));

        let mut header = vec![0x7f, b'E', b'L', b'F', 2, 1, 1];
        header.resize(16, 0);
        header.extend_from_slice(&3u16.to_le_bytes()); // ET_DYN
        header.extend_from_slice(&machine.to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());
        header.extend_from_slice(&(link_base + 0x1000).to_le_bytes()); // entry
        header.extend_from_slice(&64u64.to_le_bytes()); // phoff
        header.extend_from_slice(&0u64.to_le_bytes()); // shoff
        header.extend_from_slice(&0u32.to_le_bytes());
        for field in [64u16, 56, 4, 64, 0, 0] {
            header.extend_from_slice(&field.to_le_bytes());
        }
        volume.put(0, &header);

        let mut offset = 64;
        for ph in [
            program_header(PT_LOAD, PF_R, 0, 0x1000, link_base),
            program_header(PT_LOAD, PF_R | PF_X, 0x1000, 0x1000, link_base),
            program_header(PT_LOAD, PF_R | PF_W, 0x2000, 0x1000, link_base),
            program_header(PT_DYNAMIC, PF_R | PF_W, 0x2000, 64, link_base),
        ] {
            volume.put(offset, &ph);
            offset += ph.len();
        }

        let dynamic = [
            (7u64, link_base + RELA_TABLE as u64), // DT_RELA
            (8, 24),                               // DT_RELASZ
            (9, 24),                               // DT_RELAENT
            (0, 0),                                // DT_NULL
        ];
        for (idx, (tag, value)) in dynamic.into_iter().enumerate() {
            volume.put(0x2000 + idx * 16, &tag.to_le_bytes());
            volume.put(0x2008 + idx * 16, &value.to_le_bytes());
        }

        volume.put(
            RELA_TABLE,
            &(link_base + RELOCATION_TARGET as u64).to_le_bytes(),
        );
        volume.put(RELA_TABLE + 8, &u64::from(R_AARCH64_RELATIVE).to_le_bytes());
        volume.put(RELA_TABLE + 16, &(link_base + 0x1040).to_le_bytes());
        volume
    }

    #[derive(Default)]
    struct CountingPermissions {
        calls: Vec<(&'static str, u64, u64)>,
    }

    impl MemoryPermissions for CountingPermissions {
        fn set_no_exec(&mut self, base: u64, len: u64) -> Result<(), BootError> {
            self.calls.push(("nx", base, len));
            Ok(())
        }

        fn set_read_only(&mut self, base: u64, len: u64) -> Result<(), BootError> {
            self.calls.push(("ro", base, len));
            Ok(())
        }

        fn clear_read_only(&mut self, base: u64, len: u64) -> Result<(), BootError> {
            self.calls.push(("rw", base, len));
            Ok(())
        }
    }

    #[test]
    fn segments_become_sections() {
        let mut volume = build_image(LINK_BASE, EM_AARCH64);
        let mut loader = unsafe { ElfImageLoader::new() };
        let image = loader.locate(volume.region()).unwrap();
        let layout = loader.layout(&image).unwrap();
        assert_eq!(layout.image_address, LINK_BASE);
        assert_eq!(layout.nominal_base, LINK_BASE);
        assert_eq!(layout.section_count, 4);

        let code = loader.section(&image, &layout, 1).unwrap().unwrap();
        assert_eq!((code.address, code.size), (0x1000, 0x1000));
        assert!(code.executable && !code.writable);
        let data = loader.section(&image, &layout, 2).unwrap().unwrap();
        assert!(data.writable && !data.executable);
        assert_eq!(loader.section(&image, &layout, 3), Ok(None));
    }

    #[test]
    fn moved_image_is_relocated() {
        let mut volume = build_image(LINK_BASE, EM_AARCH64);
        let base = volume.region().base;
        let mut loader = unsafe { ElfImageLoader::new() };
        let mut permissions = CountingPermissions::default();
        let state = initialize_image(volume.region(), &mut loader, &mut permissions).unwrap();

        assert!(state.relocated);
        assert_eq!(state.load_base, base);
        assert_eq!(volume.read_u64(RELOCATION_TARGET), base + 0x1040);
        assert_eq!(
            permissions.calls,
            [
                ("nx", base, 0x1000),
                ("ro", base, 0x1000),
                ("ro", base + 0x1000, 0x1000),
                ("nx", base + 0x2000, 0x1000),
                ("rw", base + 0x2000, 0x1000),
                ("nx", base, 0x1000),
                ("rw", base, 0x1000),
            ]
        );
    }

    #[test]
    fn image_linked_in_place_is_not_relocated() {
        let mut volume = build_image(0, EM_AARCH64);
        let base = volume.region().base;
        // relink for the address the volume happens to live at
        *volume = *build_image(base, EM_AARCH64);
        let mut loader = unsafe { ElfImageLoader::new() };
        let mut permissions = CountingPermissions::default();
        let state = initialize_image(volume.region(), &mut loader, &mut permissions).unwrap();

        assert!(!state.relocated);
        assert_eq!(volume.read_u64(RELOCATION_TARGET), 0);
        assert_eq!(permissions.calls.len(), 5);
    }

    #[test]
    fn unknown_machines_cannot_be_relocated() {
        let mut volume = build_image(LINK_BASE, 0x28); // EM_ARM
        let mut loader = unsafe { ElfImageLoader::new() };
        let image = loader.locate(volume.region()).unwrap();
        let layout = loader.layout(&image).unwrap();
        assert_eq!(
            loader.relocate(&image, &layout, image.address),
            Err(RelocationError("unsupported machine for relocation"))
        );
        assert_eq!(volume.read_u64(RELOCATION_TARGET), 0);
    }

    #[test]
    fn relocations_outside_segments_are_rejected() {
        let mut volume = build_image(LINK_BASE, EM_AARCH64);
        volume.put(RELA_TABLE, &(LINK_BASE + 0x8000).to_le_bytes());
        let mut loader = unsafe { ElfImageLoader::new() };
        let image = loader.locate(volume.region()).unwrap();
        let layout = loader.layout(&image).unwrap();
        assert!(loader.relocate(&image, &layout, image.address).is_err());
    }

    #[test]
    fn relocations_into_read_only_segments_are_rejected() {
        let mut volume = build_image(LINK_BASE, EM_AARCH64);
        // inside the code segment, which stays read-only during relocation
        volume.put(RELA_TABLE, &(LINK_BASE + 0x1100).to_le_bytes());
        let mut loader = unsafe { ElfImageLoader::new() };
        let image = loader.locate(volume.region()).unwrap();
        let layout = loader.layout(&image).unwrap();
        assert_eq!(
            loader.relocate(&image, &layout, image.address),
            Err(RelocationError("relocation target is not in a writable segment"))
        );
        assert_eq!(volume.read_u64(0x1100), 0);
    }

    #[test]
    fn relocations_into_the_first_page_are_applied() {
        let mut volume = build_image(LINK_BASE, EM_AARCH64);
        volume.put(RELA_TABLE, &(LINK_BASE + 0x800).to_le_bytes());
        let base = volume.region().base;
        let mut loader = unsafe { ElfImageLoader::new() };
        let image = loader.locate(volume.region()).unwrap();
        let layout = loader.layout(&image).unwrap();
        assert_eq!(loader.relocate(&image, &layout, image.address), Ok(()));
        assert_eq!(volume.read_u64(0x800), base + 0x1040);
    }

    #[test]
    fn locate_rejects_unaligned_and_foreign_data() {
        let mut volume = build_image(LINK_BASE, EM_AARCH64);
        let mut loader = unsafe { ElfImageLoader::new() };
        let region = volume.region();
        assert!(loader
            .locate(MemoryRegion::new(region.base + 8, region.size - 8))
            .is_err());

        let mut empty = Box::new(Volume([0; VOLUME_SIZE]));
        assert!(loader.locate(empty.region()).is_err());
        assert!(loader.locate(MemoryRegion::empty()).is_err());
    }

    #[test]
    fn images_from_elsewhere_are_refused() {
        let mut volume = build_image(LINK_BASE, EM_AARCH64);
        let mut loader = unsafe { ElfImageLoader::new() };
        let image = RawImage {
            address: volume.region().base,
            len: VOLUME_SIZE as u64,
        };
        assert!(loader.layout(&image).is_err());
    }
}
