use sp_boot::{
    BootConfig, Granule, LevelFilter, MemoryRegion, PackageBuilder, PartitionDescription,
    RegionDescription,
};
use sp_boot_common::{boot_info, manifest::Manifest, memory_regions};
use std::fs;

fn description() -> PartitionDescription {
    PartitionDescription {
        description: "mm-partition".into(),
        load_address: 0x7000_0000,
        entrypoint_offset: 0x1000,
        image_size: 0x20_0000,
        xlat_granule: 0,
        manifest_address: 0x7100_0000,
        memory_regions: vec![
            RegionDescription {
                name: "ns-buffer".into(),
                description: "ns-comm".into(),
                base_address: 0x8000_0000,
                pages_count: 16,
            },
            RegionDescription {
                name: "heap".into(),
                description: "heap".into(),
                base_address: 0x7200_0000,
                pages_count: 256,
            },
        ],
    }
}

#[test]
fn manifest_is_read_back_by_the_partition() {
    let blob = PackageBuilder::new(description()).manifest_blob().unwrap();
    let manifest = Manifest::new(&blob).unwrap();

    let info = boot_info::populate_boot_info(&manifest, "heap").unwrap();
    assert_eq!(info.memory_base, 0x7000_1000);
    assert_eq!(info.memory_size, 0x20_0000);
    assert_eq!(info.granule, Granule::Size4KiB);
    assert_eq!(info.heap_base, 0x7200_0000);
    assert_eq!(info.heap_size, 256 * 4096);

    let buffer = memory_regions::discover(&manifest, "ns-comm", info.page_size()).unwrap();
    assert_eq!(buffer, MemoryRegion::new(0x8000_0000, 16 * 4096));
}

#[test]
fn larger_granules_scale_the_regions() {
    let mut description = description();
    description.xlat_granule = 2;
    let blob = PackageBuilder::new(description).manifest_blob().unwrap();
    let manifest = Manifest::new(&blob).unwrap();

    let info = boot_info::populate_boot_info(&manifest, "heap").unwrap();
    assert_eq!(info.granule, Granule::Size64KiB);
    assert_eq!(info.heap_size, 256 * 0x1_0000);
}

#[test]
fn invalid_descriptions_produce_no_manifest() {
    let mut description = description();
    description.xlat_granule = 5;
    let err = PackageBuilder::new(description).manifest_blob().unwrap_err();
    assert!(format!("{:#}", err).contains("xlat-granule 5"));
}

#[test]
fn package_directory_contains_every_file() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("package");
    let image = vec![0x1f; 0x3000];

    let mut builder = PackageBuilder::new(description());
    builder
        .set_image_data(image.clone())
        .set_boot_config(&BootConfig::default())
        .unwrap();
    let files = builder.write_to(&out).unwrap();

    let manifest = fs::read(&files.manifest).unwrap();
    assert_eq!(manifest, builder.manifest_blob().unwrap());

    let boot_info = fs::read(&files.boot_info).unwrap();
    let address = unsafe { boot_info::manifest_address(boot_info.as_ptr()) }.unwrap();
    assert_eq!(address, 0x7100_0000);

    let config = fs::read(files.config.unwrap()).unwrap();
    let config = BootConfig::deserialize(Some(config.as_slice())).unwrap();
    assert_eq!(config.log_level, LevelFilter::Trace);
    assert_eq!(config.heap_region, "heap");

    assert_eq!(fs::read(files.image.unwrap()).unwrap(), image);
}

#[test]
fn image_is_copied_from_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("partition.elf");
    fs::write(&image_path, b"\x7fELF partition").unwrap();

    let mut builder = PackageBuilder::new(description());
    builder.set_image_file(&image_path);
    let files = builder.write_to(&dir.path().join("out")).unwrap();

    assert_eq!(files.config, None);
    assert_eq!(fs::read(files.image.unwrap()).unwrap(), b"\x7fELF partition");
}

#[test]
fn oversized_image_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut description = description();
    description.image_size = 0x1000;

    let mut builder = PackageBuilder::new(description);
    builder.set_image_data(vec![0; 0x1001]);
    let err = builder.write_to(dir.path()).unwrap_err();
    assert!(err.to_string().contains("does not fit image-size"));
}

#[test]
fn description_file_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partition.json");
    fs::write(&path, description().to_json().unwrap()).unwrap();

    let builder = PackageBuilder::from_description_file(&path).unwrap();
    assert_eq!(*builder.description(), description());

    fs::write(&path, "{ \"description\": 1 }").unwrap();
    assert!(PackageBuilder::from_description_file(&path).is_err());
}
