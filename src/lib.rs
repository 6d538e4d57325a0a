/*!
Host side packaging of FF-A secure partitions.

A [`PackageBuilder`] turns a [`PartitionDescription`] into the manifest device tree blob that
the partition reads at boot, together with a boot information blob that points at it. The
boot sequence itself lives in the `sp-boot-common` crate and runs inside the partition.
*/

use anyhow::Context;
use sp_boot_common::{
    boot_info::BootInfoBlob, fdt_writer::FdtWriter, manifest::FFA_MANIFEST_COMPATIBLE,
};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub use description::{DescriptionError, PartitionDescription, RegionDescription};
pub use file_data_source::FileDataSource;
pub use sp_boot_api::{BootInfo, BootOutcome, Granule, MemoryRegion};
pub use sp_boot_config::{BootConfig, LevelFilter};

mod description;
mod file_data_source;

const MANIFEST_FILE_NAME: &str = "manifest.dtb";
const BOOT_INFO_FILE_NAME: &str = "boot-info.bin";
const CONFIG_FILE_NAME: &str = "boot.json";
const IMAGE_FILE_NAME: &str = "image.bin";

/// The files written by [`PackageBuilder::write_to`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFiles {
    /// The manifest device tree blob.
    pub manifest: PathBuf,
    /// The boot information blob, pointing at the manifest at its `manifest-address`.
    pub boot_info: PathBuf,
    /// Only written if a boot configuration was set.
    pub config: Option<PathBuf>,
    /// Only written if a partition image was set.
    pub image: Option<PathBuf>,
}

/// Assembles the boot inputs of a secure partition.
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    description: PartitionDescription,
    image: Option<FileDataSource>,
    boot_config: Option<Vec<u8>>,
}

impl PackageBuilder {
    /// Start a package for the given partition.
    pub fn new(description: PartitionDescription) -> Self {
        Self {
            description,
            image: None,
            boot_config: None,
        }
    }

    /// Start a package from a JSON partition description.
    pub fn from_description_file(path: &Path) -> anyhow::Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read partition description {}", path.display()))?;
        let description = PartitionDescription::from_json(&json)
            .with_context(|| format!("invalid partition description {}", path.display()))?;
        Ok(Self::new(description))
    }

    /// Copy the partition image from the given file into the package.
    pub fn set_image_file(&mut self, image_path: &Path) -> &mut Self {
        self.image = Some(FileDataSource::File(image_path.to_owned()));
        self
    }

    /// Add an in-memory partition image to the package.
    pub fn set_image_data(&mut self, image: Vec<u8>) -> &mut Self {
        self.image = Some(FileDataSource::Data(image));
        self
    }

    /// Creates a configuration file (boot.json) that configures the boot behavior of the partition.
    pub fn set_boot_config(&mut self, config: &BootConfig) -> anyhow::Result<&mut Self> {
        let json = serde_json::to_vec_pretty(config).context("failed to serialize BootConfig")?;
        self.boot_config = Some(json);
        Ok(self)
    }

    /// The description the package is built from.
    pub fn description(&self) -> &PartitionDescription {
        &self.description
    }

    /// Builds the manifest device tree blob.
    ///
    /// The partition properties sit on the root node, the regions in a `memory-regions` child.
    pub fn manifest_blob(&self) -> anyhow::Result<Vec<u8>> {
        let description = &self.description;
        description
            .validate()
            .context("partition description is not bootable")?;

        let mut fdt = FdtWriter::new();
        fdt.begin_node("")
            .property_string("compatible", FFA_MANIFEST_COMPATIBLE)
            .property_string("description", &description.description)
            .property_u64("load-address", description.load_address)
            .property_u32("entrypoint-offset", description.entrypoint_offset)
            .property_u64("image-size", description.image_size)
            .property_u32("xlat-granule", description.xlat_granule);
        if !description.memory_regions.is_empty() {
            fdt.begin_node("memory-regions");
            for region in &description.memory_regions {
                fdt.begin_node(&region.name)
                    .property_string("description", &region.description)
                    .property_u64("base-address", region.base_address)
                    .property_u32("pages-count", region.pages_count)
                    .end_node();
            }
            fdt.end_node();
        }
        fdt.end_node();
        fdt.finish().context("failed to write manifest device tree")
    }

    /// Builds a boot information blob with a single descriptor for a manifest of
    /// `manifest_len` bytes at `manifest_address`.
    pub fn boot_info_blob(
        &self,
        manifest_address: u64,
        manifest_len: usize,
    ) -> anyhow::Result<Vec<u8>> {
        let size = u32::try_from(manifest_len)
            .with_context(|| format!("manifest of {manifest_len} bytes is too large"))?;
        Ok(BootInfoBlob::new().manifest(manifest_address, size).to_bytes())
    }

    /// Writes the package into the directory `out_path`, creating it if needed.
    pub fn write_to(&self, out_path: &Path) -> anyhow::Result<PackageFiles> {
        fs::create_dir_all(out_path)
            .with_context(|| format!("failed to create out dir at {}", out_path.display()))?;

        let manifest = self.manifest_blob()?;
        let manifest_path = out_path.join(MANIFEST_FILE_NAME);
        fs::write(&manifest_path, &manifest)
            .with_context(|| format!("failed to write {}", manifest_path.display()))?;

        let boot_info = self.boot_info_blob(self.description.manifest_address, manifest.len())?;
        let boot_info_path = out_path.join(BOOT_INFO_FILE_NAME);
        fs::write(&boot_info_path, boot_info)
            .with_context(|| format!("failed to write {}", boot_info_path.display()))?;

        let config = match &self.boot_config {
            Some(json) => {
                let path = out_path.join(CONFIG_FILE_NAME);
                fs::write(&path, json)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                Some(path)
            }
            None => None,
        };

        let image = match &self.image {
            Some(source) => Some(self.write_image(source, out_path)?),
            None => None,
        };

        Ok(PackageFiles {
            manifest: manifest_path,
            boot_info: boot_info_path,
            config,
            image,
        })
    }

    fn write_image(&self, source: &FileDataSource, out_path: &Path) -> anyhow::Result<PathBuf> {
        let len = source.len()?;
        let image_size = self.description.image_size;
        if len > image_size {
            return Err(DescriptionError::ImageTooLarge { len, image_size }.into());
        }

        let path = out_path.join(IMAGE_FILE_NAME);
        let mut file = fs::File::create(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        source
            .copy_to(&mut file)
            .with_context(|| format!("failed to copy image to {}", path.display()))?;
        Ok(path)
    }
}
