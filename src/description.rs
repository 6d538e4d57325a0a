use serde::{Deserialize, Serialize};
use sp_boot_api::Granule;
use thiserror::Error;

/// Everything the partition manager tells a partition about itself at boot.
///
/// Stored as JSON with kebab-case keys, matching the manifest property names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PartitionDescription {
    /// Written as the `description` of the manifest root.
    pub description: String,
    pub load_address: u64,
    pub entrypoint_offset: u32,
    pub image_size: u64,
    /// 0, 1 or 2 for 4 KiB, 16 KiB or 64 KiB pages.
    pub xlat_granule: u32,
    /// Where the partition manager places the manifest blob.
    #[serde(default)]
    pub manifest_address: u64,
    #[serde(default)]
    pub memory_regions: Vec<RegionDescription>,
}

/// A child of the `memory-regions` manifest node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RegionDescription {
    /// The node name.
    pub name: String,
    /// The name the partition looks the region up by, such as `heap`.
    pub description: String,
    pub base_address: u64,
    pub pages_count: u32,
}

/// A description that cannot be turned into a manifest the partition accepts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptionError {
    #[error("xlat-granule {0} is not one of 0, 1 or 2")]
    UnknownGranule(u32),
    #[error("entrypoint-offset overflows the load address")]
    EntrypointOverflow,
    #[error("memory region `{0}` has an empty description")]
    EmptyDescription(String),
    #[error("memory region `{0}` wraps the address space")]
    RegionOverflow(String),
    #[error("memory region node `{0}` is defined more than once")]
    DuplicateRegion(String),
    #[error("a partition image of {len} bytes does not fit image-size {image_size}")]
    ImageTooLarge { len: u64, image_size: u64 },
}

impl PartitionDescription {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn granule(&self) -> Result<Granule, DescriptionError> {
        Granule::from_manifest(self.xlat_granule)
            .ok_or(DescriptionError::UnknownGranule(self.xlat_granule))
    }

    /// Checks everything the boot sequence of the partition checks, and a few things that
    /// would make it pick the wrong region.
    pub fn validate(&self) -> Result<(), DescriptionError> {
        let page_size = self.granule()?.page_size();
        self.load_address
            .checked_add(self.entrypoint_offset.into())
            .ok_or(DescriptionError::EntrypointOverflow)?;

        for (index, region) in self.memory_regions.iter().enumerate() {
            if region.description.is_empty() {
                // an empty description would match every lookup
                return Err(DescriptionError::EmptyDescription(region.name.clone()));
            }
            u64::from(region.pages_count)
                .checked_mul(page_size)
                .and_then(|size| region.base_address.checked_add(size))
                .ok_or_else(|| DescriptionError::RegionOverflow(region.name.clone()))?;
            if self.memory_regions[..index]
                .iter()
                .any(|other| other.name == region.name)
            {
                return Err(DescriptionError::DuplicateRegion(region.name.clone()));
            }
        }
        Ok(())
    }
}
