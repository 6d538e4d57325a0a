#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};

/// Configures the boot behavior of the secure partition.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
#[non_exhaustive]
pub struct BootConfig<'a> {
    /// The minimum log level that is printed during boot.
    ///
    /// The default is [`LevelFilter::Trace`].
    pub log_level: LevelFilter,

    /// The `description` of the `memory-regions` node that backs the memory service.
    ///
    /// The default is `"heap"`.
    #[serde(borrow)]
    pub heap_region: &'a str,
}

impl Default for BootConfig<'_> {
    fn default() -> Self {
        Self {
            log_level: Default::default(),
            heap_region: "heap",
        }
    }
}

impl<'a> BootConfig<'a> {
    /// Parses a JSON encoded configuration, falling back to the defaults when none is given.
    ///
    /// Missing fields take their default values.
    pub fn deserialize(serialized: Option<&'a [u8]>) -> Result<Self, serde_json_core::de::Error> {
        match serialized {
            Some(json) => serde_json_core::from_slice(json).map(|(config, _)| config),
            None => Ok(Default::default()),
        }
    }
}

/// An enum representing the available verbosity level filters of the logger.
///
/// Based on
/// <https://github.com/rust-lang/log/blob/dc32ab999f52805d5ce579b526bd9d9684c38d1a/src/lib.rs#L552-565>
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LevelFilter {
    /// A level lower than all log levels.
    Off,
    /// Corresponds to the `Error` log level.
    Error,
    /// Corresponds to the `Warn` log level.
    Warn,
    /// Corresponds to the `Info` log level.
    Info,
    /// Corresponds to the `Debug` log level.
    Debug,
    /// Corresponds to the `Trace` log level.
    Trace,
}

impl Default for LevelFilter {
    fn default() -> Self {
        Self::Trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_uses_defaults() {
        let config = BootConfig::deserialize(None).unwrap();
        assert_eq!(config, BootConfig::default());
        assert_eq!(config.heap_region, "heap");
        assert_eq!(config.log_level, LevelFilter::Trace);
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let json = br#"{"log_level":"Warn"}"#;
        let config = BootConfig::deserialize(Some(json)).unwrap();
        assert_eq!(config.log_level, LevelFilter::Warn);
        assert_eq!(config.heap_region, "heap");
    }

    #[test]
    fn heap_region_is_borrowed_from_input() {
        let json = br#"{"heap_region":"mm-heap","log_level":"Off"}"#;
        let config = BootConfig::deserialize(Some(json)).unwrap();
        assert_eq!(config.heap_region, "mm-heap");
        assert_eq!(config.log_level, LevelFilter::Off);
    }

    #[test]
    fn malformed_config_is_an_error() {
        assert!(BootConfig::deserialize(Some(b"{\"log_level\":")).is_err());
    }
}
