//! Function identifiers and encodings of the FF-A ABI used during partition boot.

use core::fmt;

/// `FFA_ERROR`, returned in `w0` when a call failed. The error code is in `w2`.
pub const FFA_ERROR: u32 = 0x8400_0060;
/// `FFA_SUCCESS` (SMC32 convention), returned in `w0` when a call succeeded.
pub const FFA_SUCCESS_32: u32 = 0x8400_0061;
/// `FFA_VERSION`: exchanges the FF-A versions of caller and partition manager.
pub const FFA_VERSION: u32 = 0x8400_0063;
/// `FFA_MEM_PERM_GET`: queries the access permissions of a page.
pub const FFA_MEM_PERM_GET: u32 = 0x8400_0088;
/// `FFA_MEM_PERM_SET`: changes the access permissions of a range of pages.
pub const FFA_MEM_PERM_SET: u32 = 0x8400_0089;

/// Error code returned by the partition manager for unknown or unsupported calls.
pub const NOT_SUPPORTED: i32 = -1;
/// Error code returned by the partition manager when the caller may not issue the call.
pub const DENIED: i32 = -6;

/// The FF-A version this partition implements and advertises, v1.1.
pub const SUPPORTED_VERSION: FfaVersion = FfaVersion::new(1, 1);

/// An FF-A version number.
///
/// Encoded on the wire as `major << 16 | minor` with bit 31 clear.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FfaVersion {
    major: u16,
    minor: u16,
}

impl FfaVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Decodes a version word returned by `FFA_VERSION`.
    ///
    /// Returns `None` if bit 31 is set, which marks an error code rather than a version.
    pub const fn decode(raw: u32) -> Option<Self> {
        if raw & (1 << 31) != 0 {
            return None;
        }
        Some(Self {
            major: (raw >> 16) as u16,
            minor: raw as u16,
        })
    }

    pub const fn encode(self) -> u32 {
        ((self.major as u32 & 0x7fff) << 16) | self.minor as u32
    }

    pub const fn major(&self) -> u16 {
        self.major
    }

    pub const fn minor(&self) -> u16 {
        self.minor
    }
}

impl fmt::Display for FfaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_word_layout() {
        assert_eq!(SUPPORTED_VERSION.encode(), 0x0001_0001);
        assert_eq!(FfaVersion::decode(0x0001_0002), Some(FfaVersion::new(1, 2)));
        assert_eq!(FfaVersion::decode(0x0002_0000), Some(FfaVersion::new(2, 0)));
    }

    #[test]
    fn error_codes_are_not_versions() {
        assert_eq!(FfaVersion::decode(NOT_SUPPORTED as u32), None);
        assert_eq!(FfaVersion::decode(0x8000_0000), None);
    }
}
