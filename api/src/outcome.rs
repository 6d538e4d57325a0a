use core::fmt;

/// The terminal outcome of the partition boot sequence.
///
/// Nothing receives this value at this stage of boot; it is kept as a diagnostic. The numeric
/// codes are stable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum BootOutcome {
    /// The partition reached its entry points, or stopped early on a path where there was
    /// nothing more to do. Also used for failures without a dedicated code.
    Success = 0,
    /// The partition manager speaks an incompatible FF-A version.
    Unsupported = -1,
    /// The boot information or the manifest was malformed or incomplete.
    InvalidParameter = -2,
    /// The manifest or a required node in it was not found.
    NotFound = -7,
}

impl BootOutcome {
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Looks up the outcome for a numeric code.
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            -1 => Some(Self::Unsupported),
            -2 => Some(Self::InvalidParameter),
            -7 => Some(Self::NotFound),
            _ => None,
        }
    }
}

impl fmt::Display for BootOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::Unsupported => "unsupported",
            Self::InvalidParameter => "invalid parameter",
            Self::NotFound => "not found",
        };
        write!(f, "{} ({})", name, self.code())
    }
}
