use sp_boot_api::BootOutcome;
use thiserror::Error;

/// Failure of a step of the partition boot sequence.
///
/// Every component returns these immediately; only the boot orchestrator turns them into a
/// [`BootOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BootError {
    /// An FF-A call to the partition manager failed with the given error code.
    #[error("FF-A call failed with error code {0}")]
    Transport(i32),
    /// The partition manager speaks an incompatible FF-A version.
    #[error("partition manager uses an incompatible FF-A version")]
    Unsupported,
    /// The boot information or the manifest is malformed or misses a required field.
    #[error("malformed or incomplete boot information")]
    InvalidParameter,
    /// The manifest, or a node required from it, does not exist.
    #[error("required boot information not found")]
    NotFound,
    /// The partition executable could not be located or parsed.
    #[error("failed to load the partition image: {0}")]
    Load(&'static str),
}

impl BootError {
    /// The outcome code reported when boot stops with this error.
    pub const fn outcome(&self) -> BootOutcome {
        match self {
            Self::Unsupported => BootOutcome::Unsupported,
            Self::InvalidParameter => BootOutcome::InvalidParameter,
            Self::NotFound => BootOutcome::NotFound,
            Self::Transport(_) | Self::Load(_) => BootOutcome::Success,
        }
    }
}
