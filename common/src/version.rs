use crate::{
    ffa::{FfaArgs, Transport},
    BootError,
};
use sp_boot_api::ffa::{FfaVersion, FFA_VERSION, SUPPORTED_VERSION};

/// How much of the FF-A protocol can be used with the partition manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compatibility {
    /// The version reported by the partition manager.
    pub manager: FfaVersion,
    /// Whether the manager implements everything the boot sequence needs.
    pub full_protocol: bool,
}

/// Exchanges versions with the partition manager through `FFA_VERSION`.
///
/// The call is made once and not retried.
pub fn negotiate<T: Transport + ?Sized>(transport: &mut T) -> Result<Compatibility, BootError> {
    let result = transport.call(FfaArgs::new(
        FFA_VERSION,
        &[SUPPORTED_VERSION.encode().into()],
    ));
    let raw = result.w(0);
    let manager = FfaVersion::decode(raw).ok_or_else(|| {
        log::error!("FFA_VERSION failed with {}", raw as i32);
        BootError::Transport(raw as i32)
    })?;

    let compatibility = check_compatibility(manager, SUPPORTED_VERSION)?;
    log::info!(
        "partition manager speaks FF-A {} (requested {})",
        manager,
        SUPPORTED_VERSION
    );
    Ok(compatibility)
}

/// Major versions must match; the full protocol needs at least the `required` minor version.
pub fn check_compatibility(
    manager: FfaVersion,
    required: FfaVersion,
) -> Result<Compatibility, BootError> {
    if manager.major() != required.major() {
        log::error!(
            "incompatible FF-A versions: partition manager {}, partition {}",
            manager,
            required
        );
        return Err(BootError::Unsupported);
    }
    Ok(Compatibility {
        manager,
        full_protocol: manager.minor() >= required.minor(),
    })
}
