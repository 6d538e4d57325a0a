use crate::{
    ffa::{FfaArgs, Transport},
    load_image::MemoryPermissions,
    BootError,
};
use sp_boot_api::ffa::{FFA_ERROR, FFA_MEM_PERM_GET, FFA_MEM_PERM_SET, FFA_SUCCESS_32, NOT_SUPPORTED};

/// Unit of the page count of `FFA_MEM_PERM_SET`.
const PERM_PAGE_SIZE: u64 = 4096;

const DATA_ACCESS_MASK: u32 = 0b11;
const DATA_ACCESS_RW: u32 = 0b01;
const DATA_ACCESS_RO: u32 = 0b11;
const INSTRUCTION_ACCESS_NX: u32 = 1 << 2;

/// Changes page permissions through `FFA_MEM_PERM_GET` and `FFA_MEM_PERM_SET`.
///
/// Each change reads the current attributes of the first page and only replaces the part that
/// changes, so data and instruction access can be updated independently.
#[derive(Debug)]
pub struct FfaMemoryPermissions<T> {
    transport: T,
}

impl<T: Transport> FfaMemoryPermissions<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Applies `change` to the attributes of every page in `base..base + len`.
    ///
    /// Pages are read one by one, and each run of pages that currently share their attributes
    /// is changed with a single `FFA_MEM_PERM_SET`.
    fn update(
        &mut self,
        base: u64,
        len: u64,
        change: impl Fn(u32) -> u32,
    ) -> Result<(), BootError> {
        if base % PERM_PAGE_SIZE != 0 {
            log::error!("permission change at unaligned address {:#x}", base);
            return Err(BootError::InvalidParameter);
        }
        if len == 0 {
            return Ok(());
        }
        let pages = u32::try_from(len.div_ceil(PERM_PAGE_SIZE))
            .ok()
            .filter(|pages| {
                u64::from(*pages)
                    .checked_mul(PERM_PAGE_SIZE)
                    .and_then(|size| base.checked_add(size))
                    .is_some()
            })
            .ok_or_else(|| {
                log::error!(
                    "permission change of {:#x} bytes at {:#x} is too large",
                    len,
                    base
                );
                BootError::InvalidParameter
            })?;

        let mut run_base = base;
        let mut run_pages = 1;
        let mut run_attributes = self.attributes(base)?;
        for page in 1..pages {
            let address = base + u64::from(page) * PERM_PAGE_SIZE;
            let current = self.attributes(address)?;
            if current == run_attributes {
                run_pages += 1;
                continue;
            }
            self.set(run_base, run_pages, run_attributes, change(run_attributes))?;
            run_base = address;
            run_pages = 1;
            run_attributes = current;
        }
        self.set(run_base, run_pages, run_attributes, change(run_attributes))
    }

    fn attributes(&mut self, page: u64) -> Result<u32, BootError> {
        Ok(self.call(FfaArgs::new(FFA_MEM_PERM_GET, &[page]))?.w(2))
    }

    fn set(
        &mut self,
        base: u64,
        pages: u32,
        current: u32,
        attributes: u32,
    ) -> Result<(), BootError> {
        log::trace!(
            "{:#x}: {} page(s), attributes {:#x} -> {:#x}",
            base,
            pages,
            current,
            attributes
        );
        self.call(FfaArgs::new(
            FFA_MEM_PERM_SET,
            &[base, pages.into(), attributes.into()],
        ))?;
        Ok(())
    }

    fn call(&mut self, args: FfaArgs) -> Result<FfaArgs, BootError> {
        let result = self.transport.call(args);
        match result.function() {
            FFA_SUCCESS_32 => Ok(result),
            FFA_ERROR => {
                let code = result.w(2) as i32;
                log::error!("FF-A call {:#x} failed with {}", args.function(), code);
                Err(BootError::Transport(code))
            }
            other => {
                log::error!(
                    "FF-A call {:#x} returned unexpected function {:#x}",
                    args.function(),
                    other
                );
                Err(BootError::Transport(NOT_SUPPORTED))
            }
        }
    }
}

impl<T: Transport> MemoryPermissions for FfaMemoryPermissions<T> {
    fn set_no_exec(&mut self, base: u64, len: u64) -> Result<(), BootError> {
        self.update(base, len, |attributes| attributes | INSTRUCTION_ACCESS_NX)
    }

    fn set_read_only(&mut self, base: u64, len: u64) -> Result<(), BootError> {
        self.update(base, len, |attributes| {
            (attributes & !DATA_ACCESS_MASK) | DATA_ACCESS_RO
        })
    }

    fn clear_read_only(&mut self, base: u64, len: u64) -> Result<(), BootError> {
        self.update(base, len, |attributes| {
            (attributes & !DATA_ACCESS_MASK) | DATA_ACCESS_RW
        })
    }
}
