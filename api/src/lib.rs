//! Types that the secure partition boot code hands to the partition it starts.
//!
//! The boot code derives a [`BootInfo`](info::BootInfo) from the FF-A manifest and reports
//! the result of the boot sequence as a [`BootOutcome`](outcome::BootOutcome). The FF-A ABI
//! constants used while talking to the partition manager live in [`ffa`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

pub use info::{BootInfo, Granule, MemoryRegion};
pub use outcome::BootOutcome;

pub mod ffa;
pub mod info;
pub mod outcome;
