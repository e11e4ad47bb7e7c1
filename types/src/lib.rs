//! Types shared between the boot protocol, the memory core and the kernel.

#![cfg_attr(not(test), no_std)]

pub mod fmt;
pub mod mem;
