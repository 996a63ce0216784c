//! # VEOS kernel support crate.
//!
//! This crate collects the pieces of the VEOS teaching kernel that the
//! virtual-memory subsystem builds on but does not own: typed physical and
//! virtual addresses, the spinlock, the kernel error type, and the traits
//! through which external collaborators are consumed (regular files, block
//! devices, and the hardware address-translation structure).
//!
//! Everything here is deliberately small. The interesting machinery —
//! demand paging, frame eviction, swap, memory-mapped files — lives in the
//! `veos-vm` crate; this crate only fixes the vocabulary those components
//! share with the rest of the kernel.
//!
//! ## Why Rust?
//!
//! In traditional system programming languages, concurrency and memory bugs
//! such as data races, use-after-free errors, and null pointer dereferences
//! are common. Rust prevents these issues at compile time by enforcing
//! strict ownership, borrowing, and lifetime rules, which allows writing
//! safe and efficient concurrent kernel code without sacrificing
//! performance.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addressing;
pub mod dev;
pub mod fs;
pub mod mm;
pub mod sync;

/// Enum representing errors that can occur during a kernel operation.
///
/// This enum is used to categorize errors encountered by kernel operations.
/// Each variant corresponds to a specific type of error that might occur
/// during the handling of a kernel operation. These errors can be returned
/// to the user program to indicate the nature of the failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// IO Error. (EIO)
    IOError,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Mapping exists. (EEXIST)
    AlreadyMapped,
    /// Invalid argument. (EINVAL)
    InvalidArgument,
    /// No space left on device. (ENOSPC)
    NoSpace,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding `usize` error
    /// code. The result is cast to `usize` for use as a return value in
    /// system calls.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::IOError => -5isize,
            KernelError::NoMemory => -12,
            KernelError::BadAddress => -14,
            KernelError::AlreadyMapped => -17,
            KernelError::InvalidArgument => -22,
            KernelError::NoSpace => -28,
        }) as usize
    }
}
