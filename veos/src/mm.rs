//! Memory-management interfaces shared between the kernel and the paging
//! subsystem.
//!
//! The actual address-translation structure (the hardware page table walked
//! by the MMU) is owned by the platform layer, not by the paging code. The
//! paging code drives it exclusively through the [`AddressSpace`] trait:
//! installing a translation when a page becomes resident, tearing it down
//! on eviction or unmap, and querying the dirty bit the hardware maintains
//! for write-back decisions.
//!
//! Keeping the translation structure behind a trait means the paging core
//! never touches architecture-specific entry formats, and a software
//! implementation can stand in for the MMU when the core runs hosted.

use crate::{KernelError, addressing::{Pa, Va}};

bitflags::bitflags! {
    /// Memory protection flags for a user page.
    ///
    /// Attributes of a mapping, combined with bitwise or. Every user page is
    /// readable; [`Permission::WRITE`] additionally allows stores.
    pub struct Permission: u32 {
        /// The page is readable.
        const READ = 1;
        /// The page is writable.
        const WRITE = 2;
    }
}

/// A process's address-translation structure.
///
/// One instance exists per process and translates that process's user
/// virtual addresses. All methods operate on page-aligned virtual
/// addresses; callers round before calling.
///
/// Implementations are expected to behave like the hardware they stand for:
/// a translation installed with [`map`] stays in place until [`unmap`], and
/// the dirty bit for a translation is set on the first store through it and
/// discarded together with the translation.
///
/// [`map`]: Self::map
/// [`unmap`]: Self::unmap
pub trait AddressSpace
where
    Self: Send + Sync,
{
    /// Installs a translation from `va` to the physical page `pa`.
    ///
    /// # Returns
    /// - `Ok(())` if the translation was installed.
    /// - `Err(KernelError::AlreadyMapped)` if `va` already has one.
    fn map(&mut self, va: Va, pa: Pa, writable: bool) -> Result<(), KernelError>;

    /// Removes the translation for `va`, if any.
    ///
    /// # Returns
    /// - The physical address the page was translated to, or `None` if no
    ///   translation existed. The dirty bit is discarded with it.
    fn unmap(&mut self, va: Va) -> Option<Pa>;

    /// Returns whether `va` currently has a translation installed.
    fn is_mapped(&self, va: Va) -> bool;

    /// Returns whether the page at `va` has been written through its
    /// current translation. `false` if no translation exists.
    fn is_dirty(&self, va: Va) -> bool;

    /// Marks the page at `va` as written.
    ///
    /// The hardware sets the dirty bit on user stores by itself; the kernel
    /// calls this when it modifies a user page through its own mapping,
    /// which the MMU cannot observe.
    fn set_dirty(&mut self, va: Va);
}
