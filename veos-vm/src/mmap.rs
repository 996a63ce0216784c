//! Memory-mapped files.
//!
//! A mapping installs one [`PageState::Mapped`] descriptor per page of a
//! file-backed region, reusing the supplemental page table's registration
//! path; the pages materialize lazily on fault like any other. What the
//! mapping adds is a [`MappingRecord`] — the identity of the region — and
//! the write-back obligation it carries: at unmap, every page that was
//! modified goes back to the file at its corresponding offset.
//!
//! Eviction does not treat mapped pages specially: a resident mapped page
//! is swapped out like any other resident page, with its hardware dirty
//! bit latched into the descriptor so the modification is still known at
//! unmap time. Write-back to the file happens only at unmap.

use alloc::vec::Vec;
use veos::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    fs::RegularFile,
    mm::Permission,
};

use crate::{
    VmManager,
    page::{MmStruct, PageSlot, PageState},
};

/// Identifier of one active memory-mapped region, unique within its
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MappingId(pub(crate) usize);

/// Metadata of one active memory-mapped region.
pub struct MappingRecord {
    pub(crate) file: RegularFile,
    pub(crate) base: Va,
    pub(crate) length: usize,
}

impl MappingRecord {
    /// First virtual address of the region.
    pub fn base(&self) -> Va {
        self.base
    }

    /// Length of the region in bytes.
    pub fn length(&self) -> usize {
        self.length
    }

    // Bytes of the file visible in the page starting `page_offset` bytes
    // into the region. The tail of the region past the file's end, and the
    // tail of the final partial page, read (and write back) as nothing.
    fn backed_bytes(&self, page_offset: usize) -> usize {
        let in_region = self.length - page_offset;
        let in_file = self.file.size().saturating_sub(page_offset);
        PAGE_SIZE.min(in_region).min(in_file)
    }
}

impl MmStruct {
    /// Maps `length` bytes of `file`, starting at its beginning, at `base`.
    ///
    /// One descriptor per page is installed; nothing is materialized until
    /// the first fault. The final partial page, and any page past the end
    /// of the file, is zero-filled on fault.
    ///
    /// Installation is atomic: if any page of the region already has a
    /// descriptor, no descriptor is installed and the call fails.
    ///
    /// # Returns
    /// - `Ok(id)`: The mapping's identifier, for [`MmStruct::unmap`].
    /// - `Err(KernelError::InvalidArgument)`: zero `length` or misaligned
    ///   `base`.
    /// - `Err(KernelError::AlreadyMapped)`: the region overlaps existing
    ///   pages.
    pub fn map(
        &mut self,
        file: RegularFile,
        base: Va,
        length: usize,
        perm: Permission,
    ) -> Result<MappingId, KernelError> {
        if length == 0 || base.offset() != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let id = MappingId(self.next_mapping);
        let record = MappingRecord {
            file: file.clone(),
            base,
            length,
        };

        let page_count = length.div_ceil(PAGE_SIZE);
        let mut descriptors = Vec::with_capacity(page_count);
        for i in 0..page_count {
            let page_offset = i * PAGE_SIZE;
            descriptors.push((
                base + page_offset,
                PageSlot::new(
                    perm,
                    PageState::Mapped {
                        file: file.clone(),
                        offset: page_offset,
                        read_bytes: record.backed_bytes(page_offset),
                        mapping: id,
                    },
                ),
            ));
        }

        let mut pages = self.pages.lock();
        if descriptors.iter().any(|(va, _)| pages.contains_key(va)) {
            pages.unlock();
            return Err(KernelError::AlreadyMapped);
        }
        for (va, slot) in descriptors {
            pages.insert(va, slot);
        }
        pages.unlock();

        self.mappings.insert(id, record);
        self.next_mapping += 1;
        log::debug!(
            "{:?}: mapped {} bytes at {:?} as {:?}",
            self.pid,
            length,
            base,
            id
        );
        Ok(id)
    }

    /// Unmaps the region identified by `id`.
    ///
    /// Every page of the mapping is discarded as at teardown, except that a
    /// resident page modified since it was loaded — per the hardware dirty
    /// bit, or the latched one if the page went through swap — is first
    /// written back to the file at its corresponding offset. Swapped pages
    /// release their slot; never-materialized pages simply disappear.
    /// Finally the record itself is dropped, closing the file handle.
    ///
    /// # Returns
    /// - `Err(KernelError::IOError)`: some write-back failed or was short.
    ///   The unmap itself still completes.
    ///
    /// # Panics
    /// Panics if `id` does not name an active mapping of this process;
    /// passing a stale or foreign identifier is a caller bug, not a
    /// recoverable condition.
    pub fn unmap(&mut self, vm: &VmManager, id: MappingId) -> Result<(), KernelError> {
        let Some(record) = self.mappings.remove(&id) else {
            panic!("munmap of unknown mapping {}", id.0);
        };

        let mut result = Ok(());
        let page_count = record.length.div_ceil(PAGE_SIZE);
        for i in 0..page_count {
            let page_offset = i * PAGE_SIZE;
            let va = record.base + page_offset;

            let mut pages = self.pages.lock();
            let Some(slot) = pages.remove(&va) else {
                pages.unlock();
                continue;
            };
            pages.unlock();

            match slot.state {
                PageState::Resident { pa } => {
                    let Some((contents, hw_dirty)) = vm.frames().reclaim(vm, pa, self.pid, va)
                    else {
                        continue;
                    };
                    if hw_dirty || slot.dirty {
                        if let Err(e) =
                            write_back(&record, page_offset, &contents)
                        {
                            log::warn!("{:?}: write-back of {:?} failed: {:?}", self.pid, va, e);
                            result = Err(e);
                        }
                    }
                }
                PageState::Swapped { slot } => vm.swap().free(slot),
                PageState::Mapped { mapping, .. } => debug_assert_eq!(mapping, id),
                // Mappings never overlap other kinds of pages.
                PageState::File { .. } | PageState::Stack => {
                    unreachable!("non-mapping page inside a mapped region")
                }
            }
        }
        log::debug!("{:?}: unmapped {:?}", self.pid, id);
        result
    }
}

// Writes the file-backed span of one page back to the file.
fn write_back(
    record: &MappingRecord,
    page_offset: usize,
    contents: &[u8; PAGE_SIZE],
) -> Result<(), KernelError> {
    let n = record.backed_bytes(page_offset);
    if n == 0 {
        return Ok(());
    }
    match record.file.write_at(page_offset, &contents[..n]) {
        Ok(written) if written == n => Ok(()),
        Ok(_) => Err(KernelError::IOError),
        Err(e) => Err(e),
    }
}
