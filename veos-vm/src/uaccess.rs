//! Kernel access to user buffers.
//!
//! System calls that read or write a user-supplied buffer cannot simply
//! dereference the user pointer: the pages behind it may not be resident,
//! and a page that is resident when the copy starts may be evicted by
//! another thread halfway through. The two operations here are the
//! capability-checked interface the syscall boundary uses instead:
//! the buffer's pages are validated, **pinned** for the duration of the
//! copy, materialized on demand, and unpinned again. Pinning removes the
//! pages from eviction eligibility; it never blocks anyone.

use veos::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
};

use crate::{
    VmManager,
    page::{MmStruct, PageState},
};

impl MmStruct {
    /// Copies `buf` into this process's memory at `addr`.
    ///
    /// The destination pages are marked dirty, as a store through the user
    /// mapping would have done.
    ///
    /// # Returns
    /// - `Err(KernelError::BadAddress)`: the range is not fully writable by
    ///   the process, or a page could not be materialized.
    pub fn copy_to_user(&self, vm: &VmManager, addr: Va, buf: &[u8]) -> Result<(), KernelError> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = Va::new(addr.into_usize() + buf.len()).ok_or(KernelError::BadAddress)?;
        if !self.access_ok(addr..end, true) {
            return Err(KernelError::BadAddress);
        }
        self.set_pinned(vm, addr..end, true);
        let result = self.copy_pinned(vm, addr, CopyOp::In(buf));
        self.set_pinned(vm, addr..end, false);
        result
    }

    /// Copies from this process's memory at `addr` into `buf`.
    ///
    /// # Returns
    /// - `Err(KernelError::BadAddress)`: the range is not fully readable by
    ///   the process, or a page could not be materialized.
    pub fn copy_from_user(
        &self,
        vm: &VmManager,
        addr: Va,
        buf: &mut [u8],
    ) -> Result<(), KernelError> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = Va::new(addr.into_usize() + buf.len()).ok_or(KernelError::BadAddress)?;
        if !self.access_ok(addr..end, false) {
            return Err(KernelError::BadAddress);
        }
        self.set_pinned(vm, addr..end, true);
        let result = self.copy_pinned(vm, addr, CopyOp::Out(buf));
        self.set_pinned(vm, addr..end, false);
        result
    }

    // The copy proper, page by page. Every page of the range is pinned, so
    // a page that is resident stays resident; one that is not yet resident
    // is faulted in first.
    fn copy_pinned(&self, vm: &VmManager, addr: Va, mut op: CopyOp<'_, '_>) -> Result<(), KernelError> {
        let mut va = addr;
        let mut done = 0usize;
        let total = op.len();
        while done < total {
            let page = va.page_down();
            let offset = va.offset();
            let chunk = (PAGE_SIZE - offset).min(total - done);

            if !self.is_resident(page) && !self.resolve_fault(vm, page) {
                return Err(KernelError::BadAddress);
            }
            let pages = self.pages.lock();
            let pa = match pages.get(&page) {
                Some(slot) => match slot.state {
                    PageState::Resident { pa } => pa,
                    _ => {
                        pages.unlock();
                        return Err(KernelError::BadAddress);
                    }
                },
                None => {
                    pages.unlock();
                    return Err(KernelError::BadAddress);
                }
            };
            pages.unlock();

            let copied = match &mut op {
                CopyOp::In(src) => vm
                    .frames()
                    .write_frame(pa, offset, &src[done..done + chunk]),
                CopyOp::Out(dst) => vm
                    .frames()
                    .read_frame(pa, offset, &mut dst[done..done + chunk]),
            };
            if copied.is_none() {
                return Err(KernelError::BadAddress);
            }
            if matches!(op, CopyOp::In(_)) {
                let mut aspace = self.aspace.lock();
                aspace.set_dirty(page);
                aspace.unlock();
            }

            done += chunk;
            va = page + PAGE_SIZE;
        }
        Ok(())
    }
}

enum CopyOp<'a, 'b> {
    In(&'a [u8]),
    Out(&'b mut [u8]),
}

impl CopyOp<'_, '_> {
    fn len(&self) -> usize {
        match self {
            CopyOp::In(b) => b.len(),
            CopyOp::Out(b) => b.len(),
        }
    }
}
