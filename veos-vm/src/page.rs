//! Supplemental page table.
//!
//! The hardware page table only says where a resident page *is*; it cannot
//! say how to produce a page that is not there. The supplemental page table
//! is the per-process structure that fills that gap: one descriptor per
//! virtual page the process knows about, each carrying a [`PageState`] that
//! records how to (re)materialize the page's contents on a fault.
//!
//! A page enters the table in one of three ways: the loader registers the
//! pages of a loadable segment ([`MmStruct::register_file_backed`],
//! [`MmStruct::register_segment`]), a fault just below the stack grows the
//! stack region ([`MmStruct::register_stack_growth`]), or a mapping is
//! installed (see the `mmap` module). From then on the page cycles through
//! the states: a fault makes it resident
//! ([`MmStruct::resolve_fault`]), an eviction moves it to swap, the next
//! fault brings it back. The cycle ends at unmap or process teardown
//! ([`MmStruct::destroy`]), which releases whatever the page still holds —
//! a frame, or a swap slot.
//!
//! Each process owns its [`MmStruct`] exclusively, but eviction runs in
//! whatever thread is starved for frames and must flip another process's
//! descriptor from resident to swapped. The descriptor map is therefore
//! shared with the frame table through the process registry, and every
//! eviction-driven transition happens while the frame-pool lock is held.
//! The fault path never holds the descriptor lock while asking for a
//! frame, which keeps the two paths deadlock-free.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::ops::Range;
use veos::{
    KernelError,
    addressing::{PAGE_SIZE, Pa, Va},
    fs::RegularFile,
    mm::{AddressSpace, Permission},
    sync::SpinLock,
};

use crate::{MappingId, MappingRecord, Pid, VmManager, swap::SwapSlot};

/// How to produce the contents of a virtual page.
///
/// This is a closed sum: fault resolution and eviction match on it
/// exhaustively, so a new origin cannot be silently ignored.
#[derive(Debug)]
pub(crate) enum PageState {
    /// Not yet materialized; read from an executable's file segment.
    File {
        file: RegularFile,
        offset: usize,
        read_bytes: usize,
        zero_bytes: usize,
    },
    /// Not yet materialized; zero-filled stack page.
    Stack,
    /// Evicted; contents live in a swap slot.
    Swapped { slot: SwapSlot },
    /// Not yet materialized; read from a memory-mapped file.
    Mapped {
        file: RegularFile,
        offset: usize,
        read_bytes: usize,
        mapping: MappingId,
    },
    /// Backed by a frame right now.
    Resident { pa: Pa },
}

/// One page descriptor: the page's protection, its pin and dirty flags, and
/// its current [`PageState`].
pub(crate) struct PageSlot {
    pub(crate) perm: Permission,
    /// Pinned pages are exempt from eviction.
    pub(crate) pinned: bool,
    /// Latched from the hardware dirty bit when the page is evicted, so a
    /// modification survives a swap round-trip for write-back purposes.
    pub(crate) dirty: bool,
    pub(crate) state: PageState,
}

impl PageSlot {
    pub(crate) fn new(perm: Permission, state: PageState) -> Self {
        Self {
            perm,
            pinned: false,
            dirty: false,
            state,
        }
    }
}

pub(crate) type PageMap = BTreeMap<Va, PageSlot>;

// Inserts a descriptor, refusing to replace one.
fn insert_descriptor(map: &mut PageMap, va: Va, slot: PageSlot) -> Result<(), KernelError> {
    match map.entry(va) {
        alloc::collections::btree_map::Entry::Vacant(e) => {
            e.insert(slot);
            Ok(())
        }
        alloc::collections::btree_map::Entry::Occupied(_) => Err(KernelError::AlreadyMapped),
    }
}

/// The memory state of one process: its supplemental page table, its
/// mapping records, and the bounds of its stack region.
///
/// Created once when the process is set up and destroyed exactly once at
/// teardown. All paging entry points — the loader's registrations, the trap
/// handler's [`resolve_fault`], the syscall layer's pinning and user-copy
/// operations, mmap/munmap — go through this struct, with the shared
/// [`VmManager`] passed in by reference.
///
/// [`resolve_fault`]: Self::resolve_fault
pub struct MmStruct {
    pub(crate) pid: Pid,
    pub(crate) pages: Arc<SpinLock<PageMap>>,
    pub(crate) aspace: Arc<SpinLock<dyn AddressSpace>>,
    pub(crate) mappings: BTreeMap<MappingId, MappingRecord>,
    pub(crate) next_mapping: usize,
    /// One past the highest stack address; the stack grows down from here.
    stack_top: Va,
    /// The lowest address the stack may ever grow to.
    stack_limit: Va,
}

impl MmStruct {
    /// Creates the memory state for process `pid` and registers it with
    /// `vm` so that eviction can find it.
    ///
    /// `aspace` is the process's hardware address-translation structure.
    /// The stack occupies at most `stack_pages` pages ending at
    /// `stack_top`, which must be page-aligned.
    ///
    /// # Panics
    /// Panics if `pid` is already registered; process identifiers are
    /// unique for the lifetime of a process, and reusing a live one is a
    /// kernel bug.
    pub fn new(
        vm: &VmManager,
        pid: Pid,
        aspace: Arc<SpinLock<dyn AddressSpace>>,
        stack_top: Va,
        stack_pages: usize,
    ) -> Self {
        assert_eq!(stack_top.offset(), 0, "stack top must be page-aligned");
        assert!(stack_pages > 0);
        let pages = Arc::new(SpinLock::new(PageMap::new()));
        vm.register(pid, pages.clone(), aspace.clone());
        Self {
            pid,
            pages,
            aspace,
            mappings: BTreeMap::new(),
            next_mapping: 0,
            stack_top,
            stack_limit: stack_top - stack_pages * PAGE_SIZE,
        }
    }

    /// The process this memory state belongs to.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Registers one page of a loadable segment.
    ///
    /// On a fault, `read_bytes` bytes are read from `file` at `offset` into
    /// the start of the page and the remaining `zero_bytes` bytes are
    /// zero-filled.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)`: `va` is not page-aligned, or
    ///   the byte counts do not cover exactly one page.
    /// - `Err(KernelError::AlreadyMapped)`: a descriptor for `va` already
    ///   exists. The caller decides whether that is fatal to the load; the
    ///   kernel itself is unaffected.
    pub fn register_file_backed(
        &self,
        file: RegularFile,
        offset: usize,
        va: Va,
        read_bytes: usize,
        zero_bytes: usize,
        perm: Permission,
    ) -> Result<(), KernelError> {
        if va.offset() != 0 || read_bytes + zero_bytes != PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        let mut pages = self.pages.lock();
        let r = insert_descriptor(
            &mut pages,
            va,
            PageSlot::new(
                perm,
                PageState::File {
                    file,
                    offset,
                    read_bytes,
                    zero_bytes,
                },
            ),
        );
        pages.unlock();
        r
    }

    /// Registers a whole loadable segment, one descriptor per page.
    ///
    /// In total, `read_bytes + zero_bytes` bytes of virtual memory starting
    /// at `va` are described: `read_bytes` bytes read from `file` starting
    /// at `offset`, the rest zeroed. The split is computed per page the way
    /// the loader expects: each page reads as much as remains, up to a page.
    ///
    /// Registration is atomic: if any page of the segment already has a
    /// descriptor, nothing is registered.
    ///
    /// # Returns
    /// - `Err(KernelError::InvalidArgument)`: misaligned `va` or `offset`,
    ///   or the byte counts do not cover whole pages.
    /// - `Err(KernelError::AlreadyMapped)`: some page already exists.
    pub fn register_segment(
        &self,
        file: RegularFile,
        offset: usize,
        va: Va,
        read_bytes: usize,
        zero_bytes: usize,
        perm: Permission,
    ) -> Result<(), KernelError> {
        if va.offset() != 0
            || offset % PAGE_SIZE != 0
            || (read_bytes + zero_bytes) % PAGE_SIZE != 0
        {
            return Err(KernelError::InvalidArgument);
        }

        let mut descriptors = Vec::new();
        let (mut va, mut offset) = (va, offset);
        let (mut read_bytes, mut zero_bytes) = (read_bytes, zero_bytes);
        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = read_bytes.min(PAGE_SIZE);
            let page_zero_bytes = PAGE_SIZE - page_read_bytes;
            descriptors.push((
                va,
                PageSlot::new(
                    perm,
                    PageState::File {
                        file: file.clone(),
                        offset,
                        read_bytes: page_read_bytes,
                        zero_bytes: page_zero_bytes,
                    },
                ),
            ));
            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            va += PAGE_SIZE;
            offset += page_read_bytes;
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
        Ok(())
    }

    /// Grows the stack region down to cover `addr`.
    ///
    /// Creates zero-fill descriptors for every previously unmapped page
    /// from `addr.page_down()` up to (but not overlapping) the existing
    /// stack pages. A no-op when the page already exists; the external
    /// stack-growth heuristic may fire more than once for one page.
    ///
    /// # Returns
    /// - `Err(KernelError::BadAddress)`: `addr` is outside the stack
    ///   region configured at creation.
    pub fn register_stack_growth(&self, addr: Va) -> Result<(), KernelError> {
        let page = addr.page_down();
        if page < self.stack_limit || page >= self.stack_top {
            return Err(KernelError::BadAddress);
        }
        let mut pages = self.pages.lock();
        let mut va = page;
        while va < self.stack_top && !pages.contains_key(&va) {
            pages.insert(
                va,
                PageSlot::new(Permission::READ | Permission::WRITE, PageState::Stack),
            );
            va += PAGE_SIZE;
        }
        pages.unlock();
        Ok(())
    }

    /// Creates and materializes the initial stack page, directly below the
    /// stack top.
    ///
    /// # Returns
    /// - `Ok(sp)`: The initial stack pointer (the stack top).
    /// - `Err(KernelError::NoMemory)`: No frame was available.
    /// - `Err(KernelError::AlreadyMapped)`: Called twice.
    pub fn setup_stack(&self, vm: &VmManager) -> Result<Va, KernelError> {
        let va = self.stack_top - PAGE_SIZE;
        let mut pages = self.pages.lock();
        let r = insert_descriptor(
            &mut pages,
            va,
            PageSlot::new(Permission::READ | Permission::WRITE, PageState::Stack),
        );
        pages.unlock();
        r?;
        if !self.resolve_fault(vm, va) {
            return Err(KernelError::NoMemory);
        }
        Ok(self.stack_top)
    }

    /// Resolves a page fault at `addr`.
    ///
    /// This is the central state machine of the paging core, called by the
    /// trap handler with the faulting address. The descriptor for the
    /// containing page decides what happens:
    ///
    /// - no descriptor: the fault is unresolvable. Nothing is allocated and
    ///   `false` is returned; the handler terminates the process with an
    ///   access violation.
    /// - [`PageState::File`] / [`PageState::Mapped`]: a frame is obtained,
    ///   the backing bytes are read from the file, the tail is zero-filled.
    /// - [`PageState::Stack`]: a zeroed frame is obtained.
    /// - [`PageState::Swapped`]: a frame is obtained, the slot is read back
    ///   and released.
    /// - [`PageState::Resident`]: the fault raced another resolution or an
    ///   eviction re-check; the translation is re-installed if missing and
    ///   the call succeeds without touching the contents.
    ///
    /// A short read from the file or the swap device is fatal to the
    /// resolving process: the page is **not** marked resident, the frame is
    /// released, and `false` is returned — the process must not run on
    /// silently zero-filled memory.
    pub fn resolve_fault(&self, vm: &VmManager, addr: Va) -> bool {
        let va = addr.page_down();

        enum Fill {
            Resident { pa: Pa },
            Zero,
            File {
                file: RegularFile,
                offset: usize,
                read_bytes: usize,
            },
            Swap {
                slot: SwapSlot,
            },
        }

        // Snapshot the descriptor; the lock is never held across frame
        // allocation or I/O.
        let pages = self.pages.lock();
        let snapshot = pages.get(&va).map(|slot| {
            let fill = match &slot.state {
                PageState::Resident { pa } => Fill::Resident { pa: *pa },
                PageState::Stack => Fill::Zero,
                PageState::File {
                    file,
                    offset,
                    read_bytes,
                    zero_bytes,
                } => {
                    debug_assert_eq!(read_bytes + zero_bytes, PAGE_SIZE);
                    Fill::File {
                        file: file.clone(),
                        offset: *offset,
                        read_bytes: *read_bytes,
                    }
                }
                PageState::Mapped {
                    file,
                    offset,
                    read_bytes,
                    ..
                } => Fill::File {
                    file: file.clone(),
                    offset: *offset,
                    read_bytes: *read_bytes,
                },
                PageState::Swapped { slot } => Fill::Swap { slot: *slot },
            };
            (slot.perm, fill)
        });
        pages.unlock();

        let Some((perm, fill)) = snapshot else {
            return false;
        };
        if let Fill::Resident { pa } = fill {
            // The page is already there; at most the translation needs to
            // be reinstalled.
            let mut aspace = self.aspace.lock();
            if !aspace.is_mapped(va) {
                let _ = aspace.map(va, pa, perm.contains(Permission::WRITE));
            }
            aspace.unlock();
            return true;
        }

        // Obtain a frame. This may block on eviction I/O and must not be
        // done while holding the descriptor lock.
        let pa = match vm.frames().allocate(vm, self.pid, va, perm, true) {
            Ok(pa) => pa,
            // Another thread resolved this page first; its translation is
            // already installed.
            Err(KernelError::AlreadyMapped) => return true,
            Err(e) => {
                log::debug!("fault at {:?} of {:?} failed: {:?}", addr, self.pid, e);
                return false;
            }
        };

        // Fill the frame from the page's origin.
        let filled = match fill {
            Fill::Resident { .. } => unreachable!(),
            Fill::Zero => Ok(()),
            Fill::File {
                file,
                offset,
                read_bytes,
            } => self.fill_from_file(vm, pa, &file, offset, read_bytes),
            Fill::Swap { slot } => {
                let mut contents = alloc::boxed::Box::new([0u8; PAGE_SIZE]);
                vm.swap().read_in(slot, &mut contents).map(|()| {
                    let _ = vm.frames().write_frame(pa, 0, &contents[..]);
                })
            }
        };
        if let Err(e) = filled {
            log::warn!("paging I/O failed for {:?} at {:?}: {:?}", self.pid, va, e);
            vm.frames().free(vm, pa);
            return false;
        }

        // Commit: the page becomes resident and the frame is unpinned
        // (unless the descriptor itself is pinned).
        let mut pages = self.pages.lock();
        match pages.get_mut(&va) {
            Some(slot) => {
                slot.state = PageState::Resident { pa };
                let keep_pinned = slot.pinned;
                pages.unlock();
                if !keep_pinned {
                    vm.frames().set_pinned(pa, false);
                }
                true
            }
            None => {
                // Torn down while we were filling; give the frame back.
                pages.unlock();
                vm.frames().free(vm, pa);
                false
            }
        }
    }

    fn fill_from_file(
        &self,
        vm: &VmManager,
        pa: Pa,
        file: &RegularFile,
        offset: usize,
        read_bytes: usize,
    ) -> Result<(), KernelError> {
        if read_bytes == 0 {
            return Ok(());
        }
        let mut buf = alloc::vec![0u8; read_bytes];
        let n = file.read_at(offset, &mut buf)?;
        if n != read_bytes {
            // A short read here would hand the process a page that is
            // silently missing its tail.
            return Err(KernelError::IOError);
        }
        let _ = vm.frames().write_frame(pa, 0, &buf);
        Ok(())
    }

    /// Marks every descriptor covering `range` as pinned or unpinned, and
    /// mirrors the flag into the frame entries of the resident ones.
    ///
    /// Pinning is advisory: it only removes pages from eviction
    /// eligibility, it never blocks. The syscall boundary brackets every
    /// copy into or out of a user buffer with a pin/unpin pair so the
    /// buffer cannot be evicted mid-copy; every pin must be matched by an
    /// unpin.
    pub fn set_pinned(&self, vm: &VmManager, range: Range<Va>, pinned: bool) {
        let start = range.start.page_down();
        let mut resident = Vec::new();
        let mut pages = self.pages.lock();
        for (_, slot) in pages.range_mut(start..range.end) {
            slot.pinned = pinned;
            if let PageState::Resident { pa } = slot.state {
                resident.push(pa);
            }
        }
        pages.unlock();
        for pa in resident {
            vm.frames().set_pinned(pa, pinned);
        }
    }

    /// Checks whether the process may access every byte of `range`.
    ///
    /// This function ensures that system calls using memory addresses
    /// operate only on valid and accessible memory regions: every page in
    /// the range must have a descriptor, and a write access additionally
    /// requires the page to be writable. It does not trigger demand paging.
    pub fn access_ok(&self, range: Range<Va>, is_write: bool) -> bool {
        if range.end <= range.start {
            return false;
        }
        let pages = self.pages.lock();
        let mut va = range.start.page_down();
        let mut ok = true;
        while va < range.end {
            match pages.get(&va) {
                Some(slot) if !is_write || slot.perm.contains(Permission::WRITE) => {}
                _ => {
                    ok = false;
                    break;
                }
            }
            va += PAGE_SIZE;
        }
        pages.unlock();
        ok
    }

    /// Whether the page containing `addr` is currently resident.
    pub fn is_resident(&self, addr: Va) -> bool {
        let pages = self.pages.lock();
        let r = matches!(
            pages.get(&addr.page_down()),
            Some(PageSlot {
                state: PageState::Resident { .. },
                ..
            })
        );
        pages.unlock();
        r
    }

    /// Tears down the process's memory state.
    ///
    /// Every descriptor releases what it holds — resident pages free their
    /// frame (and hardware translation), swapped pages free their slot —
    /// and the process is removed from the registry. Mapping records are
    /// dropped without write-back; a process that wants its mappings
    /// durable unmaps them before exiting, which the process-exit path
    /// does.
    ///
    /// Called exactly once at process teardown.
    pub fn destroy(&mut self, vm: &VmManager) {
        let mut pages = self.pages.lock();
        let drained: Vec<(Va, PageSlot)> = core::mem::take(&mut *pages).into_iter().collect();
        pages.unlock();

        let mut freed_frames = 0usize;
        let mut freed_slots = 0usize;
        for (_, slot) in drained {
            match slot.state {
                PageState::Resident { pa } => {
                    vm.frames().free(vm, pa);
                    freed_frames += 1;
                }
                PageState::Swapped { slot } => {
                    vm.swap().free(slot);
                    freed_slots += 1;
                }
                PageState::File { .. } | PageState::Stack | PageState::Mapped { .. } => {}
            }
        }
        self.mappings.clear();
        vm.deregister(self.pid);
        log::debug!(
            "teardown of {:?}: {} frames, {} swap slots reclaimed",
            self.pid,
            freed_frames,
            freed_slots
        );
    }
}
