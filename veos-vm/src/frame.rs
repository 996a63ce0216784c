//! Physical-frame table and eviction.
//!
//! Every frame of user-visible physical memory is owned by the
//! [`FrameTable`]: a fixed pool of page-sized frames handed out one at a
//! time, plus a table recording, for each frame in use, which virtual page
//! of which process it currently backs. The table is the process-wide
//! shared half of the paging state; the per-process half lives in each
//! process's [`MmStruct`].
//!
//! ## Eviction
//!
//! When [`FrameTable::allocate`] finds the pool empty it reclaims a frame
//! from whoever has held one longest: candidates are scanned in strict
//! insertion order (a FIFO queue) and the first unpinned entry is the
//! victim. A frame is never moved to the back of the queue on reaccess.
//! This is deliberately not LRU or clock; the queue position only changes
//! when a frame is handed out or released.
//!
//! The victim's contents go to the swap store and the victim's page
//! descriptor flips from resident to swapped. That transition is committed
//! while the frame-pool lock is held, so the owning process's fault path
//! can never observe a half-evicted page; the sector I/O itself happens
//! after the pool lock is released, under the swap lock alone. Lock order
//! is always frame-pool lock before swap lock, never the reverse.
//!
//! [`MmStruct`]: crate::page::MmStruct

use alloc::{boxed::Box, collections::VecDeque, vec::Vec};
use core::ptr::NonNull;
use crossbeam_utils::CachePadded;
use veos::{
    KernelError,
    addressing::{PAGE_SHIFT, PAGE_SIZE, Pa, Va},
    mm::Permission,
    sync::SpinLock,
};

use crate::{Pid, VmManager, page::PageState};

/// Bookkeeping for one physical frame currently assigned to a process.
pub struct FrameTableEntry {
    /// The user virtual page this frame backs.
    pub va: Va,
    /// The process the page belongs to.
    pub pid: Pid,
    /// Protection of the mapping.
    pub perm: Permission,
    /// Pinned frames are skipped by victim selection.
    pub pinned: bool,
}

/// The backing storage of the frame pool: one contiguous, page-aligned
/// allocation of `frames * PAGE_SIZE` bytes, indexed by frame number.
struct FramePool {
    base: NonNull<u8>,
    frames: usize,
}

// SAFETY: the pool is raw memory; all access goes through the unsafe
// accessors below whose callers guarantee exclusivity.
unsafe impl Send for FramePool {}
unsafe impl Sync for FramePool {}

impl FramePool {
    fn new(frames: usize) -> Self {
        assert!(frames > 0, "frame pool must hold at least one frame");
        let layout = core::alloc::Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let base = NonNull::new(base).expect("failed to allocate the frame pool");
        Self { base, frames }
    }

    /// Physical address of frame `index`.
    fn pa(&self, index: usize) -> Pa {
        debug_assert!(index < self.frames);
        Pa::new(index << PAGE_SHIFT).unwrap()
    }

    /// Get a reference to the contents of frame `index`.
    ///
    /// # Safety
    /// The caller must hold the frame-table lock or otherwise own the
    /// frame, so that no concurrent writer exists.
    unsafe fn bytes(&self, index: usize) -> &[u8; PAGE_SIZE] {
        unsafe { &*(self.base.as_ptr().add(index * PAGE_SIZE) as *const [u8; PAGE_SIZE]) }
    }

    /// Get a mutable reference to the contents of frame `index`.
    ///
    /// # Safety
    /// The caller must exclusively own the frame: either it was just handed
    /// out and its page is not yet resident, or the frame-table lock is
    /// held.
    #[allow(clippy::mut_from_ref)]
    unsafe fn bytes_mut(&self, index: usize) -> &mut [u8; PAGE_SIZE] {
        unsafe { &mut *(self.base.as_ptr().add(index * PAGE_SIZE) as *mut [u8; PAGE_SIZE]) }
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        let layout =
            core::alloc::Layout::from_size_align(self.frames * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe { alloc::alloc::dealloc(self.base.as_ptr(), layout) };
    }
}

struct FrameTableInner {
    /// Entry per frame number; `None` for frames in the free list.
    entries: Box<[Option<FrameTableEntry>]>,
    /// Free frame numbers.
    free: Vec<usize>,
    /// Allocated frame numbers, least recently inserted first.
    queue: VecDeque<usize>,
}

/// The process-wide frame pool and frame table. See the module
/// documentation for the eviction protocol.
pub(crate) struct FrameTable {
    pool: FramePool,
    inner: CachePadded<SpinLock<FrameTableInner>>,
}

impl FrameTable {
    pub(crate) fn new(frames: usize) -> Self {
        Self {
            pool: FramePool::new(frames),
            inner: CachePadded::new(SpinLock::new(FrameTableInner {
                entries: (0..frames).map(|_| None).collect(),
                // Reversed so frames are handed out in ascending order.
                free: (0..frames).rev().collect(),
                queue: VecDeque::with_capacity(frames),
            })),
        }
    }

    /// Total number of frames in the pool.
    pub(crate) fn frame_count(&self) -> usize {
        self.pool.frames
    }

    /// Number of frames currently assigned.
    pub(crate) fn in_use(&self) -> usize {
        let inner = self.inner.lock();
        let n = self.pool.frames - inner.free.len();
        inner.unlock();
        n
    }

    fn index_of(&self, pa: Pa) -> Option<usize> {
        if pa.offset() != 0 {
            return None;
        }
        let index = pa.into_usize() >> PAGE_SHIFT;
        (index < self.pool.frames).then_some(index)
    }

    /// Obtains a frame for page `va` of process `pid`, installs the
    /// hardware translation, and registers the frame-table entry.
    ///
    /// The new entry starts **pinned** so that the caller can fill the
    /// frame's contents without racing victim selection; the caller unpins
    /// it when the page is committed resident.
    ///
    /// If the pool is exhausted, one victim is evicted and the allocation
    /// is retried exactly once.
    ///
    /// # Returns
    /// - `Ok(pa)`: The frame now backing `va`.
    /// - `Err(KernelError::NoMemory)`: No frame could be freed (every
    ///   candidate pinned, or the retry found the pool empty again).
    /// - `Err(KernelError::NoSpace)`: Eviction found the swap store full.
    /// - `Err(KernelError::AlreadyMapped)`: `va` already has a hardware
    ///   translation in the owning process.
    pub(crate) fn allocate(
        &self,
        vm: &VmManager,
        pid: Pid,
        va: Va,
        perm: Permission,
        zero: bool,
    ) -> Result<Pa, KernelError> {
        for attempt in 0..2 {
            let mut inner = self.inner.lock();
            if let Some(index) = inner.free.pop() {
                debug_assert!(inner.entries[index].is_none());
                inner.entries[index] = Some(FrameTableEntry {
                    va,
                    pid,
                    perm,
                    pinned: true,
                });
                inner.queue.push_back(index);
                inner.unlock();

                let pa = self.pool.pa(index);
                if zero {
                    // SAFETY: the entry is pinned and its page is not yet
                    // resident; this thread is the only user of the frame.
                    unsafe { self.pool.bytes_mut(index) }.fill(0);
                }

                let owner = vm
                    .process(pid)
                    .unwrap_or_else(|| panic!("frame allocation for unregistered process {:?}", pid));
                let mut aspace = owner.aspace.lock();
                let mapped = aspace.map(va, pa, perm.contains(Permission::WRITE));
                aspace.unlock();
                if let Err(e) = mapped {
                    self.discard(index);
                    return Err(e);
                }
                return Ok(pa);
            }
            inner.unlock();

            if attempt == 0 {
                self.evict_one(vm)?;
            }
        }
        Err(KernelError::NoMemory)
    }

    // Removes a just-created entry again without touching the owner's
    // translation. Used to back out of a failed allocation.
    fn discard(&self, index: usize) {
        let mut inner = self.inner.lock();
        inner.entries[index] = None;
        if let Some(pos) = inner.queue.iter().position(|&i| i == index) {
            inner.queue.remove(pos);
        }
        inner.free.push(index);
        inner.unlock();
    }

    /// Evicts the least recently inserted unpinned frame to swap.
    fn evict_one(&self, vm: &VmManager) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        let Some(pos) = inner
            .queue
            .iter()
            .position(|&i| inner.entries[i].as_ref().is_some_and(|e| !e.pinned))
        else {
            inner.unlock();
            return Err(KernelError::NoMemory);
        };
        let index = inner.queue.remove(pos).unwrap();
        let entry = inner.entries[index].take().unwrap();
        let pa = self.pool.pa(index);

        let Some(owner) = vm.process(entry.pid) else {
            // The owner exited mid-eviction; the frame is simply reclaimed.
            inner.free.push(index);
            inner.unlock();
            return Ok(());
        };

        // Tear down the translation first so the owner faults instead of
        // writing to a frame that is being copied out, and latch the
        // hardware dirty bit before it is lost with the translation.
        let mut aspace = owner.aspace.lock();
        let dirty = aspace.is_dirty(entry.va);
        aspace.unmap(entry.va);
        aspace.unlock();

        let mut contents = Box::new([0u8; PAGE_SIZE]);
        // SAFETY: the entry was removed under the table lock; nobody else
        // owns this frame anymore.
        contents.copy_from_slice(unsafe { self.pool.bytes(index) });

        // Frame-pool lock before swap lock, always.
        let mut swap = vm.swap_session();
        let slot = match swap.reserve() {
            Ok(slot) => slot,
            Err(e) => {
                swap.finish();
                // Out of swap: the victim keeps its frame and the caller
                // learns that the machine is truly out of memory. The
                // remapped translation starts clean, so carry the dirty
                // bit over to the descriptor.
                let mut aspace = owner.aspace.lock();
                let _ = aspace.map(entry.va, pa, entry.perm.contains(Permission::WRITE));
                aspace.unlock();
                if dirty {
                    let mut pages = owner.pages.lock();
                    if let Some(desc) = pages.get_mut(&entry.va) {
                        desc.dirty = true;
                    }
                    pages.unlock();
                }
                inner.entries[index] = Some(entry);
                // Back to its old queue position: eviction order is part of
                // the policy.
                inner.queue.insert(pos, index);
                inner.unlock();
                return Err(e);
            }
        };

        // Commit the descriptor transition while the frame-pool lock is
        // still held, so the owner's fault path sees either a resident page
        // or a swapped page, never an in-between.
        let mut pages = owner.pages.lock();
        let committed = match pages.get_mut(&entry.va) {
            Some(slot_desc) => match slot_desc.state {
                PageState::Resident { pa: cur } if cur == pa => {
                    slot_desc.state = PageState::Swapped { slot };
                    slot_desc.dirty |= dirty;
                    true
                }
                // The descriptor moved on (unmap or teardown raced ahead);
                // it no longer owns this frame.
                _ => false,
            },
            None => false,
        };
        pages.unlock();
        if !committed {
            swap.release(slot);
        }
        inner.free.push(index);
        inner.unlock();

        // The sector writes happen outside the frame-pool lock but inside
        // the slot lock, so a fault-in of this slot blocks until the data
        // is on disk.
        let result = if committed {
            log::debug!(
                "evicted page {:?} of {:?} from frame {:?} to swap slot {}",
                entry.va,
                entry.pid,
                pa,
                slot.0
            );
            swap.write(slot, &contents)
        } else {
            Ok(())
        };
        swap.finish();
        result
    }

    /// Releases the frame at `pa`: removes its entry, clears the owner's
    /// translation, and returns the frame to the pool.
    ///
    /// A `pa` that no longer names an assigned frame is a no-op.
    pub(crate) fn free(&self, vm: &VmManager, pa: Pa) {
        let Some(index) = self.index_of(pa) else {
            return;
        };
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries[index].take() else {
            inner.unlock();
            return;
        };
        if let Some(pos) = inner.queue.iter().position(|&i| i == index) {
            inner.queue.remove(pos);
        }
        if let Some(owner) = vm.process(entry.pid) {
            let mut aspace = owner.aspace.lock();
            aspace.unmap(entry.va);
            aspace.unlock();
        }
        inner.free.push(index);
        inner.unlock();
    }

    /// Updates the pin flag of the entry backing `pa`, if any.
    pub(crate) fn set_pinned(&self, pa: Pa, pinned: bool) {
        let Some(index) = self.index_of(pa) else {
            return;
        };
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries[index].as_mut() {
            entry.pinned = pinned;
        }
        inner.unlock();
    }

    /// Runs `f` over the contents of the frame at `pa` while the table lock
    /// is held, or returns `None` if the frame is not assigned.
    pub(crate) fn with_frame<R>(&self, pa: Pa, f: impl FnOnce(&[u8; PAGE_SIZE]) -> R) -> Option<R> {
        let index = self.index_of(pa)?;
        let inner = self.inner.lock();
        // SAFETY: holding the table lock keeps the entry (and thus frame
        // ownership) stable for the duration of `f`.
        let r = inner.entries[index]
            .as_ref()
            .map(|_| f(unsafe { self.pool.bytes(index) }));
        inner.unlock();
        r
    }

    /// Mutable variant of [`FrameTable::with_frame`].
    pub(crate) fn with_frame_mut<R>(
        &self,
        pa: Pa,
        f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R,
    ) -> Option<R> {
        let index = self.index_of(pa)?;
        let inner = self.inner.lock();
        // SAFETY: as in `with_frame`; the table lock serializes content
        // access against eviction and release.
        let r = inner.entries[index]
            .as_ref()
            .map(|_| f(unsafe { self.pool.bytes_mut(index) }));
        inner.unlock();
        r
    }

    /// Atomically reclaims the frame at `pa` for write-back, provided it
    /// still backs page `va` of process `pid`.
    ///
    /// On success the entry is gone, the owner's translation is cleared,
    /// and the frame is back in the pool; the returned pair carries the
    /// frame's final contents and the hardware dirty bit. Returns `None`
    /// if the frame was reassigned in the meantime (an eviction won the
    /// race), in which case the caller owns nothing.
    pub(crate) fn reclaim(
        &self,
        vm: &VmManager,
        pa: Pa,
        pid: Pid,
        va: Va,
    ) -> Option<(Box<[u8; PAGE_SIZE]>, bool)> {
        let index = self.index_of(pa)?;
        let mut inner = self.inner.lock();
        match inner.entries[index] {
            Some(ref e) if e.pid == pid && e.va == va => {}
            _ => {
                inner.unlock();
                return None;
            }
        }
        inner.entries[index] = None;
        if let Some(pos) = inner.queue.iter().position(|&i| i == index) {
            inner.queue.remove(pos);
        }
        let dirty = match vm.process(pid) {
            Some(owner) => {
                let mut aspace = owner.aspace.lock();
                let dirty = aspace.is_dirty(va);
                aspace.unmap(va);
                aspace.unlock();
                dirty
            }
            None => false,
        };
        let mut contents = Box::new([0u8; PAGE_SIZE]);
        // SAFETY: entry removed under the table lock; the frame is ours.
        contents.copy_from_slice(unsafe { self.pool.bytes(index) });
        inner.free.push(index);
        inner.unlock();
        Some((contents, dirty))
    }

    /// Fills `dst` from the frame at `pa` starting at `offset`.
    pub(crate) fn read_frame(&self, pa: Pa, offset: usize, dst: &mut [u8]) -> Option<()> {
        self.with_frame(pa, |bytes| dst.copy_from_slice(&bytes[offset..offset + dst.len()]))
    }

    /// Copies `src` into the frame at `pa` starting at `offset`.
    pub(crate) fn write_frame(&self, pa: Pa, offset: usize, src: &[u8]) -> Option<()> {
        self.with_frame_mut(pa, |bytes| {
            bytes[offset..offset + src.len()].copy_from_slice(src)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_hand_out_in_ascending_order() {
        let table = FrameTable::new(3);
        let mut inner = table.inner.lock();
        assert_eq!(inner.free.pop(), Some(0));
        assert_eq!(inner.free.pop(), Some(1));
        assert_eq!(inner.free.pop(), Some(2));
        assert_eq!(inner.free.pop(), None);
        inner.unlock();
    }

    #[test]
    fn pool_index_round_trip() {
        let table = FrameTable::new(4);
        for i in 0..4 {
            assert_eq!(table.index_of(table.pool.pa(i)), Some(i));
        }
        assert_eq!(table.index_of(Pa::new(4 << PAGE_SHIFT).unwrap()), None);
        assert_eq!(table.index_of(Pa::new(0x123).unwrap()), None);
    }
}
