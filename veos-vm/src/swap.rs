//! Swap store.
//!
//! The swap store turns a dedicated block device into an array of
//! page-sized **slots**, each a contiguous group of
//! [`SECTORS_PER_SLOT`] hardware sectors. When the frame allocator evicts a
//! resident page, the page's contents move into a free slot; when the
//! owning process faults the page back in, the slot's contents move into a
//! fresh frame and the slot is released.
//!
//! Slot accounting is a single bitmap, one bit per slot, scanned first-fit.
//! The bitmap and the device I/O share one lock, separate from the
//! frame-pool lock: swap traffic is slow and must not stall unrelated frame
//! bookkeeping. Whenever both locks are needed the frame-pool lock is
//! acquired first; the reverse order never occurs. Holding the slot lock
//! across the sector writes is what makes eviction safe against a
//! concurrent fault-in of the same slot: the reader blocks on the lock
//! until the slot contents are on disk.

use alloc::{boxed::Box, sync::Arc};
use crossbeam_utils::CachePadded;
use veos::{
    KernelError,
    addressing::PAGE_SIZE,
    dev::{BlockDevice, SECTOR_SIZE},
    sync::{SpinLock, SpinLockGuard},
};

/// Number of device sectors backing one swap slot.
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

/// Index of a page-sized slot group on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(pub(crate) usize);

/// Allocation bitmap over the swap slots. One bit per slot, set = in use.
struct SlotMap {
    bits: Box<[u64]>,
    slots: usize,
    in_use: usize,
}

impl SlotMap {
    fn new(slots: usize) -> Self {
        Self {
            bits: (0..slots.div_ceil(64)).map(|_| 0u64).collect(),
            slots,
            in_use: 0,
        }
    }

    // First-fit scan for a free slot; marks it used.
    fn scan_and_set(&mut self) -> Option<usize> {
        for (pos, word) in self.bits.iter_mut().enumerate() {
            if *word != u64::MAX {
                let ofs = word.trailing_ones() as usize;
                let index = pos * 64 + ofs;
                if index >= self.slots {
                    return None;
                }
                *word |= 1 << ofs;
                self.in_use += 1;
                return Some(index);
            }
        }
        None
    }

    fn set_free(&mut self, index: usize) {
        let (pos, ofs) = (index / 64, index % 64);
        debug_assert_ne!(self.bits[pos] & (1 << ofs), 0, "freeing a free swap slot");
        self.bits[pos] &= !(1 << ofs);
        self.in_use -= 1;
    }
}

/// The swap store: a slot bitmap plus the device the slots live on.
pub(crate) struct SwapStore {
    device: Arc<dyn BlockDevice>,
    map: CachePadded<SpinLock<SlotMap>>,
}

impl SwapStore {
    /// Builds a swap store over `device`. Trailing sectors that do not fill
    /// a whole slot group are unused.
    pub(crate) fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = device.sector_count() / SECTORS_PER_SLOT;
        Self {
            device,
            map: CachePadded::new(SpinLock::new(SlotMap::new(slots))),
        }
    }

    /// Total number of slots on the device.
    pub(crate) fn slot_count(&self) -> usize {
        let map = self.map.lock();
        let n = map.slots;
        map.unlock();
        n
    }

    /// Number of slots currently holding evicted pages.
    pub(crate) fn slots_in_use(&self) -> usize {
        let map = self.map.lock();
        let n = map.in_use;
        map.unlock();
        n
    }

    /// Opens a slot session, taking the slot lock.
    ///
    /// The eviction path uses a session so it can reserve a slot while the
    /// frame-pool lock is still held, then perform the sector writes after
    /// that lock is released, all under one continuous hold of the slot
    /// lock.
    pub(crate) fn begin(&self) -> SwapSession<'_> {
        SwapSession {
            device: &self.device,
            map: self.map.lock(),
        }
    }

    /// Reads the contents of `slot` into `buf` and releases the slot.
    ///
    /// The slot is only released on a successful read; on an I/O error the
    /// caller's descriptor still owns the slot and process teardown
    /// reclaims it.
    pub(crate) fn read_in(&self, slot: SwapSlot, buf: &mut [u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let mut map = self.map.lock();
        let base = slot.0 * SECTORS_PER_SLOT;
        for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            if let Err(e) = self.device.read(base + i, chunk.try_into().unwrap()) {
                map.unlock();
                return Err(e);
            }
        }
        map.set_free(slot.0);
        map.unlock();
        log::trace!("swap: read in and freed slot {}", slot.0);
        Ok(())
    }

    /// Releases `slot` without reading it, discarding its contents.
    pub(crate) fn free(&self, slot: SwapSlot) {
        let mut map = self.map.lock();
        map.set_free(slot.0);
        map.unlock();
        log::trace!("swap: freed slot {}", slot.0);
    }
}

/// An open, locked session on the swap store. See [`SwapStore::begin`].
pub(crate) struct SwapSession<'a> {
    device: &'a Arc<dyn BlockDevice>,
    map: SpinLockGuard<'a, SlotMap>,
}

impl SwapSession<'_> {
    /// Reserves a free slot.
    ///
    /// # Returns
    /// - `Err(KernelError::NoSpace)` when every slot is in use. The caller
    ///   surfaces this to whatever operation forced the eviction; it is
    ///   never ignored.
    pub(crate) fn reserve(&mut self) -> Result<SwapSlot, KernelError> {
        match self.map.scan_and_set() {
            Some(index) => {
                log::trace!("swap: reserved slot {}", index);
                Ok(SwapSlot(index))
            }
            None => Err(KernelError::NoSpace),
        }
    }

    /// Returns a reserved slot unused.
    pub(crate) fn release(&mut self, slot: SwapSlot) {
        self.map.set_free(slot.0);
    }

    /// Writes a page of bytes across the slot's sector group.
    pub(crate) fn write(&mut self, slot: SwapSlot, buf: &[u8; PAGE_SIZE]) -> Result<(), KernelError> {
        let base = slot.0 * SECTORS_PER_SLOT;
        for (i, chunk) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
            self.device.write(base + i, chunk.try_into().unwrap())?;
        }
        Ok(())
    }

    /// Ends the session, releasing the slot lock.
    pub(crate) fn finish(self) {
        self.map.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::SlotMap;

    #[test]
    fn scan_is_first_fit() {
        let mut map = SlotMap::new(130);
        assert_eq!(map.scan_and_set(), Some(0));
        assert_eq!(map.scan_and_set(), Some(1));
        map.set_free(0);
        // The lowest free slot wins, not the next one after the last hit.
        assert_eq!(map.scan_and_set(), Some(0));
        assert_eq!(map.in_use, 2);
    }

    #[test]
    fn exhaustion_and_reuse() {
        let mut map = SlotMap::new(65);
        for i in 0..65 {
            assert_eq!(map.scan_and_set(), Some(i));
        }
        assert_eq!(map.scan_and_set(), None);
        map.set_free(64);
        assert_eq!(map.scan_and_set(), Some(64));
        assert_eq!(map.scan_and_set(), None);
    }
}
