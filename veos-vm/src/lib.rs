//! # Demand-paged virtual memory for VEOS.
//!
//! This crate is the virtual-memory subsystem of the VEOS teaching kernel.
//! It gives each process a sparse, lazily-populated address space backed by
//! an executable's segments, an anonymous stack, swap storage, and
//! memory-mapped files, while a bounded pool of physical frames is shared
//! and reclaimed across processes.
//!
//! ## Structure
//!
//! Four components cooperate, leaves first:
//!
//! - [`swap`] — a page-granular block allocator over a dedicated disk
//!   region, holding the contents of evicted pages.
//! - [`frame`] — the shared physical-frame pool and frame table; when the
//!   pool runs dry it evicts the least recently inserted unpinned frame to
//!   swap.
//! - [`page`] — the per-process supplemental page table: one descriptor
//!   per known virtual page, and the fault-resolution state machine that
//!   turns descriptors into resident pages.
//! - [`mmap`] — memory-mapped file regions layered on the page table, with
//!   write-back of modified pages at unmap.
//!
//! The [`uaccess`] module rounds the picture out with the pinned-copy
//! operations the syscall boundary uses to move data into and out of user
//! buffers without racing eviction.
//!
//! ## Ownership
//!
//! There are no global singletons. The [`VmManager`] owns the frame pool,
//! the swap store, and the process registry; it is constructed once at boot
//! and passed by reference to every entry point. Each process owns its
//! [`MmStruct`] — its page descriptors and mapping records — directly. The
//! registry holds shared handles to each process's descriptor map and
//! address-translation structure, keyed by [`Pid`], so that eviction can
//! reach a victim process's state through an identifier lookup and
//! re-validate it still exists before touching it.
//!
//! A page fault arrives from the trap handler as
//! [`MmStruct::resolve_fault`] with the faulting address; `true` means
//! resolved, `false` means the handler terminates the process with an
//! access violation.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod frame;
pub mod mmap;
pub mod page;
pub mod swap;
pub mod uaccess;

use alloc::{collections::BTreeMap, sync::Arc};
use veos::{dev::BlockDevice, mm::AddressSpace, sync::SpinLock};

use frame::FrameTable;
use swap::{SwapSession, SwapStore};

pub use mmap::{MappingId, MappingRecord};
pub use page::MmStruct;

/// A process identifier.
///
/// The scheduler assigns these; the paging code only compares them and
/// uses them as registry keys. A frame-table entry names its owner by
/// `Pid` rather than by pointer, so a stale entry can never reach into a
/// process that has already exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub usize);

/// The registry's view of one process: shared handles to its descriptor
/// map and its address-translation structure.
#[derive(Clone)]
pub(crate) struct ProcessHandle {
    pub(crate) pages: Arc<SpinLock<page::PageMap>>,
    pub(crate) aspace: Arc<SpinLock<dyn AddressSpace>>,
}

/// The machine-wide virtual-memory state: frame pool, swap store, and
/// process registry.
///
/// Constructed once at boot and passed by reference to every paging entry
/// point. The pool and the store each serialize their own state behind
/// their own lock; whenever the eviction path needs both, it takes the
/// frame-pool lock first.
pub struct VmManager {
    frames: FrameTable,
    swap: SwapStore,
    procs: SpinLock<BTreeMap<Pid, ProcessHandle>>,
}

impl VmManager {
    /// Builds the virtual-memory state over a pool of `frames` physical
    /// frames and the given swap device.
    pub fn new(frames: usize, swap_device: Arc<dyn BlockDevice>) -> Self {
        Self {
            frames: FrameTable::new(frames),
            swap: SwapStore::new(swap_device),
            procs: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Total number of frames in the pool.
    pub fn frame_count(&self) -> usize {
        self.frames.frame_count()
    }

    /// Number of frames currently assigned to pages.
    pub fn frames_in_use(&self) -> usize {
        self.frames.in_use()
    }

    /// Total number of swap slots on the device.
    pub fn swap_slot_count(&self) -> usize {
        self.swap.slot_count()
    }

    /// Number of swap slots currently holding evicted pages.
    pub fn swap_slots_in_use(&self) -> usize {
        self.swap.slots_in_use()
    }

    pub(crate) fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub(crate) fn swap(&self) -> &SwapStore {
        &self.swap
    }

    pub(crate) fn swap_session(&self) -> SwapSession<'_> {
        self.swap.begin()
    }

    /// Looks up a registered process. Used by eviction to reach the
    /// victim's state; `None` means the process exited in the meantime.
    pub(crate) fn process(&self, pid: Pid) -> Option<ProcessHandle> {
        let procs = self.procs.lock();
        let handle = procs.get(&pid).cloned();
        procs.unlock();
        handle
    }

    pub(crate) fn register(
        &self,
        pid: Pid,
        pages: Arc<SpinLock<page::PageMap>>,
        aspace: Arc<SpinLock<dyn AddressSpace>>,
    ) {
        let mut procs = self.procs.lock();
        let clash = procs.insert(pid, ProcessHandle { pages, aspace });
        procs.unlock();
        assert!(clash.is_none(), "{:?} registered twice", pid);
    }

    pub(crate) fn deregister(&self, pid: Pid) {
        let mut procs = self.procs.lock();
        procs.remove(&pid);
        procs.unlock();
    }
}
