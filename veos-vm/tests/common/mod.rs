//! In-memory collaborator doubles shared by the integration tests: a block
//! device, a regular file, and a software address-translation structure
//! standing in for the MMU.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use veos::{
    KernelError,
    addressing::{Pa, Va},
    dev::{BlockDevice, SECTOR_SIZE},
    fs::{RegularFile, traits},
    mm::AddressSpace,
    sync::SpinLock,
};
use veos_vm::{MmStruct, Pid, VmManager};

/// Top of the stack region used by test processes.
pub const STACK_TOP: usize = 0x7000_0000;
/// Maximum stack pages of a test process.
pub const STACK_PAGES: usize = 64;

pub fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

/// A RAM-backed block device.
pub struct MemDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MemDisk {
    pub fn new(sector_count: usize) -> Arc<Self> {
        Arc::new(Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; sector_count]),
        })
    }
}

impl BlockDevice for MemDisk {
    fn sector_count(&self) -> usize {
        self.sectors.lock().unwrap().len()
    }

    fn read(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let sectors = self.sectors.lock().unwrap();
        let src = sectors.get(sector).ok_or(KernelError::IOError)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let mut sectors = self.sectors.lock().unwrap();
        let dst = sectors.get_mut(sector).ok_or(KernelError::IOError)?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}

/// A RAM-backed regular file.
pub struct MemFile {
    data: Mutex<Vec<u8>>,
}

impl MemFile {
    pub fn new(content: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(content.to_vec()),
        })
    }

    /// A copy of the file's current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl traits::RegularFile for MemFile {
    fn size(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, KernelError> {
        let data = self.data.lock().unwrap();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, offset: usize, buf: &[u8]) -> Result<usize, KernelError> {
        let mut data = self.data.lock().unwrap();
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }
}

/// Builds a file handle over `content`, keeping the backing object
/// reachable for assertions.
pub fn file(content: &[u8]) -> (RegularFile, Arc<MemFile>) {
    let backing = MemFile::new(content);
    (RegularFile::new(backing.clone()), backing)
}

/// A software page table: what the MMU would hold, as a plain map.
pub struct SoftAspace {
    entries: BTreeMap<usize, SoftPte>,
}

pub struct SoftPte {
    pub pa: Pa,
    pub writable: bool,
    pub dirty: bool,
}

impl SoftAspace {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl AddressSpace for SoftAspace {
    fn map(&mut self, va: Va, pa: Pa, writable: bool) -> Result<(), KernelError> {
        match self.entries.entry(va.into_usize()) {
            std::collections::btree_map::Entry::Occupied(_) => Err(KernelError::AlreadyMapped),
            std::collections::btree_map::Entry::Vacant(e) => {
                e.insert(SoftPte {
                    pa,
                    writable,
                    dirty: false,
                });
                Ok(())
            }
        }
    }

    fn unmap(&mut self, va: Va) -> Option<Pa> {
        self.entries.remove(&va.into_usize()).map(|pte| pte.pa)
    }

    fn is_mapped(&self, va: Va) -> bool {
        self.entries.contains_key(&va.into_usize())
    }

    fn is_dirty(&self, va: Va) -> bool {
        self.entries
            .get(&va.into_usize())
            .is_some_and(|pte| pte.dirty)
    }

    fn set_dirty(&mut self, va: Va) {
        if let Some(pte) = self.entries.get_mut(&va.into_usize()) {
            pte.dirty = true;
        }
    }
}

/// A [`VmManager`] over `frames` frames and a RAM swap disk of
/// `swap_sectors` sectors.
pub fn vm(frames: usize, swap_sectors: usize) -> VmManager {
    VmManager::new(frames, MemDisk::new(swap_sectors))
}

/// A fresh test process: its memory state plus a handle on its software
/// page table.
pub fn process(vm: &VmManager, pid: usize) -> (MmStruct, Arc<SpinLock<SoftAspace>>) {
    let aspace = Arc::new(SpinLock::new(SoftAspace::new()));
    let mm = MmStruct::new(
        vm,
        Pid(pid),
        aspace.clone(),
        Va::new(STACK_TOP).unwrap(),
        STACK_PAGES,
    );
    (mm, aspace)
}
