// Memory Management for the CFS kernel
//
// Page-table primitives belong to the platform; this module only consumes them
// through `Vm` and layers the per-process mapping regions on top.
#[cfg(any(test, feature = "hosted"))]
pub mod hosted;
pub mod mmap;

use core::fmt;
use spin::{Mutex, MutexGuard};
use x86_64::structures::paging::{Page, PageTableFlags, PhysFrame, Size4KiB};
use x86_64::VirtAddr;

pub use mmap::{
    FaultError, FaultStats, FaultType, MapFlags, MappingRegion, MmapError, MmapRequest,
    MmapTable, Prot,
};

/// Handle of an address space owned by the `Vm` implementation
pub type SpaceId = u64;

/// Page-table update failures reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    AlreadyMapped,
    NotMapped,
    UnknownSpace,
    OutOfMemory,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapError::AlreadyMapped => write!(f, "page already mapped"),
            MapError::NotMapped => write!(f, "page not mapped"),
            MapError::UnknownSpace => write!(f, "unknown address space"),
            MapError::OutOfMemory => write!(f, "out of memory for page tables"),
        }
    }
}

/// Physical frames and page tables, supplied by the platform.
///
/// Ordinary user memory (`[0, size)` of a space) is managed entirely by the
/// implementation; mapping regions above `MMAP_BASE` are installed page by page
/// through `map_page`.
pub trait Vm: Send + Sync {
    fn alloc_frame(&self) -> Option<PhysFrame>;

    fn free_frame(&self, frame: PhysFrame);

    /// Number of frames currently free
    fn free_frames(&self) -> usize;

    /// Zero `frame`, then copy `data` to its start.
    fn fill_frame(&self, frame: PhysFrame, data: &[u8]);

    fn copy_frame(&self, src: PhysFrame, dst: PhysFrame);

    fn read_frame(&self, frame: PhysFrame, offset: usize, buf: &mut [u8]);

    fn write_frame(&self, frame: PhysFrame, offset: usize, data: &[u8]);

    /// Kernel virtual address at which `frame` is accessible
    fn kernel_address(&self, frame: PhysFrame) -> VirtAddr;

    fn create_space(&self) -> Option<SpaceId>;

    /// New space holding a private copy of `[0, size)` of `src`
    fn copy_space(&self, src: SpaceId, size: usize) -> Option<SpaceId>;

    /// Grow or shrink `[0, old_size)` to `[0, new_size)`; returns the new size.
    fn grow_space(&self, space: SpaceId, old_size: usize, new_size: usize) -> Option<usize>;

    /// Free the page tables and every page still mapped in `space`.
    fn free_space(&self, space: SpaceId);

    fn map_page(
        &self,
        space: SpaceId,
        page: Page<Size4KiB>,
        frame: PhysFrame,
        flags: PageTableFlags,
    ) -> Result<(), MapError>;

    fn unmap_page(&self, space: SpaceId, page: Page<Size4KiB>) -> Option<PhysFrame>;

    fn translate(&self, space: SpaceId, page: Page<Size4KiB>) -> Option<(PhysFrame, PageTableFlags)>;

    fn update_flags(
        &self,
        space: SpaceId,
        page: Page<Size4KiB>,
        flags: PageTableFlags,
    ) -> Result<(), MapError>;
}

/// A process address space: the platform handle plus its mapping regions.
pub struct AddressSpace {
    id: SpaceId,
    mappings: Mutex<MmapTable>,
    stats: FaultStats,
}

impl AddressSpace {
    pub fn new(id: SpaceId) -> Self {
        Self {
            id,
            mappings: Mutex::new(MmapTable::new()),
            stats: FaultStats::new(),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn mappings(&self) -> MutexGuard<'_, MmapTable> {
        self.mappings.lock()
    }

    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    /// Register a mapping region, materializing it right away for `POPULATE`.
    pub fn mmap(&self, vm: &dyn Vm, request: MmapRequest) -> Result<VirtAddr, MmapError> {
        self.mappings.lock().map(vm, self.id, request, &self.stats)
    }

    pub fn munmap(&self, vm: &dyn Vm, addr: VirtAddr) -> Result<(), MmapError> {
        self.mappings.lock().unmap(vm, self.id, addr)
    }

    /// Resolve a page fault at `addr`.
    ///
    /// The mapping lock is held for the whole resolution, so two faults on the
    /// same region install at most one page.
    pub fn handle_fault(&self, vm: &dyn Vm, addr: VirtAddr, access: FaultType) -> Result<(), FaultError> {
        self.mappings.lock().fault(vm, self.id, addr, access, &self.stats)
    }

    /// Copy of this space for a forked child: ordinary memory through the
    /// platform, mapping regions with private copies of their installed pages.
    pub fn duplicate(&self, vm: &dyn Vm, size: usize) -> Result<AddressSpace, MmapError> {
        let child_id = vm.copy_space(self.id, size).ok_or(MmapError::OutOfMemory)?;
        let child = AddressSpace::new(child_id);
        let copied = {
            let parent = self.mappings.lock();
            let mut regions = child.mappings.lock();
            parent.duplicate_into(vm, self.id, child_id, &mut regions)
        };
        if let Err(e) = copied {
            child.release(vm);
            return Err(e);
        }
        Ok(child)
    }

    /// Free every mapped page and the space itself.
    pub fn release(&self, vm: &dyn Vm) {
        self.mappings.lock().release(vm, self.id);
        vm.free_space(self.id);
    }
}

/// Rounds `n` up to a whole number of pages; `None` if that overflows.
pub fn page_round_up(n: usize) -> Option<usize> {
    let mask = crate::param::PAGE_SIZE - 1;
    n.checked_add(mask).map(|n| n & !mask)
}

pub fn page_of(addr: VirtAddr) -> Page<Size4KiB> {
    Page::containing_address(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::PAGE_SIZE;

    #[test]
    fn round_up_stops_at_overflow() {
        assert_eq!(page_round_up(0), Some(0));
        assert_eq!(page_round_up(1), Some(PAGE_SIZE));
        assert_eq!(page_round_up(PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(page_round_up(usize::MAX - PAGE_SIZE + 2), None);
        assert_eq!(page_round_up(usize::MAX), None);
    }
}
