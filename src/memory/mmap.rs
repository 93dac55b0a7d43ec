// Mapping regions and the demand-paging fault path
use alloc::vec::Vec;
use core::fmt;
use core::ops::BitOr;
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::structures::paging::{Page, PageTableFlags, Size4KiB};
use x86_64::VirtAddr;

use super::{page_round_up, MapError, SpaceId, Vm};
use crate::error::ErrorKind;
use crate::fs::{FileError, FileRef};
use crate::param::{MMAP_BASE, MMAP_LIMIT, NMMAP, PAGE_SIZE};

/// Region protection bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Prot(u32);

impl Prot {
    pub const NONE: Prot = Prot(0);
    pub const READ: Prot = Prot(0x1);
    pub const WRITE: Prot = Prot(0x2);

    pub const fn from_bits(bits: u32) -> Self {
        Prot(bits & 0x3)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Prot) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Prot {
    type Output = Prot;

    fn bitor(self, rhs: Prot) -> Prot {
        Prot(self.0 | rhs.0)
    }
}

/// Region mapping flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MapFlags(u32);

impl MapFlags {
    pub const NONE: MapFlags = MapFlags(0);
    /// No backing file; pages start zeroed
    pub const ANONYMOUS: MapFlags = MapFlags(0x1);
    /// Materialize every page at mmap time instead of on first touch
    pub const POPULATE: MapFlags = MapFlags(0x2);

    pub const fn from_bits(bits: u32) -> Self {
        MapFlags(bits & 0x3)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: MapFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MapFlags {
    type Output = MapFlags;

    fn bitor(self, rhs: MapFlags) -> MapFlags {
        MapFlags(self.0 | rhs.0)
    }
}

/// Access that triggered a page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// No region covers the faulting address
    NoRegion,
    /// Write to a region mapped without `Prot::WRITE`
    WriteToReadOnly,
    /// No free frame for the page
    OutOfMemory,
    /// The backing file could not be read
    ReadFailed(FileError),
    /// The page table rejected the new entry
    InstallFailed(MapError),
}

impl FaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FaultError::OutOfMemory | FaultError::InstallFailed(_) => ErrorKind::ResourceExhausted,
            FaultError::NoRegion | FaultError::WriteToReadOnly | FaultError::ReadFailed(_) => {
                ErrorKind::AccessViolation
            }
        }
    }
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FaultError::NoRegion => write!(f, "address not covered by any mapping"),
            FaultError::WriteToReadOnly => write!(f, "write to read-only mapping"),
            FaultError::OutOfMemory => write!(f, "out of physical memory"),
            FaultError::ReadFailed(e) => write!(f, "backing file read failed: {}", e),
            FaultError::InstallFailed(e) => write!(f, "page install failed: {}", e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapError {
    Misaligned,
    InvalidLength,
    /// Missing file for a file mapping, or file mode incompatible with `prot`
    BadFile,
    Overlap,
    TableFull,
    NotMapped,
    /// The process has no user address space
    NoAddressSpace,
    OutOfMemory,
    InstallFailed,
    /// Eager population hit a fault error; nothing was left mapped
    Populate(FaultError),
}

impl MmapError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MmapError::Misaligned
            | MmapError::InvalidLength
            | MmapError::BadFile
            | MmapError::Overlap
            | MmapError::NotMapped
            | MmapError::NoAddressSpace => ErrorKind::InvalidReference,
            MmapError::TableFull | MmapError::OutOfMemory | MmapError::InstallFailed => {
                ErrorKind::ResourceExhausted
            }
            MmapError::Populate(e) => e.kind(),
        }
    }
}

impl fmt::Display for MmapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MmapError::Misaligned => write!(f, "address not page aligned"),
            MmapError::InvalidLength => write!(f, "invalid mapping length"),
            MmapError::BadFile => write!(f, "bad backing file"),
            MmapError::Overlap => write!(f, "overlaps an existing mapping"),
            MmapError::TableFull => write!(f, "mapping table full"),
            MmapError::NotMapped => write!(f, "no mapping starts at address"),
            MmapError::NoAddressSpace => write!(f, "no user address space"),
            MmapError::OutOfMemory => write!(f, "out of physical memory"),
            MmapError::InstallFailed => write!(f, "page install failed"),
            MmapError::Populate(e) => write!(f, "populate failed: {}", e),
        }
    }
}

/// Fault counters of one address space
pub struct FaultStats {
    pub total: AtomicU64,
    pub zero_fill: AtomicU64,
    pub file_reads: AtomicU64,
    pub failures: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            zero_fill: AtomicU64::new(0),
            file_reads: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn file_reads(&self) -> u64 {
        self.file_reads.load(Ordering::Relaxed)
    }

    pub fn zero_fills(&self) -> u64 {
        self.zero_fill.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

/// A mapping request as received from the mmap system call
pub struct MmapRequest {
    /// Offset from `MMAP_BASE`
    pub addr: u64,
    pub length: usize,
    pub prot: Prot,
    pub flags: MapFlags,
    pub file: Option<FileRef>,
    pub offset: usize,
}

#[derive(Clone)]
pub struct MappingRegion {
    pub start: VirtAddr,
    /// Whole pages
    pub length: usize,
    pub prot: Prot,
    pub flags: MapFlags,
    pub file: Option<FileRef>,
    pub offset: usize,
}

impl MappingRegion {
    pub fn end(&self) -> VirtAddr {
        self.start + self.length as u64
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr < self.end()
    }

    pub fn overlaps(&self, start: VirtAddr, length: usize) -> bool {
        start < self.end() && self.start < start + length as u64
    }

    pub fn is_file_backed(&self) -> bool {
        !self.flags.contains(MapFlags::ANONYMOUS) && self.file.is_some()
    }

    pub fn pages(&self) -> impl Iterator<Item = Page<Size4KiB>> {
        Page::range(
            Page::containing_address(self.start),
            Page::containing_address(self.end()),
        )
    }

    /// Offset into the backing file of the first byte of `page`
    fn file_offset(&self, page: Page<Size4KiB>) -> usize {
        // A huge offset only reads past end of file.
        self.offset
            .saturating_add((page.start_address() - self.start) as usize)
    }
}

/// Fixed-size table of the mapping regions of one address space
pub struct MmapTable {
    regions: [Option<MappingRegion>; NMMAP],
}

impl MmapTable {
    pub fn new() -> Self {
        Self {
            regions: core::array::from_fn(|_| None),
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &MappingRegion> {
        self.regions.iter().flatten()
    }

    /// First region, in table order, covering `addr`
    pub fn find(&self, addr: VirtAddr) -> Option<&MappingRegion> {
        self.iter().find(|region| region.contains(addr))
    }

    pub(super) fn map(
        &mut self,
        vm: &dyn Vm,
        space: SpaceId,
        request: MmapRequest,
        stats: &FaultStats,
    ) -> Result<VirtAddr, MmapError> {
        let MmapRequest {
            addr,
            length,
            prot,
            flags,
            file,
            offset,
        } = request;

        if addr % PAGE_SIZE as u64 != 0 {
            return Err(MmapError::Misaligned);
        }
        if length == 0 {
            return Err(MmapError::InvalidLength);
        }
        let length = page_round_up(length).ok_or(MmapError::InvalidLength)?;
        let start = MMAP_BASE.checked_add(addr).ok_or(MmapError::InvalidLength)?;
        start
            .checked_add(length as u64)
            .filter(|&end| end <= MMAP_LIMIT)
            .ok_or(MmapError::InvalidLength)?;

        let file = if flags.contains(MapFlags::ANONYMOUS) {
            None
        } else {
            let file = file.ok_or(MmapError::BadFile)?;
            if (prot.contains(Prot::READ) && !file.readable())
                || (prot.contains(Prot::WRITE) && !file.writable())
            {
                return Err(MmapError::BadFile);
            }
            Some(file)
        };

        let start = VirtAddr::new(start);
        if self.iter().any(|region| region.overlaps(start, length)) {
            return Err(MmapError::Overlap);
        }
        let slot = self
            .regions
            .iter()
            .position(Option::is_none)
            .ok_or(MmapError::TableFull)?;

        let region = MappingRegion {
            start,
            length,
            prot,
            flags,
            file,
            offset,
        };

        if flags.contains(MapFlags::POPULATE) {
            let writable = prot.contains(Prot::WRITE);
            for page in region.pages() {
                if let Err(e) = materialize(vm, space, &region, page, writable, stats) {
                    unmap_pages(vm, space, &region);
                    return Err(MmapError::Populate(e));
                }
            }
        }

        crate::println!(
            "[MMAP] space {}: mapped {:#x}..{:#x} prot {:#x} flags {:#x}",
            space,
            region.start.as_u64(),
            region.end().as_u64(),
            prot.bits(),
            flags.bits()
        );
        self.regions[slot] = Some(region);
        Ok(start)
    }

    pub(super) fn unmap(&mut self, vm: &dyn Vm, space: SpaceId, addr: VirtAddr) -> Result<(), MmapError> {
        let slot = self
            .regions
            .iter()
            .position(|r| matches!(r, Some(region) if region.start == addr))
            .ok_or(MmapError::NotMapped)?;
        if let Some(region) = self.regions[slot].take() {
            unmap_pages(vm, space, &region);
            crate::println!("[MMAP] space {}: unmapped {:#x}", space, addr.as_u64());
        }
        Ok(())
    }

    pub(super) fn fault(
        &mut self,
        vm: &dyn Vm,
        space: SpaceId,
        addr: VirtAddr,
        access: FaultType,
        stats: &FaultStats,
    ) -> Result<(), FaultError> {
        stats.total.fetch_add(1, Ordering::Relaxed);
        let result = self.resolve(vm, space, addr, access, stats);
        if result.is_err() {
            stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn resolve(
        &self,
        vm: &dyn Vm,
        space: SpaceId,
        addr: VirtAddr,
        access: FaultType,
        stats: &FaultStats,
    ) -> Result<(), FaultError> {
        let region = self.find(addr).ok_or(FaultError::NoRegion)?;
        let write = access == FaultType::Write;
        if write && !region.prot.contains(Prot::WRITE) {
            return Err(FaultError::WriteToReadOnly);
        }

        let page = Page::containing_address(addr);
        if let Some((_, flags)) = vm.translate(space, page) {
            // Already installed: either a racing fault won, or a read-installed
            // page of a writable region is now being written.
            if write && !flags.contains(PageTableFlags::WRITABLE) {
                vm.update_flags(space, page, flags | PageTableFlags::WRITABLE)
                    .map_err(FaultError::InstallFailed)?;
            }
            return Ok(());
        }

        materialize(vm, space, region, page, write, stats)
    }

    pub(super) fn duplicate_into(
        &self,
        vm: &dyn Vm,
        parent: SpaceId,
        child: SpaceId,
        dst: &mut MmapTable,
    ) -> Result<(), MmapError> {
        for (slot, region) in self.regions.iter().enumerate() {
            let Some(region) = region else { continue };
            dst.regions[slot] = Some(region.clone());
            for page in region.pages() {
                let Some((frame, flags)) = vm.translate(parent, page) else {
                    continue;
                };
                let copy = vm.alloc_frame().ok_or(MmapError::OutOfMemory)?;
                vm.copy_frame(frame, copy);
                if vm.map_page(child, page, copy, flags).is_err() {
                    vm.free_frame(copy);
                    return Err(MmapError::InstallFailed);
                }
            }
        }
        Ok(())
    }

    pub(super) fn release(&mut self, vm: &dyn Vm, space: SpaceId) {
        for region in self.regions.iter_mut() {
            if let Some(region) = region.take() {
                unmap_pages(vm, space, &region);
            }
        }
    }
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate, fill and install the frame backing `page` of `region`.
fn materialize(
    vm: &dyn Vm,
    space: SpaceId,
    region: &MappingRegion,
    page: Page<Size4KiB>,
    writable: bool,
    stats: &FaultStats,
) -> Result<(), FaultError> {
    let frame = vm.alloc_frame().ok_or(FaultError::OutOfMemory)?;

    let mut contents = Vec::new();
    match region.file.as_ref() {
        Some(file) if region.is_file_backed() => {
            contents.resize(PAGE_SIZE, 0);
            match file.read_at(region.file_offset(page), &mut contents) {
                Ok(n) => contents.truncate(n),
                Err(e) => {
                    vm.free_frame(frame);
                    return Err(FaultError::ReadFailed(e));
                }
            }
            stats.file_reads.fetch_add(1, Ordering::Relaxed);
        }
        _ => {
            stats.zero_fill.fetch_add(1, Ordering::Relaxed);
        }
    }
    vm.fill_frame(frame, &contents);

    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }
    if let Err(e) = vm.map_page(space, page, frame, flags) {
        vm.free_frame(frame);
        return Err(FaultError::InstallFailed(e));
    }
    Ok(())
}

fn unmap_pages(vm: &dyn Vm, space: SpaceId, region: &MappingRegion) {
    for page in region.pages() {
        if let Some(frame) = vm.unmap_page(space, page) {
            vm.free_frame(frame);
        }
    }
}
