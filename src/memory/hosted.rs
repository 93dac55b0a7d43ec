// In-memory `Vm` for hosted builds: a fixed frame pool and per-space page maps
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;
use x86_64::structures::paging::{Page, PageTableFlags, PhysFrame, Size4KiB};
use x86_64::{PhysAddr, VirtAddr};

use super::{page_round_up, MapError, SpaceId, Vm};
use crate::param::PAGE_SIZE;

/// Physical address of frame 0 of the pool
const POOL_BASE: u64 = 0x10_0000;

type PageMap = BTreeMap<u64, (PhysFrame, PageTableFlags)>;

struct HostedState {
    frames: Vec<Box<[u8; PAGE_SIZE]>>,
    free: Vec<usize>,
    spaces: BTreeMap<SpaceId, PageMap>,
    next_space: SpaceId,
}

impl HostedState {
    fn index(frame: PhysFrame) -> usize {
        ((frame.start_address().as_u64() - POOL_BASE) as usize) / PAGE_SIZE
    }

    fn frame(index: usize) -> PhysFrame {
        PhysFrame::containing_address(PhysAddr::new(POOL_BASE + (index * PAGE_SIZE) as u64))
    }

    fn alloc(&mut self) -> Option<PhysFrame> {
        let index = self.free.pop()?;
        // Poison recycled frames so missing zero-fills show up in tests.
        self.frames[index].fill(0xA5);
        Some(Self::frame(index))
    }

    fn release(&mut self, frame: PhysFrame) {
        let index = Self::index(frame);
        assert!(!self.free.contains(&index), "hosted vm: double free of {:?}", frame);
        self.free.push(index);
    }
}

pub struct HostedVm {
    state: Mutex<HostedState>,
    fail_maps: AtomicBool,
}

impl HostedVm {
    /// A pool of `frames` physical frames, all free.
    pub fn new(frames: usize) -> Self {
        Self {
            state: Mutex::new(HostedState {
                frames: (0..frames).map(|_| Box::new([0u8; PAGE_SIZE])).collect(),
                free: (0..frames).rev().collect(),
                spaces: BTreeMap::new(),
                next_space: 1,
            }),
            fail_maps: AtomicBool::new(false),
        }
    }

    /// Make every following `map_page` fail until cleared.
    pub fn set_fail_maps(&self, fail: bool) {
        self.fail_maps.store(fail, Ordering::SeqCst);
    }

    /// Number of pages mapped in `space`
    pub fn mapped_pages(&self, space: SpaceId) -> usize {
        self.state.lock().spaces.get(&space).map_or(0, |map| map.len())
    }

    /// Copy of the user bytes at `addr` in `space`, `None` if unmapped.
    pub fn read_user(&self, space: SpaceId, addr: VirtAddr, len: usize) -> Option<Vec<u8>> {
        let page = Page::<Size4KiB>::containing_address(addr);
        let (frame, _) = self.translate(space, page)?;
        let offset = (addr - page.start_address()) as usize;
        let mut buf = alloc::vec![0u8; len];
        self.read_frame(frame, offset, &mut buf);
        Some(buf)
    }

    /// Store `data` at `addr` in `space` the way a user write would, after the
    /// page has been installed writable. Returns false on a missing or
    /// read-only page (the write would fault).
    pub fn write_user(&self, space: SpaceId, addr: VirtAddr, data: &[u8]) -> bool {
        let page = Page::<Size4KiB>::containing_address(addr);
        match self.translate(space, page) {
            Some((frame, flags)) if flags.contains(PageTableFlags::WRITABLE) => {
                let offset = (addr - page.start_address()) as usize;
                self.write_frame(frame, offset, data);
                true
            }
            _ => false,
        }
    }

    fn unmap_above(state: &mut HostedState, space: SpaceId, from: u64, to: u64) {
        let freed: Vec<PhysFrame> = match state.spaces.get_mut(&space) {
            Some(map) => {
                let pages: Vec<u64> = map.range(from..to).map(|(addr, _)| *addr).collect();
                pages
                    .into_iter()
                    .filter_map(|addr| map.remove(&addr).map(|(frame, _)| frame))
                    .collect()
            }
            None => Vec::new(),
        };
        for frame in freed {
            state.release(frame);
        }
    }
}

impl Vm for HostedVm {
    fn alloc_frame(&self) -> Option<PhysFrame> {
        self.state.lock().alloc()
    }

    fn free_frame(&self, frame: PhysFrame) {
        self.state.lock().release(frame);
    }

    fn free_frames(&self) -> usize {
        self.state.lock().free.len()
    }

    fn fill_frame(&self, frame: PhysFrame, data: &[u8]) {
        let mut state = self.state.lock();
        let bytes = &mut state.frames[HostedState::index(frame)];
        bytes.fill(0);
        bytes[..data.len()].copy_from_slice(data);
    }

    fn copy_frame(&self, src: PhysFrame, dst: PhysFrame) {
        let mut state = self.state.lock();
        let contents = *state.frames[HostedState::index(src)];
        *state.frames[HostedState::index(dst)] = contents;
    }

    fn read_frame(&self, frame: PhysFrame, offset: usize, buf: &mut [u8]) {
        let state = self.state.lock();
        let bytes = &state.frames[HostedState::index(frame)];
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
    }

    fn write_frame(&self, frame: PhysFrame, offset: usize, data: &[u8]) {
        let mut state = self.state.lock();
        let bytes = &mut state.frames[HostedState::index(frame)];
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    fn kernel_address(&self, frame: PhysFrame) -> VirtAddr {
        VirtAddr::new(frame.start_address().as_u64())
    }

    fn create_space(&self) -> Option<SpaceId> {
        let mut state = self.state.lock();
        let id = state.next_space;
        state.next_space += 1;
        state.spaces.insert(id, PageMap::new());
        Some(id)
    }

    fn copy_space(&self, src: SpaceId, size: usize) -> Option<SpaceId> {
        let mut state = self.state.lock();
        let source: Vec<(u64, PhysFrame, PageTableFlags)> = state
            .spaces
            .get(&src)?
            .range(..size as u64)
            .map(|(addr, (frame, flags))| (*addr, *frame, *flags))
            .collect();

        let mut copy = PageMap::new();
        for (addr, frame, flags) in source {
            let Some(new) = state.alloc() else {
                for (frame, _) in copy.into_values() {
                    state.release(frame);
                }
                return None;
            };
            let contents = *state.frames[HostedState::index(frame)];
            *state.frames[HostedState::index(new)] = contents;
            copy.insert(addr, (new, flags));
        }

        let id = state.next_space;
        state.next_space += 1;
        state.spaces.insert(id, copy);
        Some(id)
    }

    fn grow_space(&self, space: SpaceId, old_size: usize, new_size: usize) -> Option<usize> {
        let mut state = self.state.lock();
        if !state.spaces.contains_key(&space) {
            return None;
        }
        let (Some(old_top), Some(new_top)) = (page_round_up(old_size), page_round_up(new_size)) else {
            return None;
        };
        let (old_top, new_top) = (old_top as u64, new_top as u64);
        if new_top < old_top {
            Self::unmap_above(&mut state, space, new_top, old_top);
            return Some(new_size);
        }

        let flags = PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::USER_ACCESSIBLE;
        let mut addr = old_top;
        while addr < new_top {
            let Some(frame) = state.alloc() else {
                Self::unmap_above(&mut state, space, old_top, addr);
                return None;
            };
            state.frames[HostedState::index(frame)].fill(0);
            if let Some(map) = state.spaces.get_mut(&space) {
                map.insert(addr, (frame, flags));
            }
            addr += PAGE_SIZE as u64;
        }
        Some(new_size)
    }

    fn free_space(&self, space: SpaceId) {
        let mut state = self.state.lock();
        if let Some(map) = state.spaces.remove(&space) {
            for (frame, _) in map.into_values() {
                state.release(frame);
            }
        }
    }

    fn map_page(
        &self,
        space: SpaceId,
        page: Page<Size4KiB>,
        frame: PhysFrame,
        flags: PageTableFlags,
    ) -> Result<(), MapError> {
        if self.fail_maps.load(Ordering::SeqCst) {
            return Err(MapError::OutOfMemory);
        }
        let mut state = self.state.lock();
        let map = state.spaces.get_mut(&space).ok_or(MapError::UnknownSpace)?;
        let addr = page.start_address().as_u64();
        if map.contains_key(&addr) {
            return Err(MapError::AlreadyMapped);
        }
        map.insert(addr, (frame, flags));
        Ok(())
    }

    fn unmap_page(&self, space: SpaceId, page: Page<Size4KiB>) -> Option<PhysFrame> {
        let mut state = self.state.lock();
        state
            .spaces
            .get_mut(&space)?
            .remove(&page.start_address().as_u64())
            .map(|(frame, _)| frame)
    }

    fn translate(&self, space: SpaceId, page: Page<Size4KiB>) -> Option<(PhysFrame, PageTableFlags)> {
        let state = self.state.lock();
        state
            .spaces
            .get(&space)?
            .get(&page.start_address().as_u64())
            .copied()
    }

    fn update_flags(
        &self,
        space: SpaceId,
        page: Page<Size4KiB>,
        flags: PageTableFlags,
    ) -> Result<(), MapError> {
        let mut state = self.state.lock();
        let map = state.spaces.get_mut(&space).ok_or(MapError::UnknownSpace)?;
        let entry = map
            .get_mut(&page.start_address().as_u64())
            .ok_or(MapError::NotMapped)?;
        entry.1 = flags;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_counted_and_recycled() {
        let vm = HostedVm::new(4);
        assert_eq!(vm.free_frames(), 4);
        let a = vm.alloc_frame().unwrap();
        let b = vm.alloc_frame().unwrap();
        assert_ne!(a, b);
        assert_eq!(vm.free_frames(), 2);
        vm.free_frame(a);
        vm.free_frame(b);
        assert_eq!(vm.free_frames(), 4);
    }

    #[test]
    fn copy_space_duplicates_user_memory_below_size() {
        let vm = HostedVm::new(8);
        let space = vm.create_space().unwrap();
        vm.grow_space(space, 0, 2 * PAGE_SIZE).unwrap();
        assert!(vm.write_user(space, VirtAddr::new(10), b"abc"));

        let copy = vm.copy_space(space, 2 * PAGE_SIZE).unwrap();
        assert_eq!(vm.mapped_pages(copy), 2);
        assert_eq!(vm.read_user(copy, VirtAddr::new(10), 3).unwrap(), b"abc");
        assert_eq!(vm.free_frames(), 4);

        vm.free_space(copy);
        vm.free_space(space);
        assert_eq!(vm.free_frames(), 8);
    }

    #[test]
    fn shrinking_frees_pages() {
        let vm = HostedVm::new(4);
        let space = vm.create_space().unwrap();
        vm.grow_space(space, 0, 3 * PAGE_SIZE).unwrap();
        assert_eq!(vm.free_frames(), 1);
        vm.grow_space(space, 3 * PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(vm.free_frames(), 3);
        assert_eq!(vm.mapped_pages(space), 1);
    }
}
