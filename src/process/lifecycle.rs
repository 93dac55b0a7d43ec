// Process lifecycle: creation, exit, reaping, sleeping and per-process memory
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::structures::paging::Page;
use x86_64::VirtAddr;

use crate::fs::{FileRef, InodeRef};
use crate::kernel::{IrqGuard, Kernel, TableGuard};
use crate::memory::{AddressSpace, FaultError, FaultType, MapFlags, MmapError, MmapRequest, Prot};
use crate::param::{KSTACK_SIZE, MMAP_BASE, PAGE_SIZE};
use crate::process::context::{Context, CpuRegisters};
use crate::process::pcb::{
    format_ps, weight_of, Channel, ProcessError, ProcessId, ProcessInfo, ProcessState,
};

impl Kernel {
    /// Claim a table slot in the Embryo state with a kernel stack and a
    /// context that starts at the platform's fork entry.
    pub fn allocate(&self) -> Result<usize, ProcessError> {
        let slot = self.lock_table().claim_slot()?;

        let Some(kstack) = self.vm.alloc_frame() else {
            self.lock_table().release_slot(slot);
            return Err(ProcessError::OutOfMemory);
        };
        let stack_top = self.vm.kernel_address(kstack).as_u64() + KSTACK_SIZE as u64;

        let mut table = self.lock_table();
        let p = table.get_mut(slot);
        p.kstack = Some(kstack);
        p.context = Context::new(self.runtime.fork_entry(), stack_top);
        Ok(slot)
    }

    /// Undo `allocate` for a process that never became Runnable.
    fn abandon(&self, slot: usize) {
        let kstack = {
            let mut table = self.lock_table();
            let kstack = table.get_mut(slot).kstack.take();
            table.release_slot(slot);
            kstack
        };
        if let Some(kstack) = kstack {
            self.vm.free_frame(kstack);
        }
    }

    /// Create the first user process, running `image` from address 0.
    ///
    /// # Panics
    /// If `image` does not fit in one page.
    pub fn user_init(&self, image: &[u8], cwd: Option<InodeRef>) -> Result<ProcessId, ProcessError> {
        assert!(image.len() <= PAGE_SIZE, "user_init: more than a page");
        let slot = self.allocate()?;

        let space = self.vm.create_space().and_then(|space| {
            if self.vm.grow_space(space, 0, PAGE_SIZE).is_none() {
                self.vm.free_space(space);
                return None;
            }
            Some(space)
        });
        let Some(space) = space else {
            self.abandon(slot);
            return Err(ProcessError::OutOfMemory);
        };
        if let Some((frame, _)) = self.vm.translate(space, Page::containing_address(VirtAddr::new(0))) {
            self.vm.write_frame(frame, 0, image);
        }

        let mut table = self.lock_table();
        let p = table.get_mut(slot);
        p.name = String::from("initcode");
        p.space = Some(Arc::new(AddressSpace::new(space)));
        p.size = PAGE_SIZE;
        p.registers = CpuRegisters {
            rsp: PAGE_SIZE as u64,
            rip: 0,
            ..CpuRegisters::default()
        };
        p.cwd = cwd;
        p.state = ProcessState::Runnable;
        let pid = p.pid;
        table.set_init(slot);
        crate::println!("[PROC] init process created with PID {}", pid);
        Ok(pid)
    }

    /// Create a copy of the process in `caller`; returns the child's pid.
    ///
    /// The child shares open files and the working directory, gets private
    /// copies of all user memory, and inherits nice and vruntime.
    pub fn fork(&self, caller: usize) -> Result<ProcessId, ProcessError> {
        let slot = self.allocate()?;

        let (parent, parent_space, size, registers, files, cwd, name, nice, vruntime) = {
            let table = self.lock_table();
            let p = table.get(caller);
            (
                table.proc_ref(caller),
                p.space.clone(),
                p.size,
                p.registers,
                p.open_files.clone(),
                p.cwd.clone(),
                p.name.clone(),
                p.nice,
                p.vruntime,
            )
        };

        let space = match parent_space {
            Some(space) => match space.duplicate(self.vm, size) {
                Ok(copy) => Some(Arc::new(copy)),
                Err(e) => {
                    crate::println!("[PROC] fork from PID {} failed: {}", parent.pid, e);
                    self.abandon(slot);
                    return Err(ProcessError::OutOfMemory);
                }
            },
            None => None,
        };

        let mut table = self.lock_table();
        let weight = weight_of(nice);
        let pid = {
            let p = table.get_mut(slot);
            p.space = space;
            p.size = size;
            p.parent = Some(parent);
            p.registers = registers;
            // fork returns 0 in the child
            p.registers.rax = 0;
            p.open_files = files;
            p.cwd = cwd;
            p.name = name;
            p.nice = nice;
            p.weight = weight;
            p.vruntime = vruntime;
            p.runtime = 0;
            p.state = ProcessState::Runnable;
            p.pid
        };
        let timeslice = table.timeslice_for(weight);
        table.get_mut(slot).timeslice = timeslice;
        crate::println!("[PROC] PID {} forked child PID {}", parent.pid, pid);
        Ok(pid)
    }

    /// Exit the process in `slot`; does not return.
    ///
    /// The process stays a Zombie until its parent reaps it with `wait`.
    pub fn exit(&self, slot: usize, status: i32) -> ! {
        let table = self.begin_exit(slot, status);
        let _table = self.sched(table, slot);
        panic!("zombie exit");
    }

    /// Everything `exit` does short of giving up the CPU. Returns the held
    /// table lock with `slot` already a Zombie.
    pub(crate) fn begin_exit(&self, slot: usize, status: i32) -> TableGuard<'_> {
        let (files, cwd) = {
            let mut table = self.lock_table();
            if table.init_slot() == Some(slot) {
                panic!("init exiting");
            }
            let p = table.get_mut(slot);
            (core::mem::take(&mut p.open_files), p.cwd.take())
        };
        // Closing files may block, so it happens outside the table lock.
        drop(files);
        drop(cwd);

        let mut table = self.lock_table();

        // The parent might be sleeping in wait().
        let parent = table.get(slot).parent.and_then(|r| table.resolve(r));
        if let Some(parent) = parent {
            let parent_pid = table.get(parent).pid;
            table.wakeup(Channel::Process(parent_pid));
        }

        // Pass abandoned children to init.
        let init = table.init_slot().map(|init| table.proc_ref(init));
        let children: Vec<usize> = table.children_of(slot).collect();
        let mut orphaned_zombie = false;
        for child in children {
            let c = table.get_mut(child);
            c.parent = init;
            orphaned_zombie |= c.state == ProcessState::Zombie;
        }
        if let (true, Some(init)) = (orphaned_zombie, init) {
            table.wakeup(Channel::Process(init.pid));
        }

        let p = table.get_mut(slot);
        p.exit_code = Some(status);
        p.state = ProcessState::Zombie;
        crate::println!("[PROC] PID {} exited with code {}", p.pid, status);
        table
    }

    /// Wait for a child of `slot` to exit; returns its pid.
    pub fn wait(&self, slot: usize) -> Result<ProcessId, ProcessError> {
        self.wait_status(slot).map(|(pid, _)| pid)
    }

    /// Like `wait`, also returning the child's exit status.
    pub fn wait_status(&self, slot: usize) -> Result<(ProcessId, i32), ProcessError> {
        let mut table = self.lock_table();
        loop {
            let children: Vec<usize> = table.children_of(slot).collect();
            if children.is_empty() {
                return Err(ProcessError::NoChildren);
            }

            let zombie = children
                .iter()
                .copied()
                .find(|&child| table.get(child).state == ProcessState::Zombie);
            if let Some(child) = zombie {
                let (pid, status, kstack, space) = {
                    let c = table.get_mut(child);
                    (c.pid, c.exit_code.unwrap_or(0), c.kstack.take(), c.space.take())
                };
                table.release_slot(child);
                drop(table);

                if let Some(kstack) = kstack {
                    self.vm.free_frame(kstack);
                }
                if let Some(space) = space {
                    space.release(self.vm);
                }
                crate::println!("[PROC] reaped PID {} (status {})", pid, status);
                return Ok((pid, status));
            }

            if table.get(slot).killed {
                return Err(ProcessError::Killed);
            }
            let pid = table.get(slot).pid;
            table = self.sleep_locked(slot, Channel::Process(pid), table);
        }
    }

    /// Atomically release `guard` and sleep on `chan`; reacquires `lock`
    /// when woken.
    pub fn sleep<'a, T>(
        &'a self,
        slot: usize,
        chan: Channel,
        lock: &'a Mutex<T>,
        guard: IrqGuard<'a, T>,
    ) -> IrqGuard<'a, T> {
        // Holding the table lock before dropping `guard` means no wakeup on
        // `chan` can slip in between.
        let table = self.lock_table();
        drop(guard);
        let table = self.sleep_locked(slot, chan, table);
        drop(table);
        self.lock_irq(lock)
    }

    /// `sleep` for callers that already hold the table lock.
    pub fn sleep_locked<'a>(&self, slot: usize, chan: Channel, mut table: TableGuard<'a>) -> TableGuard<'a> {
        let p = table.get_mut(slot);
        p.chan = Some(chan);
        p.state = ProcessState::Sleeping;

        let mut table = self.sched(table, slot);
        table.get_mut(slot).chan = None;
        table
    }

    /// Sleep for `n` clock ticks.
    pub fn sleep_ticks(&self, slot: usize, n: u64) -> Result<(), ProcessError> {
        let mut guard = self.lock_ticks();
        let start = self.ticks();
        while self.ticks() - start < n {
            if self.lock_table().get(slot).killed {
                return Err(ProcessError::Killed);
            }
            guard = self.sleep(slot, Channel::Ticks, &self.tickslock, guard);
        }
        drop(guard);
        Ok(())
    }

    /// Wake every process sleeping on `chan`; returns how many woke.
    pub fn wakeup(&self, chan: Channel) -> usize {
        self.lock_table().wakeup(chan)
    }

    pub fn kill(&self, pid: ProcessId) -> Result<(), ProcessError> {
        self.lock_table().kill(pid)?;
        crate::println!("[PROC] PID {} killed", pid);
        Ok(())
    }

    pub fn process_name(&self, pid: ProcessId) -> Result<String, ProcessError> {
        self.lock_table().name_of(pid).map(String::from)
    }

    pub fn get_nice(&self, pid: ProcessId) -> Result<usize, ProcessError> {
        self.lock_table().nice(pid)
    }

    pub fn set_nice(&self, pid: ProcessId, nice: usize) -> Result<(), ProcessError> {
        self.lock_table().set_nice(pid, nice)
    }

    pub fn list_processes(&self) -> Vec<ProcessInfo> {
        self.lock_table().list()
    }

    /// The `ps` table for `pid`, or for every process when `None`.
    pub fn ps(&self, pid: Option<ProcessId>) -> String {
        let rows: Vec<ProcessInfo> = self
            .list_processes()
            .into_iter()
            .filter(|row| pid.map_or(true, |pid| row.pid == pid))
            .collect();
        format_ps(&rows, self.ticks())
    }

    /// Grow (or shrink) the ordinary memory of `slot` by `n` bytes; returns
    /// the previous size.
    pub fn grow(&self, slot: usize, n: isize) -> Result<usize, ProcessError> {
        let (space, size) = {
            let table = self.lock_table();
            let p = table.get(slot);
            (p.space.clone(), p.size)
        };
        let space = space.ok_or(ProcessError::OutOfMemory)?;

        let target = if n >= 0 {
            size.checked_add(n.unsigned_abs())
        } else {
            size.checked_sub(n.unsigned_abs())
        };
        // Ordinary memory must stay below the mapping area.
        let target = target
            .filter(|&t| t as u64 <= MMAP_BASE)
            .ok_or(ProcessError::OutOfMemory)?;
        let new_size = self
            .vm
            .grow_space(space.id(), size, target)
            .ok_or(ProcessError::OutOfMemory)?;

        self.lock_table().get_mut(slot).size = new_size;
        Ok(size)
    }

    /// Put `file` in the lowest free descriptor of `slot`.
    pub fn install_file(&self, slot: usize, file: FileRef) -> Result<usize, ProcessError> {
        let mut table = self.lock_table();
        let files = &mut table.get_mut(slot).open_files;
        let fd = files
            .iter()
            .position(Option::is_none)
            .ok_or(ProcessError::TooManyFiles)?;
        files[fd] = Some(file);
        Ok(fd)
    }

    pub fn file(&self, slot: usize, fd: usize) -> Option<FileRef> {
        self.lock_table().get(slot).open_files.get(fd).cloned().flatten()
    }

    /// Register a mapping region in the address space of `slot`. `fd` names
    /// the backing file; it is ignored for anonymous mappings.
    #[allow(clippy::too_many_arguments)]
    pub fn mmap(
        &self,
        slot: usize,
        addr: u64,
        length: usize,
        prot: Prot,
        flags: MapFlags,
        fd: Option<usize>,
        offset: usize,
    ) -> Result<VirtAddr, MmapError> {
        let (space, file) = {
            let table = self.lock_table();
            let p = table.get(slot);
            let file = fd.and_then(|fd| p.open_files.get(fd).cloned().flatten());
            (p.space.clone(), file)
        };
        let space = space.ok_or(MmapError::NoAddressSpace)?;
        space.mmap(
            self.vm,
            MmapRequest {
                addr,
                length,
                prot,
                flags,
                file,
                offset,
            },
        )
    }

    pub fn munmap(&self, slot: usize, addr: VirtAddr) -> Result<(), MmapError> {
        let space = self
            .lock_table()
            .get(slot)
            .space
            .clone()
            .ok_or(MmapError::NoAddressSpace)?;
        space.munmap(self.vm, addr)
    }

    /// Number of free physical frames
    pub fn free_mem(&self) -> usize {
        self.vm.free_frames()
    }

    /// Resolve a user page fault of `slot` at `addr`.
    ///
    /// A page the table refused to take kills the process here; every other
    /// error is left to the trap path.
    pub fn handle_page_fault(
        &self,
        slot: usize,
        addr: VirtAddr,
        error: PageFaultErrorCode,
    ) -> Result<(), FaultError> {
        let access = if error.contains(PageFaultErrorCode::CAUSED_BY_WRITE) {
            FaultType::Write
        } else {
            FaultType::Read
        };
        let (pid, space) = {
            let table = self.lock_table();
            let p = table.get(slot);
            (p.pid, p.space.clone())
        };
        let space = space.ok_or(FaultError::NoRegion)?;

        let result = space.handle_fault(self.vm, addr, access);
        if let Err(e) = result {
            crate::println!(
                "[FAULT] PID {}: {:?} at {:#x}: {}",
                pid,
                access,
                addr.as_u64(),
                e
            );
            if let FaultError::InstallFailed(_) = e {
                self.lock_table().get_mut(slot).killed = true;
            }
        }
        result
    }
}
