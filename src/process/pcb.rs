// Process Control Block (PCB) and the process table
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::{self, Write};
use x86_64::structures::paging::PhysFrame;

use crate::error::ErrorKind;
use crate::fs::{FileRef, InodeRef};
use crate::memory::AddressSpace;
use crate::param::{DEFAULT_NICE, NICE_0_WEIGHT, NOFILE, NPROC, WAKEUP_PENALTY};
use crate::process::context::{Context, CpuRegisters};
use crate::process::vruntime::ExtendedCounter;

/// Process ID type
pub type ProcessId = u64;

/// Process state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unused,   // Free table slot
    Embryo,   // Being set up by allocate/fork
    Runnable, // Ready to run, waiting for CPU
    Running,  // Currently executing
    Sleeping, // Waiting on a channel
    Zombie,   // Exited, waiting to be reaped by the parent
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ProcessState::Unused => "UNUSED",
            ProcessState::Embryo => "EMBRYO",
            ProcessState::Runnable => "RUNNABLE",
            ProcessState::Running => "RUNNING",
            ProcessState::Sleeping => "SLEEPING",
            ProcessState::Zombie => "ZOMBIE",
        };
        f.pad(name)
    }
}

/// Scheduling weight of each nice value; every step is about 1.25x.
pub const WEIGHTS: [u32; 40] = [
    88761, 71755, 56483, 46273, 36291, 29154, 23254, 18705, 14949, 11916,
    9548, 7620, 6100, 4904, 3906, 3121, 2501, 1991, 1586, 1277,
    1024, 820, 655, 526, 423, 335, 272, 215, 172, 137,
    110, 87, 70, 56, 45, 36, 29, 23, 18, 15,
];

/// Highest accepted nice value
pub const MAX_NICE: usize = WEIGHTS.len() - 1;

pub fn weight_of(nice: usize) -> u32 {
    WEIGHTS[nice.min(MAX_NICE)]
}

/// Generation-checked reference to another table slot.
///
/// A slot can be reaped and reused; the pid tells the new owner apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcRef {
    pub slot: usize,
    pub pid: ProcessId,
}

/// Wait token a sleeping process is parked on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Children of the process with this pid changed state
    Process(ProcessId),
    /// The tick clock advanced
    Ticks,
    Token(usize),
}

/// Process Control Block (PCB)
pub struct ProcessControlBlock {
    pub pid: ProcessId,
    pub name: String,
    pub state: ProcessState,
    pub nice: usize,
    pub weight: u32,
    pub vruntime: ExtendedCounter,
    /// Accumulated runtime in milli-ticks
    pub runtime: u64,
    pub timeslice: u64,
    /// Tick at which the process was last dispatched
    pub dispatched_at: u64,
    pub parent: Option<ProcRef>,
    pub chan: Option<Channel>,
    pub killed: bool,
    pub exit_code: Option<i32>,
    pub open_files: [Option<FileRef>; NOFILE],
    pub cwd: Option<InodeRef>,
    pub space: Option<Arc<AddressSpace>>,
    /// Bytes of ordinary user memory, `[0, size)`
    pub size: usize,
    pub kstack: Option<PhysFrame>,
    pub context: Context,
    pub registers: CpuRegisters,
}

impl ProcessControlBlock {
    pub fn unused() -> Self {
        Self {
            pid: 0,
            name: String::new(),
            state: ProcessState::Unused,
            nice: DEFAULT_NICE,
            weight: weight_of(DEFAULT_NICE),
            vruntime: ExtendedCounter::ZERO,
            runtime: 0,
            timeslice: 0,
            dispatched_at: 0,
            parent: None,
            chan: None,
            killed: false,
            exit_code: None,
            open_files: core::array::from_fn(|_| None),
            cwd: None,
            space: None,
            size: 0,
            kstack: None,
            context: Context::default(),
            registers: CpuRegisters::default(),
        }
    }

    /// `runtime / weight`, the figure `ps` reports
    pub fn weighted_runtime(&self) -> u64 {
        self.runtime / u64::from(self.weight.max(1))
    }
}

impl Default for ProcessControlBlock {
    fn default() -> Self {
        Self::unused()
    }
}

/// One row of a process listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: ProcessId,
    pub state: ProcessState,
    pub nice: usize,
    pub weighted_runtime: u64,
    pub runtime: u64,
    pub vruntime: ExtendedCounter,
}

impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{:<8}\t{}\t{}\t{}\t{}",
            self.name, self.pid, self.state, self.nice, self.weighted_runtime, self.runtime, self.vruntime
        )
    }
}

/// Render a listing as the tab-separated `ps` table.
pub fn format_ps(rows: &[ProcessInfo], ticks: u64) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = writeln!(
        out,
        "name\tpid\tstate\t\tpriority\truntime/weight\truntime\tvruntime\ttick {}",
        ticks
    );
    for row in rows {
        let _ = writeln!(out, "{}", row);
    }
    out
}

/// Process management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    NoFreeSlot,
    OutOfMemory,
    NoSuchProcess,
    NoChildren,
    InvalidNice,
    TooManyFiles,
    Killed,
    NoCurrentProcess,
}

impl ProcessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::NoFreeSlot | ProcessError::OutOfMemory | ProcessError::TooManyFiles => {
                ErrorKind::ResourceExhausted
            }
            ProcessError::Killed => ErrorKind::AccessViolation,
            ProcessError::NoSuchProcess
            | ProcessError::NoChildren
            | ProcessError::InvalidNice
            | ProcessError::NoCurrentProcess => ErrorKind::InvalidReference,
        }
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcessError::NoFreeSlot => write!(f, "process table full"),
            ProcessError::OutOfMemory => write!(f, "out of memory"),
            ProcessError::NoSuchProcess => write!(f, "no such process"),
            ProcessError::NoChildren => write!(f, "no children to wait for"),
            ProcessError::InvalidNice => write!(f, "nice value out of range"),
            ProcessError::TooManyFiles => write!(f, "open file table full"),
            ProcessError::Killed => write!(f, "process was killed"),
            ProcessError::NoCurrentProcess => write!(f, "no current process"),
        }
    }
}

/// Fixed-capacity process table, guarded as a whole by the kernel's table lock
pub struct ProcessTable {
    procs: [ProcessControlBlock; NPROC],
    next_pid: ProcessId,
    init: Option<usize>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            procs: core::array::from_fn(|_| ProcessControlBlock::unused()),
            next_pid: 1,
            init: None,
        }
    }

    pub fn get(&self, slot: usize) -> &ProcessControlBlock {
        &self.procs[slot]
    }

    pub fn get_mut(&mut self, slot: usize) -> &mut ProcessControlBlock {
        &mut self.procs[slot]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ProcessControlBlock)> {
        self.procs.iter().enumerate()
    }

    /// Slot of the first user process, the adopter of orphans
    pub fn init_slot(&self) -> Option<usize> {
        self.init
    }

    pub fn set_init(&mut self, slot: usize) {
        self.init = Some(slot);
    }

    /// Take the first Unused slot, mark it Embryo and give it a fresh pid
    /// with default scheduling parameters.
    pub fn claim_slot(&mut self) -> Result<usize, ProcessError> {
        let slot = self
            .procs
            .iter()
            .position(|p| p.state == ProcessState::Unused)
            .ok_or(ProcessError::NoFreeSlot)?;
        let pid = self.next_pid;
        self.next_pid += 1;

        let p = &mut self.procs[slot];
        *p = ProcessControlBlock::unused();
        p.pid = pid;
        p.state = ProcessState::Embryo;
        Ok(slot)
    }

    /// Return `slot` to Unused, dropping every reference it still holds.
    pub fn release_slot(&mut self, slot: usize) {
        self.procs[slot] = ProcessControlBlock::unused();
    }

    /// Slot of the live process with `pid`
    pub fn slot_of(&self, pid: ProcessId) -> Option<usize> {
        self.procs
            .iter()
            .position(|p| p.state != ProcessState::Unused && p.pid == pid)
    }

    /// Current slot of `r`, if it still names the same process.
    pub fn resolve(&self, r: ProcRef) -> Option<usize> {
        let p = self.procs.get(r.slot)?;
        (p.state != ProcessState::Unused && p.pid == r.pid).then_some(r.slot)
    }

    pub fn proc_ref(&self, slot: usize) -> ProcRef {
        ProcRef {
            slot,
            pid: self.procs[slot].pid,
        }
    }

    /// Slots whose parent is `slot`
    pub fn children_of(&self, slot: usize) -> impl Iterator<Item = usize> + '_ {
        let parent = self.proc_ref(slot);
        self.procs
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.state != ProcessState::Unused && p.parent == Some(parent))
            .map(|(i, _)| i)
    }

    /// Sum of the weights of every Runnable process
    pub fn runnable_weight(&self) -> u64 {
        self.procs
            .iter()
            .filter(|p| p.state == ProcessState::Runnable)
            .map(|p| u64::from(p.weight))
            .sum()
    }

    pub fn min_runnable_vruntime(&self) -> Option<ExtendedCounter> {
        self.procs
            .iter()
            .filter(|p| p.state == ProcessState::Runnable)
            .map(|p| p.vruntime)
            .min()
    }

    /// Make every process sleeping on `chan` Runnable, placed just ahead of
    /// the current minimum vruntime. Returns how many were woken.
    pub fn wakeup(&mut self, chan: Channel) -> usize {
        let min = self.min_runnable_vruntime();
        let mut woken = 0;
        for p in self.procs.iter_mut() {
            if p.state != ProcessState::Sleeping || p.chan != Some(chan) {
                continue;
            }
            let bonus = WAKEUP_PENALTY * (NICE_0_WEIGHT / u64::from(p.weight.max(1)));
            p.vruntime = match min {
                Some(min) => min.saturating_sub(ExtendedCounter::from_u64(bonus)),
                None => ExtendedCounter::ZERO,
            };
            p.state = ProcessState::Runnable;
            woken += 1;
        }
        woken
    }

    /// Mark `pid` killed; a sleeping victim is made Runnable so it notices.
    pub fn kill(&mut self, pid: ProcessId) -> Result<(), ProcessError> {
        let slot = self.slot_of(pid).ok_or(ProcessError::NoSuchProcess)?;
        let p = &mut self.procs[slot];
        p.killed = true;
        if p.state == ProcessState::Sleeping {
            p.state = ProcessState::Runnable;
        }
        Ok(())
    }

    pub fn name_of(&self, pid: ProcessId) -> Result<&str, ProcessError> {
        let slot = self.slot_of(pid).ok_or(ProcessError::NoSuchProcess)?;
        Ok(&self.procs[slot].name)
    }

    pub fn nice(&self, pid: ProcessId) -> Result<usize, ProcessError> {
        let slot = self.slot_of(pid).ok_or(ProcessError::NoSuchProcess)?;
        Ok(self.procs[slot].nice)
    }

    pub fn set_nice(&mut self, pid: ProcessId, nice: usize) -> Result<(), ProcessError> {
        if nice > MAX_NICE {
            return Err(ProcessError::InvalidNice);
        }
        let slot = self.slot_of(pid).ok_or(ProcessError::NoSuchProcess)?;
        let p = &mut self.procs[slot];
        p.nice = nice;
        p.weight = weight_of(nice);
        Ok(())
    }

    /// Snapshot of every non-Unused slot, in slot order
    pub fn list(&self) -> Vec<ProcessInfo> {
        self.procs
            .iter()
            .filter(|p| p.state != ProcessState::Unused)
            .map(|p| ProcessInfo {
                name: p.name.clone(),
                pid: p.pid,
                state: p.state,
                nice: p.nice,
                weighted_runtime: p.weighted_runtime(),
                runtime: p.runtime,
                vruntime: p.vruntime,
            })
            .collect()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
