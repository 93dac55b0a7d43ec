// Host test support: a scripted runtime and a booted kernel on the hosted VM
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;

use crate::fs::MemInode;
use crate::kernel::{Kernel, TableGuard};
use crate::memory::hosted::HostedVm;
use crate::memory::SpaceId;
use crate::process::{ProcessId, ProcessState, ProcessTable, Runtime};

/// Fake fork entry; never executed on the host.
pub const FORK_ENTRY: u64 = 0xdead_0000;

/// Runs while the table lock is held, in place of the other side of a
/// context switch.
pub type Hook = Box<dyn Fn(&mut ProcessTable, usize) + Send + Sync>;

/// Single-CPU runtime whose context switches call hooks instead.
///
/// Without a hook, `resume` lets the process give the CPU straight back
/// (Running becomes Runnable) and `suspend` reschedules the caller at once
/// (Runnable or Sleeping becomes Running; a Zombie stays dead).
pub struct ScriptedRuntime {
    enabled: AtomicBool,
    depth: AtomicUsize,
    on_resume: Mutex<Option<Hook>>,
    on_suspend: Mutex<Option<Hook>>,
    pub resumed: Mutex<Vec<usize>>,
    pub suspended: Mutex<Vec<usize>>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            on_resume: Mutex::new(None),
            on_suspend: Mutex::new(None),
            resumed: Mutex::new(Vec::new()),
            suspended: Mutex::new(Vec::new()),
        }
    }

    pub fn on_resume(&self, hook: impl Fn(&mut ProcessTable, usize) + Send + Sync + 'static) {
        *self.on_resume.lock() = Some(Box::new(hook));
    }

    pub fn on_suspend(&self, hook: impl Fn(&mut ProcessTable, usize) + Send + Sync + 'static) {
        *self.on_suspend.lock() = Some(Box::new(hook));
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

impl Runtime for ScriptedRuntime {
    fn cpu_id(&self) -> usize {
        0
    }

    fn enable_interrupts(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn interrupts_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && self.depth() == 0
    }

    fn push_off(&self) {
        self.depth.fetch_add(1, Ordering::SeqCst);
    }

    fn pop_off(&self) {
        let previous = self.depth.fetch_sub(1, Ordering::SeqCst);
        assert!(previous > 0, "pop_off without push_off");
    }

    fn wait_for_interrupt(&self) {}

    fn fork_entry(&self) -> u64 {
        FORK_ENTRY
    }

    fn resume<'a>(&self, _cpu: usize, mut guard: TableGuard<'a>, slot: usize) -> TableGuard<'a> {
        self.resumed.lock().push(slot);
        match self.on_resume.lock().as_ref() {
            Some(hook) => hook(&mut *guard, slot),
            None => {
                let p = guard.get_mut(slot);
                if p.state == ProcessState::Running {
                    p.state = ProcessState::Runnable;
                }
            }
        }
        guard
    }

    fn suspend<'a>(&self, _cpu: usize, mut guard: TableGuard<'a>, slot: usize) -> TableGuard<'a> {
        self.suspended.lock().push(slot);
        match self.on_suspend.lock().as_ref() {
            Some(hook) => hook(&mut *guard, slot),
            None => {
                let p = guard.get_mut(slot);
                if matches!(p.state, ProcessState::Runnable | ProcessState::Sleeping) {
                    p.state = ProcessState::Running;
                }
            }
        }
        guard
    }
}

/// A kernel with a running init process
pub struct Boot {
    pub kernel: &'static Kernel,
    pub vm: &'static HostedVm,
    pub runtime: &'static ScriptedRuntime,
    pub init: usize,
}

impl Boot {
    pub fn slot(&self, pid: ProcessId) -> usize {
        match self.kernel.lock_table().slot_of(pid) {
            Some(slot) => slot,
            None => panic!("no process with pid {}", pid),
        }
    }

    pub fn pid(&self, slot: usize) -> ProcessId {
        self.kernel.lock_table().get(slot).pid
    }

    pub fn space(&self, slot: usize) -> SpaceId {
        match self.kernel.lock_table().get(slot).space.as_ref() {
            Some(space) => space.id(),
            None => panic!("slot {} has no address space", slot),
        }
    }

    pub fn state(&self, slot: usize) -> ProcessState {
        self.kernel.lock_table().get(slot).state
    }

    /// Pretend `slot` is executing on CPU 0.
    pub fn run_as(&self, slot: usize) {
        self.kernel.lock_table().get_mut(slot).state = ProcessState::Running;
        self.kernel.cpu(0).set_current(Some(slot));
    }

    /// Fork a child of `parent` and return its slot.
    pub fn fork(&self, parent: usize) -> usize {
        let pid = self.kernel.fork(parent).unwrap();
        self.slot(pid)
    }
}

pub fn boot() -> Boot {
    boot_with(256)
}

/// Boot on a hosted VM with `frames` physical frames.
pub fn boot_with(frames: usize) -> Boot {
    let vm: &'static HostedVm = Box::leak(Box::new(HostedVm::new(frames)));
    let runtime: &'static ScriptedRuntime = Box::leak(Box::new(ScriptedRuntime::new()));
    let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(runtime, vm)));
    let pid = kernel
        .user_init(&[0x90, 0x90, 0xeb, 0xfe], Some(Arc::new(MemInode::new(1))))
        .unwrap();
    let init = kernel.lock_table().slot_of(pid).unwrap();
    Boot {
        kernel,
        vm,
        runtime,
        init,
    }
}
