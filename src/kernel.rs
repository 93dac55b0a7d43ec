// Kernel instance: the process table, per-CPU state and the platform hooks
use alloc::string::String;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::AtomicU64;
use spin::{Mutex, MutexGuard};

use crate::memory::Vm;
use crate::param::NCPU;
use crate::process::context::{Cpu, Runtime};
use crate::process::pcb::{Channel, ProcessError, ProcessId, ProcessInfo, ProcessTable};

/// Spin lock held with interrupts off on this CPU.
///
/// Interrupts are pushed off before locking and popped only after the lock
/// is released, so an interrupt handler on the same CPU never spins on it.
pub struct IrqGuard<'a, T> {
    inner: ManuallyDrop<MutexGuard<'a, T>>,
    runtime: &'a dyn Runtime,
}

/// Held process-table lock
pub type TableGuard<'a> = IrqGuard<'a, ProcessTable>;

impl<T> Deref for IrqGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> DerefMut for IrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for IrqGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: `inner` is never touched again.
        unsafe { ManuallyDrop::drop(&mut self.inner) };
        self.runtime.pop_off();
    }
}

pub struct Kernel {
    pub(crate) table: Mutex<ProcessTable>,
    pub(crate) cpus: [Cpu; NCPU],
    pub(crate) ticks: AtomicU64,
    /// Serializes tick updates against `sleep_ticks` sleepers
    pub(crate) tickslock: Mutex<()>,
    pub(crate) switches: AtomicU64,
    pub(crate) runtime: &'static dyn Runtime,
    pub(crate) vm: &'static dyn Vm,
}

impl Kernel {
    pub fn new(runtime: &'static dyn Runtime, vm: &'static dyn Vm) -> Self {
        Self {
            table: Mutex::new(ProcessTable::new()),
            cpus: core::array::from_fn(|_| Cpu::new()),
            ticks: AtomicU64::new(0),
            tickslock: Mutex::new(()),
            switches: AtomicU64::new(0),
            runtime,
            vm,
        }
    }

    pub fn runtime(&self) -> &'static dyn Runtime {
        self.runtime
    }

    pub fn vm(&self) -> &'static dyn Vm {
        self.vm
    }

    /// Lock `lock` with interrupts off on this CPU.
    pub fn lock_irq<'a, T>(&'a self, lock: &'a Mutex<T>) -> IrqGuard<'a, T> {
        self.runtime.push_off();
        IrqGuard {
            inner: ManuallyDrop::new(lock.lock()),
            runtime: self.runtime,
        }
    }

    pub fn lock_table(&self) -> TableGuard<'_> {
        self.lock_irq(&self.table)
    }

    /// The tick lock; the timer interrupt takes it too.
    pub fn lock_ticks(&self) -> IrqGuard<'_, ()> {
        self.lock_irq(&self.tickslock)
    }

    pub fn cpu(&self, id: usize) -> &Cpu {
        &self.cpus[id]
    }

    /// Slot of the process running on the calling CPU
    pub fn current(&self) -> Option<usize> {
        self.runtime.push_off();
        let slot = self.cpus[self.runtime.cpu_id()].current();
        self.runtime.pop_off();
        slot
    }

    pub fn current_pid(&self) -> Option<ProcessId> {
        let slot = self.current()?;
        Some(self.lock_table().get(slot).pid)
    }
}

static KERNEL: OnceCell<Kernel> = OnceCell::uninit();

/// Install the global kernel instance; fails if one already exists.
pub fn init(
    runtime: &'static dyn Runtime,
    vm: &'static dyn Vm,
) -> Result<&'static Kernel, conquer_once::TryInitError> {
    KERNEL.try_init_once(|| Kernel::new(runtime, vm))?;
    crate::console::attach_runtime(runtime);
    Ok(kernel())
}

/// The global kernel instance.
///
/// # Panics
/// If `init` has not run.
pub fn kernel() -> &'static Kernel {
    match KERNEL.get() {
        Some(kernel) => kernel,
        None => panic!("kernel not initialized"),
    }
}

fn current_slot() -> Result<usize, ProcessError> {
    kernel().current().ok_or(ProcessError::NoCurrentProcess)
}

// Kernel API functions, acting on the calling CPU's current process

pub fn fork() -> Result<ProcessId, ProcessError> {
    kernel().fork(current_slot()?)
}

pub fn exit(status: i32) -> ! {
    match current_slot() {
        Ok(slot) => kernel().exit(slot, status),
        Err(_) => panic!("exit without a current process"),
    }
}

pub fn wait() -> Result<ProcessId, ProcessError> {
    kernel().wait(current_slot()?)
}

pub fn kill(pid: ProcessId) -> Result<(), ProcessError> {
    kernel().kill(pid)
}

pub fn yield_now() {
    if let Ok(slot) = current_slot() {
        kernel().yield_now(slot);
    }
}

pub fn sleep_ticks(n: u64) -> Result<(), ProcessError> {
    kernel().sleep_ticks(current_slot()?, n)
}

pub fn wakeup(chan: Channel) -> usize {
    kernel().wakeup(chan)
}

pub fn get_nice(pid: ProcessId) -> Result<usize, ProcessError> {
    kernel().get_nice(pid)
}

pub fn set_nice(pid: ProcessId, nice: usize) -> Result<(), ProcessError> {
    kernel().set_nice(pid, nice)
}

pub fn list_processes() -> Vec<ProcessInfo> {
    kernel().list_processes()
}

pub fn ps(pid: Option<ProcessId>) -> String {
    kernel().ps(pid)
}
