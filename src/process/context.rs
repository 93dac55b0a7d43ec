// Context Switching for the CFS kernel
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::kernel::TableGuard;

/// Callee-saved registers of a suspended kernel thread.
///
/// Everything else is caller-saved and already on the kernel stack when the
/// platform switches away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Context {
    pub rip: u64,
    pub rsp: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl Context {
    /// A context that starts executing `entry` on the stack whose top is
    /// `stack_top`.
    pub fn new(entry: u64, stack_top: u64) -> Self {
        Self {
            rip: entry,
            rsp: stack_top,
            ..Self::default()
        }
    }
}

/// User registers saved on entry to the kernel (the trap frame)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,    // Instruction pointer
    pub rflags: u64, // CPU flags
    pub cs: u64,     // Code segment
    pub ss: u64,     // Stack segment
}

/// User code and data selectors (GDT entries 3 and 4, RPL 3)
pub const USER_CODE_SELECTOR: u64 = 0x1B;
pub const USER_DATA_SELECTOR: u64 = 0x23;

impl Default for CpuRegisters {
    fn default() -> Self {
        Self {
            rax: 0, rbx: 0, rcx: 0, rdx: 0,
            rsi: 0, rdi: 0, rbp: 0, rsp: 0,
            r8: 0, r9: 0, r10: 0, r11: 0,
            r12: 0, r13: 0, r14: 0, r15: 0,
            rip: 0, rflags: 0x202, // RFLAGS with interrupt flag set
            cs: USER_CODE_SELECTOR, ss: USER_DATA_SELECTOR,
        }
    }
}

/// Per-CPU scheduling state
pub struct Cpu {
    current: AtomicUsize,
}

const NO_PROCESS: usize = usize::MAX;

impl Cpu {
    pub const fn new() -> Self {
        Self {
            current: AtomicUsize::new(NO_PROCESS),
        }
    }

    /// Table slot of the process running on this CPU
    pub fn current(&self) -> Option<usize> {
        match self.current.load(Ordering::Acquire) {
            NO_PROCESS => None,
            slot => Some(slot),
        }
    }

    pub fn set_current(&self, slot: Option<usize>) {
        self.current.store(slot.unwrap_or(NO_PROCESS), Ordering::Release);
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Low-level CPU control supplied by the platform.
///
/// `resume` and `suspend` are the two halves of the context switch. Both are
/// entered with the process table locked and must return with it still
/// locked: the guard passed in stays on the caller's stack while the other
/// side runs, and is handed back when control returns here. The lock itself
/// is released by whichever side runs next (a freshly forked process does
/// so in `Kernel::fork_ret`).
pub trait Runtime: Send + Sync {
    /// Index of the executing CPU, below `NCPU`
    fn cpu_id(&self) -> usize;

    fn enable_interrupts(&self);

    fn interrupts_enabled(&self) -> bool;

    /// Disable interrupts, nesting.
    fn push_off(&self);

    /// Undo one `push_off`; interrupts come back on at depth zero if they
    /// were on before the first one.
    fn pop_off(&self);

    /// Halt until the next interrupt.
    fn wait_for_interrupt(&self);

    /// Address a new process's context starts at. It must call
    /// `Kernel::fork_ret` before returning to user space.
    fn fork_entry(&self) -> u64;

    /// Switch from the scheduler of `cpu` into the process in `slot`; returns
    /// once the process gives the CPU back through `suspend`.
    fn resume<'a>(&self, cpu: usize, guard: TableGuard<'a>, slot: usize) -> TableGuard<'a>;

    /// Switch from the process in `slot` back to the scheduler of `cpu`;
    /// returns once the scheduler resumes the process again.
    fn suspend<'a>(&self, cpu: usize, guard: TableGuard<'a>, slot: usize) -> TableGuard<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_tracks_current_slot() {
        let cpu = Cpu::new();
        assert_eq!(cpu.current(), None);
        cpu.set_current(Some(3));
        assert_eq!(cpu.current(), Some(3));
        cpu.set_current(None);
        assert_eq!(cpu.current(), None);
    }

    #[test]
    fn fresh_context_starts_at_entry() {
        let context = Context::new(0x1000, 0x8000);
        assert_eq!(context.rip, 0x1000);
        assert_eq!(context.rsp, 0x8000);
        assert_eq!(context.rbx, 0);
    }
}
