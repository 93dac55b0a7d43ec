// Trap entry: system calls, timer ticks, page faults and stray vectors
use x86_64::structures::idt::PageFaultErrorCode;
use x86_64::VirtAddr;

use crate::kernel::Kernel;
use crate::process::{CpuRegisters, ProcessState};
use crate::syscalls::{handle_syscall, SyscallArgs};

/// Why the CPU entered the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Syscall,
    Timer,
    PageFault {
        addr: VirtAddr,
        error: PageFaultErrorCode,
    },
    Spurious,
    /// Any other vector
    Other(u8),
}

/// Whether `frame` was saved while running in ring 3
pub fn from_user(frame: &CpuRegisters) -> bool {
    frame.cs & 3 == 3
}

impl Kernel {
    /// Common trap handler; `frame` holds the interrupted registers and
    /// receives the system call return value.
    pub fn on_trap(&self, trap: Trap, frame: &mut CpuRegisters) {
        let current = self.current();
        let user = from_user(frame);

        if trap == Trap::Syscall {
            let Some(slot) = current else {
                panic!("syscall without a current process");
            };
            self.exit_if_killed(slot);
            self.lock_table().get_mut(slot).registers = *frame;
            let result = handle_syscall(self, slot, frame.rax, SyscallArgs::from(&*frame));
            frame.rax = result.into();
            self.exit_if_killed(slot);
            return;
        }

        match trap {
            Trap::Timer => self.clock_tick(self.runtime.cpu_id()),
            Trap::PageFault { addr, error } => match current {
                Some(slot) => {
                    if self.handle_page_fault(slot, addr, error).is_err() {
                        self.lock_table().get_mut(slot).killed = true;
                    }
                }
                None => panic!("page fault at {:#x} with no process", addr.as_u64()),
            },
            Trap::Spurious => {
                crate::println!(
                    "[TRAP] cpu {}: spurious interrupt at {:#x}",
                    self.runtime.cpu_id(),
                    frame.rip
                );
            }
            Trap::Other(vector) => match current {
                Some(slot) if user => {
                    let pid = {
                        let mut table = self.lock_table();
                        let p = table.get_mut(slot);
                        p.killed = true;
                        p.pid
                    };
                    crate::println!(
                        "[TRAP] PID {}: trap {} at {:#x}, killing process",
                        pid,
                        vector,
                        frame.rip
                    );
                }
                _ => panic!("unexpected trap {} in kernel at {:#x}", vector, frame.rip),
            },
            Trap::Syscall => {}
        }

        let Some(slot) = current else { return };

        // A killed process only dies on its way back to user space.
        if user {
            self.exit_if_killed(slot);
        }

        let running = self.lock_table().get(slot).state == ProcessState::Running;
        if trap == Trap::Timer && running {
            self.yield_now(slot);
        }

        if user {
            self.exit_if_killed(slot);
        }
    }

    fn exit_if_killed(&self, slot: usize) {
        if self.lock_table().get(slot).killed {
            self.exit(slot, -1);
        }
    }
}
