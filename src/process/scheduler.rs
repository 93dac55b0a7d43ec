// Process Scheduler for the CFS kernel
use core::sync::atomic::Ordering;

use crate::kernel::{Kernel, TableGuard};
use crate::param::{NICE_0_WEIGHT, TICK_RUNTIME, TIMESLICE_SCALE};
use crate::process::pcb::{Channel, ProcessId, ProcessState, ProcessTable};

impl ProcessTable {
    /// The Runnable slot with the least vruntime; ties go to the lowest slot.
    pub fn pick_next(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (slot, p) in self.iter() {
            if p.state != ProcessState::Runnable {
                continue;
            }
            match best {
                Some(b) if self.get(b).vruntime <= p.vruntime => {}
                _ => best = Some(slot),
            }
        }
        best
    }

    /// Share of the scheduling period a process of `weight` gets right now
    pub fn timeslice_for(&self, weight: u32) -> u64 {
        TIMESLICE_SCALE * u64::from(weight) / self.runnable_weight().max(1)
    }

    /// Mark `slot` Running at tick `now` with a fresh time slice.
    ///
    /// The slice is computed while the process still counts as Runnable.
    pub fn dispatch(&mut self, slot: usize, now: u64) {
        let timeslice = self.timeslice_for(self.get(slot).weight);
        let p = self.get_mut(slot);
        p.timeslice = timeslice;
        p.dispatched_at = now;
        p.state = ProcessState::Running;
    }

    /// Charge one timer tick to the process in `slot`: runtime grows by a
    /// fixed amount, vruntime by the same amount scaled down by weight.
    pub fn charge_tick(&mut self, slot: usize) {
        let p = self.get_mut(slot);
        p.runtime = p.runtime.saturating_add(TICK_RUNTIME);
        let delta = TICK_RUNTIME * NICE_0_WEIGHT / u64::from(p.weight.max(1));
        p.vruntime = p.vruntime.saturating_add(delta);
    }
}

/// Scheduler statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    pub current_process: Option<ProcessId>,
    pub total_switches: u64,
    pub runnable: usize,
    pub runnable_weight: u64,
    pub ticks: u64,
}

impl Kernel {
    /// One pass of the per-CPU scheduler loop. Returns whether a process ran.
    pub fn run_once(&self, cpu: usize) -> bool {
        // Let devices interrupt an otherwise idle loop.
        self.runtime.enable_interrupts();

        let mut table = self.lock_table();
        let Some(slot) = table.pick_next() else {
            return false;
        };
        table.dispatch(slot, self.ticks());
        self.cpus[cpu].set_current(Some(slot));
        self.switches.fetch_add(1, Ordering::Relaxed);

        // The process runs until it hands the CPU back; it must have left
        // the Running state by then.
        let _table = self.runtime.resume(cpu, table, slot);
        self.cpus[cpu].set_current(None);
        true
    }

    /// Per-CPU scheduler; never returns.
    pub fn scheduler(&self, cpu: usize) -> ! {
        crate::println!("[SCHED] cpu {}: scheduler started", cpu);
        loop {
            if !self.run_once(cpu) {
                self.runtime.wait_for_interrupt();
            }
        }
    }

    /// Give the CPU back to the scheduler. The caller holds the table lock
    /// and has already moved `slot` out of Running.
    pub(crate) fn sched<'a>(&self, table: TableGuard<'a>, slot: usize) -> TableGuard<'a> {
        if table.get(slot).state == ProcessState::Running {
            panic!("sched running");
        }
        if self.runtime.interrupts_enabled() {
            panic!("sched interruptible");
        }
        self.runtime.suspend(self.runtime.cpu_id(), table, slot)
    }

    /// Give up the CPU for one scheduling round.
    pub fn yield_now(&self, slot: usize) {
        let mut table = self.lock_table();
        table.get_mut(slot).state = ProcessState::Runnable;
        let _table = self.sched(table, slot);
    }

    /// First code a new process runs in kernel mode, on the way to user space.
    ///
    /// # Safety
    /// Must be called exactly once, from the context `Runtime::fork_entry`
    /// started, while the table lock taken by the resuming scheduler is still
    /// held.
    pub unsafe fn fork_ret(&self) {
        // The scheduler's guard stays on its own stack; release the lock it
        // holds on our behalf.
        self.table.force_unlock();
        self.runtime.pop_off();
    }

    /// Timer interrupt bookkeeping for `cpu`: advance the clock (CPU 0 only)
    /// and charge the tick to whatever is running here.
    pub fn clock_tick(&self, cpu: usize) {
        if cpu == 0 {
            let _guard = self.lock_ticks();
            self.ticks.fetch_add(1, Ordering::Relaxed);
            self.wakeup(Channel::Ticks);
        }
        if let Some(slot) = self.cpus[cpu].current() {
            let mut table = self.lock_table();
            if table.get(slot).state == ProcessState::Running {
                table.charge_tick(slot);
            }
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> SchedulerStats {
        let current = self.current();
        let table = self.lock_table();
        SchedulerStats {
            current_process: current.map(|slot| table.get(slot).pid),
            total_switches: self.switches.load(Ordering::Relaxed),
            runnable: table
                .iter()
                .filter(|(_, p)| p.state == ProcessState::Runnable)
                .count(),
            runnable_weight: table.runnable_weight(),
            ticks: self.ticks(),
        }
    }
}
