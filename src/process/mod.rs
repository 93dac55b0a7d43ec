// Process Management Module for the CFS kernel
pub mod context;
pub mod lifecycle;
pub mod pcb;
pub mod scheduler;
pub mod vruntime;

pub use context::{Context, Cpu, CpuRegisters, Runtime};
pub use pcb::{
    format_ps, weight_of, Channel, ProcRef, ProcessControlBlock, ProcessError, ProcessId,
    ProcessInfo, ProcessState, ProcessTable, MAX_NICE, WEIGHTS,
};
pub use scheduler::SchedulerStats;
pub use vruntime::ExtendedCounter;
