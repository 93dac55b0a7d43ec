// Kernel-wide tunables
/// Process table capacity
pub const NPROC: usize = 64;

/// Maximum number of CPUs running the scheduler loop
pub const NCPU: usize = 8;

/// Open files per process
pub const NOFILE: usize = 16;

/// Mapping regions per address space
pub const NMMAP: usize = 64;

/// Size of a physical frame and of a virtual page
pub const PAGE_SIZE: usize = 4096;

/// Kernel stack size of every process (one frame)
pub const KSTACK_SIZE: usize = PAGE_SIZE;

/// User addresses handed to mmap are offsets from this base
pub const MMAP_BASE: u64 = 0x4000_0000;

/// Nice value given to every freshly allocated process
pub const DEFAULT_NICE: usize = 20;

/// Numerator of the weighted time slice: `TIMESLICE_SCALE * weight / total_weight`
pub const TIMESLICE_SCALE: u64 = 10_000;

/// Runtime charged to the running process on every timer tick (milli-ticks)
pub const TICK_RUNTIME: u64 = 1_000;

/// Scale of the vruntime head start removed from a woken process
pub const WAKEUP_PENALTY: u64 = 1_000;

/// Weight of nice 20; vruntime advances at `runtime * NICE_0_WEIGHT / weight`
pub const NICE_0_WEIGHT: u64 = 1024;

/// Mapping regions must end at or below this address (start of kernel space)
pub const MMAP_LIMIT: u64 = 0x8000_0000;
