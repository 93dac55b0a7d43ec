// src/syscalls.rs
use core::fmt;
use x86_64::VirtAddr;

use crate::error::ErrorKind;
use crate::kernel::Kernel;
use crate::memory::{MapFlags, MmapError, Prot};
use crate::process::{CpuRegisters, ProcessError};

/// System call numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SyscallNumber {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Kill = 6,
    GetPid = 11,
    Sbrk = 12,
    Sleep = 13,
    Yield = 21,
    GetNice = 22,
    SetNice = 23,
    Ps = 24,
    Mmap = 25,
    Munmap = 26,
    FreeMem = 27,
    GetPName = 28,
}

impl SyscallNumber {
    pub fn from_u64(number: u64) -> Option<Self> {
        Some(match number {
            1 => SyscallNumber::Fork,
            2 => SyscallNumber::Exit,
            3 => SyscallNumber::Wait,
            6 => SyscallNumber::Kill,
            11 => SyscallNumber::GetPid,
            12 => SyscallNumber::Sbrk,
            13 => SyscallNumber::Sleep,
            21 => SyscallNumber::Yield,
            22 => SyscallNumber::GetNice,
            23 => SyscallNumber::SetNice,
            24 => SyscallNumber::Ps,
            25 => SyscallNumber::Mmap,
            26 => SyscallNumber::Munmap,
            27 => SyscallNumber::FreeMem,
            28 => SyscallNumber::GetPName,
            _ => return None,
        })
    }
}

/// System call arguments (up to 6 arguments in x86_64)
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallArgs {
    pub arg0: u64,  // rdi
    pub arg1: u64,  // rsi
    pub arg2: u64,  // rdx
    pub arg3: u64,  // r10
    pub arg4: u64,  // r8
    pub arg5: u64,  // r9
}

impl From<&CpuRegisters> for SyscallArgs {
    fn from(regs: &CpuRegisters) -> Self {
        Self {
            arg0: regs.rdi,
            arg1: regs.rsi,
            arg2: regs.rdx,
            arg3: regs.r10,
            arg4: regs.r8,
            arg5: regs.r9,
        }
    }
}

/// System call result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallResult {
    Success(u64),
    Error(SyscallError),
}

/// System call errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    InvalidSyscall,
    InvalidArgument,
    OutOfMemory,
    ProcessNotFound,
    NoChildren,
    Killed,
    InvalidMemoryRegion,
    BadFile,
    NoCurrentProcess,
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SyscallError::InvalidSyscall => write!(f, "Invalid syscall number"),
            SyscallError::InvalidArgument => write!(f, "Invalid argument"),
            SyscallError::OutOfMemory => write!(f, "Out of memory"),
            SyscallError::ProcessNotFound => write!(f, "Process not found"),
            SyscallError::NoChildren => write!(f, "No children"),
            SyscallError::Killed => write!(f, "Process killed"),
            SyscallError::InvalidMemoryRegion => write!(f, "Invalid memory region"),
            SyscallError::BadFile => write!(f, "Bad file descriptor"),
            SyscallError::NoCurrentProcess => write!(f, "No current process"),
        }
    }
}

impl From<ProcessError> for SyscallError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::NoFreeSlot | ProcessError::OutOfMemory | ProcessError::TooManyFiles => {
                SyscallError::OutOfMemory
            }
            ProcessError::NoSuchProcess => SyscallError::ProcessNotFound,
            ProcessError::NoChildren => SyscallError::NoChildren,
            ProcessError::InvalidNice => SyscallError::InvalidArgument,
            ProcessError::Killed => SyscallError::Killed,
            ProcessError::NoCurrentProcess => SyscallError::NoCurrentProcess,
        }
    }
}

impl From<MmapError> for SyscallError {
    fn from(e: MmapError) -> Self {
        match e {
            MmapError::BadFile => SyscallError::BadFile,
            other => match other.kind() {
                ErrorKind::ResourceExhausted => SyscallError::OutOfMemory,
                ErrorKind::InvalidReference | ErrorKind::AccessViolation => {
                    SyscallError::InvalidMemoryRegion
                }
            },
        }
    }
}

impl<E: Into<SyscallError>> From<Result<u64, E>> for SyscallResult {
    fn from(result: Result<u64, E>) -> Self {
        match result {
            Ok(value) => SyscallResult::Success(value),
            Err(e) => SyscallResult::Error(e.into()),
        }
    }
}

/// Convert syscall result to u64 for return value
impl From<SyscallResult> for u64 {
    fn from(result: SyscallResult) -> u64 {
        match result {
            SyscallResult::Success(value) => value,
            SyscallResult::Error(err) => {
                // Use high bit to indicate error
                0x8000_0000_0000_0000 | (err as u64)
            }
        }
    }
}

/// Descriptor value meaning "no file" in mmap
const NO_FD: i64 = -1;

/// Handle a system call made by the process in `caller`
pub fn handle_syscall(kernel: &Kernel, caller: usize, number: u64, args: SyscallArgs) -> SyscallResult {
    let Some(syscall) = SyscallNumber::from_u64(number) else {
        crate::println!("[SYSCALL] unknown syscall {}", number);
        return SyscallResult::Error(SyscallError::InvalidSyscall);
    };

    let result: SyscallResult = match syscall {
        SyscallNumber::Fork => kernel.fork(caller).into(),
        SyscallNumber::Exit => kernel.exit(caller, args.arg0 as i32),
        SyscallNumber::Wait => kernel.wait(caller).into(),
        SyscallNumber::Kill => kernel.kill(args.arg0).map(|_| 0u64).into(),
        SyscallNumber::GetPid => SyscallResult::Success(kernel.lock_table().get(caller).pid),
        SyscallNumber::Sbrk => kernel
            .grow(caller, args.arg0 as i64 as isize)
            .map(|old| old as u64)
            .into(),
        SyscallNumber::Sleep => kernel.sleep_ticks(caller, args.arg0).map(|_| 0u64).into(),
        SyscallNumber::Yield => {
            kernel.yield_now(caller);
            SyscallResult::Success(0)
        }
        SyscallNumber::GetNice => kernel.get_nice(args.arg0).map(|nice| nice as u64).into(),
        SyscallNumber::SetNice => kernel
            .set_nice(args.arg0, args.arg1 as usize)
            .map(|_| 0u64)
            .into(),
        SyscallNumber::Ps => {
            let pid = (args.arg0 != 0).then_some(args.arg0);
            crate::print!("{}", kernel.ps(pid));
            SyscallResult::Success(0)
        }
        SyscallNumber::Mmap => syscall_mmap(kernel, caller, args),
        SyscallNumber::Munmap => {
            let addr = VirtAddr::try_new(args.arg0).map_err(|_| MmapError::NotMapped);
            addr.and_then(|addr| kernel.munmap(caller, addr))
                .map(|_| 0u64)
                .into()
        }
        SyscallNumber::FreeMem => SyscallResult::Success(kernel.free_mem() as u64),
        SyscallNumber::GetPName => kernel
            .process_name(args.arg0)
            .map(|name| {
                crate::println!("{}", name);
                0u64
            })
            .into(),
    };

    if let SyscallResult::Error(e) = result {
        crate::println!("[SYSCALL] {:?} failed: {}", syscall, e);
    }
    result
}

/// mmap(addr, length, prot, flags, fd, offset)
fn syscall_mmap(kernel: &Kernel, caller: usize, args: SyscallArgs) -> SyscallResult {
    let fd = match args.arg4 as i64 {
        NO_FD => None,
        fd if fd >= 0 => Some(fd as usize),
        _ => return SyscallResult::Error(SyscallError::BadFile),
    };
    kernel
        .mmap(
            caller,
            args.arg0,
            args.arg1 as usize,
            Prot::from_bits(args.arg2 as u32),
            MapFlags::from_bits(args.arg3 as u32),
            fd,
            args.arg5 as usize,
        )
        .map(|addr| addr.as_u64())
        .into()
}
