// Error classification shared by every subsystem
use core::fmt;

/// How a failed operation is recovered.
///
/// Kernel logic errors (lock discipline, init exiting, a zombie resuming) are
/// not represented here: they `panic!`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No free slot, frame or kernel stack; recovered by rolling back locally
    ResourceExhausted,
    /// Unknown pid or descriptor; reported to the caller
    InvalidReference,
    /// Fault outside any region or a forbidden access; the process is killed
    AccessViolation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::ResourceExhausted => write!(f, "resource exhausted"),
            ErrorKind::InvalidReference => write!(f, "invalid reference"),
            ErrorKind::AccessViolation => write!(f, "access violation"),
        }
    }
}
