//! Error types for udrm operations

use core::fmt;

use syscall::error::{
    EALREADY, EFAULT, EINVAL, EISCONN, ENOENT, ENOMEM, ENOTCONN, ENOTRECOVERABLE, ENOTTY,
    ESHUTDOWN,
};

/// udrm result type
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// udrm error type
///
/// Every control command and session operation reports failure through one of
/// these variants. Each maps to a fixed errno (see [`Error::errno`]), so the
/// signal a controller observes never changes between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed or oversized payload, unsupported flags
    InvalidArgument,
    /// Payload could not be read from caller memory
    FaultyInput,
    /// Operation requires a prior REGISTER
    NotConnected,
    /// Duplicate REGISTER or PLUG
    AlreadyConnected,
    /// UNPLUG on a channel with no monitor plugged
    Already,
    /// Device was already unregistered
    Shutdown,
    /// Allocation failed
    OutOfMemory,
    /// Unknown command code
    Unsupported,
    /// Unknown buffer or framebuffer handle
    NotFound,
    /// Mode objects already exist where none were expected
    Unrecoverable,
}

impl Error {
    /// Stable errno for this error
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument => EINVAL,
            Error::FaultyInput => EFAULT,
            Error::NotConnected => ENOTCONN,
            Error::AlreadyConnected => EISCONN,
            Error::Already => EALREADY,
            Error::Shutdown => ESHUTDOWN,
            Error::OutOfMemory => ENOMEM,
            Error::Unsupported => ENOTTY,
            Error::NotFound => ENOENT,
            Error::Unrecoverable => ENOTRECOVERABLE,
        }
    }

    /// Convert into the syscall error carried back to the caller
    pub fn into_syscall(self) -> syscall::Error {
        syscall::Error::new(self.errno())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument => write!(f, "Invalid argument"),
            Error::FaultyInput => write!(f, "Bad address"),
            Error::NotConnected => write!(f, "Device not registered"),
            Error::AlreadyConnected => write!(f, "Already connected"),
            Error::Already => write!(f, "Operation already done"),
            Error::Shutdown => write!(f, "Device shut down"),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::Unsupported => write!(f, "Unsupported command"),
            Error::NotFound => write!(f, "No such object"),
            Error::Unrecoverable => write!(f, "State not recoverable"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for syscall::Error {
    fn from(err: Error) -> Self {
        err.into_syscall()
    }
}
