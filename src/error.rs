//! Errno-shaped errors.
//!
//! Low-level functions return these directly; callers propagate with `?` and
//! release any held pages on every exit path.

use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// Out of memory (an allocation budget was exceeded).
    Enomem,
    /// No such node; also returned for a truncated node page.
    Enoent,
    /// I/O error, or a node page whose footer does not match its NID.
    Eio,
    /// Out of space: block or NID budget exhausted.
    Enospc,
    /// Inconsistent argument or on-device record.
    Einval,
    /// Operation refused (allocation disabled on the inode).
    Eperm,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::Enomem => "out of memory",
            Error::Enoent => "no such node",
            Error::Eio => "I/O error",
            Error::Enospc => "no space left",
            Error::Einval => "invalid argument",
            Error::Eperm => "operation not permitted",
        };
        write!(f, "{}", s)
    }
}

impl std::error::Error for Error {}
