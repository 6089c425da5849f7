#[allow(unused_imports)]
use log::{debug, error, info, log, trace, warn};

use core::fmt;

use snafu::prelude::*;

/// Errno-style condition returned by the POSIX facade.
///
/// The numeric codes follow the usual Linux numbering so a stored
/// connection error can be surfaced through `getsockopt(SO_ERROR)`
/// unchanged.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// I/O error
    EIO,
    /// Bad file descriptor
    EBADF,
    /// Operation would block
    EWOULDBLOCK,
    /// Permission denied
    EACCES,
    /// Invalid argument
    EINVAL,
    /// Connection aborted
    ECONNABORTED,
    /// Socket is already connected
    EISCONN,
    /// Socket is not connected
    ENOTCONN,
    /// No route to host
    EHOSTUNREACH,
    /// Operation now in progress
    EINPROGRESS,
}

impl Errno {
    pub fn code(self) -> i32 {
        match self {
            Errno::EIO => 5,
            Errno::EBADF => 9,
            Errno::EWOULDBLOCK => 11,
            Errno::EACCES => 13,
            Errno::EINVAL => 22,
            Errno::ECONNABORTED => 103,
            Errno::EISCONN => 106,
            Errno::ENOTCONN => 107,
            Errno::EHOSTUNREACH => 113,
            Errno::EINPROGRESS => 115,
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The crate error type.
#[non_exhaustive]
#[derive(Snafu, Debug)]
#[snafu(context(suffix(false)))]
#[snafu(visibility(pub))]
pub enum Error {
    /// The remote host name did not resolve
    NotResolved,

    /// The SSH connection could not be established
    #[snafu(display("ssh connection failed: {msg}"))]
    SshConnect { msg: String },

    /// The remote host key was not accepted
    HostKeyRejected,

    /// Every offered authentication method failed
    AuthFailed,

    /// The mosh-server launch reply was missing or malformed
    #[snafu(display("bad mosh-server response: {msg}"))]
    BadHandshake { msg: String },

    /// A POSIX facade call failed
    #[snafu(display("file table operation failed: {errno}"))]
    Posix { errno: Errno },

    /// A configuration attribute is missing or malformed
    #[snafu(display("bad configuration: {msg}"))]
    BadConfig { msg: &'static str },

    /// Key material could not be parsed
    BadKey,

    #[snafu(display("{msg}"))]
    Custom { msg: &'static str },

    /// Program bug
    Bug,
}

impl Error {
    pub fn msg(m: &'static str) -> Error {
        Error::Custom { msg: m }
    }

    #[cold]
    #[track_caller]
    /// Panics in debug builds, returns [`Error::Bug`] in release.
    pub fn bug() -> Error {
        // Easier to find during development; release builds must not panic.
        if cfg!(debug_assertions) {
            panic!("Hit a bug");
        } else {
            Error::Bug
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Error {
        Error::Posix { errno }
    }
}

/// The crate result type.
pub type Result<T, E = Error> = core::result::Result<T, E>;

pub trait TrapBug<T> {
    /// `.trap()` is used like `.unwrap()` in situations never expected to
    /// fail. Instead of panicking in release builds it returns
    /// [`Error::bug()`].
    fn trap(self) -> Result<T, Error>;
}

impl<T, E> TrapBug<T> for Result<T, E> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        if let Ok(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
}

impl<T> TrapBug<T> for Option<T> {
    #[track_caller]
    fn trap(self) -> Result<T, Error> {
        if let Some(i) = self {
            Ok(i)
        } else {
            Err(Error::bug())
        }
    }
}
