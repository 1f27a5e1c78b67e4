//! Linux-style error codes surfaced to guest processes.
//!
//! Every fallible operation in the kernel core returns [`LxError`]. The guest
//! only ever observes the Linux error number; when an error originates from a
//! host API failure the host-level cause is kept alongside it so it can be
//! logged without leaking into the guest-visible result.

use std::error;
use std::fmt;
use std::io;

use libc::c_int;
use log::debug;

/// Result alias used by all kernel-core operations.
pub type LxResult<T> = Result<T, LxError>;

/// The error taxonomy observed by guests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LxErrorKind {
    /// Bad address supplied at an API boundary.
    Fault,
    /// Malformed argument.
    Inval,
    /// Allocation failure.
    NoMem,
    /// Generic I/O failure; the fallback for unmappable host errors.
    Io,
    /// Permission denied by mode bits or handle access mode.
    Acces,
    /// Operation forbidden by the file system driver.
    Perm,
    /// No such file or directory.
    NoEnt,
    /// Node already exists.
    Exist,
    /// A directory was required.
    NotDir,
    /// The node is a directory.
    IsDir,
    /// Directory not empty.
    NotEmpty,
    /// The mount does not belong to the node's file system.
    XDev,
    /// Write to a read-only mount or file system.
    RoFs,
    /// Too many levels of symbolic links.
    Loop,
    /// Operation not supported by the driver.
    OpNotSupp,
    /// Address range is not covered by managed sections. There is no Linux
    /// equivalent; it projects to `EFAULT` at the syscall boundary.
    InvalidAddress,
}

impl LxErrorKind {
    /// The `errno` value reported to the guest.
    pub fn errno(self) -> c_int {
        match self {
            LxErrorKind::Fault => libc::EFAULT,
            LxErrorKind::Inval => libc::EINVAL,
            LxErrorKind::NoMem => libc::ENOMEM,
            LxErrorKind::Io => libc::EIO,
            LxErrorKind::Acces => libc::EACCES,
            LxErrorKind::Perm => libc::EPERM,
            LxErrorKind::NoEnt => libc::ENOENT,
            LxErrorKind::Exist => libc::EEXIST,
            LxErrorKind::NotDir => libc::ENOTDIR,
            LxErrorKind::IsDir => libc::EISDIR,
            LxErrorKind::NotEmpty => libc::ENOTEMPTY,
            LxErrorKind::XDev => libc::EXDEV,
            LxErrorKind::RoFs => libc::EROFS,
            LxErrorKind::Loop => libc::ELOOP,
            LxErrorKind::OpNotSupp => libc::EOPNOTSUPP,
            LxErrorKind::InvalidAddress => libc::EFAULT,
        }
    }
}

/// An error carrying a guest-visible code and an optional host-level cause.
pub struct LxError {
    kind: LxErrorKind,
    cause: Option<io::Error>,
}

impl LxError {
    pub const FAULT: Self = Self::new(LxErrorKind::Fault);
    pub const INVAL: Self = Self::new(LxErrorKind::Inval);
    pub const NOMEM: Self = Self::new(LxErrorKind::NoMem);
    pub const IO: Self = Self::new(LxErrorKind::Io);
    pub const ACCES: Self = Self::new(LxErrorKind::Acces);
    pub const PERM: Self = Self::new(LxErrorKind::Perm);
    pub const NOENT: Self = Self::new(LxErrorKind::NoEnt);
    pub const EXIST: Self = Self::new(LxErrorKind::Exist);
    pub const NOTDIR: Self = Self::new(LxErrorKind::NotDir);
    pub const ISDIR: Self = Self::new(LxErrorKind::IsDir);
    pub const NOTEMPTY: Self = Self::new(LxErrorKind::NotEmpty);
    pub const XDEV: Self = Self::new(LxErrorKind::XDev);
    pub const ROFS: Self = Self::new(LxErrorKind::RoFs);
    pub const LOOP: Self = Self::new(LxErrorKind::Loop);
    pub const OPNOTSUPP: Self = Self::new(LxErrorKind::OpNotSupp);
    pub const INVALID_ADDRESS: Self = Self::new(LxErrorKind::InvalidAddress);

    const fn new(kind: LxErrorKind) -> Self {
        LxError { kind, cause: None }
    }

    /// Maps a host I/O failure onto the guest-visible taxonomy, keeping the
    /// original error as the cause.
    pub fn from_host(cause: io::Error) -> Self {
        use io::ErrorKind;

        let kind = match cause.kind() {
            ErrorKind::PermissionDenied => LxErrorKind::Acces,
            ErrorKind::NotFound => LxErrorKind::NoEnt,
            ErrorKind::AlreadyExists => LxErrorKind::Exist,
            ErrorKind::InvalidInput => LxErrorKind::Inval,
            ErrorKind::OutOfMemory => LxErrorKind::NoMem,
            ErrorKind::NotADirectory => LxErrorKind::NotDir,
            ErrorKind::IsADirectory => LxErrorKind::IsDir,
            ErrorKind::DirectoryNotEmpty => LxErrorKind::NotEmpty,
            ErrorKind::ReadOnlyFilesystem => LxErrorKind::RoFs,
            _ => LxErrorKind::Io,
        };

        debug!("host error mapped to {:?}: {}", kind, cause);
        LxError {
            kind,
            cause: Some(cause),
        }
    }

    pub fn kind(&self) -> LxErrorKind {
        self.kind
    }

    /// The `errno` value reported to the guest.
    pub fn errno(&self) -> c_int {
        self.kind.errno()
    }

    /// The host-level cause, when the error crossed a driver boundary.
    pub fn cause(&self) -> Option<&io::Error> {
        self.cause.as_ref()
    }
}

impl PartialEq for LxError {
    fn eq(&self, other: &Self) -> bool {
        // The cause never participates in equality; the guest-visible code
        // is the identity of the error.
        self.kind == other.kind
    }
}

impl Eq for LxError {}

impl fmt::Debug for LxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{:?} (errno {}, caused by {:?})", self.kind, self.errno(), cause),
            None => write!(f, "{:?} (errno {})", self.kind, self.errno()),
        }
    }
}

impl fmt::Display for LxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)
    }
}

impl error::Error for LxError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.cause.as_ref().map(|e| e as &(dyn error::Error + 'static))
    }
}

impl From<LxErrorKind> for LxError {
    fn from(kind: LxErrorKind) -> Self {
        LxError { kind, cause: None }
    }
}
