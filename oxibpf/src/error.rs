//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate returns a variant below rather than
//! a bare `std::io::Error`, so callers can match on *kind* instead of parsing
//! a message. Syscall failures additionally carry the raw errno.

use std::fmt;

/// Coarse classification of a failed syscall, derived from its errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrnoKind {
    /// Worth retrying: EAGAIN, EINTR, EBUSY, ENOBUFS.
    Transient,
    /// EPERM, EACCES.
    Permission,
    /// ENOMEM, ENOSPC, EMFILE, ENFILE.
    Resource,
    /// ENOENT.
    NotFound,
    /// ENOSYS, EINVAL on a command the running kernel doesn't implement.
    Unsupported,
    /// Anything else; still carries the errno for diagnostics.
    Other,
}

impl ErrnoKind {
    pub fn classify(errno: i32) -> Self {
        match errno {
            libc::EAGAIN | libc::EINTR | libc::EBUSY | libc::ENOBUFS => ErrnoKind::Transient,
            libc::EPERM | libc::EACCES => ErrnoKind::Permission,
            libc::ENOMEM | libc::ENOSPC | libc::EMFILE | libc::ENFILE => ErrnoKind::Resource,
            libc::ENOENT => ErrnoKind::NotFound,
            libc::ENOSYS => ErrnoKind::Unsupported,
            _ => ErrnoKind::Other,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, ErrnoKind::Transient)
    }
}

/// Errno rendered with its libc mnemonic, e.g. `ENOENT (2)`.
#[derive(Debug, Clone, Copy)]
pub struct Errno(pub i32);

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            libc::EPERM => "EPERM",
            libc::ENOENT => "ENOENT",
            libc::EINTR => "EINTR",
            libc::EAGAIN => "EAGAIN",
            libc::EACCES => "EACCES",
            libc::EBUSY => "EBUSY",
            libc::EEXIST => "EEXIST",
            libc::EINVAL => "EINVAL",
            libc::ENOMEM => "ENOMEM",
            libc::ENOSPC => "ENOSPC",
            libc::EMFILE => "EMFILE",
            libc::ENFILE => "ENFILE",
            libc::ENOBUFS => "ENOBUFS",
            libc::ENOSYS => "ENOSYS",
            _ => "unknown errno",
        };
        write!(f, "{name} ({})", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("encoding error in {op}: {detail}")]
    Encoding { op: &'static str, detail: String },

    #[error("jump out of range resolving label `{label}`: offset {offset} does not fit in i16")]
    JumpOutOfRange { label: String, offset: i64 },

    #[error("{op} failed: {kind:?} errno={errno}")]
    SyscallFailed {
        op: &'static str,
        kind: ErrnoKind,
        errno: Errno,
        #[source]
        source: std::io::Error,
    },

    #[error("verifier rejected program `{name}`:\n{log}")]
    VerifierRejection { name: String, log: String },

    #[error("netlink request failed: {op} returned errno {errno}")]
    NetlinkError { op: &'static str, errno: Errno },

    #[error("ring buffer protocol violation: {detail}")]
    ProtocolViolation { detail: String },

    #[error("unsupported architecture: {0}")]
    ArchUnsupported(String),

    #[error("usage error: {0}")]
    UsageError(String),

    #[error("ELF parse error: {0}")]
    ElfParse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn syscall_failed(op: &'static str, errno: i32) -> Self {
        Error::SyscallFailed {
            op,
            kind: ErrnoKind::classify(errno),
            errno: Errno(errno),
            source: std::io::Error::from_raw_os_error(errno),
        }
    }

    /// Whether this error is worth retrying under the configured backoff policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SyscallFailed { kind, .. } if kind.is_retryable())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
