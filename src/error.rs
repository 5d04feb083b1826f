//! Status codes returned by the operation surface.
//!
//! Mirrors the `{major, minor}` pair used throughout the cache: `Major` is an
//! exhaustive, compiler-checked taxonomy (see spec §7), `Minor` carries the
//! handful of sub-codes that distinguish why a given `Major` was raised.

use std::fmt;

/// Top-level status of a cache operation.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Major {
    #[error("not found")]
    NoEnt,
    #[error("already exists")]
    Exist,
    #[error("access denied")]
    Access,
    #[error("I/O error")]
    Io,
    #[error("not a directory")]
    NotDir,
    #[error("is a directory")]
    IsDir,
    #[error("directory not empty")]
    NotEmpty,
    #[error("cross-device link")]
    XDev,
    #[error("invalid argument")]
    Inval,
    #[error("stale handle")]
    Stale,
    #[error("bad cookie")]
    BadCookie,
    #[error("out of memory")]
    NoMem,
    #[error("directory entry overflow")]
    Overflow,
    #[error("internal server fault")]
    ServerFault,
    #[error("operation would delay, retry")]
    Delay,
    #[error("bad handle")]
    BadHandle,
}

/// Sub-code carried alongside a [`Major`] for the cases where "why" matters
/// to the caller (mostly `Stale` and `ServerFault`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Minor {
    #[default]
    None,
    /// `Stale`: the sub-provider itself reported the handle is gone.
    SubProviderStale,
    /// `Stale`: the node was already marked `UNREACHABLE` by a previous op.
    AlreadyUnreachable,
    /// `ServerFault`: a hash collision persisted after all retries.
    HashCollision,
    /// `ServerFault`: an invariant that should be unreachable was violated.
    InvariantViolation,
    /// `Delay`: a full-population `readdir` pass ended before EOD.
    PartialReaddir,
    /// `Delay`: a rename lock-ordering retry backed off.
    LockContention,
}

/// A status pair, as returned by every method on the operation surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    pub major: Major,
    pub minor: Minor,
}

impl Status {
    pub const fn new(major: Major) -> Self {
        Status { major, minor: Minor::None }
    }

    pub const fn with_minor(major: Major, minor: Minor) -> Self {
        Status { major, minor }
    }

    pub fn is_ok_shaped(&self) -> bool {
        // There is no `NoError` variant: success is `Ok(_)` at the Result
        // level. This helper exists for call sites that log a `Status`
        // regardless of whether it accompanies an `Ok` or `Err`.
        false
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minor {
            Minor::None => write!(f, "{}", self.major),
            minor => write!(f, "{} ({:?})", self.major, minor),
        }
    }
}

impl From<Major> for Status {
    fn from(major: Major) -> Self {
        Status::new(major)
    }
}

/// Result type used by every cache-facing operation.
pub type CacheResult<T> = Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_without_minor() {
        let s = Status::new(Major::NoEnt);
        assert_eq!(s.to_string(), "not found");
    }

    #[test]
    fn status_display_with_minor() {
        let s = Status::with_minor(Major::Stale, Minor::SubProviderStale);
        assert!(s.to_string().contains("stale handle"));
        assert!(s.to_string().contains("SubProviderStale"));
    }
}
