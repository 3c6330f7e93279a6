//! Error types surfaced by the dispatch core.

use std::io;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors the dispatch core can report.
///
/// Resolution and transport failures are always delivered through a
/// completion callback rather than propagated as a `Result` across an async
/// boundary; this type is what populates those callbacks (and is also used
/// for the handful of synchronous, fail-fast constructor paths).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No usable hop could be found for a URI: missing domain, exhausted
    /// resolution pipeline, or no leg could reach any candidate.
    #[error("no route to host")]
    HostUnreachable,

    /// A queue entry's 64*T1 sentinel elapsed with no successful delivery.
    #[error("delivery timed out")]
    TimedOut,

    /// The protocols allowed by the caller and the protocols usable for a
    /// URI (by scheme or `transport=` param) do not intersect.
    #[error("no acceptable protocol")]
    NoProtoOpt,

    /// A DNS lookup (SRV, A, or host2ip) failed.
    #[error("DNS resolution failed: {0}")]
    Dns(String),

    /// A malformed or unusable argument was passed to a public operation.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Transport-level I/O failure reported by a leg's `deliver`.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The errno-style mnemonic used in logs and in the externally visible
    /// error taxonomy (§6).
    pub fn errno(&self) -> &'static str {
        match self {
            Error::HostUnreachable => "EHOSTUNREACH",
            Error::TimedOut => "ETIMEDOUT",
            Error::NoProtoOpt => "ENOPROTOOPT",
            Error::Dns(_) => "EINVAL",
            Error::Invalid(_) => "EINVAL",
            Error::Io(_) => "EIO",
        }
    }
}
