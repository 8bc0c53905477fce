// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling.

Every pipeline phase has its own error type. [BuildError] wraps them and is the
single error reported for a failed build. Its [std::fmt::Display] names the
phase that failed, the kind of failure and the underlying cause.
*/

use {
    strum::{Display, EnumIter, EnumString},
    thiserror::Error,
};

/// A stage of the repository build pipeline.
///
/// Variants are ordered in execution order.
#[derive(Clone, Copy, Debug, Display, EnumIter, EnumString, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Fetch,
    Index,
    Assemble,
    Sign,
    Publish,
}

impl Phase {
    /// Process exit code used when this phase fails.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Fetch => 2,
            Self::Index => 3,
            Self::Assemble => 4,
            Self::Sign => 5,
            Self::Publish => 6,
        }
    }
}

/// Classification of failures reported by remote collaborators.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum RemoteErrorKind {
    NotFound,
    Unauthorized,
    RateLimited,
    NetworkFailure,
    QuotaExceeded,
    /// A local filesystem failure while serving a remote operation.
    LocalIo,
}

/// An error from a release source or publish destination.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl ToString) -> Self {
        Self {
            kind,
            message: message.to_string(),
        }
    }

    pub fn not_found(message: impl ToString) -> Self {
        Self::new(RemoteErrorKind::NotFound, message)
    }

    pub fn network(message: impl ToString) -> Self {
        Self::new(RemoteErrorKind::NetworkFailure, message)
    }

    /// Whether the operation that produced this error may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::RateLimited | RemoteErrorKind::NetworkFailure
        )
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match e.kind() {
            ErrorKind::NotFound => RemoteErrorKind::NotFound,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::UnexpectedEof => RemoteErrorKind::NetworkFailure,
            _ => RemoteErrorKind::LocalIo,
        };

        Self::new(kind, e)
    }
}

/// Errors retrieving release assets.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("RateLimited: {0}")]
    RateLimited(String),

    #[error("NetworkFailure: {0}")]
    NetworkFailure(String),

    #[error("ChecksumMismatch: {name}: expected sha256 {expected}; got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("CacheIo: {0}: {1:?}")]
    CacheIo(String, std::io::Error),
}

impl From<RemoteError> for FetchError {
    fn from(e: RemoteError) -> Self {
        match e.kind {
            RemoteErrorKind::NotFound => Self::NotFound(e.message),
            RemoteErrorKind::Unauthorized => Self::Unauthorized(e.message),
            RemoteErrorKind::RateLimited | RemoteErrorKind::QuotaExceeded => {
                Self::RateLimited(e.message)
            }
            RemoteErrorKind::NetworkFailure => Self::NetworkFailure(e.message),
            RemoteErrorKind::LocalIo => Self::CacheIo(
                "asset cache".to_string(),
                std::io::Error::new(std::io::ErrorKind::Other, e.message),
            ),
        }
    }
}

/// Errors deriving package records from `.deb` files.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("MalformedControlFile: {path}: {reason}")]
    MalformedControlFile { path: String, reason: String },

    #[error("UnsupportedArchitecture: {path}: {architecture} is not a configured architecture")]
    UnsupportedArchitecture { path: String, architecture: String },
}

/// Errors writing the repository tree.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("IoFailure: {0}: {1:?}")]
    IoFailure(String, std::io::Error),
}

/// Errors obtaining keys or producing signatures.
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("KeyUnavailable: {0}")]
    KeyUnavailable(String),

    #[error("PassphraseRequired: {0}")]
    PassphraseRequired(String),

    #[error("SignatureVerifyFailed: {0}")]
    SignatureVerifyFailed(String),

    #[error("Pgp: {0:?}")]
    Pgp(#[from] pgp::errors::Error),

    #[error("Io: {0}: {1:?}")]
    Io(String, std::io::Error),
}

/// Errors publishing the repository tree.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("AuthFailure: {0}")]
    AuthFailure(String),

    #[error("QuotaExceeded: {0}")]
    QuotaExceeded(String),

    #[error("NetworkFailure: {0}")]
    NetworkFailure(String),

    #[error("ReleaseNotFound: {0}")]
    ReleaseNotFound(String),

    #[error("Io: {0}: {1:?}")]
    Io(String, std::io::Error),
}

impl From<RemoteError> for PublishError {
    fn from(e: RemoteError) -> Self {
        match e.kind {
            RemoteErrorKind::Unauthorized => Self::AuthFailure(e.message),
            RemoteErrorKind::QuotaExceeded => Self::QuotaExceeded(e.message),
            RemoteErrorKind::NotFound => Self::ReleaseNotFound(e.message),
            RemoteErrorKind::RateLimited | RemoteErrorKind::NetworkFailure => {
                Self::NetworkFailure(e.message)
            }
            RemoteErrorKind::LocalIo => Self::Io(
                "destination".to_string(),
                std::io::Error::new(std::io::ErrorKind::Other, e.message),
            ),
        }
    }
}

/// Error for a failed build.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("fetch phase failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("index phase failed: {0}")]
    Index(#[from] ParseError),

    #[error("assemble phase failed: {0}")]
    Assemble(#[from] AssemblyError),

    #[error("sign phase failed: {0}")]
    Sign(#[from] SigningError),

    #[error("publish phase failed: {0}")]
    Publish(#[from] PublishError),

    #[error("{0} phase cancelled")]
    Cancelled(Phase),
}

impl BuildError {
    /// The phase that failed, if the failure is attributable to one.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Config(_) => None,
            Self::Fetch(_) => Some(Phase::Fetch),
            Self::Index(_) => Some(Phase::Index),
            Self::Assemble(_) => Some(Phase::Assemble),
            Self::Sign(_) => Some(Phase::Sign),
            Self::Publish(_) => Some(Phase::Publish),
            Self::Cancelled(phase) => Some(*phase),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Cancelled(_) => 130,
            _ => self.phase().map(|p| p.exit_code()).unwrap_or(1),
        }
    }
}

/// Result wrapper for pipeline operations.
pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod test {
    use {super::*, std::str::FromStr, strum::IntoEnumIterator};

    #[test]
    fn exit_codes_are_distinct() {
        let mut codes = Phase::iter().map(|p| p.exit_code()).collect::<Vec<_>>();
        codes.push(BuildError::Config("x".into()).exit_code());
        codes.push(BuildError::Cancelled(Phase::Fetch).exit_code());
        let count = codes.len();
        codes.sort_unstable();
        codes.dedup();

        assert_eq!(codes.len(), count);
        assert!(!codes.contains(&0));
    }

    #[test]
    fn summary_names_phase_and_kind() {
        let err = BuildError::from(FetchError::from(RemoteError::not_found(
            "release v1.0 of foo/bar",
        )));

        assert_eq!(
            err.to_string(),
            "fetch phase failed: NotFound: release v1.0 of foo/bar"
        );
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.phase(), Some(Phase::Fetch));
    }

    #[test]
    fn remote_errors_map_to_publish_kinds() {
        let err = PublishError::from(RemoteError::new(RemoteErrorKind::Unauthorized, "bad token"));
        assert!(matches!(err, PublishError::AuthFailure(_)));

        let err = PublishError::from(RemoteError::new(RemoteErrorKind::QuotaExceeded, "full"));
        assert!(matches!(err, PublishError::QuotaExceeded(_)));

        let err = PublishError::from(RemoteError::new(RemoteErrorKind::RateLimited, "slow"));
        assert!(matches!(err, PublishError::NetworkFailure(_)));
    }

    #[test]
    fn phase_names() -> std::result::Result<(), strum::ParseError> {
        assert_eq!(Phase::from_str("assemble")?, Phase::Assemble);
        assert_eq!(Phase::Publish.to_string(), "publish");

        Ok(())
    }

    #[test]
    fn transient_kinds() {
        assert!(RemoteError::network("reset").is_transient());
        assert!(RemoteError::new(RemoteErrorKind::RateLimited, "429").is_transient());
        assert!(!RemoteError::not_found("gone").is_transient());
    }

    #[test]
    fn local_disk_errors_are_permanent() {
        let full = RemoteError::from(std::io::Error::new(
            std::io::ErrorKind::Other,
            "no space left on device",
        ));
        assert_eq!(full.kind, RemoteErrorKind::LocalIo);
        assert!(!full.is_transient());
        assert!(matches!(FetchError::from(full), FetchError::CacheIo(..)));

        let denied = RemoteError::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!denied.is_transient());
        assert!(matches!(PublishError::from(denied), PublishError::Io(..)));

        let reset = RemoteError::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(reset.is_transient());
    }
}
