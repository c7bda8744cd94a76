//! Core error taxonomy shared by every subsystem.
//!
//! All failures crossing a subsystem boundary are one of six kinds. Nothing
//! panics across the job-queue boundary; handlers and workers pattern-match
//! on the kind to decide whether to retry, surface, or go read-only.

use thiserror::Error;

/// Classification of a core failure, used for HTTP/JSON-RPC mapping and for
/// retry decisions in the job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Dependency,
    Integrity,
    Fatal,
}

impl ErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller mistake: empty name, bad slug, oversized file, malformed params.
    #[error("{0}")]
    Validation(String),

    /// Unknown KB, missing document, absent project.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate name, concurrent delete, role already bound.
    #[error("{0}")]
    Conflict(String),

    /// An external collaborator (embedder, parser grammar, filesystem) is
    /// unavailable or misbehaving. Retried within the job's budget.
    #[error("{0}")]
    Dependency(String),

    /// A store invariant did not hold on read. The operation is aborted and
    /// state left untouched.
    #[error("{0}")]
    Integrity(String),

    /// Storage corruption or disk exhaustion. The store enters read-only
    /// mode and health reports critical.
    #[error("{0}")]
    Fatal(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::NotFound(_) => ErrorKind::NotFound,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::Dependency(_) => ErrorKind::Dependency,
            CoreError::Integrity(_) => ErrorKind::Integrity,
            CoreError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// HTTP status for the resource API surface.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Dependency => 503,
            ErrorKind::Integrity => 500,
            ErrorKind::Fatal => 500,
        }
    }

    /// Application error code for the JSON-RPC surface.
    pub fn rpc_code(&self) -> i64 {
        match self.kind() {
            ErrorKind::Validation => -32001,
            ErrorKind::NotFound => -32002,
            ErrorKind::Conflict => -32003,
            ErrorKind::Dependency => -32010,
            ErrorKind::Integrity => -32020,
            ErrorKind::Fatal => -32030,
        }
    }

    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Dependency)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }

    pub fn dependency(msg: impl Into<String>) -> Self {
        CoreError::Dependency(msg.into())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::StorageFull => CoreError::Fatal(format!("disk full: {e}")),
            _ => CoreError::Dependency(format!("io: {e}")),
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    CoreError::Fatal(format!("storage corrupt: {e}"))
                }
                ErrorCode::DiskFull => CoreError::Fatal(format!("disk full: {e}")),
                ErrorCode::ConstraintViolation => {
                    CoreError::Conflict(format!("constraint violated: {e}"))
                }
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    CoreError::Dependency(format!("store busy: {e}"))
                }
                _ => CoreError::Integrity(format!("storage: {e}")),
            },
            rusqlite::Error::QueryReturnedNoRows => {
                CoreError::NotFound("row not found".to_string())
            }
            _ => CoreError::Integrity(format!("storage: {e}")),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Validation(format!("invalid json: {e}"))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(CoreError::validation("x").http_status(), 400);
        assert_eq!(CoreError::not_found("x").http_status(), 404);
        assert_eq!(CoreError::conflict("x").http_status(), 409);
        assert_eq!(CoreError::dependency("x").http_status(), 503);
        assert_eq!(CoreError::Fatal("x".into()).http_status(), 500);
    }

    #[test]
    fn test_transient_detection() {
        assert!(CoreError::dependency("embedder down").is_transient());
        assert!(!CoreError::validation("bad name").is_transient());
        assert!(!CoreError::Fatal("corrupt".into()).is_transient());
    }

    #[test]
    fn test_rpc_codes_are_distinct() {
        let codes = [
            CoreError::validation("a").rpc_code(),
            CoreError::not_found("a").rpc_code(),
            CoreError::conflict("a").rpc_code(),
            CoreError::dependency("a").rpc_code(),
            CoreError::Integrity("a".into()).rpc_code(),
            CoreError::Fatal("a".into()).rpc_code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }
}
