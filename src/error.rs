//! Error types for cluster-control operations

use thiserror::Error;

/// Structured domain error codes mirrored from the admin surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainCode {
    BadArgInstanceUnreachable,
    BadArgInstanceNotManaged,
    MemberMetadataMissing,
    AccountExists,
    MetadataNeedsUpgrade,
}

impl std::fmt::Display for DomainCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DomainCode::BadArgInstanceUnreachable => "SHERR_DBA_BADARG_INSTANCE_UNREACHABLE",
            DomainCode::BadArgInstanceNotManaged => "SHERR_DBA_BADARG_INSTANCE_NOT_MANAGED",
            DomainCode::MemberMetadataMissing => "SHERR_DBA_MEMBER_METADATA_MISSING",
            DomainCode::AccountExists => "SHERR_DBA_ACCOUNT_EXISTS",
            DomainCode::MetadataNeedsUpgrade => "SHERR_DBA_METADATA_NEEDS_UPGRADE",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone)]
pub enum ClusterControlError {
    #[error("Argument error: {0}")]
    ArgumentError(String),

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Value error: {0}")]
    ValueError(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("Logic error (this is a bug): {0}")]
    LogicError(String),

    #[error("Metadata error: {0}")]
    MetadataError(String),

    #[error("Parser error: {0}")]
    ParserError(String),

    #[error("{code}: {message}")]
    Domain { code: DomainCode, message: String },

    #[error("Instance isn't reachable.")]
    InstanceUnreachable,

    #[error("Metadata needs upgrade: installed {installed}, required {required}")]
    MetadataNeedsUpgrade { installed: u32, required: u32 },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),
}

impl ClusterControlError {
    pub fn domain(code: DomainCode, message: impl Into<String>) -> Self {
        ClusterControlError::Domain {
            code,
            message: message.into(),
        }
    }

    /// Check if this is a metadata-consistency error
    pub fn is_metadata_error(&self) -> bool {
        matches!(
            self,
            ClusterControlError::MetadataError(_)
                | ClusterControlError::MetadataNeedsUpgrade { .. }
        )
    }

    /// Check if this is an input-validation error
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            ClusterControlError::ArgumentError(_) | ClusterControlError::ValueError(_)
        )
    }

    /// Check if this is the unreachable-instance error
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ClusterControlError::InstanceUnreachable)
    }

    /// Check if this is a structured domain error (e.g. `AccountExists`).
    pub fn is_domain_error(&self) -> bool {
        matches!(self, ClusterControlError::Domain { .. })
    }

    /// Check if this is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClusterControlError::Timeout(_))
    }

    /// Whether the outer operation may retry this error inside a reconciliation loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterControlError::Timeout(_) | ClusterControlError::SessionError(_)
        )
    }
}

impl From<serde_json::Error> for ClusterControlError {
    fn from(err: serde_json::Error) -> Self {
        ClusterControlError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterControlError>;
