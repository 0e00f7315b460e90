//! Typed errors for the storage engine.
//!
//! Every variant corresponds to a well-known S3 error code.  Domain
//! errors bubble up from the metadata and storage backends unchanged;
//! substrate failures (I/O, SQL, HTTP) are wrapped into
//! [`StoreError::Internal`] or [`StoreError::Upstream`] at the backend
//! boundary so provider error strings never leak upward.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type StoreResult<T> = Result<T, StoreError>;

/// Engine-level error taxonomy.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The specified bucket does not exist.
    #[error("The specified bucket does not exist")]
    NoSuchBucket { bucket: String },

    /// The specified key does not exist.
    #[error("The specified key does not exist")]
    NoSuchKey { bucket: String, key: String },

    /// The specified multipart upload does not exist, or was already
    /// completed or aborted.
    #[error("The specified upload does not exist. The upload ID may be invalid, or the upload may have been aborted or completed.")]
    NoSuchUpload { upload_id: String },

    /// A bucket with the requested name already exists.
    #[error("The requested bucket name is not available. The bucket namespace is shared by all users of the system. Please select a different name and try again.")]
    BucketAlreadyExists { bucket: String },

    /// The caller already owns this bucket.
    #[error("Your previous request to create the named bucket succeeded and you already own it.")]
    BucketAlreadyOwnedByYou { bucket: String },

    /// The bucket still has objects or in-progress uploads.
    #[error("The bucket you tried to delete is not empty")]
    BucketNotEmpty { bucket: String },

    /// The bucket name fails DNS-name validation.
    #[error("The specified bucket is not valid.")]
    InvalidBucketName { name: String },

    /// The object key exceeds 1024 bytes.
    #[error("Your key is too long")]
    KeyTooLong { length: usize },

    /// A request argument is invalid.
    #[error("{message}")]
    InvalidArgument { message: String },

    /// The requested byte range cannot be satisfied.
    #[error("The requested range is not satisfiable")]
    InvalidRange,

    /// A conditional precondition did not hold.
    #[error("At least one of the pre-conditions you specified did not hold")]
    PreconditionFailed,

    /// A part referenced by CompleteMultipartUpload is missing or its
    /// ETag does not match the uploaded data.
    #[error("{message}")]
    InvalidPart { message: String },

    /// CompleteMultipartUpload part list was not strictly ascending.
    #[error("The list of parts was not in ascending order. Parts must be ordered by part number.")]
    InvalidPartOrder,

    /// A non-terminal part was smaller than the 5 MiB minimum.
    #[error("Your proposed upload is smaller than the minimum allowed size")]
    EntityTooSmall,

    /// Credential lookup failed or the credential is inactive.
    #[error("Access Denied")]
    AccessDenied { message: String },

    /// A gateway backend's provider returned a non-success response.
    #[error("upstream {provider} request failed")]
    Upstream {
        provider: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// An I/O operation exceeded its deadline.
    #[error("Your socket connection to the server was not read from or written to within the timeout period.")]
    Timeout { operation: String },

    /// The caller tore down the operation's context.
    #[error("operation canceled")]
    Canceled,

    /// Catch-all for unexpected substrate failures.
    #[error("We encountered an internal error, please try again.")]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    /// S3 error code string for this error.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NoSuchBucket { .. } => "NoSuchBucket",
            StoreError::NoSuchKey { .. } => "NoSuchKey",
            StoreError::NoSuchUpload { .. } => "NoSuchUpload",
            StoreError::BucketAlreadyExists { .. } => "BucketAlreadyExists",
            StoreError::BucketAlreadyOwnedByYou { .. } => "BucketAlreadyOwnedByYou",
            StoreError::BucketNotEmpty { .. } => "BucketNotEmpty",
            StoreError::InvalidBucketName { .. } => "InvalidBucketName",
            StoreError::KeyTooLong { .. } => "KeyTooLongError",
            StoreError::InvalidArgument { .. } => "InvalidArgument",
            StoreError::InvalidRange => "InvalidRange",
            StoreError::PreconditionFailed => "PreconditionFailed",
            StoreError::InvalidPart { .. } => "InvalidPart",
            StoreError::InvalidPartOrder => "InvalidPartOrder",
            StoreError::EntityTooSmall => "EntityTooSmall",
            StoreError::AccessDenied { .. } => "AccessDenied",
            StoreError::Upstream { .. } => "InternalError",
            StoreError::Timeout { .. } => "RequestTimeout",
            StoreError::Canceled => "RequestCanceled",
            StoreError::Internal(_) => "InternalError",
        }
    }

    /// HTTP status the S3 boundary maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            StoreError::NoSuchBucket { .. }
            | StoreError::NoSuchKey { .. }
            | StoreError::NoSuchUpload { .. } => 404,
            StoreError::BucketAlreadyExists { .. }
            | StoreError::BucketAlreadyOwnedByYou { .. }
            | StoreError::BucketNotEmpty { .. } => 409,
            StoreError::InvalidBucketName { .. }
            | StoreError::KeyTooLong { .. }
            | StoreError::InvalidArgument { .. }
            | StoreError::InvalidPart { .. }
            | StoreError::InvalidPartOrder
            | StoreError::EntityTooSmall
            | StoreError::Timeout { .. } => 400,
            StoreError::InvalidRange => 416,
            StoreError::PreconditionFailed => 412,
            StoreError::AccessDenied { .. } => 403,
            StoreError::Upstream { .. } | StoreError::Internal(_) => 500,
            // The canceled caller never sees a response; 499 is the
            // conventional placeholder for logs.
            StoreError::Canceled => 499,
        }
    }

    /// True for the NotFound family.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::NoSuchBucket { .. }
                | StoreError::NoSuchKey { .. }
                | StoreError::NoSuchUpload { .. }
        )
    }

    /// Wrap a provider failure from a gateway backend.
    pub fn upstream(provider: &'static str, source: impl Into<anyhow::Error>) -> Self {
        StoreError::Upstream {
            provider,
            source: source.into(),
        }
    }

    /// Shorthand for [`StoreError::InvalidArgument`].
    pub fn invalid(message: impl Into<String>) -> Self {
        StoreError::InvalidArgument {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Internal(err.into())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Internal(err.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Internal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        let err = StoreError::NoSuchBucket {
            bucket: "b".to_string(),
        };
        assert_eq!(err.code(), "NoSuchBucket");
        assert_eq!(err.http_status(), 404);
        assert!(err.is_not_found());

        let err = StoreError::BucketNotEmpty {
            bucket: "b".to_string(),
        };
        assert_eq!(err.code(), "BucketNotEmpty");
        assert_eq!(err.http_status(), 409);
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_upstream_masks_provider_detail() {
        let err = StoreError::upstream("gcs", anyhow::anyhow!("503 backend unavailable"));
        // Clients see a generic InternalError; the cause stays in the chain.
        assert_eq!(err.code(), "InternalError");
        assert_eq!(err.http_status(), 500);
    }

    #[test]
    fn test_io_error_wraps_to_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StoreError = io.into();
        assert_eq!(err.code(), "InternalError");
    }

    #[test]
    fn test_range_and_precondition_statuses() {
        assert_eq!(StoreError::InvalidRange.http_status(), 416);
        assert_eq!(StoreError::PreconditionFailed.http_status(), 412);
        assert_eq!(StoreError::EntityTooSmall.http_status(), 400);
    }
}
