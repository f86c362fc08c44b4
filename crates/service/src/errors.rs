use thiserror::Error;

/// Failures reported by a [`RowStore`](crate::storage::RowStore) backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("table not found: {0}")]
    NotFound(String),
    /// The table exists or is being created by someone else.
    #[error("table already exists: {0}")]
    AlreadyExists(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("request throttled: {0}")]
    Throttled(String),
    #[error("request rejected: {0}")]
    Validation(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Stable numeric code for external mapping/logging
    pub fn code(&self) -> u16 {
        match self {
            StoreError::NotFound(_) => 2001,
            StoreError::AlreadyExists(_) => 2002,
            StoreError::PermissionDenied(_) => 2003,
            StoreError::Throttled(_) => 2004,
            StoreError::Validation(_) => 2005,
            StoreError::Unavailable(_) => 2100,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Throttled(_))
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("`{0}` is a reserved configuration name and cannot be used as a map key")]
    ReservedKey(String),
    #[error("no row key: set PERSISTENCE_TABLE_KEY, pass table_key, or run inside AWS Lambda")]
    MissingRowKey,
}

impl PersistenceError {
    pub fn serialization(msg: impl Into<String>) -> Self { Self::Serialization(msg.into()) }

    pub fn code(&self) -> u16 {
        match self {
            PersistenceError::Store(e) => e.code(),
            PersistenceError::Serialization(_) => 1001,
            PersistenceError::ReservedKey(_) => 1002,
            PersistenceError::MissingRowKey => 1003,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, PersistenceError::Store(StoreError::PermissionDenied(_)))
    }

    /// [`REQUIRED_PERMISSIONS`] for permission failures, `None` otherwise.
    pub fn permission_guidance(&self) -> Option<&'static str> {
        self.is_permission_denied().then_some(REQUIRED_PERMISSIONS)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self { Self::Serialization(e.to_string()) }
}

/// IAM actions the execution role needs, with an example policy statement.
pub const REQUIRED_PERMISSIONS: &str = r#"The execution role needs
dynamodb:{CreateTable,TagResource,PutItem,DescribeTable,GetItem}
for example:
{
    "Sid": "AllowPersistentMap",
    "Effect": "Allow",
    "Action": [
        "dynamodb:CreateTable",
        "dynamodb:TagResource",
        "dynamodb:PutItem",
        "dynamodb:DescribeTable",
        "dynamodb:GetItem"
    ],
    "Resource": "arn:aws:dynamodb:*:*:table/AWSLambdaPersistence"
}"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_pass_through_unchanged() {
        let err: PersistenceError = StoreError::PermissionDenied("AccessDeniedException: no".into()).into();
        assert!(err.is_permission_denied());
        assert_eq!(err.to_string(), "permission denied: AccessDeniedException: no");
        assert_eq!(err.code(), 2003);
        assert!(err.permission_guidance().is_some_and(|g| g.contains("dynamodb:GetItem")));
        assert_eq!(PersistenceError::MissingRowKey.permission_guidance(), None);
    }

    #[test]
    fn only_throttling_is_retryable() {
        assert!(StoreError::Throttled("slow down".into()).is_retryable());
        assert!(!StoreError::Unavailable("down".into()).is_retryable());
        assert!(!StoreError::PermissionDenied("no".into()).is_retryable());
    }
}
