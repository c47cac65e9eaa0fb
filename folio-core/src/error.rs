//! Error types for Folio operations

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::EntityTag;
use crate::mutation::MutationKind;

/// Request shape errors. These never reach the data service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unknown entity type: {name}")]
    UnknownEntity { name: String },

    #[error("Unknown operation kind: {name}")]
    UnknownKind { name: String },

    #[error("Unsupported mutation: {kind} on {entity}")]
    UnsupportedMutation {
        entity: EntityTag,
        kind: MutationKind,
    },

    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Structured reason attached to a service rejection.
///
/// Services that send a code are trusted as-is; plain messages fall back to
/// [`ServiceErrorCode::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceErrorCode {
    /// The request was already approved or rejected by someone else.
    AlreadyProcessed,
    /// The book is no longer available to borrow.
    NoLongerAvailable,
    /// A user or book still has active borrows and cannot be deleted.
    ActiveBorrows,
    /// The user already holds the admin role.
    AlreadyAdmin,
    NotFound,
    Conflict,
    Other,
}

impl ServiceErrorCode {
    /// Derive a code from a free-text service message.
    pub fn classify(message: &str) -> Self {
        let message = message.to_lowercase();
        if message.contains("already been processed") || message.contains("already processed") {
            Self::AlreadyProcessed
        } else if message.contains("no longer available") || message.contains("not available") {
            Self::NoLongerAvailable
        } else if message.contains("active borrows") {
            Self::ActiveBorrows
        } else if message.contains("already an admin") {
            Self::AlreadyAdmin
        } else if message.contains("not found") {
            Self::NotFound
        } else if message.contains("conflict") || message.contains("already exists") {
            Self::Conflict
        } else {
            Self::Other
        }
    }
}

/// Coarse failure class, one per [`FolioError`] variant family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Validation,
    Service,
    Network,
    Config,
}

/// Master error type for all Folio errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FolioError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Service rejected the operation: {message}")]
    Service {
        code: ServiceErrorCode,
        message: String,
    },

    #[error("Service unreachable: {message}")]
    Network { message: String },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl FolioError {
    /// Service rejection with a code derived from the message.
    pub fn service(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Service {
            code: ServiceErrorCode::classify(&message),
            message,
        }
    }

    /// Service rejection with an explicit code.
    pub fn service_with_code(code: ServiceErrorCode, message: impl Into<String>) -> Self {
        Self::Service {
            code,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::Validation(_) => FailureClass::Validation,
            Self::Service { .. } => FailureClass::Service,
            Self::Network { .. } => FailureClass::Network,
            Self::Config(_) => FailureClass::Config,
        }
    }

    /// Code of a service rejection.
    pub fn code(&self) -> Option<ServiceErrorCode> {
        match self {
            Self::Service { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Message sent by the data service, if the service answered.
    pub fn service_message(&self) -> Option<&str> {
        match self {
            Self::Service { message, .. } if !message.trim().is_empty() => Some(message),
            _ => None,
        }
    }
}

/// Result type alias for Folio operations.
pub type FolioResult<T> = Result<T, FolioError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_messages() {
        assert_eq!(
            ServiceErrorCode::classify("This request has already been processed"),
            ServiceErrorCode::AlreadyProcessed
        );
        assert_eq!(
            ServiceErrorCode::classify("Book is no longer available"),
            ServiceErrorCode::NoLongerAvailable
        );
        assert_eq!(
            ServiceErrorCode::classify("Cannot delete user with active borrows"),
            ServiceErrorCode::ActiveBorrows
        );
        assert_eq!(
            ServiceErrorCode::classify("User is already an admin"),
            ServiceErrorCode::AlreadyAdmin
        );
        assert_eq!(ServiceErrorCode::classify("boom"), ServiceErrorCode::Other);
    }

    #[test]
    fn test_service_error_carries_message() {
        let err = FolioError::service("Borrow request has already been processed");
        assert_eq!(err.class(), FailureClass::Service);
        assert_eq!(err.code(), Some(ServiceErrorCode::AlreadyProcessed));
        assert_eq!(
            err.service_message(),
            Some("Borrow request has already been processed")
        );
        assert!(err.to_string().contains("already been processed"));
    }

    #[test]
    fn test_blank_service_message_is_absent() {
        let err = FolioError::service_with_code(ServiceErrorCode::Conflict, "  ");
        assert_eq!(err.service_message(), None);
        assert_eq!(err.code(), Some(ServiceErrorCode::Conflict));
    }

    #[test]
    fn test_network_and_validation_have_no_service_message() {
        assert_eq!(FolioError::network("connection refused").service_message(), None);
        let err: FolioError = ValidationError::RequiredFieldMissing {
            field: "params".to_string(),
        }
        .into();
        assert_eq!(err.class(), FailureClass::Validation);
        assert_eq!(err.service_message(), None);
        assert!(err.to_string().contains("Required field missing: params"));
    }
}
