//! Folio Core - Cache Keys, Mutations and Collaborators
//!
//! Data types shared by the cache layer and its tests. This crate holds no
//! cache behaviour: fingerprints, the error taxonomy, mutation requests and
//! outcomes, notifications, configuration, and the traits for the external
//! data service, notification sink and identity provider.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod mutation;
pub mod notification;
pub mod service;

pub use config::CacheConfig;
pub use error::{
    ConfigError, FailureClass, FolioError, FolioResult, ServiceErrorCode, ValidationError,
};
pub use fingerprint::{EntityTag, Fingerprint, KeyPart, TagKind};
pub use mutation::{MutationKind, MutationOutcome, MutationRequest};
pub use notification::{Notification, Severity};
pub use service::{Anonymous, DataService, IdentityProvider, NotificationSink};
