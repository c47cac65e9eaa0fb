//! Collaborators consumed by the cache layer.
//!
//! The data service, the notification sink and the identity provider live
//! outside this workspace. These traits are the only contact surface.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::FolioResult;
use crate::fingerprint::Fingerprint;
use crate::mutation::MutationRequest;
use crate::notification::Notification;

/// Remote data service.
///
/// `fetch` backs cache reads, `mutate` backs the mutation executor. Both
/// return the service's canonical JSON for the addressed entity.
#[async_trait]
pub trait DataService: Send + Sync {
    /// Run the query a fingerprint describes.
    async fn fetch(&self, fingerprint: &Fingerprint) -> FolioResult<Value>;

    /// Apply a write and return the entity's fresh state.
    async fn mutate(&self, request: &MutationRequest) -> FolioResult<Value>;
}

#[async_trait]
impl<S: DataService + ?Sized> DataService for Arc<S> {
    async fn fetch(&self, fingerprint: &Fingerprint) -> FolioResult<Value> {
        (**self).fetch(fingerprint).await
    }

    async fn mutate(&self, request: &MutationRequest) -> FolioResult<Value> {
        (**self).mutate(request).await
    }
}

/// UI toast sink. Fire and forget.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Supplies the acting user for mutations that record an actor.
pub trait IdentityProvider: Send + Sync {
    /// Opaque id of the signed-in user, `None` when signed out.
    fn current_actor(&self) -> Option<String>;
}

/// Identity provider for contexts with no signed-in user.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl IdentityProvider for Anonymous {
    fn current_actor(&self) -> Option<String> {
        None
    }
}
