//! Mutation executor.
//!
//! Validates a request against the rule catalogue, fills in the acting user
//! and submits it to the data service exactly once. Failures come back as
//! [`MutationOutcome::Failed`]; nothing is retried.

use std::sync::Arc;

use folio_core::{
    Anonymous, DataService, FolioError, FolioResult, IdentityProvider, MutationKind,
    MutationOutcome, MutationRequest, ValidationError,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::rules::InvalidationRules;

/// Submits mutations to the data service.
#[derive(Clone)]
pub struct MutationExecutor {
    service: Arc<dyn DataService>,
    identity: Arc<dyn IdentityProvider>,
    rules: &'static InvalidationRules,
}

impl MutationExecutor {
    /// Executor over the library rule catalogue with no signed-in user.
    pub fn new(service: Arc<dyn DataService>) -> Self {
        Self {
            service,
            identity: Arc::new(Anonymous),
            rules: InvalidationRules::library(),
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_rules(mut self, rules: &'static InvalidationRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn rules(&self) -> &'static InvalidationRules {
        self.rules
    }

    /// Check a request and return the copy that will be sent.
    ///
    /// The actor is taken from the identity provider when the rule records
    /// one and the request does not carry it already.
    pub fn prepare(&self, request: &MutationRequest) -> FolioResult<MutationRequest> {
        let rule = self.rules.rule(request.entity, request.kind).ok_or_else(|| {
            ValidationError::UnsupportedMutation {
                entity: request.entity,
                kind: request.kind,
            }
        })?;

        if request.kind.needs_target() && request.target_id().is_none() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "params".to_string(),
            }
            .into());
        }

        if request.kind != MutationKind::Delete && request.payload.is_null() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "payload".to_string(),
            }
            .into());
        }

        let mut prepared = request.clone();
        if rule.requires_actor && prepared.actor.is_none() {
            prepared.actor = self.identity.current_actor();
            if prepared.actor.is_none() {
                return Err(ValidationError::RequiredFieldMissing {
                    field: "actor".to_string(),
                }
                .into());
            }
        }
        Ok(prepared)
    }

    /// Run a mutation once and report its outcome.
    pub async fn execute(&self, request: &MutationRequest) -> MutationOutcome {
        let prepared = match self.prepare(request) {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(
                    request_id = %request.request_id,
                    entity = %request.entity,
                    kind = %request.kind,
                    error = %err,
                    "Mutation rejected before submission"
                );
                return MutationOutcome::Failed(err);
            }
        };

        debug!(
            request_id = %prepared.request_id,
            entity = %prepared.entity,
            kind = %prepared.kind,
            "Submitting mutation"
        );

        let result: FolioResult<Value> = self.service.mutate(&prepared).await;
        match &result {
            Ok(_) => debug!(request_id = %prepared.request_id, "Mutation succeeded"),
            Err(err) => warn!(
                request_id = %prepared.request_id,
                entity = %prepared.entity,
                kind = %prepared.kind,
                error = %err,
                "Mutation failed"
            ),
        }
        MutationOutcome::from(result)
    }
}

impl std::fmt::Debug for MutationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationExecutor")
            .field("rules", &self.rules.len())
            .finish_non_exhaustive()
    }
}

/// True for failures that never reached the data service.
pub fn rejected_locally(err: &FolioError) -> bool {
    matches!(err, FolioError::Validation(_) | FolioError::Config(_))
}
