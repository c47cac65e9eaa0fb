//! Mutation requests and outcomes.
//!
//! A [`MutationRequest`] is built by a UI action, consumed once by the
//! executor and then dropped. Its [`MutationOutcome`] is read by the
//! reconciler and the notification emitter and then dropped as well.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{FolioError, FolioResult, ValidationError};
use crate::fingerprint::{EntityTag, KeyPart};

/// Operation kind of a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Update and delete address an existing record.
    pub fn needs_target(&self) -> bool {
        !matches!(self, Self::Create)
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(ValidationError::UnknownKind {
                name: s.to_string(),
            }),
        }
    }
}

/// A write command against the data service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    /// Correlates log lines for one mutation.
    pub request_id: Uuid,
    pub entity: EntityTag,
    pub kind: MutationKind,
    /// Identifies the target record. The first part is the record id.
    pub params: Vec<KeyPart>,
    pub payload: Value,
    /// Acting user, filled from the identity provider when absent.
    pub actor: Option<String>,
}

impl MutationRequest {
    pub fn new(entity: EntityTag, kind: MutationKind) -> Self {
        Self {
            request_id: Uuid::now_v7(),
            entity,
            kind,
            params: Vec::new(),
            payload: Value::Null,
            actor: None,
        }
    }

    /// Build a request from UI-facing names such as `("borrow", "create")`.
    pub fn parse(entity: &str, kind: &str) -> Result<Self, ValidationError> {
        Ok(Self::new(entity.parse()?, kind.parse()?))
    }

    pub fn create(entity: EntityTag, payload: Value) -> Self {
        Self::new(entity, MutationKind::Create).with_payload(payload)
    }

    pub fn update(entity: EntityTag, id: impl Into<KeyPart>, payload: Value) -> Self {
        Self::new(entity, MutationKind::Update)
            .with_param(id)
            .with_payload(payload)
    }

    pub fn delete(entity: EntityTag, id: impl Into<KeyPart>) -> Self {
        Self::new(entity, MutationKind::Delete).with_param(id)
    }

    pub fn with_param(mut self, part: impl Into<KeyPart>) -> Self {
        self.params.push(part.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Id of the record an update or delete addresses.
    pub fn target_id(&self) -> Option<&KeyPart> {
        self.params.first()
    }
}

/// Result of executing a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// Fresh state of the entity as returned by the service.
    Succeeded(Value),
    Failed(FolioError),
}

impl MutationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    pub fn fresh_state(&self) -> Option<&Value> {
        match self {
            Self::Succeeded(value) => Some(value),
            Self::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&FolioError> {
        match self {
            Self::Succeeded(_) => None,
            Self::Failed(err) => Some(err),
        }
    }

    pub fn into_result(self) -> FolioResult<Value> {
        match self {
            Self::Succeeded(value) => Ok(value),
            Self::Failed(err) => Err(err),
        }
    }
}

impl From<FolioResult<Value>> for MutationOutcome {
    fn from(result: FolioResult<Value>) -> Self {
        match result {
            Ok(value) => Self::Succeeded(value),
            Err(err) => Self::Failed(err),
        }
    }
}
