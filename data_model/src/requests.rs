use std::fmt::{self, Display};

use anyhow::{anyhow, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::{TriggerContext, VmId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(nanoid::nanoid!())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    /// Statuses only move forward.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("request {id} cannot move from {from} to {to}")]
pub struct RequestTransitionError {
    pub id: RequestId,
    pub from: RequestStatus,
    pub to: RequestStatus,
}

/// Bookkeeping shared by every request type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestLifecycle {
    pub id: RequestId,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub status: RequestStatus,
    pub error: Option<String>,
}

impl RequestLifecycle {
    pub fn new(created_at: u64) -> Self {
        Self {
            id: RequestId::generate(),
            created_at,
            started_at: None,
            completed_at: None,
            status: RequestStatus::Pending,
            error: None,
        }
    }

    fn advance(&mut self, next: RequestStatus) -> Result<(), RequestTransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(RequestTransitionError {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_processing(&mut self, now_ms: u64) -> Result<(), RequestTransitionError> {
        self.advance(RequestStatus::Processing)?;
        self.started_at = Some(now_ms);
        Ok(())
    }

    pub fn mark_completed(&mut self, now_ms: u64) -> Result<(), RequestTransitionError> {
        self.advance(RequestStatus::Completed)?;
        self.completed_at = Some(now_ms);
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        now_ms: u64,
        error: impl Into<String>,
    ) -> Result<(), RequestTransitionError> {
        self.advance(RequestStatus::Failed)?;
        self.completed_at = Some(now_ms);
        self.error = Some(error.into());
        Ok(())
    }
}

/// Implemented by every request kind held in a scheduler log.
pub trait Request: Clone + Send + Sync + 'static {
    fn lifecycle(&self) -> &RequestLifecycle;
    fn lifecycle_mut(&mut self) -> &mut RequestLifecycle;

    fn id(&self) -> &RequestId {
        &self.lifecycle().id
    }

    fn status(&self) -> RequestStatus {
        self.lifecycle().status
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
#[builder(build_fn(skip))]
pub struct ProvisionRequest {
    #[serde(flatten)]
    #[builder(setter(skip))]
    pub lifecycle: RequestLifecycle,
    pub repository: String,
    /// Golden template to clone from; the provisioner default when absent.
    pub template: Option<String>,
    /// Free-text instructions handed to the agent in the new VM.
    pub prompt: Option<String>,
    pub trigger: Option<TriggerContext>,
    #[builder(setter(skip))]
    pub vm_id: Option<VmId>,
}

impl ProvisionRequestBuilder {
    pub fn build(&self, created_at: u64) -> Result<ProvisionRequest> {
        let repository = self
            .repository
            .clone()
            .ok_or(anyhow!("repository is not present"))?;
        if repository.trim().is_empty() {
            return Err(anyhow!("repository must not be empty"));
        }
        Ok(ProvisionRequest {
            lifecycle: RequestLifecycle::new(created_at),
            repository,
            template: self.template.clone().flatten(),
            prompt: self.prompt.clone().flatten(),
            trigger: self.trigger.clone().flatten(),
            vm_id: None,
        })
    }
}

impl Request for ProvisionRequest {
    fn lifecycle(&self) -> &RequestLifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut RequestLifecycle {
        &mut self.lifecycle
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DestroyReason {
    /// Asked for by a person through the API or dashboard.
    Requested,
    IdleTimeout,
    MaxLifetime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DestroyRequest {
    #[serde(flatten)]
    pub lifecycle: RequestLifecycle,
    pub vm_id: VmId,
    pub reason: DestroyReason,
    pub detail: Option<String>,
}

impl DestroyRequest {
    pub fn new(vm_id: VmId, reason: DestroyReason, detail: Option<String>, created_at: u64) -> Self {
        Self {
            lifecycle: RequestLifecycle::new(created_at),
            vm_id,
            reason,
            detail,
        }
    }
}

impl Request for DestroyRequest {
    fn lifecycle(&self) -> &RequestLifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut RequestLifecycle {
        &mut self.lifecycle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_never_regresses() {
        let mut lifecycle = RequestLifecycle::new(10);
        lifecycle.mark_processing(20).unwrap();
        lifecycle.mark_completed(30).unwrap();
        assert_eq!(lifecycle.status, RequestStatus::Completed);
        assert_eq!(lifecycle.started_at, Some(20));
        assert_eq!(lifecycle.completed_at, Some(30));

        let err = lifecycle.mark_processing(40).unwrap_err();
        assert_eq!(err.from, RequestStatus::Completed);
        assert_eq!(err.to, RequestStatus::Processing);
        assert!(lifecycle.mark_failed(40, "late").is_err());
        assert_eq!(lifecycle.status, RequestStatus::Completed);
        assert!(lifecycle.error.is_none());
    }

    #[test]
    fn test_failed_records_error() {
        let mut lifecycle = RequestLifecycle::new(10);
        lifecycle.mark_processing(11).unwrap();
        lifecycle.mark_failed(12, "boom").unwrap();
        assert_eq!(lifecycle.error.as_deref(), Some("boom"));
        assert!(lifecycle.status.is_terminal());
    }

    #[test]
    fn test_provision_request_builder() {
        let request = ProvisionRequestBuilder::default()
            .repository("acme/widgets".to_string())
            .template(Some("default".to_string()))
            .prompt(Some("fix the flaky test".to_string()))
            .trigger(None)
            .build(123)
            .unwrap();
        assert_eq!(request.lifecycle.created_at, 123);
        assert_eq!(request.status(), RequestStatus::Pending);
        assert_eq!(request.template.as_deref(), Some("default"));
        assert_eq!(request.prompt.as_deref(), Some("fix the flaky test"));
        assert!(request.vm_id.is_none());

        assert!(ProvisionRequestBuilder::default().build(0).is_err());
        assert!(ProvisionRequestBuilder::default()
            .repository("  ".to_string())
            .build(0)
            .is_err());
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = RequestLifecycle::new(0);
        let b = RequestLifecycle::new(0);
        assert_ne!(a.id, b.id);
    }
}
