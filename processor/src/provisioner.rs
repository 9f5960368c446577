use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use data_model::{Machine, ProvisionRequest, VmId};
use serde::Deserialize;

/// What a successful provision hands back. When `machine` is present the
/// record is inserted directly instead of waiting for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProvisionOutcome {
    pub vm_id: VmId,
    #[serde(default)]
    pub machine: Option<Machine>,
}

impl ProvisionOutcome {
    pub fn new(vm_id: VmId) -> Self {
        Self {
            vm_id,
            machine: None,
        }
    }
}

/// Creates and destroys VMs. Calls may take tens of seconds and are never
/// retried by the caller.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionOutcome>;

    /// Must succeed for a VM that is already stopped or destroyed.
    async fn destroy(&self, vm_id: &VmId) -> Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionerError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("provision command printed no vm id")]
    MissingVmId,

    #[error("unparsable provision output `{line}`: {reason}")]
    InvalidOutput { line: String, reason: String },
}
