use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use data_model::{LifecycleState, Machine, VmId};
use serde::Deserialize;
use tracing::{debug, warn};

/// Read access to the VM provider's machine listing.
#[async_trait]
pub trait InventoryClient: Send + Sync {
    async fn list_machines(&self) -> Result<Vec<Machine>>;
}

#[derive(Debug, Clone)]
pub struct FlyMachinesConfig {
    pub api_url: String,
    pub app_name: String,
    pub token: Option<String>,
    pub request_timeout: Duration,
}

/// Inventory client for the Fly Machines REST API.
pub struct FlyMachinesClient {
    client: reqwest::Client,
    config: FlyMachinesConfig,
}

#[derive(Debug, Deserialize)]
struct FlyMachine {
    id: String,
    #[serde(default)]
    name: String,
    state: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    config: Option<FlyMachineConfig>,
    #[serde(default)]
    created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlyMachineConfig {
    #[serde(default)]
    image: Option<String>,
}

impl FlyMachinesClient {
    pub fn new(config: FlyMachinesConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("building provider http client")?;
        Ok(Self { client, config })
    }

    fn machines_url(&self) -> String {
        format!(
            "{}/apps/{}/machines",
            self.config.api_url.trim_end_matches('/'),
            self.config.app_name
        )
    }
}

/// Maps provider states onto the four the fleet tracks. Transitional states
/// count as stopped until the provider settles them.
pub fn map_lifecycle_state(state: &str) -> LifecycleState {
    match state {
        "started" => LifecycleState::Started,
        "suspended" | "suspending" => LifecycleState::Suspended,
        "destroyed" | "destroying" => LifecycleState::Destroyed,
        "stopped" => LifecycleState::Stopped,
        other => {
            debug!(state = other, "treating transitional machine state as stopped");
            LifecycleState::Stopped
        }
    }
}

fn parse_created_at(machine_id: &str, created_at: Option<&str>) -> Option<u64> {
    let parsed = created_at
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .and_then(|dt| u64::try_from(dt.timestamp_millis()).ok());
    if parsed.is_none() {
        warn!(
            vm_id = machine_id,
            created_at = ?created_at,
            "machine has no usable creation time, aging it from first sighting"
        );
    }
    parsed
}

impl From<FlyMachine> for Machine {
    fn from(machine: FlyMachine) -> Self {
        let created_at = parse_created_at(&machine.id, machine.created_at.as_deref());
        Machine {
            lifecycle_state: map_lifecycle_state(&machine.state),
            image: machine
                .config
                .and_then(|c| c.image)
                .unwrap_or_default(),
            id: VmId::new(machine.id),
            name: machine.name,
            region: machine.region,
            created_at,
        }
    }
}

#[async_trait]
impl InventoryClient for FlyMachinesClient {
    async fn list_machines(&self) -> Result<Vec<Machine>> {
        let mut request = self.client.get(self.machines_url());
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.context("listing machines")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("machine listing failed with {}: {}", status, body));
        }
        let machines: Vec<FlyMachine> = response
            .json()
            .await
            .context("decoding machine listing")?;
        Ok(machines.into_iter().map(Machine::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decodes_provider_listing() {
        let body = serde_json::json!([
            {
                "id": "148e1",
                "name": "thopter-42",
                "state": "started",
                "region": "ord",
                "config": { "image": "registry.fly.io/thopter:abc" },
                "created_at": "2023-11-14T22:13:20Z"
            },
            {
                "id": "148e2",
                "name": "thopter-43",
                "state": "starting",
                "region": "iad"
            }
        ]);
        let machines: Vec<Machine> = serde_json::from_value::<Vec<FlyMachine>>(body)
            .unwrap()
            .into_iter()
            .map(Machine::from)
            .collect();

        assert_eq!(machines.len(), 2);
        assert_eq!(machines[0].id, VmId::from("148e1"));
        assert_eq!(machines[0].lifecycle_state, LifecycleState::Started);
        assert_eq!(machines[0].image, "registry.fly.io/thopter:abc");
        assert_eq!(machines[0].created_at, Some(1_700_000_000_000));

        assert_eq!(machines[1].lifecycle_state, LifecycleState::Stopped);
        assert_eq!(machines[1].image, "");
        assert_eq!(machines[1].created_at, None);
    }

    #[test]
    fn test_map_lifecycle_state() {
        assert_eq!(map_lifecycle_state("destroying"), LifecycleState::Destroyed);
        assert_eq!(map_lifecycle_state("suspended"), LifecycleState::Suspended);
        assert_eq!(map_lifecycle_state("replacing"), LifecycleState::Stopped);
    }

    #[test]
    fn test_machines_url() {
        let client = FlyMachinesClient::new(FlyMachinesConfig {
            api_url: "https://api.machines.dev/v1/".to_string(),
            app_name: "thopters".to_string(),
            token: None,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(
            client.machines_url(),
            "https://api.machines.dev/v1/apps/thopters/machines"
        );
    }
}
