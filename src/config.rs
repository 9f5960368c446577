use std::{env, fmt::Debug, net::SocketAddr, path::Path, time::Duration};

use anyhow::{anyhow, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use processor::{CommandProvisionerConfig, ReaperConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};
use state_store::{
    inventory::FlyMachinesConfig,
    naming::FleetNaming,
    FleetStateConfig,
};

use crate::poller::PollerConfig;

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "THOPTER_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub env: String,
    pub instance_id: Option<String>,
    pub listen_addr: String,
    pub structured_logging: bool,
    pub telemetry: TelemetryConfig,
    pub fleet: FleetConfig,
    pub scheduler: SchedulerSettings,
    pub poller: PollerSettings,
    pub provider: ProviderConfig,
    pub provisioner: ProvisionerConfig,
    pub reaper: ReaperSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            env: LOCAL_ENV.to_string(),
            instance_id: None,
            listen_addr: "0.0.0.0:8910".to_string(),
            structured_logging: false,
            telemetry: TelemetryConfig::default(),
            fleet: FleetConfig::default(),
            scheduler: SchedulerSettings::default(),
            poller: PollerSettings::default(),
            provider: ProviderConfig::default(),
            provisioner: ProvisionerConfig::default(),
            reaper: ReaperSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    // Export spans over OTLP.
    pub enable_tracing: bool,
    // OpenTelemetry collector grpc endpoint. Defaults to
    // OTEL_EXPORTER_OTLP_ENDPOINT or localhost:4317 when empty.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub fleet_prefix: String,
    pub golden_prefix: String,
    pub reconcile_interval_secs: u64,
    /// Web terminal base URL; the VM id is appended.
    pub terminal_base_url: Option<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        let naming = FleetNaming::default();
        Self {
            fleet_prefix: naming.fleet_prefix,
            golden_prefix: naming.golden_prefix,
            reconcile_interval_secs: 30,
            terminal_base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub max_concurrent_destroys: usize,
    pub max_fleet_capacity: usize,
    pub tick_interval_ms: u64,
    pub request_history: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_destroys: 5,
            max_fleet_capacity: 10,
            tick_interval_ms: 100,
            request_history: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// `owner/name` of a GitHub repository.
    pub repository: String,
    /// Only items carrying this label are scanned.
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    pub command_prefix: String,
    pub overlap_secs: u64,
    pub initial_lookback_secs: u64,
    pub github_api_url: String,
    pub token_env: String,
    pub sources: Vec<SourceConfig>,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            command_prefix: "/thopter".to_string(),
            overlap_secs: 300,
            initial_lookback_secs: 24 * 60 * 60,
            github_api_url: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_url: String,
    pub app_name: String,
    pub token_env: String,
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.machines.dev/v1".to_string(),
            app_name: String::new(),
            token_env: "FLY_API_TOKEN".to_string(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub provision_command: String,
    pub destroy_command: String,
    pub timeout_secs: u64,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            provision_command: String::new(),
            destroy_command: String::new(),
            timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub enabled: bool,
    pub interval_secs: u64,
    /// `null` disables the idle timeout.
    pub idle_timeout_secs: Option<u64>,
    /// `null` disables the lifetime limit.
    pub max_lifetime_secs: Option<u64>,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            idle_timeout_secs: Some(60 * 60),
            max_lifetime_secs: Some(24 * 60 * 60),
        }
    }
}

impl ServerConfig {
    pub fn from_path(path: &str) -> Result<ServerConfig> {
        Self::load(Some(Path::new(path)))
    }

    /// Defaults, then the YAML file if given, then `THOPTER_*` environment
    /// variables (`__` separates nested keys).
    pub fn load(path: Option<&Path>) -> Result<ServerConfig> {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(anyhow!("config file {} does not exist", path.display()));
            }
            figment = figment.merge(Yaml::file(path));
        }
        let config: ServerConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow!("invalid listen address: {}", self.listen_addr));
        }
        if self.provider.app_name.trim().is_empty() {
            return Err(anyhow!("provider.app_name is required"));
        }
        if self.provisioner.provision_command.trim().is_empty() {
            return Err(anyhow!("provisioner.provision_command is required"));
        }
        if self.provisioner.destroy_command.trim().is_empty() {
            return Err(anyhow!("provisioner.destroy_command is required"));
        }
        if self.fleet.fleet_prefix.is_empty() || self.fleet.golden_prefix.is_empty() {
            return Err(anyhow!("fleet prefixes must not be empty"));
        }
        if self.scheduler.max_concurrent_destroys == 0 {
            return Err(anyhow!("scheduler.max_concurrent_destroys must be positive"));
        }
        if self.scheduler.max_fleet_capacity == 0 {
            return Err(anyhow!("scheduler.max_fleet_capacity must be positive"));
        }
        if self.scheduler.tick_interval_ms == 0 ||
            self.fleet.reconcile_interval_secs == 0 ||
            self.poller.interval_secs == 0 ||
            self.reaper.interval_secs == 0
        {
            return Err(anyhow!("loop intervals must be positive"));
        }
        let prefix = self.poller.command_prefix.trim();
        if prefix.is_empty() || prefix.split_whitespace().count() != 1 {
            return Err(anyhow!(
                "invalid poller.command_prefix: {:?}",
                self.poller.command_prefix
            ));
        }
        for source in &self.poller.sources {
            let valid = source
                .repository
                .split_once('/')
                .is_some_and(|(owner, name)| {
                    !owner.is_empty() && !name.is_empty() && !name.contains('/')
                });
            if !valid {
                return Err(anyhow!(
                    "invalid poller source repository: {}",
                    source.repository
                ));
            }
        }
        Ok(())
    }

    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.env, nanoid::nanoid!(8)))
    }

    pub fn fleet_naming(&self) -> FleetNaming {
        FleetNaming {
            fleet_prefix: self.fleet.fleet_prefix.clone(),
            golden_prefix: self.fleet.golden_prefix.clone(),
        }
    }

    pub fn fleet_state_config(&self) -> FleetStateConfig {
        FleetStateConfig {
            naming: self.fleet_naming(),
            reconcile_interval: Duration::from_secs(self.fleet.reconcile_interval_secs),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_destroys: self.scheduler.max_concurrent_destroys,
            max_fleet_capacity: self.scheduler.max_fleet_capacity,
            tick_interval: Duration::from_millis(self.scheduler.tick_interval_ms),
            request_history: self.scheduler.request_history,
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_secs(self.reaper.interval_secs),
            idle_timeout: self.reaper.idle_timeout_secs.map(Duration::from_secs),
            max_lifetime: self.reaper.max_lifetime_secs.map(Duration::from_secs),
        }
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_secs(self.poller.interval_secs),
            command_prefix: self.poller.command_prefix.trim().to_string(),
            overlap: Duration::from_secs(self.poller.overlap_secs),
            initial_lookback: Duration::from_secs(self.poller.initial_lookback_secs),
        }
    }

    pub fn fly_machines_config(&self) -> FlyMachinesConfig {
        FlyMachinesConfig {
            api_url: self.provider.api_url.clone(),
            app_name: self.provider.app_name.clone(),
            token: read_token(&self.provider.token_env),
            request_timeout: Duration::from_secs(self.provider.request_timeout_secs),
        }
    }

    pub fn command_provisioner_config(&self) -> CommandProvisionerConfig {
        CommandProvisionerConfig {
            provision_command: self.provisioner.provision_command.clone(),
            destroy_command: self.provisioner.destroy_command.clone(),
            timeout: Duration::from_secs(self.provisioner.timeout_secs),
        }
    }

    pub fn github_token(&self) -> Option<String> {
        read_token(&self.poller.token_env)
    }
}

fn read_token(var: &str) -> Option<String> {
    env::var(var).ok().filter(|token| !token.is_empty())
}
