use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::http::Method;
use axum_server::Handle;
use processor::{CommandProvisioner, IdleReaper, Provisioner, RequestScheduler};
use state_store::{
    inventory::{FlyMachinesClient, InventoryClient},
    FleetState,
};
use thopter_utils::{Clock, ModeController, OperatingMode, SystemClock};
use tokio::{signal, task::JoinHandle};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    config::ServerConfig,
    poller::{GithubSource, TriggerPoller, TriggerSource},
    routes::{create_routes, RouteState},
    tracing::http_trace_layer,
};

pub struct Service {
    pub config: Arc<ServerConfig>,
    pub mode: ModeController,
    pub fleet_state: Arc<FleetState>,
    pub scheduler: Arc<RequestScheduler>,
    pub poller: Arc<TriggerPoller>,
    pub reaper: Arc<IdleReaper>,
}

impl Service {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let inventory = Arc::new(
            FlyMachinesClient::new(config.fly_machines_config())
                .context("creating provider inventory client")?,
        );
        let provisioner = Arc::new(CommandProvisioner::new(config.command_provisioner_config()));

        let token = config.github_token();
        if token.is_none() && !config.poller.sources.is_empty() {
            warn!(
                token_env = config.poller.token_env.as_str(),
                "no github token set, polling anonymously"
            );
        }
        let timeout = Duration::from_secs(config.provider.request_timeout_secs);
        let mut sources: Vec<Arc<dyn TriggerSource>> = Vec::new();
        for source in &config.poller.sources {
            let github = GithubSource::new(
                &config.poller.github_api_url,
                &source.repository,
                source.label.clone(),
                token.clone(),
                timeout,
            )
            .with_context(|| format!("creating source for {}", source.repository))?;
            sources.push(Arc::new(github));
        }

        Ok(Self::with_collaborators(
            config,
            inventory,
            provisioner,
            Arc::new(SystemClock),
            sources,
        ))
    }

    /// Wires the components around the given external collaborators.
    pub fn with_collaborators(
        config: ServerConfig,
        inventory: Arc<dyn InventoryClient>,
        provisioner: Arc<dyn Provisioner>,
        clock: Arc<dyn Clock>,
        sources: Vec<Arc<dyn TriggerSource>>,
    ) -> Self {
        let config = Arc::new(config);
        let mode = ModeController::new();
        let fleet_state = FleetState::new(
            inventory,
            clock.clone(),
            mode.clone(),
            config.fleet_state_config(),
        );
        let scheduler = RequestScheduler::new(
            fleet_state.clone(),
            provisioner,
            mode.clone(),
            clock.clone(),
            config.scheduler_config(),
        );
        let poller = Arc::new(TriggerPoller::new(
            sources,
            scheduler.clone(),
            mode.clone(),
            clock.clone(),
            config.poller_config(),
        ));
        let reaper = Arc::new(IdleReaper::new(
            fleet_state.clone(),
            scheduler.clone(),
            mode.clone(),
            clock,
            config.reaper_config(),
        ));
        Self {
            config,
            mode,
            fleet_state,
            scheduler,
            poller,
            reaper,
        }
    }

    pub fn route_state(&self) -> RouteState {
        RouteState {
            fleet_state: self.fleet_state.clone(),
            scheduler: self.scheduler.clone(),
            mode: self.mode.clone(),
            config: self.config.clone(),
        }
    }

    fn spawn_loops(&self) -> Vec<JoinHandle<()>> {
        let mut loops = Vec::new();
        let fleet_state = self.fleet_state.clone();
        loops.push(tokio::spawn(
            async move { fleet_state.start().await }.instrument(info_span!("reconciler")),
        ));

        let scheduler = self.scheduler.clone();
        loops.push(tokio::spawn(
            async move { scheduler.start().await }.instrument(info_span!("scheduler")),
        ));

        if self.config.poller.enabled && !self.config.poller.sources.is_empty() {
            let poller = self.poller.clone();
            loops.push(tokio::spawn(
                async move { poller.start().await }.instrument(info_span!("poller")),
            ));
        } else {
            info!("trigger poller disabled");
        }

        if self.config.reaper.enabled {
            let reaper = self.reaper.clone();
            loops.push(tokio::spawn(
                async move { reaper.start().await }.instrument(info_span!("reaper")),
            ));
        } else {
            info!("idle reaper disabled");
        }
        loops
    }

    /// Waits for the loops to notice `stopping` and finish their current
    /// tick, then for every dispatched destroy to settle.
    async fn wind_down(&self, loops: Vec<JoinHandle<()>>) {
        for handle in loops {
            if let Err(err) = handle.await {
                error!("background loop ended abnormally: {:?}", err);
            }
        }
        self.scheduler.drain_destroys().await;
        info!("background work finished");
    }

    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = self.config.listen_addr.parse()?;
        self.mode.transition(OperatingMode::Starting)?;
        match self.fleet_state.reconcile().await {
            Ok(report) => info!(fleet_size = report.fleet_size, "initial reconciliation done"),
            Err(err) => warn!("initial reconciliation failed, will retry: {:?}", err),
        }
        let loops = self.spawn_loops();
        if let Err(err) = self.mode.transition(OperatingMode::Running) {
            self.mode.stop();
            self.wind_down(loops).await;
            return Err(err.into());
        }

        let handle = Handle::new();
        let handle_sh = handle.clone();
        let mode = self.mode.clone();
        tokio::spawn(async move {
            shutdown_signal(handle_sh, mode).await;
            info!("graceful shutdown signal received, shutting down server gracefully");
        });

        info!("server api listening on {}", self.config.listen_addr);
        let cors = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::PUT])
            .allow_origin(Any)
            .allow_headers(Any);
        let router = create_routes(self.route_state())
            .layer(http_trace_layer(
                &self.config.env,
                &self.config.instance_id(),
            ))
            .layer(cors);
        let served = axum_server::bind(addr)
            .handle(handle)
            .serve(router.into_make_service())
            .await;

        self.mode.stop();
        self.wind_down(loops).await;
        served.map_err(Into::into)
    }
}

async fn shutdown_signal(handle: Handle, mode: ModeController) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let mut mode_rx = mode.subscribe();
    let stopping = async {
        if mode_rx
            .wait_for(|current| *current == OperatingMode::Stopping)
            .await
            .is_err()
        {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => {
        },
        _ = terminate => {
        },
        _ = stopping => {
        },
    }
    mode.stop();
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
    info!("signal received, shutting down server gracefully");
}
