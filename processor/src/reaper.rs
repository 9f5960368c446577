use std::{sync::Arc, time::Duration};

use data_model::{DestroyReason, DestroyRequest, FleetRecord};
use state_store::FleetState;
use thopter_utils::{elapsed_secs, unwrap_or_continue, Clock, ModeController, TickGate};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::scheduler::RequestScheduler;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub interval: Duration,
    /// `None` disables the idle check.
    pub idle_timeout: Option<Duration>,
    /// `None` disables the lifetime check.
    pub max_lifetime: Option<Duration>,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            idle_timeout: Some(Duration::from_secs(60 * 60)),
            max_lifetime: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

/// Which timeout, if any, `record` has run past. Idle time is checked
/// before lifetime.
pub fn destroy_reason_for(
    record: &FleetRecord,
    now_ms: u64,
    config: &ReaperConfig,
) -> Option<(DestroyReason, String)> {
    if record.control.destroy_requested {
        return None;
    }
    if let (Some(idle_timeout), Some(idle_since)) = (
        config.idle_timeout,
        record.session.as_ref().and_then(|s| s.idle_since),
    ) {
        let idle = now_ms.saturating_sub(idle_since);
        if idle >= idle_timeout.as_millis() as u64 {
            return Some((
                DestroyReason::IdleTimeout,
                format!("idle for {}s", elapsed_secs(now_ms, idle_since)),
            ));
        }
    }
    if let Some(max_lifetime) = config.max_lifetime {
        if record.age_ms(now_ms) >= max_lifetime.as_millis() as u64 {
            return Some((
                DestroyReason::MaxLifetime,
                format!("running for {}s", elapsed_secs(now_ms, record.infra.created_at)),
            ));
        }
    }
    None
}

/// Files destroy requests for VMs that sat idle or lived too long.
pub struct IdleReaper {
    store: Arc<FleetState>,
    scheduler: Arc<RequestScheduler>,
    mode: ModeController,
    clock: Arc<dyn Clock>,
    config: ReaperConfig,
}

impl IdleReaper {
    pub fn new(
        store: Arc<FleetState>,
        scheduler: Arc<RequestScheduler>,
        mode: ModeController,
        clock: Arc<dyn Clock>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            mode,
            clock,
            config,
        }
    }

    pub async fn sweep(&self) -> Vec<DestroyRequest> {
        let now_ms = self.clock.now_ms();
        let mut created = Vec::new();
        for record in self.store.get_all().await {
            let (reason, detail) =
                unwrap_or_continue!(destroy_reason_for(&record, now_ms, &self.config));
            info!(
                vm_id = record.id().get(),
                reason = %reason,
                detail = detail.as_str(),
                "reaping vm"
            );
            match self
                .scheduler
                .create_destroy_request(record.id().clone(), reason, Some(detail))
                .await
            {
                Ok(request) => created.push(request),
                Err(err) => warn!(vm_id = record.id().get(), "could not reap vm: {}", err),
            }
        }
        created
    }

    pub async fn start(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut mode_rx = self.mode.subscribe();
        loop {
            match self.mode.wait_tick(&mut ticker, &mut mode_rx).await {
                TickGate::Exit => break,
                TickGate::Skip => continue,
                TickGate::Run => {
                    self.sweep().await;
                }
            }
        }
        info!("idle reaper stopped");
    }
}
