use std::{sync::Arc, time::Duration};

use dashmap::DashSet;
use data_model::{
    requests::Request,
    DestroyReason,
    DestroyRequest,
    ProvisionRequest,
    ProvisionRequestBuilder,
    RequestId,
    TriggerContext,
    VmId,
};
use state_store::FleetState;
use thopter_utils::{Clock, ModeController, TickGate};
use tokio::{
    sync::{Mutex, OwnedSemaphorePermit, Semaphore},
    task::JoinError,
    time::MissedTickBehavior,
};
use tracing::{error, info, warn};

use crate::{
    provisioner::Provisioner,
    request_log::{RequestLog, RequestLogSnapshot},
};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_destroys: usize,
    pub max_fleet_capacity: usize,
    pub tick_interval: Duration,
    pub request_history: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_destroys: 5,
            max_fleet_capacity: 10,
            tick_interval: Duration::from_millis(100),
            request_history: 500,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("fleet is at capacity: {started} of {max} vms started")]
    CapacityExceeded { started: usize, max: usize },

    #[error("vm {0} is not in the fleet")]
    UnknownVm(VmId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Holds a destroy slot and the in-flight entry for one VM. Both are released
/// when the guard drops, after the request has reached a terminal status.
struct InFlightDestroy {
    vm_id: VmId,
    in_flight: Arc<DashSet<VmId>>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for InFlightDestroy {
    fn drop(&mut self) {
        self.in_flight.remove(&self.vm_id);
    }
}

pub struct RequestScheduler {
    store: Arc<FleetState>,
    provisioner: Arc<dyn Provisioner>,
    mode: ModeController,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    provisions: Mutex<RequestLog<ProvisionRequest>>,
    destroys: Mutex<RequestLog<DestroyRequest>>,
    destroy_slots: Arc<Semaphore>,
    in_flight: Arc<DashSet<VmId>>,
}

impl RequestScheduler {
    pub fn new(
        store: Arc<FleetState>,
        provisioner: Arc<dyn Provisioner>,
        mode: ModeController,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            provisions: Mutex::new(RequestLog::new(config.request_history)),
            destroys: Mutex::new(RequestLog::new(config.request_history)),
            destroy_slots: Arc::new(Semaphore::new(config.max_concurrent_destroys)),
            in_flight: Arc::new(DashSet::new()),
            store,
            provisioner,
            mode,
            clock,
            config,
        })
    }

    pub async fn create_provision_request(
        &self,
        repository: String,
        template: Option<String>,
        prompt: Option<String>,
        trigger: Option<TriggerContext>,
    ) -> Result<ProvisionRequest, SchedulerError> {
        let request = ProvisionRequestBuilder::default()
            .repository(repository)
            .template(template)
            .prompt(prompt)
            .trigger(trigger)
            .build(self.clock.now_ms())
            .map_err(|err| SchedulerError::InvalidRequest(err.to_string()))?;
        info!(
            request_id = request.id().get(),
            repository = request.repository.as_str(),
            template = request.template.as_deref(),
            "provision request created"
        );
        self.provisions.lock().await.enqueue(request.clone());
        Ok(request)
    }

    /// Enqueues a destroy and flags the record. A VM that already has a
    /// pending or processing destroy gets that request back.
    pub async fn create_destroy_request(
        &self,
        vm_id: VmId,
        reason: DestroyReason,
        detail: Option<String>,
    ) -> Result<DestroyRequest, SchedulerError> {
        let mut destroys = self.destroys.lock().await;
        if let Some(existing) = destroys.find_active(|r| r.vm_id == vm_id) {
            return Ok(existing.clone());
        }
        if !self.store.request_destroy(&vm_id).await {
            return Err(SchedulerError::UnknownVm(vm_id));
        }
        let request = DestroyRequest::new(vm_id, reason, detail, self.clock.now_ms());
        info!(
            request_id = request.id().get(),
            vm_id = request.vm_id.get(),
            reason = %reason,
            "destroy request created"
        );
        destroys.enqueue(request.clone());
        Ok(request)
    }

    pub async fn list_provision_requests(&self) -> RequestLogSnapshot<ProvisionRequest> {
        self.provisions.lock().await.snapshot()
    }

    pub async fn list_destroy_requests(&self) -> RequestLogSnapshot<DestroyRequest> {
        self.destroys.lock().await.snapshot()
    }

    pub async fn get_provision_request(&self, id: &RequestId) -> Option<ProvisionRequest> {
        self.provisions.lock().await.get(id).cloned()
    }

    pub async fn get_destroy_request(&self, id: &RequestId) -> Option<DestroyRequest> {
        self.destroys.lock().await.get(id).cloned()
    }

    pub fn in_flight_destroy_count(&self) -> usize {
        self.in_flight.len()
    }

    /// One scheduling pass: fill free destroy slots, then run at most one
    /// provision if no destroy is in flight.
    pub async fn tick(self: &Arc<Self>) {
        self.dispatch_destroys().await;
        if self.in_flight.is_empty() {
            self.process_next_provision().await;
        }
    }

    async fn dispatch_destroys(self: &Arc<Self>) {
        loop {
            let Ok(permit) = self.destroy_slots.clone().try_acquire_owned() else {
                break;
            };
            let Some(request) = self.destroys.lock().await.start_next(self.clock.now_ms()) else {
                break;
            };
            self.in_flight.insert(request.vm_id.clone());
            let guard = InFlightDestroy {
                vm_id: request.vm_id.clone(),
                in_flight: self.in_flight.clone(),
                _permit: permit,
            };
            let scheduler = self.clone();
            tokio::spawn(async move {
                let _guard = guard;
                let request_id = request.id().clone();
                let vm_id = request.vm_id.clone();
                let worker = scheduler.clone();
                let outcome = tokio::spawn(async move { worker.run_destroy(request).await }).await;
                if let Err(err) = outcome {
                    scheduler.abandon_destroy(&request_id, &vm_id, err).await;
                }
            });
        }
    }

    /// Settles a destroy whose task died before recording an outcome.
    async fn abandon_destroy(&self, request_id: &RequestId, vm_id: &VmId, err: JoinError) {
        error!(
            request_id = request_id.get(),
            vm_id = vm_id.get(),
            "destroy task did not finish: {}",
            err
        );
        let failed = self.destroys.lock().await.fail(
            request_id,
            self.clock.now_ms(),
            format!("destroy task panicked: {}", err),
        );
        if failed.is_some() {
            self.store.clear_destroy_requested(vm_id).await;
        }
    }

    /// Waits until every dispatched destroy has settled. New destroys can
    /// still start afterwards if the scheduler keeps ticking.
    pub async fn drain_destroys(&self) {
        if self.in_flight.is_empty() {
            return;
        }
        let slots = u32::try_from(self.config.max_concurrent_destroys).unwrap_or(u32::MAX);
        info!(
            in_flight = self.in_flight.len(),
            "waiting for in-flight destroys"
        );
        match self.destroy_slots.acquire_many(slots).await {
            Ok(_permits) => info!("in-flight destroys settled"),
            Err(err) => warn!("destroy slots closed while draining: {}", err),
        }
    }

    async fn run_destroy(&self, request: DestroyRequest) {
        let vm_id = request.vm_id.clone();
        let result = self.provisioner.destroy(&vm_id).await;
        let now_ms = self.clock.now_ms();
        match result {
            Ok(()) => {
                self.store.remove(&vm_id).await;
                self.destroys.lock().await.complete(request.id(), now_ms, |_| {});
                info!(
                    request_id = request.id().get(),
                    vm_id = vm_id.get(),
                    "destroy request completed"
                );
            }
            Err(err) => {
                self.store.clear_destroy_requested(&vm_id).await;
                error!(
                    request_id = request.id().get(),
                    vm_id = vm_id.get(),
                    "destroy request failed: {:#}",
                    err
                );
                self.destroys
                    .lock()
                    .await
                    .fail(request.id(), now_ms, format!("{:#}", err));
            }
        }
    }

    /// Only the tick takes provisions off the pending queue, so the request
    /// stays visible in `pending` until it moves to its next list.
    async fn process_next_provision(&self) {
        if self.provisions.lock().await.pending_len() == 0 {
            return;
        }

        let started = self.store.count_started().await;
        if started >= self.config.max_fleet_capacity {
            let err = SchedulerError::CapacityExceeded {
                started,
                max: self.config.max_fleet_capacity,
            };
            let rejected =
                self.provisions
                    .lock()
                    .await
                    .reject_next(self.clock.now_ms(), err.to_string());
            if let Some(request) = rejected {
                warn!(request_id = request.id().get(), "{}", err);
            }
            return;
        }

        let Some(request) = self.provisions.lock().await.start_next(self.clock.now_ms()) else {
            return;
        };
        info!(
            request_id = request.id().get(),
            repository = request.repository.as_str(),
            "provisioning vm"
        );

        match self.provisioner.provision(&request).await {
            Ok(outcome) => {
                let vm_id = outcome.vm_id.clone();
                match outcome.machine {
                    Some(machine) => {
                        self.store
                            .insert_provisioned(machine, request.trigger.clone())
                            .await
                    }
                    None => {
                        if let Some(trigger) = request.trigger.clone() {
                            self.store.register_expectation(vm_id.clone(), trigger).await;
                        }
                    }
                }
                self.provisions
                    .lock()
                    .await
                    .complete(request.id(), self.clock.now_ms(), |r| {
                        r.vm_id = Some(vm_id.clone())
                    });
                info!(
                    request_id = request.id().get(),
                    vm_id = vm_id.get(),
                    "provision request completed"
                );
                self.store.trigger_reconcile();
            }
            Err(err) => {
                error!(
                    request_id = request.id().get(),
                    "provision request failed: {:#}", err
                );
                self.provisions
                    .lock()
                    .await
                    .fail(request.id(), self.clock.now_ms(), format!("{:#}", err));
            }
        }
    }

    pub async fn start(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut mode_rx = self.mode.subscribe();
        info!(
            max_concurrent_destroys = self.config.max_concurrent_destroys,
            max_fleet_capacity = self.config.max_fleet_capacity,
            "request scheduler started"
        );
        loop {
            match self.mode.wait_tick(&mut ticker, &mut mode_rx).await {
                TickGate::Exit => break,
                TickGate::Skip => continue,
                TickGate::Run => self.tick().await,
            }
        }
        info!("request scheduler stopped");
    }
}
