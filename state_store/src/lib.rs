//! In-memory fleet state.
//!
//! Three writers feed the fleet map and each owns its own field group of a
//! [`FleetRecord`]:
//!
//! - reconciliation owns `infra`, rebuilt from the provider inventory,
//! - the scheduler owns `control` and `trigger` (through expectations),
//! - telemetry ingestion owns `session`.
//!
//! Every write is a lookup-and-patch of the owner's group. Reconciliation
//! fetches the inventory without holding any lock, then merges and swaps the
//! whole map under a single write lock, so readers always see a complete
//! snapshot and a telemetry write that lands during the fetch is carried
//! forward into the new map. A VM removed while a fetch is in flight is left
//! out of the map built from that fetch.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use data_model::{
    derive_orphan_status,
    FleetRecord,
    GoldenTemplateRecord,
    InfraState,
    LifecycleState,
    Machine,
    OrphanStatus,
    TelemetryUpdate,
    TriggerContext,
    VmId,
};
use inventory::InventoryClient;
use naming::{FleetNaming, MachineKind};
use serde::Serialize;
use thopter_utils::{Clock, ModeController, TickGate};
use tokio::{
    sync::{Notify, RwLock},
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

pub mod inventory;
pub mod naming;
pub mod test_state_store;

/// Expectations that were never matched by a discovered VM are dropped
/// after this long.
pub const EXPECTATION_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct FleetStateConfig {
    pub naming: FleetNaming,
    pub reconcile_interval: Duration,
}

impl Default for FleetStateConfig {
    fn default() -> Self {
        Self {
            naming: FleetNaming::default(),
            reconcile_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct Expectation {
    trigger: TriggerContext,
    registered_at: u64,
}

/// Where a telemetry update ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryRoute {
    Fleet,
    GoldenTemplate,
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleTransition {
    pub vm_id: VmId,
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Differences between the previous fleet map and the one a reconciliation
/// installed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub appeared: Vec<VmId>,
    pub disappeared: Vec<VmId>,
    pub transitions: Vec<LifecycleTransition>,
    pub expectations_consumed: Vec<VmId>,
    pub fleet_size: usize,
    pub golden_templates: usize,
}

impl ReconcileReport {
    fn diff(
        previous: &im::HashMap<VmId, FleetRecord>,
        next: &im::HashMap<VmId, FleetRecord>,
    ) -> Self {
        let mut report = ReconcileReport {
            fleet_size: next.len(),
            ..Default::default()
        };
        for (id, record) in next.iter() {
            match previous.get(id) {
                None => report.appeared.push(id.clone()),
                Some(old) if old.infra.lifecycle_state != record.infra.lifecycle_state => {
                    report.transitions.push(LifecycleTransition {
                        vm_id: id.clone(),
                        from: old.infra.lifecycle_state,
                        to: record.infra.lifecycle_state,
                    })
                }
                Some(_) => {}
            }
        }
        report.disappeared = previous
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();
        report.appeared.sort();
        report.disappeared.sort();
        report.transitions.sort_by(|a, b| a.vm_id.cmp(&b.vm_id));
        report
    }

    fn log(&self) {
        for vm_id in &self.appeared {
            info!(vm_id = vm_id.get(), "vm appeared in fleet");
        }
        for vm_id in &self.disappeared {
            info!(vm_id = vm_id.get(), "vm disappeared from fleet");
        }
        for transition in &self.transitions {
            info!(
                vm_id = transition.vm_id.get(),
                from = %transition.from,
                to = %transition.to,
                "vm lifecycle state changed"
            );
        }
        debug!(
            fleet_size = self.fleet_size,
            golden_templates = self.golden_templates,
            "reconciliation complete"
        );
    }
}

pub struct FleetState {
    records: RwLock<im::HashMap<VmId, FleetRecord>>,
    golden_templates: RwLock<im::HashMap<VmId, GoldenTemplateRecord>>,
    expectations: RwLock<HashMap<VmId, Expectation>>,
    /// Removal generation of each VM removed since the last reconciliation
    /// that started after it.
    tombstones: RwLock<HashMap<VmId, u64>>,
    removal_generation: AtomicU64,
    inventory: Arc<dyn InventoryClient>,
    clock: Arc<dyn Clock>,
    mode: ModeController,
    config: FleetStateConfig,
    reconcile_notify: Notify,
}

impl FleetState {
    pub fn new(
        inventory: Arc<dyn InventoryClient>,
        clock: Arc<dyn Clock>,
        mode: ModeController,
        config: FleetStateConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            records: RwLock::new(im::HashMap::new()),
            golden_templates: RwLock::new(im::HashMap::new()),
            expectations: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(HashMap::new()),
            removal_generation: AtomicU64::new(0),
            inventory,
            clock,
            mode,
            config,
            reconcile_notify: Notify::new(),
        })
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Fetches the provider inventory and installs a fresh fleet map.
    ///
    /// On fetch failure the previous map is left untouched.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let fetch_generation = self.removal_generation.load(Ordering::SeqCst);
        let machines = self.inventory.list_machines().await?;
        let now_ms = self.clock.now_ms();

        let mut records = self.records.write().await;
        let mut golden_templates = self.golden_templates.write().await;
        let mut expectations = self.expectations.write().await;
        let mut tombstones = self.tombstones.write().await;

        let mut next_records = im::HashMap::new();
        let mut next_golden = im::HashMap::new();
        let mut consumed = Vec::new();

        for machine in machines {
            match self.config.naming.classify(&machine.name) {
                MachineKind::Unmanaged => continue,
                MachineKind::GoldenTemplate { template_name } => {
                    let session = golden_templates
                        .get(&machine.id)
                        .and_then(|existing| existing.session.clone());
                    next_golden.insert(
                        machine.id.clone(),
                        GoldenTemplateRecord {
                            id: machine.id,
                            template_name,
                            lifecycle_state: machine.lifecycle_state,
                            session,
                        },
                    );
                }
                MachineKind::Fleet => {
                    let vm_id = machine.id.clone();
                    if tombstones
                        .get(&vm_id)
                        .is_some_and(|removed_at| *removed_at > fetch_generation)
                    {
                        debug!(
                            vm_id = vm_id.get(),
                            "skipping vm removed while the inventory was fetched"
                        );
                        continue;
                    }
                    let first_seen = records
                        .get(&vm_id)
                        .map(|existing| existing.infra.created_at)
                        .unwrap_or(now_ms);
                    let mut record =
                        FleetRecord::new(InfraState::from_machine(machine, first_seen));
                    if let Some(existing) = records.get(&vm_id) {
                        record.control = existing.control.clone();
                        record.session = existing.session.clone();
                        record.trigger = existing.trigger.clone();
                    }
                    if record.trigger.is_none() {
                        if let Some(expectation) = expectations.remove(&vm_id) {
                            record.trigger = Some(expectation.trigger);
                            consumed.push(vm_id.clone());
                        }
                    }
                    next_records.insert(vm_id, record);
                }
            }
        }

        let ttl_ms = EXPECTATION_TTL.as_millis() as u64;
        expectations.retain(|vm_id, expectation| {
            let keep = now_ms.saturating_sub(expectation.registered_at) < ttl_ms;
            if !keep {
                warn!(
                    vm_id = vm_id.get(),
                    "dropping expectation for vm that never appeared in inventory"
                );
            }
            keep
        });
        tombstones.retain(|_, removed_at| *removed_at > fetch_generation);

        let mut report = ReconcileReport::diff(&records, &next_records);
        report.golden_templates = next_golden.len();
        consumed.sort();
        report.expectations_consumed = consumed;

        *records = next_records;
        *golden_templates = next_golden;
        report.log();
        Ok(report)
    }

    /// Patches the session group of the record the update names. Updates for
    /// unknown ids are dropped; telemetry never creates a record.
    pub async fn update_from_telemetry(&self, update: TelemetryUpdate) -> TelemetryRoute {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(&update.vm_id) {
            record.session = Some(update.session);
            if let Some(trigger) = update.trigger {
                record.trigger = Some(trigger);
            }
            return TelemetryRoute::Fleet;
        }

        let mut golden_templates = self.golden_templates.write().await;
        if let Some(template) = golden_templates.get_mut(&update.vm_id) {
            template.session = Some(update.session);
            return TelemetryRoute::GoldenTemplate;
        }

        warn!(
            vm_id = update.vm_id.get(),
            "dropping telemetry for unknown vm"
        );
        TelemetryRoute::Dropped
    }

    /// Links a VM that may not be in the provider inventory yet to the event
    /// that created it. Consumed by the first reconciliation that sees the VM.
    pub async fn register_expectation(&self, vm_id: VmId, trigger: TriggerContext) {
        debug!(vm_id = vm_id.get(), "registering expectation");
        self.expectations.write().await.insert(
            vm_id,
            Expectation {
                trigger,
                registered_at: self.clock.now_ms(),
            },
        );
    }

    /// Inserts a record straight from provisioner metadata. A record that
    /// reconciliation already created only gets its trigger group patched.
    pub async fn insert_provisioned(&self, machine: Machine, trigger: Option<TriggerContext>) {
        let mut records = self.records.write().await;
        match records.get_mut(&machine.id) {
            Some(existing) => {
                if trigger.is_some() {
                    existing.trigger = trigger;
                }
            }
            None => {
                let vm_id = machine.id.clone();
                let mut record =
                    FleetRecord::new(InfraState::from_machine(machine, self.clock.now_ms()));
                record.trigger = trigger;
                info!(vm_id = vm_id.get(), "vm inserted from provisioner metadata");
                records.insert(vm_id, record);
            }
        }
    }

    /// Returns false when the VM is unknown.
    pub async fn request_destroy(&self, vm_id: &VmId) -> bool {
        self.set_destroy_requested(vm_id, true).await
    }

    pub async fn clear_destroy_requested(&self, vm_id: &VmId) -> bool {
        self.set_destroy_requested(vm_id, false).await
    }

    async fn set_destroy_requested(&self, vm_id: &VmId, requested: bool) -> bool {
        let mut records = self.records.write().await;
        match records.get_mut(vm_id) {
            Some(record) => {
                record.control.destroy_requested = requested;
                true
            }
            None => false,
        }
    }

    /// Drops the record. A reconciliation whose fetch was already in flight
    /// will not bring it back.
    pub async fn remove(&self, vm_id: &VmId) -> Option<FleetRecord> {
        let mut records = self.records.write().await;
        let removed = records.remove(vm_id);
        self.expectations.write().await.remove(vm_id);
        if removed.is_some() {
            let generation = self.removal_generation.fetch_add(1, Ordering::SeqCst) + 1;
            self.tombstones
                .write()
                .await
                .insert(vm_id.clone(), generation);
            info!(vm_id = vm_id.get(), "vm removed from fleet");
        }
        removed
    }

    /// All fleet records, ordered by id.
    pub async fn get_all(&self) -> Vec<FleetRecord> {
        let snapshot = self.snapshot().await;
        let mut records: Vec<FleetRecord> = snapshot.values().cloned().collect();
        records.sort_by(|a, b| a.infra.id.cmp(&b.infra.id));
        records
    }

    pub async fn get_by_id(&self, vm_id: &VmId) -> Option<FleetRecord> {
        self.records.read().await.get(vm_id).cloned()
    }

    /// A structurally shared copy of the current map.
    pub async fn snapshot(&self) -> im::HashMap<VmId, FleetRecord> {
        self.records.read().await.clone()
    }

    pub async fn golden_templates(&self) -> Vec<GoldenTemplateRecord> {
        let mut templates: Vec<GoldenTemplateRecord> =
            self.golden_templates.read().await.values().cloned().collect();
        templates.sort_by(|a, b| a.template_name.cmp(&b.template_name));
        templates
    }

    pub async fn count_started(&self) -> usize {
        self.records
            .read()
            .await
            .values()
            .filter(|record| record.is_started())
            .count()
    }

    pub async fn pending_expectations(&self) -> usize {
        self.expectations.read().await.len()
    }

    pub fn orphan_status(&self, record: &FleetRecord) -> OrphanStatus {
        derive_orphan_status(record, self.clock.now_ms())
    }

    /// Asks the reconciliation loop to run without waiting for the next tick.
    pub fn trigger_reconcile(&self) {
        self.reconcile_notify.notify_one();
    }

    pub async fn start(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut mode_rx = self.mode.subscribe();
        info!(
            interval_s = self.config.reconcile_interval.as_secs(),
            "fleet reconciliation loop started"
        );
        loop {
            let gate = tokio::select! {
                gate = self.mode.wait_tick(&mut ticker, &mut mode_rx) => gate,
                _ = self.reconcile_notify.notified() => self.mode.gate(),
            };
            match gate {
                TickGate::Exit => break,
                TickGate::Skip => continue,
                TickGate::Run => {
                    if let Err(err) = self.reconcile().await {
                        error!("fleet reconciliation failed, keeping previous snapshot: {:?}", err);
                    }
                }
            }
        }
        info!("fleet reconciliation loop stopped");
    }
}
