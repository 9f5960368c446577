pub mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
        Mutex,
    };

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use data_model::{test_objects::tests::mock_machine, LifecycleState, Machine, VmId};
    use thopter_utils::{ManualClock, ModeController, OperatingMode};
    use tokio::sync::Notify;

    use crate::{inventory::InventoryClient, FleetState, FleetStateConfig};

    /// Creation time of every VM made by the helpers below.
    pub const TEST_START_MS: u64 = 1_700_000_000_000;

    pub fn fleet_machine(id: &str, created_at: u64) -> Machine {
        mock_machine(id, &format!("thopter-{}", id), created_at)
    }

    pub fn golden_machine(id: &str, template_name: &str) -> Machine {
        mock_machine(id, &format!("thopter-golden-{}", template_name), 0)
    }

    /// Provider inventory held in memory.
    #[derive(Default)]
    pub struct FakeInventory {
        machines: Mutex<Vec<Machine>>,
        failing: AtomicBool,
        calls: AtomicUsize,
        hold: Mutex<Option<Arc<Notify>>>,
        listing_started: Notify,
    }

    impl FakeInventory {
        pub fn add(&self, machine: Machine) {
            let mut machines = self.machines.lock().unwrap();
            machines.retain(|m| m.id != machine.id);
            machines.push(machine);
        }

        pub fn remove(&self, vm_id: &VmId) {
            self.machines.lock().unwrap().retain(|m| &m.id != vm_id);
        }

        pub fn set_lifecycle_state(&self, vm_id: &VmId, state: LifecycleState) {
            for machine in self.machines.lock().unwrap().iter_mut() {
                if &machine.id == vm_id {
                    machine.lifecycle_state = state;
                }
            }
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Makes the next listings take their snapshot and then wait until
        /// the returned notify fires.
        pub fn hold_listing(&self) -> Arc<Notify> {
            let release = Arc::new(Notify::new());
            *self.hold.lock().unwrap() = Some(release.clone());
            release
        }

        /// Resolves once a held listing has taken its snapshot.
        pub async fn listing_started(&self) {
            self.listing_started.notified().await;
        }
    }

    #[async_trait]
    impl InventoryClient for FakeInventory {
        async fn list_machines(&self) -> Result<Vec<Machine>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(anyhow!("provider unavailable"));
            }
            let machines = self.machines.lock().unwrap().clone();
            let hold = self.hold.lock().unwrap().take();
            if let Some(release) = hold {
                self.listing_started.notify_one();
                release.notified().await;
            }
            Ok(machines)
        }
    }

    pub struct TestStateStore {
        pub state: Arc<FleetState>,
        pub inventory: Arc<FakeInventory>,
        pub clock: ManualClock,
        pub mode: ModeController,
    }

    impl Default for TestStateStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TestStateStore {
        pub fn new() -> Self {
            Self::with_config(FleetStateConfig::default())
        }

        pub fn with_config(config: FleetStateConfig) -> Self {
            let inventory = Arc::new(FakeInventory::default());
            let clock = ManualClock::new(TEST_START_MS);
            let mode = ModeController::new();
            let state = FleetState::new(
                inventory.clone(),
                Arc::new(clock.clone()),
                mode.clone(),
                config,
            );
            Self {
                state,
                inventory,
                clock,
                mode,
            }
        }

        pub fn start_running(&self) {
            self.mode.transition(OperatingMode::Starting).unwrap();
            self.mode.transition(OperatingMode::Running).unwrap();
        }
    }
}
