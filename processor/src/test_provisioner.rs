pub mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use data_model::{test_objects::tests::mock_machine, ProvisionRequest, VmId};

    use crate::provisioner::{ProvisionOutcome, Provisioner};

    /// Provisioner that hands out queued ids, then `vm-1`, `vm-2`, ... and
    /// records how it was driven.
    #[derive(Default)]
    pub struct FakeProvisioner {
        next_vm_ids: Mutex<VecDeque<String>>,
        destroy_delay: Mutex<Duration>,
        return_machine: AtomicBool,
        fail_provision: AtomicBool,
        fail_destroy: AtomicBool,
        panic_destroy: AtomicBool,
        provision_calls: AtomicUsize,
        active_destroys: AtomicUsize,
        max_active_destroys: AtomicUsize,
        provisions_during_destroys: AtomicUsize,
        destroyed: Mutex<Vec<VmId>>,
        provisioned: Mutex<Vec<ProvisionRequest>>,
    }

    impl FakeProvisioner {
        pub fn push_vm_id(&self, vm_id: &str) {
            self.next_vm_ids.lock().unwrap().push_back(vm_id.to_string());
        }

        pub fn set_destroy_delay(&self, delay: Duration) {
            *self.destroy_delay.lock().unwrap() = delay;
        }

        pub fn set_return_machine(&self, value: bool) {
            self.return_machine.store(value, Ordering::SeqCst);
        }

        pub fn set_fail_provision(&self, value: bool) {
            self.fail_provision.store(value, Ordering::SeqCst);
        }

        pub fn set_fail_destroy(&self, value: bool) {
            self.fail_destroy.store(value, Ordering::SeqCst);
        }

        pub fn set_panic_destroy(&self, value: bool) {
            self.panic_destroy.store(value, Ordering::SeqCst);
        }

        pub fn provision_calls(&self) -> usize {
            self.provision_calls.load(Ordering::SeqCst)
        }

        pub fn max_concurrent_destroys(&self) -> usize {
            self.max_active_destroys.load(Ordering::SeqCst)
        }

        pub fn provisions_during_destroys(&self) -> usize {
            self.provisions_during_destroys.load(Ordering::SeqCst)
        }

        pub fn destroyed(&self) -> Vec<VmId> {
            self.destroyed.lock().unwrap().clone()
        }

        pub fn provisioned(&self) -> Vec<ProvisionRequest> {
            self.provisioned.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Provisioner for FakeProvisioner {
        async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionOutcome> {
            let call = self.provision_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.active_destroys.load(Ordering::SeqCst) > 0 {
                self.provisions_during_destroys
                    .fetch_add(1, Ordering::SeqCst);
            }
            self.provisioned.lock().unwrap().push(request.clone());
            if self.fail_provision.load(Ordering::SeqCst) {
                return Err(anyhow!("provision failed: no capacity in region"));
            }
            let vm_id = self
                .next_vm_ids
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| format!("vm-{}", call));
            let mut outcome = ProvisionOutcome::new(VmId::from(vm_id.as_str()));
            if self.return_machine.load(Ordering::SeqCst) {
                outcome.machine = Some(mock_machine(&vm_id, &format!("thopter-{}", vm_id), 0));
            }
            Ok(outcome)
        }

        async fn destroy(&self, vm_id: &VmId) -> Result<()> {
            if self.panic_destroy.load(Ordering::SeqCst) {
                panic!("provider client crashed destroying {}", vm_id);
            }
            let active = self.active_destroys.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active_destroys.fetch_max(active, Ordering::SeqCst);
            let delay = *self.destroy_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.active_destroys.fetch_sub(1, Ordering::SeqCst);
            if self.fail_destroy.load(Ordering::SeqCst) {
                return Err(anyhow!("destroy failed: provider returned 500"));
            }
            self.destroyed.lock().unwrap().push(vm_id.clone());
            Ok(())
        }
    }
}
