pub mod command_provisioner;
pub mod provisioner;
pub mod reaper;
pub mod request_log;
pub mod scheduler;
pub mod test_provisioner;

pub use command_provisioner::{CommandProvisioner, CommandProvisionerConfig};
pub use provisioner::{ProvisionOutcome, Provisioner, ProvisionerError};
pub use reaper::{IdleReaper, ReaperConfig};
pub use scheduler::{RequestScheduler, SchedulerConfig, SchedulerError};
