use std::{process::Stdio, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use data_model::{ProvisionRequest, VmId};
use tokio::process::Command;
use tracing::{debug, info};

use crate::provisioner::{ProvisionOutcome, Provisioner, ProvisionerError};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct CommandProvisionerConfig {
    pub provision_command: String,
    pub destroy_command: String,
    pub timeout: Duration,
}

/// Runs operator-supplied shell commands to create and destroy VMs.
///
/// The provision command gets the request through `THOPTER_*` environment
/// variables and must print the new VM id, or a JSON object with `vm_id` and an
/// optional `machine`, as the last line on stdout.
pub struct CommandProvisioner {
    config: CommandProvisionerConfig,
}

impl CommandProvisioner {
    pub fn new(config: CommandProvisionerConfig) -> Self {
        Self { config }
    }

    async fn run(&self, command_line: &str, envs: Vec<(&str, String)>) -> Result<String> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(command_line)
            .envs(envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| ProvisionerError::Spawn {
            command: command_line.to_string(),
            source,
        })?;
        let output = tokio::time::timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| ProvisionerError::Timeout {
                command: command_line.to_string(),
                timeout: self.config.timeout,
            })?
            .with_context(|| format!("waiting for `{}`", command_line))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProvisionerError::Failed {
                command: command_line.to_string(),
                status: output.status.to_string(),
                stderr: tail_lines(&stderr, STDERR_TAIL_LINES),
            }
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}

/// Reads the provision result from the last non-empty stdout line.
pub fn parse_provision_output(stdout: &str) -> Result<ProvisionOutcome, ProvisionerError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .ok_or(ProvisionerError::MissingVmId)?;

    if line.starts_with('{') {
        let outcome: ProvisionOutcome =
            serde_json::from_str(line).map_err(|err| ProvisionerError::InvalidOutput {
                line: line.to_string(),
                reason: err.to_string(),
            })?;
        if outcome.vm_id.get().is_empty() {
            return Err(ProvisionerError::MissingVmId);
        }
        return Ok(outcome);
    }
    if line.split_whitespace().count() != 1 {
        return Err(ProvisionerError::InvalidOutput {
            line: line.to_string(),
            reason: "expected a single vm id".to_string(),
        });
    }
    Ok(ProvisionOutcome::new(VmId::from(line)))
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn provision(&self, request: &ProvisionRequest) -> Result<ProvisionOutcome> {
        let trigger_json = match &request.trigger {
            Some(trigger) => serde_json::to_string(trigger)?,
            None => String::new(),
        };
        let envs = vec![
            ("THOPTER_REQUEST_ID", request.lifecycle.id.to_string()),
            ("THOPTER_REPOSITORY", request.repository.clone()),
            (
                "THOPTER_TEMPLATE",
                request.template.clone().unwrap_or_default(),
            ),
            ("THOPTER_PROMPT", request.prompt.clone().unwrap_or_default()),
            ("THOPTER_TRIGGER_JSON", trigger_json),
        ];
        debug!(
            request_id = request.lifecycle.id.get(),
            repository = request.repository.as_str(),
            "running provision command"
        );
        let stdout = self.run(&self.config.provision_command, envs).await?;
        let outcome = parse_provision_output(&stdout)?;
        info!(
            request_id = request.lifecycle.id.get(),
            vm_id = outcome.vm_id.get(),
            "provision command finished"
        );
        Ok(outcome)
    }

    async fn destroy(&self, vm_id: &VmId) -> Result<()> {
        debug!(vm_id = vm_id.get(), "running destroy command");
        self.run(
            &self.config.destroy_command,
            vec![("THOPTER_VM_ID", vm_id.to_string())],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use data_model::{test_objects::tests::TEST_REPOSITORY, LifecycleState, ProvisionRequestBuilder};

    use super::*;

    fn provisioner(provision: &str, destroy: &str, timeout: Duration) -> CommandProvisioner {
        CommandProvisioner::new(CommandProvisionerConfig {
            provision_command: provision.to_string(),
            destroy_command: destroy.to_string(),
            timeout,
        })
    }

    fn request() -> ProvisionRequest {
        ProvisionRequestBuilder::default()
            .repository(TEST_REPOSITORY.to_string())
            .template(Some("default".to_string()))
            .trigger(None)
            .build(0)
            .unwrap()
    }

    #[test]
    fn test_parse_bare_id() {
        let outcome = parse_provision_output("cloning...\nbooting\n  vm-123  \n\n").unwrap();
        assert_eq!(outcome.vm_id, VmId::from("vm-123"));
        assert!(outcome.machine.is_none());
    }

    #[test]
    fn test_parse_json_output() {
        let stdout = r#"{"vm_id":"m1","machine":{"id":"m1","name":"thopter-m1","lifecycle_state":"started","region":"ord","image":"img","created_at":5}}"#;
        let outcome = parse_provision_output(stdout).unwrap();
        assert_eq!(outcome.vm_id, VmId::from("m1"));
        let machine = outcome.machine.unwrap();
        assert_eq!(machine.lifecycle_state, LifecycleState::Started);
        assert_eq!(machine.created_at, Some(5));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_provision_output(""),
            Err(ProvisionerError::MissingVmId)
        ));
        assert!(matches!(
            parse_provision_output("machine created ok"),
            Err(ProvisionerError::InvalidOutput { .. })
        ));
        assert!(matches!(
            parse_provision_output("{\"vm\": 1}"),
            Err(ProvisionerError::InvalidOutput { .. })
        ));
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
    }

    #[tokio::test]
    async fn test_provision_passes_request_environment() {
        let provisioner = provisioner(
            "echo \"$THOPTER_TEMPLATE-$THOPTER_REQUEST_ID\"",
            "true",
            Duration::from_secs(10),
        );
        let request = request();
        let outcome = provisioner.provision(&request).await.unwrap();
        assert_eq!(
            outcome.vm_id.get(),
            format!("default-{}", request.lifecycle.id)
        );
    }

    #[tokio::test]
    async fn test_failure_carries_stderr_tail() {
        let provisioner = provisioner(
            "echo 'quota exceeded' >&2; exit 3",
            "echo \"gone $THOPTER_VM_ID\"",
            Duration::from_secs(10),
        );
        let err = provisioner.provision(&request()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("quota exceeded"));

        provisioner.destroy(&VmId::from("m1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let provisioner = provisioner("sleep 5", "sleep 5", Duration::from_millis(100));
        let err = provisioner.destroy(&VmId::from("m1")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionerError>(),
            Some(ProvisionerError::Timeout { .. })
        ));
    }
}
