pub mod tests {
    use crate::{
        ActivityState,
        FleetRecord,
        InfraState,
        LifecycleState,
        Machine,
        ParsedCommand,
        ProcessState,
        SessionState,
        SourceComment,
        TriggerContext,
        VmId,
    };

    pub const TEST_REPOSITORY: &str = "acme/widgets";
    pub const TEST_REGION: &str = "ord";
    pub const TEST_IMAGE: &str = "registry.fly.io/thopter:latest";

    pub fn mock_machine(id: &str, name: &str, created_at: u64) -> Machine {
        Machine {
            id: VmId::from(id),
            name: name.to_string(),
            lifecycle_state: LifecycleState::Started,
            region: TEST_REGION.to_string(),
            image: TEST_IMAGE.to_string(),
            created_at: Some(created_at),
        }
    }

    /// A started fleet record without session or trigger context.
    pub fn mock_record(id: &str, created_at: u64) -> FleetRecord {
        FleetRecord::new(InfraState::from_machine(
            mock_machine(id, &format!("thopter-{}", id), created_at),
            created_at,
        ))
    }

    pub fn mock_session(last_activity: u64) -> SessionState {
        SessionState {
            activity_state: ActivityState::Active,
            process_state: ProcessState::Running,
            last_activity,
            idle_since: None,
            screen_dump: "claude> working on it".to_string(),
            reported_at: last_activity,
        }
    }

    pub fn mock_trigger_context(item_number: u64) -> TriggerContext {
        TriggerContext {
            repository: TEST_REPOSITORY.to_string(),
            item_number,
            title: format!("issue {}", item_number),
            body: "/thopter fix the bug".to_string(),
            author: "octocat".to_string(),
            url: format!("https://github.com/{}/issues/{}", TEST_REPOSITORY, item_number),
            comments: vec![SourceComment {
                id: 1,
                author: "octocat".to_string(),
                body: "any update?".to_string(),
                created_at: 0,
            }],
            instance_key: format!("{}#{}:body", TEST_REPOSITORY, item_number),
            command: ParsedCommand {
                line: "/thopter fix the bug".to_string(),
                text: "fix the bug".to_string(),
                ..Default::default()
            },
        }
    }
}
