use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Result;
use data_model::TriggerContext;
use processor::RequestScheduler;
use thopter_utils::{Clock, ModeController, TickGate};
use tokio::{sync::Mutex, time::MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub mod command;
pub mod github;
pub mod source;

use command::{ack_marker, acked_keys, find_command, has_ack_marker};
pub use github::GithubSource;
pub use source::{SourceItem, TriggerSource};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub command_prefix: String,
    pub overlap: Duration,
    pub initial_lookback: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            command_prefix: "/thopter".to_string(),
            overlap: Duration::from_secs(5 * 60),
            initial_lookback: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub requests_created: usize,
}

/// Start of the "updated since" window for the next cycle.
pub fn poll_window_start(last_success_ms: Option<u64>, now_ms: u64, config: &PollerConfig) -> u64 {
    match last_success_ms {
        Some(last) => last.saturating_sub(config.overlap.as_millis() as u64),
        None => now_ms.saturating_sub(config.initial_lookback.as_millis() as u64),
    }
}

pub fn body_instance_key(source: &str, item_number: u64) -> String {
    format!("{}#{}:body", source, item_number)
}

pub fn comment_instance_key(source: &str, item_number: u64, comment_id: u64) -> String {
    format!("{}#{}:comment:{}", source, item_number, comment_id)
}

struct TextBlock<'a> {
    instance_key: String,
    author: &'a str,
    text: &'a str,
}

/// Turns command lines in external trackers into provision requests.
///
/// Each command is acknowledged with a comment carrying a marker for its
/// instance key. The marker is what keeps a command from being honored twice
/// after a restart; the in-memory processed set only saves the lookup.
pub struct TriggerPoller {
    sources: Vec<Arc<dyn TriggerSource>>,
    scheduler: Arc<RequestScheduler>,
    mode: ModeController,
    clock: Arc<dyn Clock>,
    config: PollerConfig,
    processed: Mutex<HashSet<String>>,
    last_success_ms: Mutex<Option<u64>>,
}

impl TriggerPoller {
    pub fn new(
        sources: Vec<Arc<dyn TriggerSource>>,
        scheduler: Arc<RequestScheduler>,
        mode: ModeController,
        clock: Arc<dyn Clock>,
        config: PollerConfig,
    ) -> Self {
        Self {
            sources,
            scheduler,
            mode,
            clock,
            config,
            processed: Mutex::new(HashSet::new()),
            last_success_ms: Mutex::new(None),
        }
    }

    pub async fn last_success_ms(&self) -> Option<u64> {
        *self.last_success_ms.lock().await
    }

    pub async fn processed_count(&self) -> usize {
        self.processed.lock().await.len()
    }

    pub async fn poll_once(&self) -> PollReport {
        let cycle_started = self.clock.now_ms();
        let since = poll_window_start(self.last_success_ms().await, cycle_started, &self.config);
        let mut report = PollReport::default();

        for source in &self.sources {
            match self.poll_source(source.as_ref(), since).await {
                Ok(created) => {
                    report.sources_ok += 1;
                    report.requests_created += created;
                }
                Err(err) => {
                    report.sources_failed += 1;
                    error!(source = source.name(), "polling source failed: {:?}", err);
                }
            }
        }

        if report.sources_ok > 0 {
            *self.last_success_ms.lock().await = Some(cycle_started);
        }
        debug!(
            sources_ok = report.sources_ok,
            sources_failed = report.sources_failed,
            requests_created = report.requests_created,
            "poll cycle finished"
        );
        report
    }

    async fn poll_source(&self, source: &dyn TriggerSource, since_ms: u64) -> Result<usize> {
        let items = source.list_updated_items(since_ms).await?;
        let mut created = 0;
        for item in items {
            match self.process_item(source, &item).await {
                Ok(count) => created += count,
                Err(err) => warn!(
                    source = source.name(),
                    item = item.number,
                    "processing item failed: {:?}",
                    err
                ),
            }
        }
        Ok(created)
    }

    async fn process_item(&self, source: &dyn TriggerSource, item: &SourceItem) -> Result<usize> {
        let comments = source.list_comments(item.number).await?;
        let acked: HashSet<String> = comments
            .iter()
            .flat_map(|comment| acked_keys(&comment.body))
            .collect();

        let mut blocks = vec![TextBlock {
            instance_key: body_instance_key(source.name(), item.number),
            author: &item.author,
            text: &item.body,
        }];
        blocks.extend(
            comments
                .iter()
                .filter(|comment| !has_ack_marker(&comment.body))
                .map(|comment| TextBlock {
                    instance_key: comment_instance_key(source.name(), item.number, comment.id),
                    author: &comment.author,
                    text: &comment.body,
                }),
        );

        let mut created = 0;
        for block in blocks {
            if self.processed.lock().await.contains(&block.instance_key) {
                continue;
            }
            let Some(command) =
                find_command(block.text, &self.config.command_prefix, &block.instance_key)
            else {
                continue;
            };
            if acked.contains(&block.instance_key) {
                self.processed.lock().await.insert(block.instance_key);
                continue;
            }

            let trigger = TriggerContext {
                repository: source.name().to_string(),
                item_number: item.number,
                title: item.title.clone(),
                body: item.body.clone(),
                author: block.author.to_string(),
                url: item.url.clone(),
                comments: comments.clone(),
                instance_key: block.instance_key.clone(),
                command,
            };
            if self.submit(source, trigger).await {
                created += 1;
            }
            self.processed.lock().await.insert(block.instance_key);
        }
        Ok(created)
    }

    async fn submit(&self, source: &dyn TriggerSource, trigger: TriggerContext) -> bool {
        let repository = trigger
            .command
            .flag("repo")
            .unwrap_or(trigger.repository.as_str())
            .to_string();
        let template = trigger.command.flag("template").map(str::to_string);
        let prompt = Some(trigger.command.text.clone()).filter(|text| !text.is_empty());
        let instance_key = trigger.instance_key.clone();
        let item_number = trigger.item_number;

        let request = match self
            .scheduler
            .create_provision_request(repository.clone(), template, prompt, Some(trigger))
            .await
        {
            Ok(request) => request,
            Err(err) => {
                warn!(
                    instance_key = instance_key.as_str(),
                    "rejected command: {}", err
                );
                return false;
            }
        };
        info!(
            instance_key = instance_key.as_str(),
            request_id = request.lifecycle.id.get(),
            "command accepted"
        );

        let ack = format!(
            "{}\nQueued provision request `{}` for `{}`.",
            ack_marker(&instance_key),
            request.lifecycle.id,
            repository
        );
        if let Err(err) = source.create_comment(item_number, &ack).await {
            warn!(
                instance_key = instance_key.as_str(),
                "posting acknowledgment failed: {:?}", err
            );
        }
        true
    }

    pub async fn start(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut mode_rx = self.mode.subscribe();
        info!(
            sources = self.sources.len(),
            prefix = self.config.command_prefix.as_str(),
            "trigger poller started"
        );
        loop {
            match self.mode.wait_tick(&mut ticker, &mut mode_rx).await {
                TickGate::Exit => break,
                TickGate::Skip => continue,
                TickGate::Run => {
                    self.poll_once().await;
                }
            }
        }
        info!("trigger poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use data_model::{requests::Request, test_objects::tests::TEST_REPOSITORY};

    use super::*;
    use crate::testing::{FakeSource, TestService};

    #[test]
    fn test_poll_window() {
        let config = PollerConfig::default();
        let now = 100 * 60 * 60 * 1000;
        assert_eq!(
            poll_window_start(None, now, &config),
            now - 24 * 60 * 60 * 1000
        );
        assert_eq!(
            poll_window_start(Some(now - 1000), now, &config),
            now - 1000 - 5 * 60 * 1000
        );
        assert_eq!(poll_window_start(Some(10), now, &config), 0);
    }

    #[test]
    fn test_instance_keys() {
        assert_eq!(body_instance_key("acme/widgets", 42), "acme/widgets#42:body");
        assert_eq!(
            comment_instance_key("acme/widgets", 42, 7),
            "acme/widgets#42:comment:7"
        );
    }

    #[tokio::test]
    async fn test_body_with_two_commands_creates_one_request() {
        let test = TestService::new();
        test.source.add_item(42, "/thopter first\n/thopter second");

        let report = test.poller.poll_once().await;

        assert_eq!(report.requests_created, 1);
        let log = test.service.scheduler.list_provision_requests().await;
        assert_eq!(log.pending.len(), 1);
        assert_eq!(log.pending[0].prompt.as_deref(), Some("first"));
        let posted = test.source.posted();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].1.contains("<!-- trigger-ack:acme/widgets#42:body -->"));
        assert!(posted[0].1.contains(log.pending[0].id().get()));
    }

    #[tokio::test]
    async fn test_existing_ack_prevents_duplicate_after_restart() {
        let test = TestService::new();
        test.source.add_item(42, "/thopter fix it");
        test.source.add_comment(
            42,
            &format!("{}\nQueued earlier.", ack_marker("acme/widgets#42:body")),
        );

        let report = test.poller.poll_once().await;

        assert_eq!(report.requests_created, 0);
        assert!(test.source.posted().is_empty());
        assert!(test
            .service
            .scheduler
            .list_provision_requests()
            .await
            .pending
            .is_empty());
    }

    #[tokio::test]
    async fn test_processed_commands_are_not_repeated() {
        let test = TestService::new();
        test.source.add_item(42, "/thopter fix it");
        test.source.set_drop_posted_comments(true);

        assert_eq!(test.poller.poll_once().await.requests_created, 1);
        // the ack was never stored, only the in-memory set stops a repeat
        assert_eq!(test.poller.poll_once().await.requests_created, 0);
        assert_eq!(test.poller.processed_count().await, 1);
    }

    #[tokio::test]
    async fn test_comment_commands_and_flags() {
        let test = TestService::new();
        test.source.add_item(7, "no command in the body");
        let comment_id =
            test.source
                .add_comment(7, "/thopter --template=python --repo=acme/api add retries");
        test.source.add_comment(7, "unrelated chatter");

        test.poller.poll_once().await;

        let log = test.service.scheduler.list_provision_requests().await;
        assert_eq!(log.pending.len(), 1);
        let request = &log.pending[0];
        assert_eq!(request.repository, "acme/api");
        assert_eq!(request.template.as_deref(), Some("python"));
        let trigger = request.trigger.as_ref().unwrap();
        assert_eq!(trigger.repository, TEST_REPOSITORY);
        assert_eq!(
            trigger.instance_key,
            comment_instance_key(TEST_REPOSITORY, 7, comment_id)
        );
        assert_eq!(trigger.comments.len(), 2);
        let acks = test
            .source
            .comments(7)
            .iter()
            .filter(|comment| acked_keys(&comment.body).contains(&trigger.instance_key))
            .count();
        assert_eq!(acks, 1);
    }

    #[tokio::test]
    async fn test_ack_comments_are_never_scanned() {
        let test = TestService::new();
        test.source.add_item(9, "");
        test.source.add_comment(
            9,
            &format!("{}\n/thopter this line is quoted", ack_marker("other")),
        );
        assert_eq!(test.poller.poll_once().await.requests_created, 0);
    }

    #[tokio::test]
    async fn test_last_success_only_advances_on_success() {
        let test = TestService::new();
        test.source.set_failing(true);
        let report = test.poller.poll_once().await;
        assert_eq!(report.sources_failed, 1);
        assert_eq!(test.poller.last_success_ms().await, None);

        test.source.set_failing(false);
        let now = test.clock.now_ms();
        test.poller.poll_once().await;
        assert_eq!(test.poller.last_success_ms().await, Some(now));
        assert_eq!(
            test.source.last_since(),
            Some(now - PollerConfig::default().initial_lookback.as_millis() as u64)
        );
    }

    #[tokio::test]
    async fn test_one_failing_source_does_not_block_others() {
        let test = TestService::new();
        let broken = Arc::new(FakeSource::new("acme/broken"));
        broken.set_failing(true);
        test.source.add_item(1, "/thopter go");
        let poller = TriggerPoller::new(
            vec![broken as Arc<dyn TriggerSource>, test.source.clone()],
            test.service.scheduler.clone(),
            test.service.mode.clone(),
            Arc::new(test.clock.clone()),
            PollerConfig::default(),
        );

        let report = poller.poll_once().await;

        assert_eq!(report.sources_ok, 1);
        assert_eq!(report.sources_failed, 1);
        assert_eq!(report.requests_created, 1);
        assert!(poller.last_success_ms().await.is_some());
    }
}
