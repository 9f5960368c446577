use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
        Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{test_objects::tests::TEST_REPOSITORY, SourceComment};
use processor::test_provisioner::tests::FakeProvisioner;
use state_store::test_state_store::tests::{FakeInventory, TEST_START_MS};
use thopter_utils::{ManualClock, OperatingMode};
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::ServerConfig,
    poller::{SourceItem, TriggerPoller, TriggerSource},
    routes::RouteState,
    service::Service,
};

pub const BOT_LOGIN: &str = "thopter-bot";

/// Issue tracker held in memory.
pub struct FakeSource {
    name: String,
    items: Mutex<Vec<SourceItem>>,
    comments: Mutex<HashMap<u64, Vec<SourceComment>>>,
    posted: Mutex<Vec<(u64, String)>>,
    next_comment_id: AtomicU64,
    failing: AtomicBool,
    drop_posted_comments: AtomicBool,
    last_since: Mutex<Option<u64>>,
}

impl FakeSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            items: Mutex::new(Vec::new()),
            comments: Mutex::new(HashMap::new()),
            posted: Mutex::new(Vec::new()),
            next_comment_id: AtomicU64::new(1),
            failing: AtomicBool::new(false),
            drop_posted_comments: AtomicBool::new(false),
            last_since: Mutex::new(None),
        }
    }

    pub fn add_item(&self, number: u64, body: &str) {
        let mut items = self.items.lock().unwrap();
        items.retain(|item| item.number != number);
        items.push(SourceItem {
            number,
            title: format!("issue {}", number),
            body: body.to_string(),
            author: "octocat".to_string(),
            url: format!("https://github.com/{}/issues/{}", self.name, number),
            updated_at: TEST_START_MS,
        });
    }

    /// Returns the id of the new comment.
    pub fn add_comment(&self, number: u64, body: &str) -> u64 {
        self.push_comment(number, "octocat", body)
    }

    fn push_comment(&self, number: u64, author: &str, body: &str) -> u64 {
        let id = self.next_comment_id.fetch_add(1, Ordering::SeqCst);
        self.comments
            .lock()
            .unwrap()
            .entry(number)
            .or_default()
            .push(SourceComment {
                id,
                author: author.to_string(),
                body: body.to_string(),
                created_at: TEST_START_MS,
            });
        id
    }

    pub fn comments(&self, number: u64) -> Vec<SourceComment> {
        self.comments
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .unwrap_or_default()
    }

    /// Comments created through [`TriggerSource::create_comment`].
    pub fn posted(&self) -> Vec<(u64, String)> {
        self.posted.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Posted comments are recorded but never show up in listings.
    pub fn set_drop_posted_comments(&self, value: bool) {
        self.drop_posted_comments.store(value, Ordering::SeqCst);
    }

    pub fn last_since(&self) -> Option<u64> {
        *self.last_since.lock().unwrap()
    }
}

#[async_trait]
impl TriggerSource for FakeSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_updated_items(&self, since_ms: u64) -> Result<Vec<SourceItem>> {
        *self.last_since.lock().unwrap() = Some(since_ms);
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("tracker unavailable"));
        }
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .filter(|item| item.updated_at >= since_ms)
            .cloned()
            .collect())
    }

    async fn list_comments(&self, item_number: u64) -> Result<Vec<SourceComment>> {
        Ok(self.comments(item_number))
    }

    async fn create_comment(&self, item_number: u64, body: &str) -> Result<()> {
        self.posted
            .lock()
            .unwrap()
            .push((item_number, body.to_string()));
        if !self.drop_posted_comments.load(Ordering::SeqCst) {
            self.push_comment(item_number, BOT_LOGIN, body);
        }
        Ok(())
    }
}

pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.provider.app_name = "thopters-test".to_string();
    config.provisioner.provision_command = "true".to_string();
    config.provisioner.destroy_command = "true".to_string();
    config
}

pub struct TestService {
    pub service: Service,
    pub inventory: Arc<FakeInventory>,
    pub provisioner: Arc<FakeProvisioner>,
    pub source: Arc<FakeSource>,
    pub poller: Arc<TriggerPoller>,
    pub clock: ManualClock,
}

impl TestService {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Builds the service around in-memory collaborators and moves it to
    /// `running` without spawning any loop.
    pub fn with_config(config: ServerConfig) -> Self {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
        let _ = subscriber::set_global_default(
            tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
        );

        let inventory = Arc::new(FakeInventory::default());
        let provisioner = Arc::new(FakeProvisioner::default());
        let source = Arc::new(FakeSource::new(TEST_REPOSITORY));
        let clock = ManualClock::new(TEST_START_MS);
        let service = Service::with_collaborators(
            config,
            inventory.clone(),
            provisioner.clone(),
            Arc::new(clock.clone()),
            vec![source.clone() as Arc<dyn TriggerSource>],
        );
        service.mode.transition(OperatingMode::Starting).unwrap();
        service.mode.transition(OperatingMode::Running).unwrap();
        let poller = service.poller.clone();

        Self {
            service,
            inventory,
            provisioner,
            source,
            poller,
            clock,
        }
    }

    pub fn route_state(&self) -> RouteState {
        self.service.route_state()
    }

    /// Runs scheduler ticks until no request is pending or processing.
    pub async fn drain_requests(&self) {
        for _ in 0..100 {
            self.service.scheduler.tick().await;
            tokio::task::yield_now().await;
            let provisions = self.service.scheduler.list_provision_requests().await;
            let destroys = self.service.scheduler.list_destroy_requests().await;
            let idle = provisions.pending.is_empty() &&
                provisions.processing.is_empty() &&
                destroys.pending.is_empty() &&
                destroys.processing.is_empty();
            if idle {
                return;
            }
        }
        panic!("requests did not drain");
    }
}
