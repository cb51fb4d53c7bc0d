#![allow(dead_code)]

//! Shared fixtures: scripted providers, a recording transport and a fully wired
//! in-memory pipeline.

use async_trait::async_trait;
use parking_lot::Mutex;
use scenepipe_core::config::PipelineConfig;
use scenepipe_core::database::{MemoryStore, SlotStore};
use scenepipe_core::error::{PipelineResult, ProviderError};
use scenepipe_core::messaging::{
    DispatchTransport, LocalDispatchTransport, MessageEnvelope, PipelineMessage,
};
use scenepipe_core::models::{Feature, NewTask, SceneContent, SlotLimit, Step, Task};
use scenepipe_core::orchestration::{PipelineOrchestrator, PipelineWorker};
use scenepipe_core::providers::{Provider, ProviderOutcome, ProviderRegistry, ProviderRequest};
use scenepipe_core::slot_broker::SlotBroker;
use scenepipe_core::state_machine::TaskMode;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

type Scripted = Result<ProviderOutcome, ProviderError>;

/// Provider that replays queued outcomes and completes with a derived resource
/// reference once its script runs out
pub struct ScriptedProvider {
    name: String,
    feature: Feature,
    service: Option<String>,
    generate_script: Mutex<VecDeque<Scripted>>,
    poll_script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ProviderRequest>>,
    cancelled: Mutex<Vec<String>>,
    polls: AtomicUsize,
    gate: Option<Gate>,
}

/// Holds the first `generate` call until released
#[derive(Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl ScriptedProvider {
    pub fn new(name: &str, feature: Feature) -> Self {
        Self {
            name: name.to_string(),
            feature,
            service: None,
            generate_script: Mutex::new(VecDeque::new()),
            poll_script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub fn rate_limited(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }

    pub fn gated(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn then(self, outcome: Scripted) -> Self {
        self.generate_script.lock().push_back(outcome);
        self
    }

    pub fn then_poll(self, outcome: Scripted) -> Self {
        self.poll_script.lock().push_back(outcome);
        self
    }

    pub fn push(&self, outcome: Scripted) {
        self.generate_script.lock().push_back(outcome);
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn feature(&self) -> Feature {
        self.feature
    }

    fn rate_limit_service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderOutcome, ProviderError> {
        let first_call = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len() == 1
        };
        if let (Some(gate), true) = (&self.gate, first_call) {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let scripted = self.generate_script.lock().pop_front();
        scripted.unwrap_or_else(|| {
            let key = request.resource_key.clone().unwrap_or_else(|| "resource".into());
            Ok(ProviderOutcome::completed(format!("mem://{key}")))
        })
    }

    async fn poll(&self, job_id: &str) -> Result<ProviderOutcome, ProviderError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.poll_script.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(ProviderOutcome::completed(format!("mem://{job_id}"))))
    }

    async fn cancel(&self, job_id: &str) -> Result<(), ProviderError> {
        self.cancelled.lock().push(job_id.to_string());
        Ok(())
    }
}

/// Storyboard provider producing `count` scenes
pub fn storyboard_outcome(count: usize) -> ProviderOutcome {
    let scenes: Vec<Value> = (1..=count)
        .map(|i| {
            json!({
                "narration": format!("narration {i}"),
                "image_prompt": format!("image prompt {i}"),
            })
        })
        .collect();
    let mut meta = Map::new();
    meta.insert("scenes".into(), Value::Array(scenes));
    ProviderOutcome::Completed {
        resource_ref: "mem://storyboard".into(),
        meta,
    }
}

pub fn scenes(count: usize) -> Vec<SceneContent> {
    (1..=count)
        .map(|i| SceneContent {
            narration: format!("narration {i}"),
            image_prompt: format!("image prompt {i}"),
            ..Default::default()
        })
        .collect()
}

/// Transport that records every message and forwards it to a local queue
pub struct RecordingTransport {
    inner: LocalDispatchTransport,
    sent: Mutex<Vec<MessageEnvelope>>,
}

impl RecordingTransport {
    pub fn new(inner: LocalDispatchTransport) -> Self {
        Self {
            inner,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn messages(&self) -> Vec<PipelineMessage> {
        self.sent.lock().iter().map(|e| e.message.clone()).collect()
    }

    /// Stages of every `ExecuteStep` sent, in order
    pub fn executed_stages(&self) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                PipelineMessage::ExecuteStep { stage, item_id: None, .. } => Some(stage),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl DispatchTransport for RecordingTransport {
    async fn send(&self, envelope: MessageEnvelope) -> PipelineResult<()> {
        self.sent.lock().push(envelope.clone());
        self.inner.send(envelope).await
    }
}

/// One provider per feature, all named `mem`
pub struct Providers {
    pub storyboard: Arc<ScriptedProvider>,
    pub image: Arc<ScriptedProvider>,
    pub audio: Arc<ScriptedProvider>,
    pub video: Arc<ScriptedProvider>,
    pub compose: Arc<ScriptedProvider>,
    pub video_prompt: Option<Arc<ScriptedProvider>>,
}

impl Providers {
    pub fn new(scene_count: usize) -> Self {
        Self {
            storyboard: Arc::new(
                ScriptedProvider::new("mem", Feature::Storyboard)
                    .then(Ok(storyboard_outcome(scene_count))),
            ),
            image: Arc::new(ScriptedProvider::new("mem", Feature::Image)),
            audio: Arc::new(ScriptedProvider::new("mem", Feature::Audio)),
            video: Arc::new(ScriptedProvider::new("mem", Feature::Video)),
            compose: Arc::new(ScriptedProvider::new("mem", Feature::MediaCompose)),
            video_prompt: None,
        }
    }

    pub fn with_image(mut self, image: ScriptedProvider) -> Self {
        self.image = Arc::new(image);
        self
    }

    pub fn with_video(mut self, video: ScriptedProvider) -> Self {
        self.video = Arc::new(video);
        self
    }

    pub fn with_video_prompt(mut self, video_prompt: ScriptedProvider) -> Self {
        self.video_prompt = Some(Arc::new(video_prompt));
        self
    }

    fn registry(&self) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry
            .register(self.storyboard.clone())
            .register(self.image.clone())
            .register(self.audio.clone())
            .register(self.video.clone())
            .register(self.compose.clone());
        let mut defaults = BTreeMap::from([
            (Feature::Storyboard, "mem".to_string()),
            (Feature::Image, "mem".to_string()),
            (Feature::Audio, "mem".to_string()),
            (Feature::Video, "mem".to_string()),
            (Feature::MediaCompose, "mem".to_string()),
        ]);
        if let Some(video_prompt) = &self.video_prompt {
            registry.register(video_prompt.clone());
            defaults.insert(Feature::VideoPrompt, "mem".to_string());
        }
        registry.with_defaults(defaults);
        registry
    }
}

/// Fully wired in-memory pipeline
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub broker: Arc<SlotBroker>,
    pub transport: Arc<RecordingTransport>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub worker: PipelineWorker,
    pub providers: Providers,
    pub config: PipelineConfig,
}

pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.execution.admission_retry_delay_ms = 1;
    config.worker.redelivery_backoff_ms = 1;
    config.slot_broker.limit_cache_ttl_seconds = 0.0;
    config
}

impl Harness {
    pub fn new(providers: Providers) -> Self {
        Self::with_config(providers, test_config())
    }

    pub fn with_config(providers: Providers, config: PipelineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(SlotBroker::new(store.clone(), config.slot_broker.clone()));
        let registry = Arc::new(providers.registry());
        let (local, queue) = LocalDispatchTransport::channel(config.worker.queue_capacity);
        let transport = Arc::new(RecordingTransport::new(local));
        let orchestrator = Arc::new(
            PipelineOrchestrator::new(
                store.clone(),
                broker.clone(),
                registry,
                transport.clone(),
                &config,
            )
            .expect("orchestrator"),
        );
        let worker = PipelineWorker::new(
            orchestrator.clone(),
            transport.clone(),
            queue,
            config.worker.clone(),
        );
        Self {
            store,
            broker,
            transport,
            orchestrator,
            worker,
            providers,
            config,
        }
    }

    pub async fn limit(&self, service: &str, feature: Option<&str>, max_slots: i32) {
        self.store
            .upsert_slot_limit(&SlotLimit::new(service, feature, max_slots))
            .await
            .expect("slot limit");
    }

    pub async fn create(&self, mode: TaskMode, scenes: Option<Vec<SceneContent>>) -> Task {
        self.orchestrator
            .create_task(NewTask {
                mode,
                config: json!({"script": "a short film about the sea"}),
                scenes,
                ..Default::default()
            })
            .await
            .expect("create task")
    }

    pub async fn step(&self, task_id: uuid::Uuid, name: &str) -> Step {
        self.orchestrator
            .list_steps(task_id)
            .await
            .expect("steps")
            .into_iter()
            .find(|s| s.name == name)
            .expect("step exists")
    }

    pub async fn task(&self, task_id: uuid::Uuid) -> Task {
        self.orchestrator
            .get_task(task_id)
            .await
            .expect("task")
            .expect("task exists")
    }
}
