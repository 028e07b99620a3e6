//! Shared fixtures: an on-disk worker with scripted inference and in-memory
//! template and seed sources.

use async_trait::async_trait;
use genworker::config::WorkerConfig;
use genworker::error::{InferenceError, TemplateError, WorkerError};
use genworker::inference::InferenceService;
use genworker::job::{Job, JobRequest, OutputSelection, TemplateRef};
use genworker::seeds::SeedSource;
use genworker::store::{JobStore, SledBackends};
use genworker::template::{Template, TemplateSource};
use genworker::types::now_millis;
use genworker::worker::{Worker, WorkerDeps};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

type CallHook = Box<dyn Fn() + Send + Sync>;

/// Inference double. Replies `out:{prompt}` unless scripted otherwise.
/// Call numbers are 1-based and count every invocation, failed or not.
#[derive(Default)]
pub struct ScriptedInference {
    calls: AtomicUsize,
    failures: Mutex<HashMap<usize, InferenceError>>,
    hooks: Mutex<HashMap<usize, CallHook>>,
    replies: Mutex<Vec<(String, String)>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedInference {
    pub fn fail_call(&self, call: usize, err: InferenceError) {
        self.failures.lock().insert(call, err);
    }

    /// Run `hook` while serving the given call.
    pub fn on_call(&self, call: usize, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.lock().insert(call, Box::new(hook));
    }

    /// Reply with `reply` to prompts containing `needle`.
    pub fn reply_containing(&self, needle: &str, reply: &str) {
        self.replies
            .lock()
            .push((needle.to_string(), reply.to_string()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceService for ScriptedInference {
    async fn invoke(&self, _model_id: &str, prompt: &str) -> Result<String, InferenceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.prompts.lock().push(prompt.to_string());
        if let Some(hook) = self.hooks.lock().get(&call) {
            hook();
        }
        if let Some(err) = self.failures.lock().remove(&call) {
            return Err(err);
        }
        let scripted = self
            .replies
            .lock()
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone());
        Ok(scripted.unwrap_or_else(|| format!("out:{}", prompt)))
    }
}

#[derive(Default)]
pub struct StaticTemplates {
    templates: Mutex<HashMap<(String, String), Template>>,
}

impl StaticTemplates {
    pub fn insert(&self, template: Template) {
        self.templates
            .lock()
            .insert((template.id.clone(), template.version.clone()), template);
    }
}

impl TemplateSource for StaticTemplates {
    fn load(&self, template: &TemplateRef) -> Result<Template, TemplateError> {
        self.templates
            .lock()
            .get(&(template.id.clone(), template.version.clone()))
            .cloned()
            .ok_or_else(|| TemplateError::NotFound(template.to_string()))
    }
}

#[derive(Default)]
pub struct StaticSeeds {
    sets: Mutex<HashMap<String, Vec<Value>>>,
}

impl StaticSeeds {
    pub fn insert(&self, seed_ref: &str, seeds: Vec<Value>) {
        self.sets.lock().insert(seed_ref.to_string(), seeds);
    }
}

impl SeedSource for StaticSeeds {
    fn load(&self, seed_ref: &str) -> Result<Vec<Value>, WorkerError> {
        self.sets
            .lock()
            .get(seed_ref)
            .cloned()
            .ok_or_else(|| WorkerError::SeedError(format!("unknown seed set {}", seed_ref)))
    }
}

pub fn single_step_template() -> Template {
    serde_json::from_value(json!({
        "id": "qa",
        "version": "1",
        "steps": [
            {"kind": "generate", "id": "text", "prompt": "Write about {{seed.topic}} ({{index}})"}
        ]
    }))
    .unwrap()
}

pub fn labelled_template() -> Template {
    serde_json::from_value(json!({
        "id": "labelled",
        "version": "1",
        "steps": [
            {"kind": "generate", "id": "text", "prompt": "Write about {{seed.topic}} ({{index}})"},
            {"kind": "classify", "id": "tone", "prompt": "Tone of: {{steps.text}}",
             "labels": ["calm", "urgent"]}
        ]
    }))
    .unwrap()
}

/// A worker environment on a temporary directory.
///
/// Pricing is one unit per invocation with token prices zeroed, so spend
/// equals the number of successful invocations.
pub struct Fixture {
    pub dir: TempDir,
    pub config: WorkerConfig,
    pub backends: SledBackends,
    pub inference: Arc<ScriptedInference>,
    pub templates: Arc<StaticTemplates>,
    pub seeds: Arc<StaticSeeds>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_interval(50)
    }

    pub fn with_interval(checkpoint_interval: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = WorkerConfig::default();
        config.worker.checkpoint_interval = checkpoint_interval;
        config.worker.max_consecutive_failures = 3;
        config.checkpoint.backoff_ms = 1;
        config.pricing.per_invocation = 1.0;
        config.pricing.input_per_1k_tokens = 0.0;
        config.pricing.output_per_1k_tokens = 0.0;
        config.storage = config.storage.resolved(dir.path());

        let backends = SledBackends::open(&config.storage).unwrap();
        let templates = Arc::new(StaticTemplates::default());
        templates.insert(single_step_template());
        templates.insert(labelled_template());
        let seeds = Arc::new(StaticSeeds::default());
        seeds.insert(
            "topics",
            vec![
                json!({"topic": "rust"}),
                json!({"topic": "sled"}),
                json!({"topic": "tokio"}),
            ],
        );

        Self {
            dir,
            config,
            backends,
            inference: Arc::new(ScriptedInference::default()),
            templates,
            seeds,
        }
    }

    pub fn worker(&self, owner: &str) -> Worker {
        let deps = WorkerDeps {
            jobs: self.backends.jobs.clone(),
            blobs: self.backends.blobs.clone(),
            ledger: self.backends.ledger.clone(),
            batches: self.backends.batches.clone(),
            inference: self.inference.clone(),
            templates: self.templates.clone(),
            seeds: self.seeds.clone(),
        };
        Worker::new(&self.config, owner, deps)
    }

    pub fn request(&self, job_id: &str, budget_limit: f64, target: u64) -> JobRequest {
        JobRequest {
            job_id: job_id.to_string(),
            owner: "test".to_string(),
            budget_limit,
            target_record_count: target,
            template: TemplateRef {
                id: "qa".to_string(),
                version: "1".to_string(),
            },
            seed_ref: "topics".to_string(),
            output: OutputSelection::default(),
        }
    }

    pub fn submit_request(&self, request: JobRequest) -> Job {
        request.validate().unwrap();
        let job = request.into_job(now_millis());
        assert!(self.backends.jobs.enqueue(&job, now_millis()).unwrap());
        job
    }

    pub fn submit(&self, job_id: &str, budget_limit: f64, target: u64) -> Job {
        self.submit_request(self.request(job_id, budget_limit, target))
    }

    pub fn job(&self, job_id: &str) -> Job {
        self.backends.jobs.get_job(job_id).unwrap().unwrap()
    }
}
