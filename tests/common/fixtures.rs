#![allow(dead_code)]

//! Scripted in-memory collaborators shared across the integration suites.
//!
//! The LLM and search fixtures are deterministic: every task has a sane
//! default response so the happy path needs no scripting, and individual
//! tests push per-task response queues to steer a scenario.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::json;

use specloom::checkpoint::InMemoryCheckpointStore;
use specloom::collaborators::{
    ArtifactStore, CodeBundleParser, CollaboratorError, Collaborators, DownstreamNotifier,
    LlmClient, UpstreamBundle, UpstreamLoader, WebSearch,
};
use specloom::config::Config;
use specloom::domain::{
    ArtifactRecord, DocKind, NotifyPayload, ParsedComponent, SavedArtifact, SearchHit,
};
use specloom::scheduler::{SessionScheduler, StartRequest, StatusReport};
use specloom::types::SessionStatus;

/// Deterministic LLM stub: per-task response queues with fallback
/// defaults, plus call counting for assertions.
#[derive(Default)]
pub struct ScriptedLlm {
    scripts: Mutex<HashMap<String, VecDeque<String>>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next `task` completion.
    pub fn push(&self, task: &str, body: impl Into<String>) {
        self.scripts
            .lock()
            .entry(task.to_string())
            .or_default()
            .push_back(body.into());
    }

    pub fn calls(&self, task: &str) -> u32 {
        self.calls.lock().get(task).copied().unwrap_or(0)
    }

    fn default_response(task: &str) -> String {
        match task {
            "analyze_completeness" => json!({
                "completeness_score": 92,
                "missing_elements": [],
                "ambiguous_elements": [],
            })
            .to_string(),
            "identify_tech_gaps" => json!({"gaps": []}).to_string(),
            "enrich_options" => json!({
                "options": [
                    option_json("Option A", 90),
                    option_json("Option B", 70),
                    option_json("Option C", 50),
                ]
            })
            .to_string(),
            "validate_decision" => json!({"warnings": []}).to_string(),
            "generate_trd" => "# Technical Requirements Document\n\n## Architecture\n\nService plus database.\n".to_string(),
            "validate_trd" => json!({
                "score": 95,
                "missing_sections": [],
                "inconsistencies": [],
                "suggestions": [],
            })
            .to_string(),
            "infer_api" => json!({
                "endpoints": [
                    {"method": "GET", "path": "/api/items"},
                    {"method": "POST", "path": "/api/items"},
                ]
            })
            .to_string(),
            "generate_db_schema" => json!({
                "tables": [{
                    "name": "items",
                    "columns": [
                        {"name": "id", "data_type": "uuid", "primary_key": true},
                        {"name": "title", "data_type": "text", "nullable": false},
                    ],
                }]
            })
            .to_string(),
            "generate_architecture" => "flowchart TD\n    client --> api\n    api --> db\n".to_string(),
            "validate_architecture" => json!({"score": 88, "warnings": []}).to_string(),
            other => panic!("no default response for LLM task {other}"),
        }
    }
}

pub fn option_json(name: &str, ease: u8) -> serde_json::Value {
    json!({
        "name": name,
        "description": format!("{name} description"),
        "pros": ["solid"],
        "cons": ["none noted"],
        "popularity_metrics": {"stars": 1000},
        "docs_url": "https://example.com/docs",
        "learning_curve": "moderate",
        "setup_time": "hours",
        "cost": "free",
        "scores": {
            "ease_of_use": ease,
            "popularity": 60,
            "recency": 60,
            "docs": 60,
            "cost": 60,
            "setup": 60,
        },
    })
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, task: &str, _prompt: &str) -> Result<String, CollaboratorError> {
        *self.calls.lock().entry(task.to_string()).or_insert(0) += 1;
        let scripted = self.scripts.lock().get_mut(task).and_then(|q| q.pop_front());
        Ok(scripted.unwrap_or_else(|| Self::default_response(task)))
    }
}

/// Web search stub; flip `fail` to simulate a dead provider.
#[derive(Default)]
pub struct ScriptedSearch {
    pub fail: Mutex<bool>,
    calls: Mutex<u32>,
}

impl ScriptedSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock() = failing;
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl WebSearch for ScriptedSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, CollaboratorError> {
        *self.calls.lock() += 1;
        if *self.fail.lock() {
            return Err(CollaboratorError::Unavailable {
                service: "web_search",
                message: "provider down".into(),
            });
        }
        Ok((0..limit.min(3))
            .map(|i| SearchHit {
                title: format!("result {i} for {query}"),
                url: format!("https://example.com/{i}"),
                snippet: "snippet".into(),
            })
            .collect())
    }
}

/// Upstream loader serving one fixed bundle, or failing with a missing
/// list.
pub struct StaticUpstream {
    bundle: Mutex<UpstreamBundle>,
    missing: Mutex<Vec<String>>,
}

impl StaticUpstream {
    pub fn complete() -> Self {
        let mut design_docs = FxHashMap::default();
        design_docs.insert(DocKind::DesignSystem, "tokens and components".to_string());
        design_docs.insert(DocKind::UxFlow, "signup -> dashboard".to_string());
        design_docs.insert(DocKind::ScreenSpecs, "dashboard screen".to_string());
        Self {
            bundle: Mutex::new(UpstreamBundle {
                prd: "Auth: JWT. Database: PostgreSQL. Storage: S3. No realtime features."
                    .to_string(),
                design_docs,
                code_bundle_ref: None,
            }),
            missing: Mutex::new(Vec::new()),
        }
    }

    pub fn with_prd(self, prd: &str) -> Self {
        self.bundle.lock().prd = prd.to_string();
        self
    }

    pub fn with_code_bundle(self, bundle_ref: &str) -> Self {
        self.bundle.lock().code_bundle_ref = Some(bundle_ref.to_string());
        self
    }

    pub fn set_missing(&self, missing: &[&str]) {
        *self.missing.lock() = missing.iter().map(|s| s.to_string()).collect();
    }
}

#[async_trait]
impl UpstreamLoader for StaticUpstream {
    async fn load(&self, _upstream_job_id: &str) -> Result<UpstreamBundle, CollaboratorError> {
        let missing = self.missing.lock().clone();
        if !missing.is_empty() {
            return Err(CollaboratorError::UpstreamIncomplete { missing });
        }
        Ok(self.bundle.lock().clone())
    }
}

/// Notifier that records every call and the distinct downstream effects
/// (one per session id, per the idempotency contract).
#[derive(Default)]
pub struct RecordingNotifier {
    pub calls: Mutex<Vec<NotifyPayload>>,
    effects: Mutex<HashSet<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn effect_count(&self) -> usize {
        self.effects.lock().len()
    }
}

#[async_trait]
impl DownstreamNotifier for RecordingNotifier {
    async fn notify(&self, payload: NotifyPayload) -> Result<(), CollaboratorError> {
        self.calls.lock().push(payload.clone());
        self.effects.lock().insert(payload.session_id);
        Ok(())
    }
}

/// Artifact store assigning strictly increasing versions per session.
#[derive(Default)]
pub struct MemoryArtifactStore {
    records: Mutex<HashMap<String, Vec<ArtifactRecord>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, session_id: &str) -> Option<ArtifactRecord> {
        self.records
            .lock()
            .get(session_id)
            .and_then(|v| v.last().cloned())
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn save(&self, mut record: ArtifactRecord) -> Result<SavedArtifact, CollaboratorError> {
        let mut records = self.records.lock();
        let versions = records.entry(record.session_id.clone()).or_default();
        let version = versions.len() as u32 + 1;
        record.version = version;
        let artifact_id = format!("artifact-{}-v{version}", record.session_id);
        versions.push(record);
        Ok(SavedArtifact {
            artifact_id,
            version,
        })
    }
}

/// Code parser returning a fixed component list.
#[derive(Default)]
pub struct StubCodeParser {
    pub components: Vec<ParsedComponent>,
}

#[async_trait]
impl CodeBundleParser for StubCodeParser {
    async fn parse(&self, _bundle_ref: &str) -> Result<Vec<ParsedComponent>, CollaboratorError> {
        Ok(self.components.clone())
    }
}

/// Everything a scenario needs, pre-wired.
pub struct TestWorld {
    pub llm: Arc<ScriptedLlm>,
    pub search: Arc<ScriptedSearch>,
    pub notifier: Arc<RecordingNotifier>,
    pub artifacts: Arc<MemoryArtifactStore>,
    pub upstream: Arc<StaticUpstream>,
    pub store: Arc<InMemoryCheckpointStore>,
    pub scheduler: SessionScheduler,
}

pub fn world() -> TestWorld {
    world_with(test_config(), StaticUpstream::complete())
}

pub fn world_with(config: Config, upstream: StaticUpstream) -> TestWorld {
    let llm = Arc::new(ScriptedLlm::new());
    let search = Arc::new(ScriptedSearch::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let upstream = Arc::new(upstream);
    let store = Arc::new(InMemoryCheckpointStore::new());
    let collaborators = Arc::new(Collaborators {
        upstream: upstream.clone(),
        notifier: notifier.clone(),
        llm: llm.clone(),
        search: search.clone(),
        code_parser: Arc::new(StubCodeParser::default()),
        artifacts: artifacts.clone(),
    });
    let scheduler = SessionScheduler::new(collaborators, store.clone(), config);
    TestWorld {
        llm,
        search,
        notifier,
        artifacts,
        upstream,
        store,
        scheduler,
    }
}

/// Defaults tuned for test speed: tiny backoff, everything else stock.
pub fn test_config() -> Config {
    Config {
        retry_base_delay: Duration::from_millis(5),
        ..Config::default()
    }
}

pub fn start_request() -> StartRequest {
    StartRequest {
        project_id: "proj-1".into(),
        user_id: "user-1".into(),
        upstream_job_id: "job-1".into(),
    }
}

/// Poll session status until `pred` holds or the timeout elapses.
pub async fn wait_for_status(
    scheduler: &SessionScheduler,
    session_id: &str,
    pred: impl Fn(&StatusReport) -> bool,
) -> StatusReport {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(report) = scheduler.status(session_id).await {
            if pred(&report) {
                return report;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for session {session_id} status");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_until_paused(scheduler: &SessionScheduler, session_id: &str) -> StatusReport {
    wait_for_status(scheduler, session_id, |r| {
        r.status == SessionStatus::Paused
    })
    .await
}

pub async fn wait_until_completed(scheduler: &SessionScheduler, session_id: &str) -> StatusReport {
    wait_for_status(scheduler, session_id, |r| {
        r.status == SessionStatus::Completed
    })
    .await
}

/// JSON body for a single-gap `identify_tech_gaps` script.
pub fn single_auth_gap() -> String {
    json!({
        "gaps": [{
            "id": "gap-auth",
            "category": "authentication",
            "description": "authentication approach unspecified",
            "requirements": ["secure session handling"],
            "urgency": "high",
            "depends_on": [],
        }]
    })
    .to_string()
}

/// JSON body for a two-gap script (auth then database).
pub fn two_gaps() -> String {
    json!({
        "gaps": [
            {
                "id": "gap-auth",
                "category": "authentication",
                "description": "authentication approach unspecified",
                "requirements": ["secure session handling"],
                "urgency": "high",
                "depends_on": [],
            },
            {
                "id": "gap-db",
                "category": "database",
                "description": "database engine unspecified",
                "requirements": ["relational queries"],
                "urgency": "medium",
                "depends_on": ["gap-auth"],
            },
        ]
    })
    .to_string()
}
