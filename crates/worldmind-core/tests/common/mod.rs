//! Shared fixtures for mission-level integration tests: a scripted sandbox
//! provider, a scripted structured caller, and a mission harness wired to
//! an in-memory checkpoint store.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use worldmind_core::checkpoint::MemoryCheckpointStore;
use worldmind_core::config::WorldmindConfig;
use worldmind_core::events::EventBus;
use worldmind_core::graph::{MissionContext, MissionGraph};
use worldmind_core::metrics::RecordingSink;
use worldmind_core::mission::MissionState;
use worldmind_core::mission::model::{
    AgentKind, Classification, ClarifyingQuestions, ExecutionStrategy, InteractionMode,
    MissionSubmission, ProductSpec, ReasoningLevel,
};
use worldmind_core::planning::caller::{
    ApprovalGate, CallerError, ClarifyInput, DraftTask, ParsedReviewOutput, ParsedTestOutput,
    PlanDraft, PlanInput, ProjectScanner, SpecifyInput, StructuredCaller,
};
use worldmind_core::sandbox::SandboxManager;
use worldmind_core::sandbox::instruction_store::InstructionStore;
use worldmind_core::sandbox::provider::{OpenSandboxRequest, ProviderError, SandboxProvider};
use worldmind_core::worktree::WorkspaceManager;

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

/// One scripted sandbox run.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    pub exit_code: i32,
    pub output: String,
    /// Files written into the project during `wait_for_completion`,
    /// simulating agent work.
    pub write_files: Vec<(String, String)>,
    /// Fail `open_sandbox` with `ProviderUnavailable` instead of running.
    pub fail_open: bool,
}

impl ScriptedRun {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_output(output: &str) -> Self {
        Self {
            output: output.to_owned(),
            ..Self::default()
        }
    }

    pub fn writing(path: &str, contents: &str) -> Self {
        Self {
            write_files: vec![(path.to_owned(), contents.to_owned())],
            ..Self::default()
        }
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }
}

/// Provider that plays back scripted runs per task id.
///
/// Unknown task ids (tester and reviewer sub-dispatches, usually) get a
/// clean empty run.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedRun>>>,
    active: Mutex<HashMap<String, (ScriptedRun, PathBuf)>>,
    counter: AtomicU32,
    pub dispatched_task_ids: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a run for a task id. Multiple calls queue successive attempts.
    pub fn script(&self, task_id: &str, run: ScriptedRun) {
        self.scripts
            .lock()
            .unwrap()
            .entry(task_id.to_owned())
            .or_default()
            .push_back(run);
    }

    pub fn dispatched(&self) -> Vec<String> {
        self.dispatched_task_ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open_sandbox(&self, request: &OpenSandboxRequest) -> Result<String, ProviderError> {
        self.dispatched_task_ids
            .lock()
            .unwrap()
            .push(request.task_id.clone());

        let run = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.task_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();

        if run.fail_open {
            return Err(ProviderError::Unavailable("sandbox runtime down".to_owned()));
        }

        let id = format!(
            "sbx-{}-{}",
            request.task_id,
            self.counter.fetch_add(1, Ordering::SeqCst)
        );
        self.active
            .lock()
            .unwrap()
            .insert(id.clone(), (run, request.project_path.clone()));
        Ok(id)
    }

    async fn wait_for_completion(&self, sandbox_id: &str, _timeout_seconds: u64) -> i32 {
        let entry = self.active.lock().unwrap().get(sandbox_id).cloned();
        let Some((run, project_path)) = entry else {
            return -1;
        };
        for (path, contents) in &run.write_files {
            let full = project_path.join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(full, contents).unwrap();
        }
        run.exit_code
    }

    async fn capture_output(&self, sandbox_id: &str) -> String {
        self.active
            .lock()
            .unwrap()
            .get(sandbox_id)
            .map(|(run, _)| run.output.clone())
            .unwrap_or_default()
    }

    async fn teardown_sandbox(&self, sandbox_id: &str) {
        self.active.lock().unwrap().remove(sandbox_id);
    }
}

// ---------------------------------------------------------------------------
// Scripted caller
// ---------------------------------------------------------------------------

/// Caller that returns a fixed plan and scripted parse results.
#[derive(Debug)]
pub struct MockCaller {
    pub draft: PlanDraft,
    pub test_scripts: Mutex<VecDeque<ParsedTestOutput>>,
    pub review_scripts: Mutex<VecDeque<ParsedReviewOutput>>,
    pub parse_test_calls: AtomicU32,
    pub parse_review_calls: AtomicU32,
}

impl MockCaller {
    pub fn new(draft: PlanDraft) -> Self {
        Self {
            draft,
            test_scripts: Mutex::new(VecDeque::new()),
            review_scripts: Mutex::new(VecDeque::new()),
            parse_test_calls: AtomicU32::new(0),
            parse_review_calls: AtomicU32::new(0),
        }
    }

    pub fn script_test(&self, parsed: ParsedTestOutput) {
        self.test_scripts.lock().unwrap().push_back(parsed);
    }

    pub fn script_review(&self, parsed: ParsedReviewOutput) {
        self.review_scripts.lock().unwrap().push_back(parsed);
    }
}

pub fn passing_tests() -> ParsedTestOutput {
    ParsedTestOutput {
        passed: true,
        total: 0,
        failed: 0,
        duration_ms: 10,
    }
}

pub fn approving_review() -> ParsedReviewOutput {
    ParsedReviewOutput {
        approved: true,
        score: 9,
        summary: "looks good".to_owned(),
        issues: Vec::new(),
        suggestions: Vec::new(),
    }
}

#[async_trait]
impl StructuredCaller for MockCaller {
    async fn classify(&self, _request: &str) -> Result<Classification, CallerError> {
        Ok(Classification {
            category: "feature".to_owned(),
            complexity: 2,
            affected_components: Vec::new(),
            planning_strategy: "single-pass".to_owned(),
            runtime_tag: "python3.12".to_owned(),
        })
    }

    async fn clarify(
        &self,
        _input: &ClarifyInput<'_>,
    ) -> Result<ClarifyingQuestions, CallerError> {
        Ok(ClarifyingQuestions::default())
    }

    async fn specify(&self, input: &SpecifyInput<'_>) -> Result<ProductSpec, CallerError> {
        Ok(ProductSpec {
            title: "spec".to_owned(),
            summary: input.request.to_owned(),
            requirements: Vec::new(),
            acceptance_criteria: Vec::new(),
        })
    }

    async fn plan(&self, _input: &PlanInput<'_>) -> Result<PlanDraft, CallerError> {
        Ok(self.draft.clone())
    }

    async fn parse_test_output(&self, _raw: &str) -> Result<ParsedTestOutput, CallerError> {
        self.parse_test_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .test_scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(passing_tests))
    }

    async fn parse_review_output(&self, _raw: &str) -> Result<ParsedReviewOutput, CallerError> {
        self.parse_review_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .review_scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(approving_review))
    }
}

/// Scanner returning a canned context (the planning nodes only forward it).
#[derive(Debug, Default)]
pub struct StaticScanner;

#[async_trait]
impl ProjectScanner for StaticScanner {
    async fn scan(
        &self,
        _project_path: &Path,
    ) -> anyhow::Result<worldmind_core::mission::model::ProjectContext> {
        Ok(worldmind_core::mission::model::ProjectContext {
            language: "Python".to_owned(),
            framework: "FastAPI".to_owned(),
            file_tree: vec!["app/main.py".to_owned()],
            dependencies: vec!["fastapi".to_owned()],
            summary: "test project".to_owned(),
        })
    }
}

#[derive(Debug, Default)]
pub struct ApproveAll;

#[async_trait]
impl ApprovalGate for ApproveAll {
    async fn await_approval(&self, _mission_id: &str, _task_count: usize) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Everything a scenario test needs to drive a mission.
pub struct TestHarness {
    pub dir: TempDir,
    pub ctx: MissionContext,
    pub graph: MissionGraph,
    pub store: Arc<MemoryCheckpointStore>,
    pub provider: Arc<ScriptedProvider>,
    pub caller: Arc<MockCaller>,
    pub metrics: Arc<RecordingSink>,
}

impl TestHarness {
    /// Build a harness around a plan draft, with config tweaks applied.
    pub fn new(draft: PlanDraft, configure: impl FnOnce(&mut WorldmindConfig)) -> Self {
        let dir = TempDir::new().expect("failed to create project dir");

        let mut config = WorldmindConfig::for_project(dir.path());
        config.dispatch.max_parallel = 4;
        config.dispatch.wave_cooldown_seconds = 0;
        configure(&mut config);
        config.validate().expect("test config must validate");
        let config = Arc::new(config);

        let provider = Arc::new(ScriptedProvider::new());
        let caller = Arc::new(MockCaller::new(draft));
        let metrics = Arc::new(RecordingSink::new());
        let instruction_store = Arc::new(InstructionStore::new(b"test".to_vec()));
        let sandboxes = Arc::new(SandboxManager::new(
            Arc::clone(&config),
            Arc::clone(&provider) as Arc<dyn SandboxProvider>,
            instruction_store,
        ));
        let workspaces = Arc::new(WorkspaceManager::new(dir.path().join("workspaces")));

        let ctx = MissionContext {
            config,
            caller: Arc::clone(&caller) as Arc<dyn StructuredCaller>,
            scanner: Arc::new(StaticScanner),
            approval: Arc::new(ApproveAll),
            sandboxes,
            workspaces,
            events: Arc::new(EventBus::default()),
            metrics: Arc::clone(&metrics) as Arc<dyn worldmind_core::metrics::MetricsSink>,
            cancel: CancellationToken::new(),
        };

        Self {
            dir,
            ctx,
            graph: MissionGraph::standard(),
            store: Arc::new(MemoryCheckpointStore::new()),
            provider,
            caller,
            metrics,
        }
    }

    /// Run a fresh mission to its terminal state.
    pub async fn run(&self, request: &str) -> MissionState {
        let state = MissionState::from_submission(&submission(request), None);
        self.graph
            .run(state, &self.ctx, self.store.as_ref())
            .await
            .expect("mission drive failed")
    }
}

pub fn submission(request: &str) -> MissionSubmission {
    MissionSubmission {
        request: request.to_owned(),
        interaction_mode: InteractionMode::FullAuto,
        create_cf_deployment: false,
        prd_document: None,
        reasoning_level: Some(ReasoningLevel::Medium),
    }
}

/// Build a single-agent draft task.
pub fn draft_task(agent: AgentKind, description: &str) -> DraftTask {
    DraftTask {
        agent,
        description: description.to_owned(),
        input_context: String::new(),
        success_criteria: String::new(),
        dependencies: Vec::new(),
        target_files: Vec::new(),
        max_iterations: None,
        on_failure: None,
    }
}

/// Build a plan draft from tasks.
pub fn plan_draft(strategy: ExecutionStrategy, tasks: Vec<DraftTask>) -> PlanDraft {
    PlanDraft {
        tasks,
        execution_strategy: strategy,
        manifest_created_by_task: false,
    }
}
