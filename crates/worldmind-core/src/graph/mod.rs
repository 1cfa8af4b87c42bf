//! Graph engine: node registry, conditional edges, execution driver, and
//! checkpoint hook-points.
//!
//! The engine owns the mission state. Nodes receive an immutable view and
//! return a patch; the channel reducer applies it between nodes. A
//! checkpoint is written before and after every node so a mission can be
//! resumed from the last committed node after a process restart.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;
use crate::config::WorldmindConfig;
use crate::events::{EventBus, topic};
use crate::metrics::MetricsSink;
use crate::mission::{MissionPatch, MissionState, apply_patch};
use crate::mission::model::{InteractionMode, MissionStatus};
use crate::planning::caller::{ApprovalGate, ProjectScanner, StructuredCaller};
use crate::sandbox::SandboxManager;
use crate::worktree::WorkspaceManager;

/// Name of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeName {
    Classify,
    Upload,
    Clarify,
    Spec,
    Plan,
    AwaitApproval,
    ScheduleWave,
    ParallelDispatch,
    EvaluateWave,
    Converge,
    PostMission,
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Classify => "classify",
            Self::Upload => "upload",
            Self::Clarify => "clarify",
            Self::Spec => "spec",
            Self::Plan => "plan",
            Self::AwaitApproval => "await_approval",
            Self::ScheduleWave => "schedule_wave",
            Self::ParallelDispatch => "parallel_dispatch",
            Self::EvaluateWave => "evaluate_wave",
            Self::Converge => "converge",
            Self::PostMission => "post_mission",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeName {
    type Err = NodeNameParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classify" => Ok(Self::Classify),
            "upload" => Ok(Self::Upload),
            "clarify" => Ok(Self::Clarify),
            "spec" => Ok(Self::Spec),
            "plan" => Ok(Self::Plan),
            "await_approval" => Ok(Self::AwaitApproval),
            "schedule_wave" => Ok(Self::ScheduleWave),
            "parallel_dispatch" => Ok(Self::ParallelDispatch),
            "evaluate_wave" => Ok(Self::EvaluateWave),
            "converge" => Ok(Self::Converge),
            "post_mission" => Ok(Self::PostMission),
            other => Err(NodeNameParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeName`] string.
#[derive(Debug, Clone)]
pub struct NodeNameParseError(pub String);

impl fmt::Display for NodeNameParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node name: {:?}", self.0)
    }
}

impl std::error::Error for NodeNameParseError {}

/// Collaborators shared by every node.
pub struct MissionContext {
    pub config: Arc<WorldmindConfig>,
    pub caller: Arc<dyn StructuredCaller>,
    pub scanner: Arc<dyn ProjectScanner>,
    pub approval: Arc<dyn ApprovalGate>,
    pub sandboxes: Arc<SandboxManager>,
    pub workspaces: Arc<WorkspaceManager>,
    pub events: Arc<EventBus>,
    pub metrics: Arc<dyn MetricsSink>,
    pub cancel: CancellationToken,
}

/// One graph node.
///
/// Nodes must catch their predictable failures and surface them through
/// the patch (`errors` entries, `status = FAILED`). An `Err` from `run` is
/// treated as an unexpected failure and fails the mission.
#[async_trait]
pub trait MissionNode: Send + Sync {
    fn name(&self) -> NodeName;

    async fn run(&self, state: &MissionState, ctx: &MissionContext) -> Result<MissionPatch>;
}

/// The mission graph: registered nodes plus the conditional edge function.
#[derive(Default)]
pub struct MissionGraph {
    nodes: HashMap<NodeName, Arc<dyn MissionNode>>,
}

impl MissionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Replaces any node already registered under the
    /// same name.
    pub fn register(&mut self, node: Arc<dyn MissionNode>) {
        self.nodes.insert(node.name(), node);
    }

    /// The standard mission topology with every production node.
    pub fn standard() -> Self {
        let mut graph = Self::new();
        graph.register(Arc::new(crate::planning::nodes::ClassifyNode));
        graph.register(Arc::new(crate::planning::nodes::UploadNode));
        graph.register(Arc::new(crate::planning::nodes::ClarifyNode));
        graph.register(Arc::new(crate::planning::nodes::SpecNode));
        graph.register(Arc::new(crate::planning::nodes::PlanNode));
        graph.register(Arc::new(crate::planning::nodes::AwaitApprovalNode));
        graph.register(Arc::new(crate::scheduler::node::ScheduleWaveNode::new()));
        graph.register(Arc::new(crate::dispatch::ParallelDispatchNode));
        graph.register(Arc::new(crate::gate::EvaluateWaveNode));
        graph.register(Arc::new(crate::planning::nodes::ConvergeNode));
        graph.register(Arc::new(crate::planning::nodes::PostMissionNode));
        graph
    }

    /// The conditional edge function.
    ///
    /// Routing follows the mission pipeline; a `FAILED` status short-cuts
    /// to converge so final metrics are still produced.
    pub fn next_node(state: &MissionState, current: NodeName) -> Option<NodeName> {
        if state.status == MissionStatus::Failed
            && !matches!(current, NodeName::Converge | NodeName::PostMission)
        {
            return Some(NodeName::Converge);
        }

        match current {
            NodeName::Classify => Some(NodeName::Upload),
            NodeName::Upload => Some(NodeName::Clarify),
            NodeName::Clarify => Some(NodeName::Spec),
            NodeName::Spec => Some(NodeName::Plan),
            NodeName::Plan => {
                if state.interaction_mode == InteractionMode::ApprovePlan {
                    Some(NodeName::AwaitApproval)
                } else {
                    Some(NodeName::ScheduleWave)
                }
            }
            NodeName::AwaitApproval => Some(NodeName::ScheduleWave),
            NodeName::ScheduleWave => {
                if state.wave_task_ids.is_empty() {
                    Some(NodeName::Converge)
                } else {
                    Some(NodeName::ParallelDispatch)
                }
            }
            NodeName::ParallelDispatch => Some(NodeName::EvaluateWave),
            NodeName::EvaluateWave => Some(NodeName::ScheduleWave),
            NodeName::Converge => Some(NodeName::PostMission),
            NodeName::PostMission => None,
        }
    }

    /// Run a fresh mission from the classify node.
    pub async fn run(
        &self,
        state: MissionState,
        ctx: &MissionContext,
        store: &dyn CheckpointStore,
    ) -> Result<MissionState> {
        ctx.events.publish(
            topic::MISSION_STARTED,
            &state.mission_id,
            None,
            serde_json::json!({ "request": state.request }),
        );
        let state = apply_patch(&state, &MissionPatch::status(MissionStatus::Classifying))
            .context("failed to mark mission classifying")?;
        self.drive(state, NodeName::Classify, ctx, store).await
    }

    /// Resume a mission from its latest checkpoint.
    ///
    /// A `pre` checkpoint re-executes the interrupted node; a `post`
    /// checkpoint continues with its successor.
    pub async fn resume(
        &self,
        thread_id: &str,
        ctx: &MissionContext,
        store: &dyn CheckpointStore,
    ) -> Result<MissionState> {
        let latest = store
            .get_latest(thread_id)
            .await?
            .with_context(|| format!("no checkpoint found for thread {thread_id}"))?;

        let node: NodeName = latest
            .node_name
            .parse()
            .with_context(|| format!("checkpoint has unknown node {:?}", latest.node_name))?;

        let phase = CheckpointPhase::of(&latest.checkpoint_id);
        let start = match phase {
            CheckpointPhase::Pre => Some(node),
            CheckpointPhase::Post => Self::next_node(&latest.state, node),
        };

        tracing::info!(
            thread_id = thread_id,
            checkpoint_id = %latest.checkpoint_id,
            resume_at = ?start,
            "resuming mission from checkpoint"
        );

        match start {
            Some(start) => self.drive(latest.state, start, ctx, store).await,
            None => Ok(latest.state),
        }
    }

    async fn drive(
        &self,
        mut state: MissionState,
        start: NodeName,
        ctx: &MissionContext,
        store: &dyn CheckpointStore,
    ) -> Result<MissionState> {
        let mut current = Some(start);
        let mut seq = store.list(&state.thread_id).await?.len() as u64;
        let mut executed: u32 = 0;

        while let Some(node_name) = current {
            if ctx.cancel.is_cancelled() {
                tracing::info!(
                    mission_id = %state.mission_id,
                    node = %node_name,
                    "mission cancelled before node"
                );
                return Ok(state);
            }

            executed += 1;
            if executed > ctx.config.dispatch.max_node_executions {
                let patch = MissionPatch::failed(format!(
                    "mission exceeded node execution ceiling ({})",
                    ctx.config.dispatch.max_node_executions
                ));
                state = apply_patch(&state, &patch)?;
                current = Self::next_node(&state, node_name);
                continue;
            }

            let node = self
                .nodes
                .get(&node_name)
                .with_context(|| format!("node {node_name} not registered"))?;

            seq += 1;
            self.checkpoint(store, ctx, &state, seq, node_name, CheckpointPhase::Pre)
                .await?;

            ctx.events.publish(
                topic::NODE_ENTERED,
                &state.mission_id,
                None,
                serde_json::json!({ "node": node_name.to_string() }),
            );

            let patch = match node.run(&state, ctx).await {
                Ok(patch) => patch,
                Err(e) => {
                    tracing::error!(
                        mission_id = %state.mission_id,
                        node = %node_name,
                        error = %e,
                        "node failed unexpectedly"
                    );
                    MissionPatch::failed(format!("node {node_name} failed: {e:#}"))
                }
            };

            state = apply_patch(&state, &patch)
                .with_context(|| format!("reducer rejected patch from node {node_name}"))?;

            seq += 1;
            self.checkpoint(store, ctx, &state, seq, node_name, CheckpointPhase::Post)
                .await?;

            ctx.events.publish(
                topic::NODE_EXITED,
                &state.mission_id,
                None,
                serde_json::json!({ "node": node_name.to_string(), "status": state.status.to_string() }),
            );

            current = Self::next_node(&state, node_name);
        }

        ctx.events.publish(
            topic::MISSION_COMPLETED,
            &state.mission_id,
            None,
            serde_json::json!({ "status": state.status.to_string() }),
        );

        Ok(state)
    }

    async fn checkpoint(
        &self,
        store: &dyn CheckpointStore,
        ctx: &MissionContext,
        state: &MissionState,
        seq: u64,
        node: NodeName,
        phase: CheckpointPhase,
    ) -> Result<()> {
        let checkpoint_id = format!("{seq:06}-{phase}-{node}");
        store
            .put(&state.thread_id, &checkpoint_id, &node.to_string(), state)
            .await
            .with_context(|| format!("failed to write checkpoint {checkpoint_id}"))?;

        ctx.events.publish(
            topic::CHECKPOINT_WRITTEN,
            &state.mission_id,
            None,
            serde_json::json!({ "checkpoint_id": checkpoint_id }),
        );
        Ok(())
    }
}

/// Whether a checkpoint bracketed a node's entry or its committed exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointPhase {
    Pre,
    Post,
}

impl CheckpointPhase {
    /// Recover the phase from a checkpoint id (`NNNNNN-pre-node` /
    /// `NNNNNN-post-node`). Unknown shapes count as `post` so resume
    /// continues rather than re-running an unidentified node.
    fn of(checkpoint_id: &str) -> Self {
        let mut parts = checkpoint_id.splitn(3, '-');
        let _seq = parts.next();
        match parts.next() {
            Some("pre") => Self::Pre,
            _ => Self::Post,
        }
    }
}

impl fmt::Display for CheckpointPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pre => f.write_str("pre"),
            Self::Post => f.write_str("post"),
        }
    }
}
