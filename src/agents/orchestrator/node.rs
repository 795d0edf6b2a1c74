//! Recursive node driver.
//!
//! A node is visited once per planning pass: plan, then either execute as a
//! leaf or run child bands in order and aggregate. Children of one band run
//! concurrently under the band parallelism limit; the next band starts only
//! after every child of the current band has finished.

use std::collections::HashSet;
use std::sync::Arc;

use async_recursion::async_recursion;
use futures::stream::{self, StreamExt};
use uuid::Uuid;

use crate::agents::artifacts::{self, ParentHintDraft, ResultDraft};
use crate::agents::context::RunContext;
use crate::agents::roles::aggregator::{self, ChildReport};
use crate::agents::roles::executor;
use crate::agents::roles::planner::{self, PlannerMode, ProposedStep};
use crate::agents::roles::NodeBrief;
use crate::agents::scratchpad;
use crate::agents::types::OrchestratorError;
use crate::events::EventKind;
use crate::store::{NewNode, Node, NodeStatus, Plan, PlanBand, PlanStep, ResultEnvelope, RoleState};
use crate::tools::ToolCall;

type Result<T> = std::result::Result<T, OrchestratorError>;

/// Drives nodes of one run. Cheap to clone; all state lives in the store.
#[derive(Clone)]
pub struct NodeOrchestrator {
    ctx: Arc<RunContext>,
}

impl NodeOrchestrator {
    pub fn new(ctx: Arc<RunContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Run `node_id` to completion and return its result envelope.
    ///
    /// A node that already completed returns its stored result. Any error
    /// marks the node failed before it propagates to the parent.
    #[async_recursion]
    pub async fn run_node(&self, node_id: Uuid) -> Result<ResultEnvelope> {
        let node = self
            .ctx
            .store
            .get_node(node_id)
            .await?
            .ok_or(OrchestratorError::NodeNotFound(node_id))?;

        if node.status == NodeStatus::Completed {
            if let Some(result) = node.result.clone() {
                tracing::debug!(node_id = %node.id, "Node already completed, reusing result");
                return Ok(result);
            }
        }

        match self.visit(&node).await {
            Ok(result) => Ok(result),
            Err(e) => {
                self.mark_failed(&node, &e).await;
                Err(e)
            }
        }
    }

    async fn mark_failed(&self, node: &Node, error: &OrchestratorError) {
        tracing::warn!(
            run_id = %self.ctx.run_id(),
            node_id = %node.id,
            depth = node.depth,
            "Node failed: {}",
            error
        );
        if let Err(e) = self
            .ctx
            .set_status(node.id, NodeStatus::Failed, node.role_state)
            .await
        {
            tracing::warn!(node_id = %node.id, "Could not mark node failed: {}", e);
        }
        self.ctx
            .events
            .emit(EventKind::NodeFailed {
                node_id: node.id,
                reason: error.failure_reason(),
                error: error.to_string(),
            })
            .await;
    }

    async fn visit(&self, node: &Node) -> Result<ResultEnvelope> {
        let ctx = &*self.ctx;
        ctx.check_budget()?;

        let scratchpad_id = scratchpad::ensure(ctx, node).await?;
        let force_leaf = node.depth >= ctx.config.max_depth;
        let mut resume = self.interrupted_plan(node).await?;
        let mut replans: u32 = resume
            .as_ref()
            .map_or(0, |plan| plan.version.saturating_sub(1));

        tracing::info!(
            run_id = %ctx.run_id(),
            node_id = %node.id,
            depth = node.depth,
            "Visiting node"
        );

        loop {
            let plan = match resume.take() {
                Some(plan) => {
                    tracing::info!(
                        node_id = %node.id,
                        plan_version = plan.version,
                        "Resuming interrupted plan"
                    );
                    plan
                }
                None => {
                    ctx.set_status(node.id, NodeStatus::Planning, RoleState::Planner)
                        .await?;
                    let brief = self.brief(node, scratchpad_id).await?;
                    let decision = planner::plan(ctx, &brief, force_leaf).await?;
                    scratchpad::append(ctx, node.id, scratchpad_id, &decision.scratchpad_append)
                        .await?;

                    let bands = match decision.mode {
                        PlannerMode::Execute { .. } => {
                            return self.run_leaf(node, scratchpad_id).await;
                        }
                        PlannerMode::Plan { .. } if force_leaf => {
                            ctx.events
                                .emit(EventKind::ContextWarning {
                                    node_id: Some(node.id),
                                    message: format!(
                                        "planner returned a plan at max depth {}; executing as leaf",
                                        ctx.config.max_depth
                                    ),
                                })
                                .await;
                            return self.run_leaf(node, scratchpad_id).await;
                        }
                        PlannerMode::Plan { bands } => bands,
                    };
                    self.persist_plan(node, bands).await?
                }
            };

            ctx.set_status(node.id, NodeStatus::Delegating, RoleState::Planner)
                .await?;
            let reports = self.run_bands(node, &plan).await?;

            ctx.set_status(node.id, NodeStatus::Aggregating, RoleState::Executor)
                .await?;
            let can_replan = replans < ctx.config.max_replans;
            let brief = self.brief(node, scratchpad_id).await?;
            let decision = aggregator::aggregate(ctx, &brief, &reports, can_replan).await?;
            scratchpad::append(ctx, node.id, scratchpad_id, &decision.scratchpad_append).await?;

            if decision.should_replan {
                if can_replan {
                    replans += 1;
                    let reason = decision
                        .replan_reason
                        .unwrap_or_else(|| "aggregator requested a new plan".to_string());
                    tracing::info!(node_id = %node.id, pass = replans, "Replanning: {}", reason);
                    ctx.events
                        .emit(EventKind::ReplanRequested {
                            node_id: node.id,
                            reason,
                            pass: replans,
                        })
                        .await;
                    continue;
                }
                tracing::warn!(node_id = %node.id, "Replan limit reached, keeping aggregate");
            }

            return self
                .complete(node, scratchpad_id, &decision.result, None)
                .await;
        }
    }

    /// The latest plan of a node that was delegating or aggregating when a
    /// previous attempt stopped. Its children are reused instead of replanning.
    async fn interrupted_plan(&self, node: &Node) -> Result<Option<Plan>> {
        if !matches!(node.status, NodeStatus::Delegating | NodeStatus::Aggregating) {
            return Ok(None);
        }
        Ok(self.ctx.store.latest_plan(node.id).await?)
    }

    async fn brief(&self, node: &Node, scratchpad_id: Uuid) -> Result<NodeBrief> {
        let tail = scratchpad::tail(&self.ctx, scratchpad_id).await?;
        Ok(NodeBrief::new(&self.ctx, node, tail))
    }

    /// Store a new plan version. Steps keep the id of a previous step with the
    /// same id or title; other ids are taken from the planner when unique.
    async fn persist_plan(&self, node: &Node, proposed: Vec<Vec<ProposedStep>>) -> Result<Plan> {
        let ctx = &*self.ctx;
        let previous = ctx.store.latest_plan(node.id).await?;
        let bands = assign_step_ids(previous.as_ref(), proposed);
        let plan = ctx.store.insert_plan(node.id, bands).await?;

        ctx.events
            .emit(EventKind::PlanCreated {
                node_id: node.id,
                plan_id: plan.id,
                version: plan.version,
                band_count: plan.bands.len(),
                step_count: plan.steps().count(),
            })
            .await;
        for band in &plan.bands {
            ctx.events
                .emit(EventKind::PlanBandCreated {
                    node_id: node.id,
                    plan_version: plan.version,
                    band_index: band.index,
                    step_ids: band.steps.iter().map(|s| s.id.clone()).collect(),
                })
                .await;
            for step in &band.steps {
                ctx.events
                    .emit(EventKind::StepCreated {
                        node_id: node.id,
                        plan_version: plan.version,
                        step_id: step.id.clone(),
                        title: step.title.clone(),
                        band_index: step.band_index,
                        step_index: step.step_index,
                    })
                    .await;
            }
        }
        Ok(plan)
    }

    /// Run every band of `plan` in order and collect child reports.
    async fn run_bands(&self, node: &Node, plan: &Plan) -> Result<Vec<ChildReport>> {
        let ctx = &*self.ctx;
        let mut reports = Vec::with_capacity(plan.steps().count());
        let existing: Vec<Node> = ctx
            .store
            .list_children(node.id)
            .await?
            .into_iter()
            .filter(|child| child.created_at >= plan.created_at)
            .collect();

        for band in &plan.bands {
            ctx.check_budget()?;

            let mut children = Vec::with_capacity(band.steps.len());
            for step in &band.steps {
                let child = match reusable_child(&existing, step) {
                    Some(child) => {
                        tracing::debug!(
                            node_id = %node.id,
                            child_node_id = %child.id,
                            status = %child.status,
                            "Reusing child from interrupted attempt"
                        );
                        child.clone()
                    }
                    None => self.create_child(node, step).await?,
                };
                children.push((step, child));
            }

            tracing::debug!(
                node_id = %node.id,
                band = band.index,
                children = children.len(),
                "Running band"
            );

            let ids: Vec<(usize, Uuid)> = children
                .iter()
                .map(|(_, child)| child.id)
                .enumerate()
                .collect();
            let mut results: Vec<(usize, Result<ResultEnvelope>)> = stream::iter(ids)
                .map(|(i, id)| {
                    let this = self.clone();
                    async move { (i, this.run_node(id).await) }
                })
                .buffer_unordered(ctx.config.band_parallelism.max(1))
                .collect()
                .await;
            results.sort_by_key(|(i, _)| *i);

            let mut band_reports = Vec::with_capacity(results.len());
            for ((step, _), (_, result)) in children.iter().zip(results) {
                let envelope = result?;
                band_reports.push(self.child_report(step, envelope).await?);
            }
            reports.extend(band_reports);
        }
        Ok(reports)
    }

    async fn create_child(&self, parent: &Node, step: &PlanStep) -> Result<Node> {
        let ctx = &*self.ctx;
        let child = ctx
            .store
            .create_node(NewNode {
                run_id: ctx.run_id(),
                parent_node_id: Some(parent.id),
                title: step.title.clone(),
                reason: step.reason.clone(),
                success_criteria: step.success_criteria.clone(),
                depth: parent.depth + 1,
                band_index: Some(step.band_index),
                step_index: Some(step.step_index),
                context: parent.context.clone(),
            })
            .await?;
        ctx.events
            .emit(EventKind::NodeCreated {
                node_id: child.id,
                parent_node_id: Some(parent.id),
                title: child.title.clone(),
                depth: child.depth,
                band_index: child.band_index,
                step_index: child.step_index,
            })
            .await;
        ctx.events
            .emit(EventKind::NodeDelegated {
                node_id: parent.id,
                child_node_id: child.id,
                step_id: step.id.clone(),
            })
            .await;
        Ok(child)
    }

    async fn child_report(&self, step: &PlanStep, result: ResultEnvelope) -> Result<ChildReport> {
        let mut documents = Vec::with_capacity(result.document_ids.len());
        for document_id in &result.document_ids {
            match self.ctx.store.get_document(*document_id).await? {
                Some(document) => documents.push(document),
                None => tracing::warn!(document_id = %document_id, "Child document missing"),
            }
        }
        Ok(ChildReport {
            step_id: step.id.clone(),
            title: step.title.clone(),
            result,
            documents,
        })
    }

    async fn run_leaf(&self, node: &Node, scratchpad_id: Uuid) -> Result<ResultEnvelope> {
        let ctx = &*self.ctx;
        ctx.set_status(node.id, NodeStatus::Executing, RoleState::Executor)
            .await?;

        let brief = self.brief(node, scratchpad_id).await?;
        let mut decision = executor::execute(ctx, &brief, None).await?;
        scratchpad::append(ctx, node.id, scratchpad_id, &decision.scratchpad_append).await?;

        if !decision.actions.is_empty() {
            let calls: Vec<ToolCall> = decision
                .actions
                .drain(..)
                .take(ctx.config.max_executor_tool_calls)
                .collect();
            for (index, call) in calls.iter().enumerate() {
                ctx.events
                    .emit(EventKind::ToolCallRequested {
                        node_id: node.id,
                        index,
                        tool: call.tool.clone(),
                        args: call.args.clone(),
                    })
                    .await;
            }

            let outcomes = ctx.tools.execute_tool_calls(&calls).await;
            for (index, outcome) in outcomes.iter().enumerate() {
                ctx.events
                    .emit(EventKind::ToolCallResult {
                        node_id: node.id,
                        index,
                        tool: outcome.tool.clone(),
                        ok: outcome.ok,
                        error: outcome.error.clone(),
                        artifacts: outcome.artifacts.clone(),
                    })
                    .await;
            }
            ctx.metrics.record_tool_calls(outcomes.len()).await?;

            let mut log = String::from("### Tool calls\n");
            for outcome in &outcomes {
                match &outcome.error {
                    Some(error) => log.push_str(&format!("- `{}` failed: {}\n", outcome.tool, error)),
                    None => log.push_str(&format!("- `{}` ok\n", outcome.tool)),
                }
            }
            scratchpad::append(ctx, node.id, scratchpad_id, &log).await?;

            let brief = self.brief(node, scratchpad_id).await?;
            decision = executor::execute(ctx, &brief, Some(&outcomes)).await?;
            scratchpad::append(ctx, node.id, scratchpad_id, &decision.scratchpad_append).await?;
        }

        self.complete(
            node,
            scratchpad_id,
            &decision.result,
            decision.parent_hint.as_ref(),
        )
        .await
    }

    async fn complete(
        &self,
        node: &Node,
        scratchpad_id: Uuid,
        draft: &ResultDraft,
        hint: Option<&ParentHintDraft>,
    ) -> Result<ResultEnvelope> {
        let ctx = &*self.ctx;
        let persisted = artifacts::persist(ctx, node, &draft.artifacts).await?;
        let tail = scratchpad::tail(ctx, scratchpad_id).await?;
        let envelope = artifacts::build_envelope(draft, &persisted, Some(scratchpad_id), tail);
        ctx.store.set_node_result(node.id, &envelope).await?;

        let (mode, artifact_ids) = artifacts::parent_hint(hint, &envelope, &persisted);
        ctx.events
            .emit(EventKind::ParentHint {
                node_id: node.id,
                parent_node_id: node.parent_node_id,
                mode,
                artifact_ids,
            })
            .await;
        ctx.events
            .emit(EventKind::NodeResult {
                node_id: node.id,
                kind: envelope.kind,
                summary: envelope.summary.clone(),
                met: envelope.success_assessment.met,
            })
            .await;

        ctx.set_status(node.id, NodeStatus::Completed, RoleState::Executor)
            .await?;
        ctx.events
            .emit(EventKind::NodeCompleted {
                node_id: node.id,
                depth: node.depth,
            })
            .await;

        tracing::info!(
            run_id = %ctx.run_id(),
            node_id = %node.id,
            depth = node.depth,
            met = envelope.success_assessment.met,
            "Node completed"
        );
        Ok(envelope)
    }
}

/// The newest child created for `step` that can still produce a result:
/// completed with a stored result, or not yet terminal.
fn reusable_child<'a>(existing: &'a [Node], step: &PlanStep) -> Option<&'a Node> {
    existing
        .iter()
        .filter(|child| {
            child.band_index == Some(step.band_index) && child.step_index == Some(step.step_index)
        })
        .max_by_key(|child| child.created_at)
        .filter(|child| match child.status {
            NodeStatus::Completed => child.result.is_some(),
            status => !status.is_terminal(),
        })
}

fn assign_step_ids(previous: Option<&Plan>, proposed: Vec<Vec<ProposedStep>>) -> Vec<PlanBand> {
    let known: Vec<&PlanStep> = previous.map(|p| p.steps().collect()).unwrap_or_default();
    let mut used: HashSet<String> = HashSet::new();

    proposed
        .into_iter()
        .enumerate()
        .map(|(band_index, steps)| {
            let steps = steps
                .into_iter()
                .enumerate()
                .map(|(step_index, step)| {
                    let carried = known
                        .iter()
                        .find(|k| {
                            step.id.as_deref() == Some(k.id.as_str())
                                || k.title.eq_ignore_ascii_case(&step.title)
                        })
                        .map(|k| k.id.clone())
                        .filter(|id| !used.contains(id));
                    let id = carried
                        .or_else(|| step.id.clone().filter(|id| !used.contains(id)))
                        .unwrap_or_else(|| Uuid::new_v4().to_string());
                    used.insert(id.clone());
                    PlanStep {
                        id,
                        title: step.title,
                        reason: step.reason,
                        success_criteria: step.success_criteria,
                        band_index: band_index as u32,
                        step_index: step_index as u32,
                    }
                })
                .collect();
            PlanBand {
                index: band_index as u32,
                steps,
            }
        })
        .collect()
}

#[cfg(test)]
mod step_id_tests {
    use super::*;
    use chrono::Utc;

    fn proposed(id: Option<&str>, title: &str) -> ProposedStep {
        ProposedStep {
            id: id.map(str::to_string),
            title: title.to_string(),
            reason: String::new(),
            success_criteria: vec![],
        }
    }

    #[test]
    fn test_ids_unique_within_plan() {
        let bands = assign_step_ids(
            None,
            vec![vec![proposed(Some("a"), "One"), proposed(Some("a"), "Two")]],
        );
        assert_eq!(bands[0].steps[0].id, "a");
        assert_ne!(bands[0].steps[1].id, "a");
        assert_eq!(bands[0].steps[1].step_index, 1);
    }

    #[test]
    fn test_ids_carried_across_versions_by_title() {
        let first = assign_step_ids(None, vec![vec![proposed(None, "Collect data")]]);
        let previous = Plan {
            id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            version: 1,
            bands: first.clone(),
            created_at: Utc::now(),
        };
        let second = assign_step_ids(
            Some(&previous),
            vec![
                vec![proposed(None, "collect data")],
                vec![proposed(None, "Write report")],
            ],
        );
        assert_eq!(second[0].steps[0].id, first[0].steps[0].id);
        assert_eq!(second[1].index, 1);
        assert_ne!(second[1].steps[0].id, first[0].steps[0].id);
    }
}
