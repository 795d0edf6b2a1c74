//! Run controller: claim a queued run, drive its root node, finalize the run.
//!
//! # Job Processing Flow
//! ```text
//! 1. Claim: load the run, check it is claimable, validate the root node,
//!    mark the run running
//! 2. Resolve the execution context and allowed projects
//! 3. Record scope and tool manifest
//! 4. Run the root node under the wall-clock budget
//! 5. Finalize: completed, stopped (budget), canceled or failed
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::node::NodeOrchestrator;
use crate::agents::context::RunContext;
use crate::agents::types::{JobOutcome, JobPayload, OrchestratorError};
use crate::budget::{MetricsRecorder, WallClockBudget};
use crate::config::OrchestratorConfig;
use crate::events::{EventKind, EventLog};
use crate::llm::StructuredLlm;
use crate::store::{ResultEnvelope, Run, RunStatus, Store};
use crate::tools::{DomainStore, ToolExecutionContext};

/// Entry point for the worker: one job, one run.
pub struct RunController {
    store: Arc<dyn Store>,
    domain: Arc<dyn DomainStore>,
    llm: Arc<dyn StructuredLlm>,
    config: OrchestratorConfig,
}

impl RunController {
    pub fn new(
        store: Arc<dyn Store>,
        domain: Arc<dyn DomainStore>,
        llm: Arc<dyn StructuredLlm>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            domain,
            llm,
            config,
        }
    }

    pub async fn process_job(&self, job: &JobPayload) -> JobOutcome {
        self.process_job_with_cancel(job, CancellationToken::new())
            .await
    }

    /// Process `job`, stopping cooperatively once `cancel_token` fires.
    ///
    /// Claim failures leave the run untouched; every failure after the claim
    /// finalizes the run with the matching terminal status.
    pub async fn process_job_with_cancel(
        &self,
        job: &JobPayload,
        cancel_token: CancellationToken,
    ) -> JobOutcome {
        let run = match self.claim(job).await {
            Ok(run) => run,
            Err(e) => {
                tracing::error!(run_id = %job.run_id, "Could not claim run: {}", e);
                return JobOutcome::failure(job.run_id, None, e.to_string());
            }
        };

        tracing::info!(
            run_id = %run.id,
            actor_id = %run.actor_id,
            "Run claimed: {}",
            crate::util::truncate_chars(&run.objective, 80)
        );

        match self.drive(job, run, cancel_token).await {
            Ok(result) => self.finalize_success(job, result).await,
            Err(e) => self.finalize_failure(job, e).await,
        }
    }

    async fn claim(&self, job: &JobPayload) -> Result<Run, OrchestratorError> {
        let run = self
            .store
            .get_run(job.run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(job.run_id))?;
        if !run.status.is_claimable() {
            return Err(OrchestratorError::NotClaimable {
                run_id: run.id,
                status: run.status,
            });
        }

        let root = self
            .store
            .get_node(job.root_node_id)
            .await?
            .ok_or(OrchestratorError::NodeNotFound(job.root_node_id))?;
        if root.run_id != run.id || root.parent_node_id.is_some() || root.depth != 0 {
            return Err(OrchestratorError::InvalidJob(format!(
                "node {} is not the root of run {}",
                root.id, run.id
            )));
        }
        if run.root_node_id.is_some_and(|id| id != root.id) {
            return Err(OrchestratorError::InvalidJob(format!(
                "run {} has a different root node",
                run.id
            )));
        }
        // Validate before the status write so a bad payload cannot strand the run.
        job.execution_context()?;

        Ok(self
            .store
            .update_run_status(run.id, RunStatus::Running, None)
            .await?)
    }

    async fn drive(
        &self,
        job: &JobPayload,
        run: Run,
        cancel_token: CancellationToken,
    ) -> Result<ResultEnvelope, OrchestratorError> {
        let events = EventLog::new(self.store.clone(), run.id);

        let tools = ToolExecutionContext::resolve(
            run.actor_id,
            run.id,
            job.workspace_project_id,
            job.execution_context()?,
            self.store.clone(),
            self.domain.clone(),
        )
        .await?
        .with_max_batch(self.config.max_batch_tool_calls);

        if tools.was_degraded() {
            events
                .emit(EventKind::ContextWarning {
                    node_id: None,
                    message: format!(
                        "actor is not a member of project {}; running in global context",
                        job.context_project_id
                            .map(|id| id.to_string())
                            .unwrap_or_default()
                    ),
                })
                .await;
        }

        self.store
            .update_run_scope(run.id, tools.run_scope().await)
            .await?;

        let metrics = Arc::new(MetricsRecorder::new(
            self.store.clone(),
            run.id,
            run.metrics.clone(),
        ));
        let manifest: Vec<String> = tools
            .allowed_tools()
            .into_iter()
            .map(str::to_string)
            .collect();
        metrics.set_tool_manifest(manifest.clone()).await?;
        events
            .emit(EventKind::ToolsManifest {
                context_type: tools.context_type().as_str().to_string(),
                project_id: tools.context().project_id(),
                tools: manifest,
            })
            .await;

        let budget = WallClockBudget::from_millis(
            job.budgets
                .max_wall_clock_ms
                .unwrap_or(self.config.default_wall_clock_ms),
        );

        let ctx = Arc::new(RunContext {
            run,
            workspace_id: job.workspace_project_id,
            store: self.store.clone(),
            llm: self.llm.clone(),
            tools: Arc::new(tools),
            events,
            metrics,
            budget,
            cancel_token,
            config: self.config.clone(),
        });

        NodeOrchestrator::new(ctx).run_node(job.root_node_id).await
    }

    async fn finalize_success(&self, job: &JobPayload, result: ResultEnvelope) -> JobOutcome {
        if let Err(e) = self
            .store
            .update_run_status(job.run_id, RunStatus::Completed, None)
            .await
        {
            tracing::error!(run_id = %job.run_id, "Could not mark run completed: {}", e);
            return JobOutcome::failure(job.run_id, None, e.to_string());
        }
        tracing::info!(
            run_id = %job.run_id,
            met = result.success_assessment.met,
            "Run completed"
        );
        JobOutcome::success(job.run_id, result)
    }

    async fn finalize_failure(&self, job: &JobPayload, error: OrchestratorError) -> JobOutcome {
        let status = error.run_status();
        let message = error.to_string();
        tracing::error!(run_id = %job.run_id, status = %status, "Run ended: {}", message);

        if let Err(e) = self
            .store
            .update_run_status(job.run_id, status, Some(&message))
            .await
        {
            tracing::error!(run_id = %job.run_id, "Could not finalize run: {}", e);
            return JobOutcome::failure(job.run_id, None, message);
        }
        JobOutcome::failure(job.run_id, Some(status), message)
    }
}
