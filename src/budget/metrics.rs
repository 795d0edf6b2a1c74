//! Run metrics accumulator.
//!
//! One recorder per run, shared by every node. Each update is applied and
//! flushed under the same lock, so the stored row only ever moves forward.

use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::llm::{LlmRole, LlmUsage};
use crate::store::{RunMetrics, Store, StoreResult};

pub struct MetricsRecorder {
    store: Arc<dyn Store>,
    run_id: Uuid,
    metrics: Mutex<RunMetrics>,
}

impl MetricsRecorder {
    /// Continue from `initial` (the run's stored metrics) so a re-claimed run keeps its totals.
    pub fn new(store: Arc<dyn Store>, run_id: Uuid, initial: RunMetrics) -> Self {
        Self {
            store,
            run_id,
            metrics: Mutex::new(initial),
        }
    }

    /// Account for one LLM call and persist.
    pub async fn record_llm_call(&self, role: LlmRole, usage: Option<&LlmUsage>) -> StoreResult<()> {
        let mut metrics = self.metrics.lock().await;
        metrics.llm_calls += 1;
        *metrics
            .calls_by_role
            .entry(role.as_str().to_string())
            .or_insert(0) += 1;
        if let Some(usage) = usage {
            metrics.prompt_tokens += usage.prompt_tokens;
            metrics.completion_tokens += usage.completion_tokens;
            metrics.total_tokens += usage.total_tokens;
            metrics.input_cost += usage.input_cost;
            metrics.output_cost += usage.output_cost;
            metrics.total_cost += usage.total_cost;
            metrics.last_model = Some(usage.model.clone());
        }
        self.store.update_run_metrics(self.run_id, &metrics).await
    }

    pub async fn record_tool_calls(&self, count: usize) -> StoreResult<()> {
        if count == 0 {
            return Ok(());
        }
        let mut metrics = self.metrics.lock().await;
        metrics.tool_calls += count as u64;
        self.store.update_run_metrics(self.run_id, &metrics).await
    }

    pub async fn set_tool_manifest(&self, tools: Vec<String>) -> StoreResult<()> {
        let mut metrics = self.metrics.lock().await;
        metrics.tool_manifest = tools;
        self.store.update_run_metrics(self.run_id, &metrics).await
    }

    pub async fn snapshot(&self) -> RunMetrics {
        self.metrics.lock().await.clone()
    }
}
