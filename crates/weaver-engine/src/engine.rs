//! Engine facade: the execution control API over a repository of executions.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use weaver_core::config::AppConfig;
use weaver_core::definition::WorkflowDefinition;
use weaver_core::error::{Result, WeaverError};
use weaver_core::event::StreamFrame;
use weaver_core::traits::AgentRunner;
use weaver_core::types::{
    ExecutionSnapshot, ExecutionStatus, ExecutionSummary, GateDecisionResult, GateInstance, Page,
    StartedExecution, StatusChange,
};

use crate::machine::Execution;
use crate::registry::{ExecutionRepository, InMemoryRepository};
use crate::validator::validate;
use crate::variables::VariableStore;

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 200;

/// Input of `start`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Overrides the id carried by the definition when set.
    #[serde(default)]
    pub workflow_id: Option<String>,
    pub workflow: WorkflowDefinition,
    #[serde(default)]
    pub work_item: Option<Value>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

impl StartRequest {
    pub fn new(workflow: WorkflowDefinition) -> Self {
        Self {
            workflow_id: None,
            workflow,
            work_item: None,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_work_item(mut self, work_item: Value) -> Self {
        self.work_item = Some(work_item);
        self
    }
}

/// Filters and paging for `list`. Pages are 1-based.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
}

/// Owns the runner, configuration and execution registry.
#[derive(Clone)]
pub struct WorkflowEngine {
    config: Arc<AppConfig>,
    runner: Arc<dyn AgentRunner>,
    repository: Arc<dyn ExecutionRepository>,
}

impl WorkflowEngine {
    pub fn new(config: AppConfig, runner: Arc<dyn AgentRunner>) -> Self {
        Self::with_repository(config, runner, Arc::new(InMemoryRepository::new()))
    }

    pub fn with_repository(
        config: AppConfig,
        runner: Arc<dyn AgentRunner>,
        repository: Arc<dyn ExecutionRepository>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            runner,
            repository,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Validate, seed variables and launch a new execution.
    ///
    /// Nothing is registered when validation or seeding fails.
    pub async fn start(&self, request: StartRequest) -> Result<StartedExecution> {
        let mut definition = request.workflow;
        if let Some(id) = request.workflow_id {
            definition.id = id;
        }
        let workflow = validate(&definition)?;
        let variables = VariableStore::seed(&definition, request.variables)?;

        let execution = Execution::new(
            workflow,
            variables,
            Arc::clone(&self.runner),
            Arc::clone(&self.config),
            request.work_item,
        );
        self.repository.insert(Arc::clone(&execution)).await;
        let started = execution.start().await;
        info!(
            execution_id = %started.execution_id,
            workflow_id = %execution.workflow_id(),
            "Execution registered"
        );

        let pruned = self
            .repository
            .prune_terminal(self.config.engine.retain_terminal)
            .await;
        if pruned > 0 {
            debug!(pruned, "Dropped old terminal executions");
        }
        Ok(started)
    }

    /// Live handle of an execution.
    pub async fn execution(&self, id: &str) -> Result<Arc<Execution>> {
        self.repository
            .get(id)
            .await
            .ok_or_else(|| WeaverError::ExecutionNotFound(id.to_string()))
    }

    pub async fn get(&self, id: &str) -> Result<ExecutionSnapshot> {
        Ok(self.execution(id).await?.snapshot().await)
    }

    /// Summaries newest first, filtered by status and workflow id.
    pub async fn list(&self, query: ListQuery) -> Page<ExecutionSummary> {
        let page = query.page.unwrap_or(1).max(1);
        let page_size = query
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        let matching: Vec<Arc<Execution>> = self
            .repository
            .list()
            .await
            .into_iter()
            .filter(|e| query.status.map_or(true, |s| e.status() == s))
            .filter(|e| {
                query
                    .workflow_id
                    .as_deref()
                    .map_or(true, |w| e.workflow_id() == w)
            })
            .collect();

        let total = matching.len();
        let mut items = Vec::new();
        for execution in matching.iter().skip((page - 1) * page_size).take(page_size) {
            items.push(execution.summary().await);
        }
        Page {
            items,
            total,
            page,
            page_size,
        }
    }

    pub async fn pause(&self, id: &str) -> Result<StatusChange> {
        self.execution(id).await?.pause().await
    }

    pub async fn resume(&self, id: &str) -> Result<StatusChange> {
        self.execution(id).await?.resume().await
    }

    pub async fn abort(&self, id: &str, reason: Option<String>) -> Result<StatusChange> {
        self.execution(id).await?.abort(reason).await
    }

    pub async fn decide_gate(
        &self,
        id: &str,
        gate_id: &str,
        node_id: &str,
        option: &str,
        decided_by: &str,
        reason: Option<String>,
    ) -> Result<GateDecisionResult> {
        self.execution(id)
            .await?
            .decide_gate(gate_id, node_id, option, decided_by, reason)
            .await
    }

    pub async fn list_gates(&self, id: &str) -> Result<Vec<GateInstance>> {
        Ok(self.execution(id).await?.gates().await)
    }

    /// Event stream of an execution, resuming after `last_event_id` when given.
    pub async fn event_stream(
        &self,
        id: &str,
        last_event_id: Option<u64>,
    ) -> Result<BoxStream<'static, StreamFrame>> {
        self.execution(id).await?.event_stream(last_event_id).await
    }
}
