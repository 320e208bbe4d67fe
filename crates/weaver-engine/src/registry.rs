use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::debug;

use crate::machine::Execution;

/// Storage of live and recently finished executions.
///
/// The engine only talks to this trait, so an archival or persistent backend
/// can replace the in-memory map without touching the state machine.
pub trait ExecutionRepository: Send + Sync + 'static {
    fn insert(&self, execution: Arc<Execution>) -> BoxFuture<'_, ()>;

    fn get(&self, id: &str) -> BoxFuture<'_, Option<Arc<Execution>>>;

    /// All executions, newest first.
    fn list(&self) -> BoxFuture<'_, Vec<Arc<Execution>>>;

    /// Drop the oldest terminal executions beyond `retain`. Returns how many were dropped.
    fn prune_terminal(&self, retain: usize) -> BoxFuture<'_, usize>;
}

/// Process-local repository backed by a map.
#[derive(Default)]
pub struct InMemoryRepository {
    executions: RwLock<HashMap<String, Arc<Execution>>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionRepository for InMemoryRepository {
    fn insert(&self, execution: Arc<Execution>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let id = execution.id().to_string();
            self.executions.write().await.insert(id, execution);
        })
    }

    fn get(&self, id: &str) -> BoxFuture<'_, Option<Arc<Execution>>> {
        let id = id.to_string();
        Box::pin(async move { self.executions.read().await.get(&id).cloned() })
    }

    fn list(&self) -> BoxFuture<'_, Vec<Arc<Execution>>> {
        Box::pin(async move {
            let mut all: Vec<Arc<Execution>> =
                self.executions.read().await.values().cloned().collect();
            all.sort_by(|a, b| {
                b.started_at()
                    .cmp(&a.started_at())
                    .then_with(|| a.id().cmp(b.id()))
            });
            all
        })
    }

    fn prune_terminal(&self, retain: usize) -> BoxFuture<'_, usize> {
        Box::pin(async move {
            let mut executions = self.executions.write().await;
            let mut terminal: Vec<(chrono::DateTime<chrono::Utc>, String)> = executions
                .values()
                .filter(|e| e.status().is_terminal())
                .map(|e| (e.started_at(), e.id().to_string()))
                .collect();
            if terminal.len() <= retain {
                return 0;
            }
            terminal.sort();
            let excess = terminal.len() - retain;
            for (_, id) in terminal.into_iter().take(excess) {
                executions.remove(&id);
            }
            debug!(pruned = excess, "Pruned terminal executions");
            excess
        })
    }
}
