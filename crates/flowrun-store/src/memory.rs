use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use flowrun_core::error::{FlowError, Result};
use flowrun_core::event::Event;
use flowrun_core::traits::ExecutionStore;
use flowrun_core::types::{Execution, ExecutionId, ExecutionSummary};

#[derive(Default)]
struct Inner {
    executions: HashMap<ExecutionId, Execution>,
    order: Vec<ExecutionId>,
    events: HashMap<ExecutionId, Vec<Event>>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for MemoryStore {
    fn save_execution(&self, execution: &Execution) -> BoxFuture<'_, Result<()>> {
        let execution = execution.clone();
        Box::pin(async move {
            let mut inner = self
                .inner
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            if !inner.executions.contains_key(&execution.id) {
                inner.order.push(execution.id.clone());
            }
            inner.executions.insert(execution.id.clone(), execution);
            Ok(())
        })
    }

    fn load_execution(&self, id: &ExecutionId) -> BoxFuture<'_, Result<Option<Execution>>> {
        let id = id.clone();
        Box::pin(async move {
            let inner = self
                .inner
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            Ok(inner.executions.get(&id).cloned())
        })
    }

    fn list_executions(&self, limit: usize) -> BoxFuture<'_, Result<Vec<ExecutionSummary>>> {
        Box::pin(async move {
            let inner = self
                .inner
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            Ok(inner
                .order
                .iter()
                .rev()
                .filter_map(|id| inner.executions.get(id))
                .take(limit)
                .map(Execution::summary)
                .collect())
        })
    }

    fn append_event(&self, event: &Event) -> BoxFuture<'_, Result<()>> {
        let event = event.clone();
        Box::pin(async move {
            let mut inner = self
                .inner
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            let log = inner.events.entry(event.execution_id.clone()).or_default();
            if log.last().is_some_and(|last| last.seq >= event.seq) {
                return Err(FlowError::Database(format!(
                    "Duplicate event seq {} for execution {}",
                    event.seq, event.execution_id
                )));
            }
            log.push(event);
            Ok(())
        })
    }

    fn load_events(&self, id: &ExecutionId, after_seq: u64) -> BoxFuture<'_, Result<Vec<Event>>> {
        let id = id.clone();
        Box::pin(async move {
            let inner = self
                .inner
                .lock()
                .map_err(|e| FlowError::Database(e.to_string()))?;
            Ok(inner
                .events
                .get(&id)
                .map(|log| log.iter().filter(|e| e.seq > after_seq).cloned().collect())
                .unwrap_or_default())
        })
    }
}
