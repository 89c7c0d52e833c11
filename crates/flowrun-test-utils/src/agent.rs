use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use flowrun_core::error::AgentError;
use flowrun_core::traits::AgentProvider;
use flowrun_core::types::AgentRequest;

#[derive(Default)]
struct State {
    replies: HashMap<String, String>,
    requests: Vec<AgentRequest>,
    fail_remaining: usize,
}

/// Agent provider returning canned replies per binding.
///
/// Bindings without a canned reply answer with `done: <task>`.
#[derive(Clone, Default)]
pub struct MockAgent {
    state: Arc<Mutex<State>>,
    calls: Arc<AtomicUsize>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, binding: &str, reply: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .replies
            .insert(binding.to_string(), reply.to_string());
        self
    }

    /// Fail the next `n` requests with a transient provider error.
    pub fn failing(self, n: usize) -> Self {
        self.state.lock().unwrap().fail_remaining = n;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<AgentRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

impl AgentProvider for MockAgent {
    fn complete(&self, request: AgentRequest) -> BoxFuture<'_, Result<String, AgentError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut state = self.state.lock().unwrap();
            state.requests.push(request.clone());
            if state.fail_remaining > 0 {
                state.fail_remaining -= 1;
                return Err(AgentError::Provider("503 service unavailable".into()));
            }
            Ok(state
                .replies
                .get(&request.binding)
                .cloned()
                .unwrap_or_else(|| format!("done: {}", request.task)))
        })
    }
}
