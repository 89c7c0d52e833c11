use thiserror::Error;

/// Structural problems in a flow definition. Raised at submission time;
/// an execution is never created for a flow that fails validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Start step not found: '{0}'")]
    MissingStart(String),

    #[error("Step '{from}' points to unknown step '{to}'")]
    DanglingEdge { from: String, to: String },

    #[error("Step '{0}' is unreachable from the start step")]
    UnreachableStep(String),

    #[error("Duplicate step id: '{0}'")]
    DuplicateStep(String),

    #[error("Condition step '{step}' branches to '{target}', which is not one of its successors")]
    InvalidBranch { step: String, target: String },

    #[error("Feedback step '{step}' targets '{target}', which is not one of its ancestors")]
    InvalidFeedbackTarget { step: String, target: String },

    #[error("Step '{step}' is missing required parameter '{param}'")]
    MissingParam { step: String, param: String },
}

/// Failures reported by a tool call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("Tool not found: {server}/{tool}")]
    NotFound { server: String, tool: String },

    #[error("Tool {server}/{tool} failed: {message}")]
    Remote {
        server: String,
        tool: String,
        message: String,
    },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("Session to '{server}' is unhealthy: {message}")]
    Unhealthy { server: String, message: String },
}

impl ToolError {
    /// Everything except a missing tool may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound { .. })
    }
}

/// Failures establishing or keeping a pooled tool session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Failed to connect to tool server '{server}': {message}")]
    ConnectFailed { server: String, message: String },

    #[error("Tool server '{server}' is unhealthy")]
    Unhealthy { server: String },
}

/// Failures from an agent (LLM) provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent binding not found: {0}")]
    UnknownBinding(String),

    #[error("Agent provider rejected credentials: {0}")]
    Auth(String),

    #[error("Agent configuration error: {0}")]
    Config(String),

    #[error("Agent request failed: {0}")]
    Provider(String),
}

impl AgentError {
    /// Provider-level failures are transient; credential and configuration
    /// problems are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider(_))
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Invalid flow: {0}")]
    Graph(#[from] GraphError),

    #[error("Step '{step}' timed out after {timeout_secs}s")]
    StepTimeout { step: String, timeout_secs: u64 },

    #[error("Step '{step}' exhausted its retry budget after {attempts} attempt(s): {reason}")]
    StepRetryExhausted {
        step: String,
        attempts: u32,
        reason: String,
    },

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Approval rejected for step '{step}': {reason}")]
    ApprovalRejected { step: String, reason: String },

    #[error("Execution cancelled by caller")]
    CancelledByCaller,

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("No step is awaiting approval in execution {0}")]
    NoPendingApproval(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Whether a step that failed with this error may be re-dispatched.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StepTimeout { .. } | Self::Session(_) => true,
            Self::Tool(e) => e.is_retryable(),
            Self::Agent(e) => e.is_retryable(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(FlowError::StepTimeout {
            step: "a".into(),
            timeout_secs: 1
        }
        .is_retryable());
        assert!(FlowError::from(ToolError::Remote {
            server: "s".into(),
            tool: "t".into(),
            message: "boom".into()
        })
        .is_retryable());
        assert!(!FlowError::from(ToolError::NotFound {
            server: "s".into(),
            tool: "t".into()
        })
        .is_retryable());
        assert!(FlowError::from(SessionError::Unhealthy { server: "s".into() }).is_retryable());
        assert!(!FlowError::from(AgentError::Auth("401".into())).is_retryable());
        assert!(FlowError::from(AgentError::Provider("503".into())).is_retryable());
        assert!(!FlowError::CancelledByCaller.is_retryable());
    }

    #[test]
    fn test_graph_error_display() {
        let e = GraphError::DanglingEdge {
            from: "a".into(),
            to: "zz".into(),
        };
        assert_eq!(e.to_string(), "Step 'a' points to unknown step 'zz'");
        let wrapped = FlowError::from(e);
        assert!(wrapped.to_string().starts_with("Invalid flow:"));
    }
}
