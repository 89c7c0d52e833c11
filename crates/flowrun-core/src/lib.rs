pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod retry;
pub mod template;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{AgentError, FlowError, GraphError, Result, SessionError, ToolError};
pub use event::{Event, EventBus, EventKind};
pub use graph::{Flow, GraphIndex, Step, StepKind};
pub use retry::BackoffPolicy;
pub use types::*;
