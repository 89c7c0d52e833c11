mod connector;
mod handler;
mod manager;

pub use connector::{McpConnector, McpTransport};
pub use handler::{FlowrunClientHandler, McpEvent};
pub use manager::{SessionLease, ToolSession, ToolSessionManager};
