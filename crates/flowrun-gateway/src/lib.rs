mod auth;
mod client;
mod middleware;
mod protocol;
mod routes;
mod server;
mod state;

pub use auth::{validate_auth, AuthResult};
pub use client::{EventStreamClient, StreamError};
pub use protocol::{ApprovalRequest, SubmitRequest};
pub use server::GatewayServer;
