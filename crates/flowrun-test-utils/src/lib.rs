//! Shared mocks and fixtures for flowrun tests.

mod agent;
mod fixtures;
mod tools;

pub use agent::MockAgent;
pub use fixtures::*;
pub use tools::{MockBehavior, MockToolConnector};
