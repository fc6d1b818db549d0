//! Session broker: authenticates callers, provisions sandboxes, launches
//! agent processes, and supervises idle single-shot sessions.
//!
//! Provides:
//! - `SessionBroker` - Start/keepalive/stop orchestration
//! - `SandboxDriver` trait + `ProcessDriver` - Sandbox lifecycle seam
//! - `IdentityVerifier` trait + `StaticTokenVerifier` - Credential seam
//! - `SessionRegistry` - Synchronized session table
//! - Axum router for the HTTP surface

pub mod broker;
pub mod driver;
pub mod http;
pub mod registry;
pub mod verify;

pub use broker::{BrokerConfig, BrokerError, SessionBroker, StartRequest, StartResponse};
pub use driver::{ProcessDriver, SandboxDriver, SandboxError};
pub use http::router;
pub use registry::SessionRegistry;
pub use verify::{AuthError, IdentityVerifier, StaticTokenVerifier};
