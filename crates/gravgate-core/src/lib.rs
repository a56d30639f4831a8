//! Request Orchestrator: wires the Credential Pool, Request Adapter,
//! Streaming Engine, Usage Store, and image sink into the handful of
//! dialect entry points the HTTP surface calls into (spec §4.H).

pub mod auth;
pub mod error;
pub mod orchestrator;
pub mod upstream;

pub use auth::{PanelSessionStore, check_api_key, extract_api_key, requires_api_key};
pub use error::GatewayError;
pub use orchestrator::{GatewayResponse, RequestContext, RequestOrchestrator, ResponseBody};
pub use upstream::UpstreamClient;
