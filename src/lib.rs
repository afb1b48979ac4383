//! Evidence-grounded orchestration over a user's structured data. One user
//! message becomes a validated plan, policy-gated tool calls, verified
//! results and a cited answer, streamed as ordered events.

pub mod answer;
pub mod config;
pub mod connectors;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod planner;
pub mod policy;
pub mod providers;
pub mod runtime;
pub mod schema;
pub mod sqlgate;
pub mod store;
pub mod types;
pub mod verifier;

pub use config::{CoreConfig, SqlPolicyConfig};
pub use error::CoreError;
pub use events::{EventSink, Stage, StreamEvent};
pub use pipeline::Pipeline;
pub use providers::LlmAdapter;
pub use runtime::ConnectorRegistry;
pub use store::EvidenceStore;
pub use types::RunContext;
