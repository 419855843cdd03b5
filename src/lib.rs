// src/lib.rs

// Import the top-level `agentgate` module.
pub mod agentgate;

// Re-exporting key items for easier external access.
pub use agentgate::agent::{Agent, AgentRegistry, Intent};
pub use agentgate::clients::{Message, Provider, ProviderClient, ProviderRegistry, Role};
pub use agentgate::config::GatewayConfig;
pub use agentgate::dispatcher::{DispatchOptions, Dispatcher};
pub use agentgate::error::{ErrorKind, GatewayError};
pub use agentgate::gateway::{Gateway, GatewayRequest, GatewayResponse};
pub use agentgate::orchestrator::{ExecutionPlan, Orchestrator, Task};
pub use agentgate::router::{Router, RoutingDecision};
