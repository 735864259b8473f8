//! # Relay Core
//!
//! Hot-path building blocks for the relay gateway: what happens when a packet
//! arrives, and how the system stays consistent under failure and shutdown.
//!
//! ## Components
//!
//! - [`error`] / [`retry`]: tagged error taxonomy and the retry engine
//! - [`resource`]: idempotent disposal of sockets and plugin instances
//! - [`session`]: TCP connection and UDP peer bookkeeping
//! - [`security`]: IP filtering, rate limiting and connection caps
//! - [`pipeline`] / [`router`]: staged message processing and first-match dispatch
//! - [`services`] / [`metrics`]: narrow collaborator interfaces
//!
//! ## Flow
//!
//! ```text
//! transport event → session → security gate → retry(pipeline.process) → reply
//!                                                     │
//!                                   plugin stages → router stage
//! ```
//!
//! Everything here is safe to share across tasks; state lives in concurrent
//! maps or atomics and the request context is passed explicitly.

// ============================================================================
// Module Declarations
// ============================================================================

pub mod error;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod resource;
pub mod retry;
pub mod router;
pub mod security;
pub mod services;
pub mod session;

// ============================================================================
// Public Re-exports
// ============================================================================

pub use error::{classify_io, ErrorContext, ErrorKind, RelayResult, RouterError, Severity};
pub use message::{MessageContext, TransportHandle};
pub use metrics::{HistogramSummary, InMemoryMetrics, MetricsSink, MetricsSnapshot};
pub use pipeline::{MessagePipeline, Next, PipelineOutcome, RouterStage, Stage, StageResult};
pub use resource::{DisposalStats, RegistryStats, Resource, ResourceRegistry};
pub use retry::{CriticalHook, ErrorHandler, ErrorStats, KindStats, RetryPolicy};
pub use router::{ReplyHandler, RouteHandler, RouteStats, Router};
pub use security::{
    SecurityConfig, SecurityManager, SecurityPipeline, SecurityStage, SecurityStats,
    SecurityVerdict,
};
pub use services::ServiceLocator;
pub use session::{generate_session_id, Protocol, Session, SessionCount, SessionStore};

// Re-export so plugin crates implement `Stage` / `RouteHandler` with the same macro.
pub use async_trait::async_trait;
