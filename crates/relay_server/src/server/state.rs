use relay_core::{
    ErrorHandler, InMemoryMetrics, MessageContext, MessagePipeline, MetricsSink, PipelineOutcome,
    ResourceRegistry, SecurityManager, SecurityPipeline, SessionStore,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ServerConfig;

pub(crate) const TCP_RESOURCE_TYPE: &str = "tcp_connection";
pub(crate) const UDP_RESOURCE_TYPE: &str = "udp_session";

pub(crate) fn tcp_resource_id(session_id: &str) -> String {
    format!("tcp:{session_id}")
}

pub(crate) fn udp_resource_id(session_id: &str) -> String {
    format!("udp:{session_id}")
}

/// Everything a connection or datagram handler needs, shared by every task.
pub(crate) struct RelayState {
    pub config: ServerConfig,
    pub sessions: Arc<SessionStore>,
    pub resources: Arc<ResourceRegistry>,
    pub security: Arc<SecurityManager>,
    pub connection_gate: SecurityPipeline,
    pub datagram_gate: SecurityPipeline,
    pub errors: Arc<ErrorHandler>,
    pub metrics: Arc<InMemoryMetrics>,
    pub pipeline: MessagePipeline,
    pub active_connections: AtomicUsize,
    pub connections: Mutex<JoinSet<()>>,
    pub datagrams: Mutex<JoinSet<()>>,
}

impl RelayState {
    /// Run one message through the pipeline under the retry policy.
    ///
    /// Returns `None` when the message failed for good. The failure has
    /// already been counted and logged by the error handler by then.
    pub async fn dispatch(&self, ctx: MessageContext) -> Option<PipelineOutcome> {
        let protocol = ctx.protocol;
        let session_id = ctx.session_id.clone();
        let error_context = ctx
            .error_context()
            .component("transport")
            .operation("pipeline.process");
        let labels = [("protocol", protocol.as_str())];

        let started = Instant::now();
        let pipeline = &self.pipeline;
        let result = self
            .errors
            .execute_with_retry(
                move || pipeline.process(ctx.clone()),
                &error_context,
                &self.config.retry,
            )
            .await;
        self.metrics.observe_histogram(
            "relay_processing_latency_ms",
            &labels,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        self.sessions.record_message(&session_id);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.metrics.increment_counter(
                    "relay_messages_total",
                    &[("protocol", protocol.as_str()), ("outcome", "failed")],
                    1,
                );
                debug!(session_id = %session_id, kind = %err.kind, "Message dropped after error handling");
                return None;
            }
        };

        let label = match &outcome {
            PipelineOutcome::Completed(_) => "completed",
            PipelineOutcome::Dropped => "dropped",
            PipelineOutcome::Halted(_) => {
                warn!(session_id = %session_id, "Pipeline stage returned without continuing the chain");
                "halted"
            }
        };
        self.metrics.increment_counter(
            "relay_messages_total",
            &[("protocol", protocol.as_str()), ("outcome", label)],
            1,
        );
        Some(outcome)
    }

    /// Publish current session counts as gauges.
    pub fn record_session_gauges(&self) {
        let count = self.sessions.count();
        self.metrics
            .set_gauge("relay_sessions", &[("protocol", "tcp")], count.tcp as i64);
        self.metrics
            .set_gauge("relay_sessions", &[("protocol", "udp")], count.udp as i64);
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }
}

/// Holds one of the `max_connections` TCP slots until dropped.
pub(crate) struct ConnectionSlot {
    state: Arc<RelayState>,
}

impl ConnectionSlot {
    pub fn acquire(state: &Arc<RelayState>) -> Option<Self> {
        let max = state.config.max_connections;
        state
            .active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()?;
        state
            .metrics
            .add_gauge("relay_active_connections", &[("protocol", "tcp")], 1);
        Some(Self {
            state: state.clone(),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::AcqRel);
        self.state
            .metrics
            .add_gauge("relay_active_connections", &[("protocol", "tcp")], -1);
    }
}
