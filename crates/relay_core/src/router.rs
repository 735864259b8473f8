//! First-match rule dispatch.
//!
//! Routes are evaluated in registration order and exactly one handler fires
//! per message. No match is not an error; the caller simply learns nothing
//! handled the message.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::error::{ErrorContext, RouterError};
use crate::message::MessageContext;
use crate::metrics::MetricsSink;
use crate::session::SessionStore;

#[async_trait]
pub trait RouteHandler: Send + Sync {
    async fn handle(&self, ctx: &MessageContext) -> Result<(), RouterError>;
}

/// Handler that computes a reply from the message and writes it back.
pub struct ReplyHandler<F>(pub F);

#[async_trait]
impl<F> RouteHandler for ReplyHandler<F>
where
    F: Fn(&MessageContext) -> Vec<u8> + Send + Sync,
{
    async fn handle(&self, ctx: &MessageContext) -> Result<(), RouterError> {
        let reply = (self.0)(ctx);
        ctx.reply(&reply).await?;
        Ok(())
    }
}

type Predicate = Box<dyn Fn(&MessageContext) -> bool + Send + Sync>;

struct Route {
    name: String,
    predicate: Predicate,
    handler: Arc<dyn RouteHandler>,
    hits: AtomicU64,
    last_latency_us: AtomicU64,
    total_latency_us: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RouteStats {
    pub name: String,
    pub hits: u64,
    pub last_latency_us: u64,
    pub total_latency_us: u64,
}

#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// `health`/`ping`, then `metrics`/`stats`, then echo for anything else.
    pub fn with_builtin_routes(sessions: Arc<SessionStore>) -> Self {
        Self::new().with_health().with_stats(sessions).with_echo()
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_health(mut self) -> Self {
        self.add_route(
            "health",
            |ctx| matches!(command(ctx), b"health" | b"ping"),
            ReplyHandler(|_: &MessageContext| b"OK\n".to_vec()),
        );
        self
    }

    pub fn with_stats(mut self, sessions: Arc<SessionStore>) -> Self {
        self.add_route(
            "stats",
            |ctx| matches!(command(ctx), b"metrics" | b"stats"),
            ReplyHandler(move |_: &MessageContext| {
                let count = sessions.count();
                let mut body = json!({
                    "activeSessions": count.total(),
                    "tcp": count.tcp,
                    "udp": count.udp,
                })
                .to_string()
                .into_bytes();
                body.push(b'\n');
                body
            }),
        );
        self
    }

    pub fn with_echo(mut self) -> Self {
        self.add_route(
            "echo",
            |ctx| !ctx.payload.is_empty(),
            ReplyHandler(|ctx: &MessageContext| ctx.payload.clone()),
        );
        self
    }

    pub fn add_route<P, H>(&mut self, name: impl Into<String>, predicate: P, handler: H)
    where
        P: Fn(&MessageContext) -> bool + Send + Sync + 'static,
        H: RouteHandler + 'static,
    {
        let name = name.into();
        debug!(route = %name, position = self.routes.len(), "Registered route");
        self.routes.push(Route {
            name,
            predicate: Box::new(predicate),
            handler: Arc::new(handler),
            hits: AtomicU64::new(0),
            last_latency_us: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
        });
    }

    /// Dispatch to the first matching route. Returns whether one matched.
    pub async fn route(&self, ctx: &MessageContext) -> Result<bool, RouterError> {
        let Some(route) = self.routes.iter().find(|route| (route.predicate)(ctx)) else {
            debug!(session_id = %ctx.session_id, "No route matched");
            return Ok(false);
        };

        let started = Instant::now();
        let result = route.handler.handle(ctx).await;
        let elapsed_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);

        route.hits.fetch_add(1, Ordering::Relaxed);
        route.last_latency_us.store(elapsed_us, Ordering::Relaxed);
        route.total_latency_us.fetch_add(elapsed_us, Ordering::Relaxed);

        if let Some(metrics) = &self.metrics {
            let labels = [("route", route.name.as_str())];
            metrics.increment_counter("relay_routes_total", &labels, 1);
            metrics.observe_histogram(
                "relay_route_latency_ms",
                &labels,
                elapsed_us as f64 / 1_000.0,
            );
        }

        result.map_err(|err| {
            err.with_context(
                &ErrorContext::new()
                    .component("router")
                    .with_extra("route", route.name.clone()),
            )
            .with_context(&ctx.error_context())
        })?;
        Ok(true)
    }

    pub fn route_names(&self) -> Vec<&str> {
        self.routes.iter().map(|route| route.name.as_str()).collect()
    }

    pub fn stats(&self) -> Vec<RouteStats> {
        self.routes
            .iter()
            .map(|route| RouteStats {
                name: route.name.clone(),
                hits: route.hits.load(Ordering::Relaxed),
                last_latency_us: route.last_latency_us.load(Ordering::Relaxed),
                total_latency_us: route.total_latency_us.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// Payload with surrounding ASCII whitespace removed, so `health\n` from a
/// line-oriented client still matches.
fn command(ctx: &MessageContext) -> &[u8] {
    ctx.payload.trim_ascii()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TransportHandle;
    use crate::metrics::InMemoryMetrics;
    use crate::session::Protocol;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn message(payload: &[u8]) -> (MessageContext, UnboundedReceiver<Vec<u8>>) {
        let (transport, rx) = TransportHandle::channel();
        let ctx = MessageContext::new(
            "s-1",
            Protocol::Tcp,
            "127.0.0.1:4000".parse().unwrap(),
            payload.to_vec(),
            transport,
        );
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_health_replies_ok_exactly() {
        let router = Router::with_builtin_routes(Arc::new(SessionStore::new()));
        for payload in [&b"health"[..], b"ping", b"health\r\n"] {
            let (ctx, mut rx) = message(payload);
            assert!(router.route(&ctx).await.unwrap());
            assert_eq!(rx.recv().await.unwrap(), b"OK\n");
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let sessions = Arc::new(SessionStore::new());
        sessions.create_session("127.0.0.1:1".parse().unwrap());
        sessions.get_or_create_for_datagram("127.0.0.1:2".parse().unwrap());
        let router = Router::with_builtin_routes(sessions);

        let (ctx, mut rx) = message(b"stats");
        assert!(router.route(&ctx).await.unwrap());
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.last(), Some(&b'\n'));
        let body: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(body["activeSessions"], 2);
        assert_eq!(body["tcp"], 1);
        assert_eq!(body["udp"], 1);
    }

    #[tokio::test]
    async fn test_echo_and_empty_payload() {
        let router = Router::with_builtin_routes(Arc::new(SessionStore::new()));

        let (ctx, mut rx) = message(b"hello relay");
        assert!(router.route(&ctx).await.unwrap());
        assert_eq!(rx.recv().await.unwrap(), b"hello relay");

        let (ctx, mut rx) = message(b"");
        assert!(!router.route(&ctx).await.unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_first_match_wins_and_stats_recorded() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let mut router = Router::new().with_metrics(metrics.clone());
        router.add_route("first", |_| true, ReplyHandler(|_: &MessageContext| b"1".to_vec()));
        router.add_route("second", |_| true, ReplyHandler(|_: &MessageContext| b"2".to_vec()));

        let (ctx, mut rx) = message(b"x");
        assert!(router.route(&ctx).await.unwrap());
        assert_eq!(rx.recv().await.unwrap(), b"1");
        assert!(rx.try_recv().is_err());

        let stats = router.stats();
        assert_eq!(stats[0].hits, 1);
        assert_eq!(stats[1].hits, 0);
        assert_eq!(metrics.counter("relay_routes_total", &[("route", "first")]), 1);
        assert_eq!(router.route_names(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_handler_error_carries_context() {
        let router = Router::new().with_echo();
        let ctx = MessageContext::new(
            "s-9",
            Protocol::Udp,
            "127.0.0.1:4000".parse().unwrap(),
            b"x".to_vec(),
            TransportHandle::Detached,
        );

        let err = router.route(&ctx).await.unwrap_err();
        assert_eq!(err.context.component.as_deref(), Some("router"));
        assert_eq!(err.context.session_id.as_deref(), Some("s-9"));
        assert_eq!(err.context.extra["route"], "echo");
    }
}
