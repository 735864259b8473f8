//! Ordered message stages with explicit continuation.
//!
//! Each [`Stage`] receives the context and a [`Next`] handle. Calling
//! `next.run(ctx)` hands off to the following stage; returning without calling
//! it stops the chain. Returning `Ok(None)` drops the message.
//!
//! ```text
//! process(ctx) → stage[0].handle(ctx, next) → stage[1].handle(ctx, next) → … → end
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

use crate::error::RouterError;
use crate::message::MessageContext;
use crate::router::Router;

pub type StageResult = Result<Option<MessageContext>, RouterError>;

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, ctx: MessageContext, next: Next<'_>) -> StageResult;
}

/// Continuation into the rest of the pipeline.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Stage>],
    reached_end: &'a AtomicBool,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: MessageContext) -> StageResult {
        match self.remaining.split_first() {
            Some((stage, rest)) => {
                trace!(stage = stage.name(), "Entering stage");
                stage
                    .handle(
                        ctx,
                        Next {
                            remaining: rest,
                            reached_end: self.reached_end,
                        },
                    )
                    .await
            }
            None => {
                self.reached_end.store(true, Ordering::Release);
                Ok(Some(ctx))
            }
        }
    }
}

#[derive(Debug)]
pub enum PipelineOutcome {
    /// Every stage ran and passed the context on.
    Completed(MessageContext),
    /// A stage dropped the message.
    Dropped,
    /// A stage returned without calling its continuation. This is a contract
    /// violation; stages must either continue or drop.
    Halted(MessageContext),
}

impl PipelineOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineOutcome::Completed(_))
    }
}

#[derive(Default, Clone)]
pub struct MessagePipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl MessagePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn add_stage(&mut self, stage: Arc<dyn Stage>) {
        self.stages.push(stage);
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    pub async fn process(&self, ctx: MessageContext) -> Result<PipelineOutcome, RouterError> {
        let reached_end = AtomicBool::new(false);
        let next = Next {
            remaining: &self.stages,
            reached_end: &reached_end,
        };

        match next.run(ctx).await? {
            None => Ok(PipelineOutcome::Dropped),
            Some(ctx) if reached_end.load(Ordering::Acquire) => Ok(PipelineOutcome::Completed(ctx)),
            Some(ctx) => {
                warn!(
                    session_id = %ctx.session_id,
                    "Pipeline halted: a stage returned without continuing"
                );
                Ok(PipelineOutcome::Halted(ctx))
            }
        }
    }
}

/// Terminal-friendly stage that runs the router, then continues.
pub struct RouterStage {
    router: Arc<Router>,
}

impl RouterStage {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Stage for RouterStage {
    fn name(&self) -> &str {
        "router"
    }

    async fn handle(&self, ctx: MessageContext, next: Next<'_>) -> StageResult {
        self.router.route(&ctx).await?;
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TransportHandle;
    use crate::session::Protocol;
    use std::sync::atomic::AtomicUsize;

    fn ctx(payload: &str) -> MessageContext {
        MessageContext::new(
            "s",
            Protocol::Tcp,
            "127.0.0.1:1".parse().unwrap(),
            payload.as_bytes().to_vec(),
            TransportHandle::Detached,
        )
    }

    struct Append(&'static str);

    #[async_trait]
    impl Stage for Append {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle(&self, mut ctx: MessageContext, next: Next<'_>) -> StageResult {
            ctx.payload.extend_from_slice(self.0.as_bytes());
            next.run(ctx).await
        }
    }

    struct Discard;

    #[async_trait]
    impl Stage for Discard {
        fn name(&self) -> &str {
            "discard"
        }

        async fn handle(&self, _ctx: MessageContext, _next: Next<'_>) -> StageResult {
            Ok(None)
        }
    }

    struct Forgetful;

    #[async_trait]
    impl Stage for Forgetful {
        fn name(&self) -> &str {
            "forgetful"
        }

        async fn handle(&self, ctx: MessageContext, _next: Next<'_>) -> StageResult {
            Ok(Some(ctx))
        }
    }

    struct Count(Arc<AtomicUsize>);

    #[async_trait]
    impl Stage for Count {
        fn name(&self) -> &str {
            "count"
        }

        async fn handle(&self, ctx: MessageContext, next: Next<'_>) -> StageResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            next.run(ctx).await
        }
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let pipeline = MessagePipeline::new().stage(Append("a")).stage(Append("b"));
        match pipeline.process(ctx(">")).await.unwrap() {
            PipelineOutcome::Completed(ctx) => assert_eq!(ctx.payload, b">ab"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(pipeline.stage_names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_empty_pipeline_completes() {
        let outcome = MessagePipeline::new().process(ctx("x")).await.unwrap();
        assert!(outcome.is_completed());
    }

    #[tokio::test]
    async fn test_drop_stops_later_stages() {
        let hits = Arc::new(AtomicUsize::new(0));
        let pipeline = MessagePipeline::new()
            .stage(Discard)
            .stage(Count(hits.clone()));

        assert!(matches!(
            pipeline.process(ctx("x")).await.unwrap(),
            PipelineOutcome::Dropped
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_continuation_is_reported() {
        let hits = Arc::new(AtomicUsize::new(0));
        let pipeline = MessagePipeline::new()
            .stage(Count(hits.clone()))
            .stage(Forgetful)
            .stage(Count(hits.clone()));

        assert!(matches!(
            pipeline.process(ctx("x")).await.unwrap(),
            PipelineOutcome::Halted(_)
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_router_stage_replies() {
        let router = Arc::new(Router::new().with_echo());
        let pipeline = MessagePipeline::new().stage(RouterStage::new(router));

        let (transport, mut rx) = TransportHandle::channel();
        let mut message = ctx("ping?");
        message.transport = transport;

        assert!(pipeline.process(message).await.unwrap().is_completed());
        assert_eq!(rx.recv().await.unwrap(), b"ping?");
    }
}
