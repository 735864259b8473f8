use async_trait::async_trait;
use relay_core::{MessageContext, Next, Stage, StageResult};
use std::sync::Arc;

use crate::PluginManager;

/// Runs the plugin chain as one pipeline stage. A plugin drop drops the message.
pub struct PluginStage {
    manager: Arc<PluginManager>,
}

impl PluginStage {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Stage for PluginStage {
    fn name(&self) -> &str {
        "plugins"
    }

    async fn handle(&self, ctx: MessageContext, next: Next<'_>) -> StageResult {
        match self.manager.process_message(ctx).await {
            Some(ctx) => next.run(ctx).await,
            None => Ok(None),
        }
    }
}
