use async_trait::async_trait;
use plugin_system::{LegacyPlugin, PluginError};
use relay_core::{MessageContext, ServiceLocator, SessionStore};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

// ============================================================================
// Greeter Plugin
// ============================================================================

/// Welcomes clients that say hello and consumes the greeting so it never
/// reaches the router.
pub struct GreeterPlugin {
    welcome_count: AtomicU32,
    sessions: Option<Arc<SessionStore>>,
}

impl GreeterPlugin {
    pub fn new() -> Self {
        Self {
            welcome_count: AtomicU32::new(0),
            sessions: None,
        }
    }

    pub fn welcome_count(&self) -> u32 {
        self.welcome_count.load(Ordering::Relaxed)
    }

    fn is_greeting(payload: &[u8]) -> bool {
        let word = payload.trim_ascii();
        word.eq_ignore_ascii_case(b"hello") || word.eq_ignore_ascii_case(b"hi")
    }
}

impl Default for GreeterPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LegacyPlugin for GreeterPlugin {
    fn name(&self) -> &str {
        "greeter"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn initialize(&mut self, services: Arc<ServiceLocator>) -> Result<(), PluginError> {
        self.sessions = services.resolve::<SessionStore>("sessions");
        if self.sessions.is_none() {
            warn!("👋 GreeterPlugin: no session store registered, greetings will not be recorded");
        }
        info!("👋 GreeterPlugin: ready to welcome clients");
        Ok(())
    }

    async fn process(&self, ctx: MessageContext) -> Result<Option<MessageContext>, PluginError> {
        if !Self::is_greeting(&ctx.payload) {
            return Ok(Some(ctx));
        }

        let count = self.welcome_count.fetch_add(1, Ordering::Relaxed) + 1;
        let greeting = format!("Welcome, {}! You are visitor #{}\n", ctx.remote(), count);
        ctx.reply(greeting.as_bytes())
            .await
            .map_err(|e| PluginError::ExecutionError(e.to_string()))?;

        if let Some(sessions) = &self.sessions {
            sessions.set_metadata(&ctx.session_id, "greeted", "true");
        }

        info!(
            session_id = %ctx.session_id,
            peer = %ctx.remote(),
            count,
            "👋 GreeterPlugin: welcomed client"
        );
        Ok(None)
    }

    async fn stop(&mut self) -> Result<(), PluginError> {
        info!(
            "👋 GreeterPlugin: welcomed {} clients this run",
            self.welcome_count()
        );
        Ok(())
    }
}

pub fn create() -> Box<dyn LegacyPlugin> {
    Box::new(GreeterPlugin::new())
}
