//! Relay gateway entry point
//!
//! Loads the TOML configuration, applies CLI overrides, installs logging,
//! registers the built-in plugins and runs the TCP/UDP server until a
//! shutdown signal arrives.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use relay_server::{RelayServer, ServerStats};

mod cli;
mod config;
mod logging;
mod plugins;
mod signals;

use cli::CliArgs;
use config::AppConfig;

const STATS_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Application
// ============================================================================

pub struct Application {
    config: AppConfig,
    server: Arc<RelayServer>,
}

impl Application {
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        // Configuration comes first so logging can honour it.
        let mut config = AppConfig::load_from_file(&args.config_path)
            .await
            .with_context(|| format!("loading {}", args.config_path.display()))?;
        apply_overrides(&mut config, &args);

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {e}"))?;

        logging::setup_logging(&config.logging)?;
        display_banner();

        let server = RelayServer::new(config.to_server_config()?)?;
        let report = server
            .load_plugins(
                &plugins::builtin_registry(),
                &config.plugins.settings,
                config.plugins.enabled_filter(),
            )
            .await;
        for (name, err) in &report.failed {
            warn!("⚠️ Plugin '{}' failed to load: {}", name, err);
        }

        info!("📂 Config: {}", args.config_path.display());
        Ok(Self {
            config,
            server: Arc::new(server),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!("🌟 Starting relay gateway");
        info!("📋 Configuration Summary:");
        info!("  🔗 TCP bind: {}", display_bind(&self.config.server.tcp_bind));
        info!("  📨 UDP bind: {}", display_bind(&self.config.server.udp_bind));
        info!("  👥 Max connections: {}", self.config.server.max_connections);
        info!("  ⏱️ Idle timeout: {}s", self.config.server.idle_timeout_secs);
        info!(
            "  🛡️ Security: {}",
            if self.config.security.enabled { "enabled" } else { "disabled" }
        );

        let bound = self.server.start().await?;
        if let Some(addr) = bound.tcp {
            info!("✅ Accepting TCP connections on {}", addr);
        }
        if let Some(addr) = bound.udp {
            info!("✅ Receiving UDP datagrams on {}", addr);
        }

        let monitoring = spawn_monitoring(self.server.clone());
        info!("🔍 Health monitoring active - stats every {}s", STATS_INTERVAL.as_secs());
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        if let Err(e) = signals::wait_for_shutdown_signal().await {
            error!("❌ Signal handling failed, shutting down: {}", e);
        }
        info!("🛑 Shutdown signal received, initiating graceful shutdown...");

        monitoring.abort();
        self.server.shutdown().await?;

        let stats = self.server.stats().await;
        info!("📊 Final Statistics:");
        info!("  - Messages processed: {}", stats.messages_processed());
        info!("  - Security denials: {}", stats.security_denials());
        info!("  - Errors handled: {}", stats.errors.total);
        info!("✅ Relay gateway shutdown complete");
        Ok(())
    }
}

fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(tcp_bind) = &args.tcp_bind {
        config.server.tcp_bind = tcp_bind.clone();
    }
    if let Some(udp_bind) = &args.udp_bind {
        config.server.udp_bind = udp_bind.clone();
    }
    if let Some(log_level) = &args.log_level {
        config.logging.level = log_level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
}

fn spawn_monitoring(server: Arc<RelayServer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        // The first tick completes immediately.
        interval.tick().await;
        let mut last_processed = 0u64;

        loop {
            interval.tick().await;
            let stats = server.stats().await;
            let processed = stats.messages_processed();
            log_health(&stats, processed.saturating_sub(last_processed));
            last_processed = processed;
        }
    })
}

fn log_health(stats: &ServerStats, messages_this_period: u64) {
    info!(
        "📊 System Health - {} msgs/min | {} TCP / {} UDP sessions | {} resources | {} plugins",
        messages_this_period,
        stats.sessions.tcp,
        stats.sessions.udp,
        stats.resources.active,
        stats.plugins.enabled_plugins
    );
    if stats.errors.total > 0 {
        info!("  ⚠️ {} errors handled so far", stats.errors.total);
    }
}

fn display_bind(value: &str) -> &str {
    if value.trim().is_empty() {
        "disabled"
    } else {
        value
    }
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {:?}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to start application: {e:?}");
            std::process::exit(1);
        }
    }
}

fn display_banner() {
    let version = env!("CARGO_PKG_VERSION");
    info!("╔══════════════════════════════════════════╗");
    info!("║              🔀 RELAY GATEWAY              ║");
    info!("║                  v{:<8}                 ║", version);
    info!("║                                          ║");
    info!("║  TCP + UDP ingress                       ║");
    info!("║  🛡️  IP filter, rate and connection caps  ║");
    info!("║  🔌 Plugin pipeline with router fallback ║");
    info!("╚══════════════════════════════════════════╝");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn args() -> CliArgs {
        CliArgs {
            config_path: PathBuf::from("relay.toml"),
            tcp_bind: None,
            udp_bind: None,
            log_level: None,
            json_logs: false,
        }
    }

    #[test]
    fn test_overrides_replace_file_settings() {
        let mut config = AppConfig::default();
        let args = CliArgs {
            tcp_bind: Some("0.0.0.0:9000".to_string()),
            udp_bind: Some(String::new()),
            log_level: Some("debug".to_string()),
            json_logs: true,
            ..args()
        };

        apply_overrides(&mut config, &args);
        assert_eq!(config.server.tcp_bind, "0.0.0.0:9000");
        assert!(config.server.udp_bind.is_empty());
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);

        let server_config = config.to_server_config().unwrap();
        assert!(server_config.udp_bind.is_none());
    }

    #[test]
    fn test_no_overrides_keeps_file_settings() {
        let mut config = AppConfig::default();
        apply_overrides(&mut config, &args());
        assert_eq!(config.server.tcp_bind, "127.0.0.1:8080");
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json_format);
    }

    #[test]
    fn test_display_bind() {
        assert_eq!(display_bind(""), "disabled");
        assert_eq!(display_bind("127.0.0.1:1"), "127.0.0.1:1");
    }
}
