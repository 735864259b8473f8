//! Command-line interface for the relay gateway.
//!
//! Every option here overrides the matching setting from the configuration
//! file.

use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the TCP listener address
    pub tcp_bind: Option<String>,
    /// Optional override for the UDP socket address
    pub udp_bind: Option<String>,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
}

impl CliArgs {
    /// Parses the process arguments.
    pub fn parse() -> Self {
        Self::from_matches(&command().get_matches())
    }

    fn from_matches(matches: &clap::ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
            tcp_bind: matches.get_one::<String>("tcp-bind").cloned(),
            udp_bind: matches.get_one::<String>("udp-bind").cloned(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

const DEFAULT_CONFIG_PATH: &str = "relay.toml";

fn command() -> Command {
    Command::new("Relay Gateway")
        .version(env!("CARGO_PKG_VERSION"))
        .about("TCP/UDP relay gateway with a plugin message pipeline")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("tcp-bind")
                .long("tcp-bind")
                .value_name("ADDRESS")
                .help("TCP listener address (e.g., 0.0.0.0:8080); empty disables TCP"),
        )
        .arg(
            Arg::new("udp-bind")
                .long("udp-bind")
                .value_name("ADDRESS")
                .help("UDP socket address (e.g., 0.0.0.0:8081); empty disables UDP"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level (trace, debug, info, warn, error)"),
        )
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .help("Output logs in JSON format")
                .action(ArgAction::SetTrue),
        )
}
