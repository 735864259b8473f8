//! Convenience constructors.

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::server::RelayServer;

pub fn create_server_with_config(config: ServerConfig) -> Result<RelayServer, ServerError> {
    RelayServer::new(config)
}
