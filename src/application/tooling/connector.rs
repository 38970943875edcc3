//! Connection establishment over the configured server list.
//!
//! Initialization is fail-fast: servers connect sequentially in document
//! order and the first failure aborts the whole attempt, shutting down every
//! connection opened so far.

use super::Timeouts;
use super::error::ConnectionError;
use super::interface::ToolServerConnection;
use super::sse::SseConnection;
use super::stdio::StdioConnection;
use crate::config::{ServerDescriptor, TransportConfig};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Seam for connection establishment; tests substitute fake transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        server: &ServerDescriptor,
    ) -> Result<Arc<dyn ToolServerConnection>, ConnectionError>;
}

/// Production connector dispatching on the descriptor's transport kind.
#[derive(Debug, Default)]
pub struct TransportConnector {
    timeouts: Timeouts,
}

impl TransportConnector {
    pub fn new(timeouts: Timeouts) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(
        &self,
        server: &ServerDescriptor,
    ) -> Result<Arc<dyn ToolServerConnection>, ConnectionError> {
        match &server.transport {
            TransportConfig::Stdio { .. } => {
                let connection = StdioConnection::connect(server, self.timeouts.connect).await?;
                Ok(Arc::new(connection))
            }
            TransportConfig::Sse { url } => {
                let connection =
                    SseConnection::connect(&server.name, url, self.timeouts.connect).await?;
                Ok(Arc::new(connection))
            }
        }
    }
}

pub async fn connect_all(
    connector: &dyn Connector,
    servers: &[ServerDescriptor],
) -> Result<Vec<Arc<dyn ToolServerConnection>>, ConnectionError> {
    if servers.is_empty() {
        return Err(ConnectionError::NoServers);
    }

    let mut connections: Vec<Arc<dyn ToolServerConnection>> = Vec::with_capacity(servers.len());
    for server in servers {
        match connector.connect(server).await {
            Ok(connection) => {
                info!(server = %server.name, "connected to tool server");
                connections.push(connection);
            }
            Err(err) => {
                warn!(server = %server.name, %err, "connection failed, aborting initialization");
                for opened in &connections {
                    opened.shutdown().await;
                }
                return Err(err);
            }
        }
    }
    Ok(connections)
}
