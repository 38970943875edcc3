//! The engine: one explicitly constructed context object holding the
//! connection registry, the aggregated catalog, and the model backend.
//! Built once at service startup and shared by every request; tests inject
//! fake connectors and backends through `bootstrap_with`.

use super::conversation::ConversationLoop;
use super::stream::{self, ResponseStream};
use super::tooling::{
    CatalogError, ConnectionError, Connector, Timeouts, ToolCatalog, ToolInvoker,
    ToolServerConnection, TransportConnector, connect_all,
};
use crate::config::{ConfigError, EngineConfig};
use crate::domain::types::{ChatMessage, ChatSettings};
use crate::infrastructure::model::{ModelBackend, ModelError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Structured error at the request boundary: a message and an HTTP-ish
/// status for failures occurring before streaming begins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct EngineError {
    pub message: String,
    pub status: u16,
}

impl EngineError {
    pub fn new(message: impl Into<String>, status: u16) -> Self {
        Self {
            message: message.into(),
            status,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(message, 500)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(message, 400)
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<ConnectionError> for EngineError {
    fn from(err: ConnectionError) -> Self {
        Self::new(err.to_string(), 502)
    }
}

impl From<CatalogError> for EngineError {
    fn from(err: CatalogError) -> Self {
        Self::new(err.to_string(), 502)
    }
}

impl From<ModelError> for EngineError {
    fn from(err: ModelError) -> Self {
        let status = err.status();
        Self::new(err.to_string(), status)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineLimits {
    pub max_iterations: u32,
    pub timeouts: Timeouts,
    pub channel_capacity: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            timeouts: Timeouts::default(),
            channel_capacity: 64,
        }
    }
}

pub struct ChatEngine {
    connections: HashMap<String, Arc<dyn ToolServerConnection>>,
    catalog: Arc<ToolCatalog>,
    backend: Arc<dyn ModelBackend>,
    limits: EngineLimits,
}

impl std::fmt::Debug for ChatEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatEngine")
            .field("connections", &self.connections)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl ChatEngine {
    /// Connect every configured server and build the catalog, using the
    /// production transports and default limits.
    pub async fn bootstrap(
        config: EngineConfig,
        backend: Arc<dyn ModelBackend>,
    ) -> Result<Self, EngineError> {
        let limits = EngineLimits::default();
        let connector = TransportConnector::new(limits.timeouts);
        Self::bootstrap_with(config, backend, &connector, limits).await
    }

    pub async fn bootstrap_with(
        config: EngineConfig,
        backend: Arc<dyn ModelBackend>,
        connector: &dyn Connector,
        limits: EngineLimits,
    ) -> Result<Self, EngineError> {
        let connections = connect_all(connector, &config.servers).await?;

        let catalog =
            match ToolCatalog::query_all(&connections, limits.timeouts.list_tools).await {
                Ok(catalog) => catalog,
                Err(err) => {
                    // Catalog failure aborts initialization; release what we opened.
                    for connection in &connections {
                        connection.shutdown().await;
                    }
                    return Err(err.into());
                }
            };

        info!(
            servers = connections.len(),
            tools = catalog.len(),
            "chat engine ready"
        );

        let connections = connections
            .into_iter()
            .map(|connection| (connection.server_name().to_string(), connection))
            .collect();

        Ok(Self {
            connections,
            catalog: Arc::new(catalog),
            backend,
            limits,
        })
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Start one chat invocation. Failures before streaming begins surface
    /// here; everything after lands on the returned stream.
    pub fn respond(
        &self,
        settings: ChatSettings,
        messages: Vec<ChatMessage>,
    ) -> Result<ResponseStream, EngineError> {
        if settings.model.trim().is_empty() {
            return Err(EngineError::invalid("model must not be empty"));
        }
        if messages.is_empty() {
            return Err(EngineError::invalid("messages must not be empty"));
        }

        let invoker = ToolInvoker::new(
            Arc::clone(&self.catalog),
            self.connections.clone(),
            self.limits.timeouts.call_tool,
        );
        let conversation_loop = ConversationLoop::new(
            Arc::clone(&self.backend),
            invoker,
            self.catalog.to_function_specs(),
            self.limits.max_iterations,
        );

        let (sink, output) = stream::channel(self.limits.channel_capacity);
        tokio::spawn(conversation_loop.run(settings, messages, sink));
        Ok(output)
    }

    /// Close every server connection. The engine is unusable afterwards.
    pub async fn shutdown(&self) {
        for connection in self.connections.values() {
            connection.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::tooling::error::ToolInvokeError;
    use crate::config::{ServerDescriptor, TransportConfig};
    use crate::domain::types::MessageRole;
    use crate::infrastructure::model::{ModelChunk, ModelRequest, ModelResponse};
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    struct OneShotBackend;

    #[async_trait]
    impl ModelBackend for OneShotBackend {
        fn name(&self) -> &str {
            "oneshot"
        }

        async fn complete(&self, _request: ModelRequest) -> Result<ModelResponse, ModelError> {
            Ok(ModelResponse {
                message: ChatMessage::new(MessageRole::Assistant, "pong"),
            })
        }

        async fn stream(
            &self,
            _request: ModelRequest,
        ) -> Result<mpsc::Receiver<Result<ModelChunk, ModelError>>, ModelError> {
            let (tx, rx) = mpsc::channel(2);
            let _ = tx
                .send(Ok(ModelChunk {
                    content: Some("pong".into()),
                    tool_calls: Vec::new(),
                    done: true,
                }))
                .await;
            Ok(rx)
        }
    }

    struct FakeConnection {
        name: String,
        listing: Value,
        shut_down: AtomicBool,
    }

    #[async_trait]
    impl ToolServerConnection for FakeConnection {
        fn server_name(&self) -> &str {
            &self.name
        }

        async fn list_tools(&self) -> Result<Value, ToolInvokeError> {
            if self.listing.is_null() {
                return Err(ToolInvokeError::Terminated {
                    server: self.name.clone(),
                });
            }
            Ok(self.listing.clone())
        }

        async fn call_tool(&self, _tool: &str, _args: Value) -> Result<Value, ToolInvokeError> {
            Ok(json!({}))
        }

        async fn shutdown(&self) {
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        listing: Value,
        opened: Mutex<Vec<Arc<FakeConnection>>>,
    }

    impl FakeConnector {
        fn new(listing: Value) -> Self {
            Self {
                listing,
                opened: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            server: &ServerDescriptor,
        ) -> Result<Arc<dyn ToolServerConnection>, ConnectionError> {
            let connection = Arc::new(FakeConnection {
                name: server.name.clone(),
                listing: self.listing.clone(),
                shut_down: AtomicBool::new(false),
            });
            self.opened.lock().expect("opened lock").push(connection.clone());
            Ok(connection)
        }
    }

    fn config(names: &[&str]) -> EngineConfig {
        EngineConfig {
            servers: names
                .iter()
                .map(|name| ServerDescriptor {
                    name: name.to_string(),
                    transport: TransportConfig::Sse {
                        url: format!("http://localhost/{name}"),
                    },
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn bootstrap_then_respond_streams_text() {
        let connector = FakeConnector::new(json!([{ "name": "lookup" }]));
        let engine = ChatEngine::bootstrap_with(
            config(&["srv"]),
            Arc::new(OneShotBackend),
            &connector,
            EngineLimits::default(),
        )
        .await
        .expect("engine boots");
        assert_eq!(engine.catalog().len(), 1);

        let mut output = engine
            .respond(
                ChatSettings::new("test-model"),
                vec![ChatMessage::new(MessageRole::User, "ping")],
            )
            .expect("stream starts");

        assert_eq!(output.next().await, Some(Ok("pong".into())));
        assert!(output.next().await.is_none());
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_with_400() {
        let connector = FakeConnector::new(json!([]));
        let engine = ChatEngine::bootstrap_with(
            config(&["srv"]),
            Arc::new(OneShotBackend),
            &connector,
            EngineLimits::default(),
        )
        .await
        .expect("engine boots");

        let err = engine
            .respond(ChatSettings::new(""), vec![ChatMessage::new(MessageRole::User, "hi")])
            .expect_err("empty model rejected");
        assert_eq!(err.status, 400);

        let err = engine
            .respond(ChatSettings::new("m"), Vec::new())
            .expect_err("empty messages rejected");
        assert_eq!(err.status, 400);
    }

    #[tokio::test]
    async fn catalog_failure_releases_every_connection() {
        let connector = FakeConnector::new(Value::Null);
        let err = ChatEngine::bootstrap_with(
            config(&["a", "b"]),
            Arc::new(OneShotBackend),
            &connector,
            EngineLimits::default(),
        )
        .await
        .expect_err("listing failure is fatal");
        assert_eq!(err.status, 502);

        let opened = connector.opened.lock().expect("opened lock");
        assert_eq!(opened.len(), 2);
        assert!(opened.iter().all(|c| c.shut_down.load(Ordering::SeqCst)));
    }

    #[tokio::test]
    async fn zero_servers_fails_bootstrap() {
        let connector = FakeConnector::new(json!([]));
        let err = ChatEngine::bootstrap_with(
            config(&[]),
            Arc::new(OneShotBackend),
            &connector,
            EngineLimits::default(),
        )
        .await
        .expect_err("no servers configured");
        assert_eq!(err.status, 502);
    }

    #[tokio::test]
    async fn shutdown_reaches_every_connection() {
        let connector = FakeConnector::new(json!([]));
        let engine = ChatEngine::bootstrap_with(
            config(&["a", "b"]),
            Arc::new(OneShotBackend),
            &connector,
            EngineLimits::default(),
        )
        .await
        .expect("engine boots");

        engine.shutdown().await;
        let opened = connector.opened.lock().expect("opened lock");
        assert!(opened.iter().all(|c| c.shut_down.load(Ordering::SeqCst)));
    }
}
