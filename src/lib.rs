//! Tool-augmented chat orchestration.
//!
//! The engine connects to MCP tool servers over stdio pipes or SSE, merges
//! their catalogs into one function-calling toolset, and drives a bounded
//! conversation loop against a streaming model backend. Callers get the run
//! back as a lazy, cancellable stream of text chunks with tool activity
//! annotated inline.
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use switchboard::{ChatEngine, ChatMessage, ChatSettings, EngineConfig, MessageRole};
//! use switchboard::model::OpenAiCompatBackend;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_path("servers.json".as_ref())?;
//! let backend = Arc::new(OpenAiCompatBackend::new("local", "http://localhost:11434/v1"));
//! let engine = ChatEngine::bootstrap(config, backend).await?;
//!
//! let mut output = engine.respond(
//!     ChatSettings::new("llama3"),
//!     vec![ChatMessage::new(MessageRole::User, "what's the weather in Oslo?")],
//! )?;
//! while let Some(chunk) = output.next().await {
//!     print!("{}", chunk?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::engine::{ChatEngine, EngineError, EngineLimits};
pub use application::stream::ResponseStream;
pub use application::tooling;
pub use application::tooling::{
    CatalogError, ConnectionError, Connector, Timeouts, ToolCatalog, ToolDescriptor,
    ToolServerConnection, TransportConnector,
};
pub use config::{ConfigError, EngineConfig, ServerDescriptor, TransportConfig};
pub use domain::types::{ChatMessage, ChatSettings, MessageRole, ToolCallRequest};
pub use infrastructure::model;
