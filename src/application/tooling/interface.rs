use super::error::ToolInvokeError;
use async_trait::async_trait;
use serde_json::Value;

/// One capability exposed by a server, as registered in the catalog.
///
/// `server` is a back-reference by name; the connection registry owns the
/// actual handle.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
    pub server: String,
}

/// A live connection to one tool server, independent of transport.
///
/// `list_tools` returns the listing payload verbatim; shape coercion is the
/// catalog's concern.
#[async_trait]
pub trait ToolServerConnection: Send + Sync {
    fn server_name(&self) -> &str;

    async fn list_tools(&self) -> Result<Value, ToolInvokeError>;

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolInvokeError>;

    /// Tear the connection down. Idempotent.
    async fn shutdown(&self);
}

impl std::fmt::Debug for dyn ToolServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolServerConnection")
            .field("server_name", &self.server_name())
            .finish_non_exhaustive()
    }
}
