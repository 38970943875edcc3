use thiserror::Error;

/// Failures while establishing a server connection. Fatal to initialization.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no tool servers configured")]
    NoServers,
    #[error("failed to spawn MCP server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },
    #[error("MCP server '{server}' handshake failed: {message}")]
    Handshake { server: String, message: String },
    #[error("connection to MCP server '{server}' timed out")]
    Timeout { server: String },
    #[error("MCP server '{server}' has an invalid endpoint url: {message}")]
    Endpoint { server: String, message: String },
}

/// Failures on an established connection, per protocol exchange.
#[derive(Debug, Error)]
pub enum ToolInvokeError {
    #[error("MCP server '{server}' transport error: {message}")]
    Transport { server: String, message: String },
    #[error("MCP server '{server}' returned invalid JSON: {source}")]
    InvalidJson {
        server: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("MCP server '{server}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },
    #[error("MCP server '{server}' terminated unexpectedly")]
    Terminated { server: String },
    #[error("call to MCP server '{server}' timed out")]
    Timeout { server: String },
}

/// Failures while building the aggregated tool catalog. Fatal to
/// initialization: one bad listing poisons the whole build.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("listing tools on server '{server}' failed: {source}")]
    Listing {
        server: String,
        #[source]
        source: ToolInvokeError,
    },
    #[error("server '{server}' returned an unrecognized tool-listing shape: {source}")]
    Shape {
        server: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-call failures inside the conversation loop. Never fatal: the invoker
/// folds these into an error payload on the transcript.
#[derive(Debug, Error)]
pub enum ToolCallError {
    #[error("could not decode tool arguments: {0}")]
    ArgumentDecode(String),
    #[error("no tool named '{0}' is registered")]
    UnknownTool(String),
    #[error("tool '{tool}' failed: {source}")]
    Execution {
        tool: String,
        #[source]
        source: ToolInvokeError,
    },
}
