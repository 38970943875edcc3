pub mod catalog;
pub mod connector;
pub mod error;
pub mod interface;
pub mod invoker;
pub mod sse;
pub mod stdio;

pub use catalog::ToolCatalog;
pub use connector::{Connector, TransportConnector, connect_all};
pub use error::{CatalogError, ConnectionError, ToolCallError, ToolInvokeError};
pub use interface::{ToolDescriptor, ToolServerConnection};
pub use invoker::{ToolInvoker, ToolOutcome};

use std::time::Duration;

/// Deadlines applied to every tool-layer suspension point.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub connect: Duration,
    pub list_tools: Duration,
    pub call_tool: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(15),
            list_tools: Duration::from_secs(15),
            call_tool: Duration::from_secs(60),
        }
    }
}
