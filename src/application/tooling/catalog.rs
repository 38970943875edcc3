//! Aggregated tool catalog.
//!
//! Listing payloads in the wild come in several shapes; they are decoded
//! through an explicit union and anything unrecognized is a `CatalogError`
//! rather than a silently empty catalog.

use super::error::CatalogError;
use super::interface::{ToolDescriptor, ToolServerConnection};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The listing shapes a server may answer `tools/list` with.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ToolListing {
    Wrapped { tools: Vec<Value> },
    Enveloped { result: Vec<Value> },
    Bare(Vec<Value>),
    Keyed(serde_json::Map<String, Value>),
}

impl ToolListing {
    fn into_records(self) -> Vec<Value> {
        match self {
            ToolListing::Wrapped { tools } => tools,
            ToolListing::Enveloped { result } => result,
            ToolListing::Bare(records) => records,
            ToolListing::Keyed(map) => map.into_iter().map(|(_, value)| value).collect(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ToolCatalog {
    entries: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl ToolCatalog {
    /// List every connection's tools and merge them into one name-keyed
    /// registry. Any listing failure poisons the whole build. On a name
    /// collision the later registration wins, keeping the earlier slot's
    /// position, and a warning names both servers.
    pub async fn query_all(
        connections: &[Arc<dyn ToolServerConnection>],
        deadline: Duration,
    ) -> Result<Self, CatalogError> {
        let mut catalog = Self::default();
        for connection in connections {
            let server = connection.server_name().to_string();
            let listing = tokio::time::timeout(deadline, connection.list_tools())
                .await
                .map_err(|_| CatalogError::Listing {
                    server: server.clone(),
                    source: super::error::ToolInvokeError::Timeout {
                        server: server.clone(),
                    },
                })?
                .map_err(|source| CatalogError::Listing {
                    server: server.clone(),
                    source,
                })?;

            for descriptor in coerce_listing(&server, listing)? {
                catalog.register(descriptor);
            }
        }
        debug!(tool_count = catalog.entries.len(), "tool catalog built");
        Ok(catalog)
    }

    fn register(&mut self, descriptor: ToolDescriptor) {
        match self.index.get(&descriptor.name) {
            Some(&slot) => {
                warn!(
                    tool = %descriptor.name,
                    previous_server = %self.entries[slot].server,
                    server = %descriptor.server,
                    "tool name collision, later registration wins"
                );
                self.entries[slot] = descriptor;
            }
            None => {
                self.index.insert(descriptor.name.clone(), self.entries.len());
                self.entries.push(descriptor);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&slot| &self.entries[slot])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Project the catalog into the backend's function-calling descriptors.
    pub fn to_function_specs(&self) -> Vec<Value> {
        self.entries
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description.clone().unwrap_or_default(),
                        "parameters": tool
                            .input_schema
                            .clone()
                            .unwrap_or_else(|| json!({ "type": "object" })),
                    }
                })
            })
            .collect()
    }
}

fn coerce_listing(server: &str, listing: Value) -> Result<Vec<ToolDescriptor>, CatalogError> {
    let listing: ToolListing =
        serde_json::from_value(listing).map_err(|source| CatalogError::Shape {
            server: server.to_string(),
            source,
        })?;

    let mut descriptors = Vec::new();
    for record in listing.into_records() {
        let Some(name) = record.get("name").and_then(Value::as_str) else {
            warn!(server = %server, "dropping tool record without a name");
            continue;
        };
        descriptors.push(ToolDescriptor {
            name: name.to_string(),
            description: record
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            input_schema: record.get("inputSchema").cloned(),
            server: server.to_string(),
        });
    }
    Ok(descriptors)
}
