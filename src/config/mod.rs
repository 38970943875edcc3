//! Engine configuration.
//!
//! Read once at startup from a JSON document whose top-level `mcpServers`
//! mapping names every tool server and its transport. Document order is
//! preserved and decides both connection order and catalog registration
//! order.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration: {source}")]
    Parse {
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid descriptor for server '{name}': {source}")]
    Server {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Transport selector for one configured server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Subprocess exchanging protocol messages over stdin/stdout.
    Stdio {
        command: String,
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// HTTP(S) endpoint exchanging messages over a server-sent-event channel.
    Sse { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub name: String,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub servers: Vec<ServerDescriptor>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: serde_json::Map<String, Value>,
}

impl EngineConfig {
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_json::from_str(document).map_err(|source| ConfigError::Parse { source })?;

        let mut servers = Vec::with_capacity(raw.mcp_servers.len());
        for (name, value) in raw.mcp_servers {
            let transport: TransportConfig = serde_json::from_value(value).map_err(|source| {
                ConfigError::Server {
                    name: name.clone(),
                    source,
                }
            })?;
            servers.push(ServerDescriptor {
                name,
                transport: expand_transport(transport),
            });
        }

        debug!(server_count = servers.len(), "Parsed engine configuration");
        Ok(Self { servers })
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "Reading engine configuration file");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }
}

/// Expand `~` and `${VAR}` references the way a shell would; values that fail
/// to expand are kept verbatim.
fn expand_transport(transport: TransportConfig) -> TransportConfig {
    let expand = |s: &str| -> String {
        shellexpand::full(s)
            .map(|cow| cow.into_owned())
            .unwrap_or_else(|_| s.to_string())
    };

    match transport {
        TransportConfig::Stdio { command, args, env } => TransportConfig::Stdio {
            command: expand(&command),
            args: args.iter().map(|arg| expand(arg)).collect(),
            env: env
                .into_iter()
                .map(|(key, value)| (key, expand(&value)))
                .collect(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_both_transport_kinds_in_document_order() {
        let config = EngineConfig::from_json(
            r#"{
                "mcpServers": {
                    "weather": { "type": "stdio", "command": "weather-mcp", "args": ["--celsius"] },
                    "search": { "type": "sse", "url": "http://localhost:9100/sse" }
                }
            }"#,
        )
        .expect("config parses");

        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].name, "weather");
        assert_eq!(
            config.servers[0].transport,
            TransportConfig::Stdio {
                command: "weather-mcp".into(),
                args: vec!["--celsius".into()],
                env: HashMap::new(),
            }
        );
        assert_eq!(config.servers[1].name, "search");
        assert_eq!(
            config.servers[1].transport,
            TransportConfig::Sse {
                url: "http://localhost:9100/sse".into()
            }
        );
    }

    #[test]
    fn missing_required_field_is_fatal() {
        let err = EngineConfig::from_json(
            r#"{ "mcpServers": { "broken": { "type": "stdio", "command": "x" } } }"#,
        )
        .expect_err("args is required for stdio");
        assert!(matches!(err, ConfigError::Server { ref name, .. } if name == "broken"));

        let err = EngineConfig::from_json(r#"{ "mcpServers": { "broken": { "type": "sse" } } }"#)
            .expect_err("url is required for sse");
        assert!(matches!(err, ConfigError::Server { ref name, .. } if name == "broken"));
    }

    #[test]
    fn unknown_transport_kind_is_fatal() {
        let err = EngineConfig::from_json(
            r#"{ "mcpServers": { "odd": { "type": "carrier-pigeon", "url": "x" } } }"#,
        )
        .expect_err("unknown type rejected");
        assert!(matches!(err, ConfigError::Server { ref name, .. } if name == "odd"));
    }

    #[test]
    fn expands_env_references_in_stdio_values() {
        unsafe {
            std::env::set_var("SWITCHBOARD_TEST_ROOT", "/opt/servers");
        }

        let config = EngineConfig::from_json(
            r#"{
                "mcpServers": {
                    "files": {
                        "type": "stdio",
                        "command": "${SWITCHBOARD_TEST_ROOT}/files-mcp",
                        "args": ["--root", "${SWITCHBOARD_TEST_ROOT}"],
                        "env": { "DATA_DIR": "${SWITCHBOARD_TEST_ROOT}/data" }
                    }
                }
            }"#,
        )
        .expect("config parses");

        let TransportConfig::Stdio { command, args, env } = &config.servers[0].transport else {
            panic!("expected stdio transport");
        };
        assert_eq!(command, "/opt/servers/files-mcp");
        assert_eq!(args[1], "/opt/servers");
        assert_eq!(env.get("DATA_DIR").map(String::as_str), Some("/opt/servers/data"));

        unsafe {
            std::env::remove_var("SWITCHBOARD_TEST_ROOT");
        }
    }

    #[test]
    fn empty_document_yields_no_servers() {
        let config = EngineConfig::from_json("{}").expect("parses");
        assert!(config.servers.is_empty());
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("servers.json");
        fs::write(
            &path,
            r#"{ "mcpServers": { "s": { "type": "sse", "url": "http://h/sse" } } }"#,
        )
        .expect("write config");

        let config = EngineConfig::from_path(&path).expect("load");
        assert_eq!(config.servers.len(), 1);
    }
}
