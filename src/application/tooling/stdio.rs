//! Subprocess-pipe transport: spawns the configured command and speaks
//! JSON-RPC over its stdin/stdout, one message per line.

use super::error::{ConnectionError, ToolInvokeError};
use super::interface::ToolServerConnection;
use crate::config::{ServerDescriptor, TransportConfig};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";

pub struct StdioConnection {
    inner: Arc<Inner>,
}

struct Inner {
    server: String,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    child: AsyncMutex<Option<Child>>,
    pending: AsyncMutex<HashMap<u64, oneshot::Sender<Result<Value, ToolInvokeError>>>>,
    id_counter: AtomicU64,
}

impl StdioConnection {
    /// Spawn the server process and run the MCP initialize handshake. The
    /// whole sequence is bounded by `deadline`.
    pub async fn connect(
        descriptor: &ServerDescriptor,
        deadline: Duration,
    ) -> Result<Self, ConnectionError> {
        let TransportConfig::Stdio { command, args, env } = &descriptor.transport else {
            return Err(ConnectionError::Handshake {
                server: descriptor.name.clone(),
                message: "descriptor is not a stdio transport".into(),
            });
        };

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ConnectionError::Spawn {
            server: descriptor.name.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| ConnectionError::Handshake {
            server: descriptor.name.clone(),
            message: "failed to capture server stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ConnectionError::Handshake {
            server: descriptor.name.clone(),
            message: "failed to capture server stdout".into(),
        })?;

        let connection = Self {
            inner: Arc::new(Inner {
                server: descriptor.name.clone(),
                writer: AsyncMutex::new(Some(BufWriter::new(stdin))),
                child: AsyncMutex::new(Some(child)),
                pending: AsyncMutex::new(HashMap::new()),
                id_counter: AtomicU64::new(1),
            }),
        };

        let reader = Arc::clone(&connection.inner);
        tokio::spawn(async move {
            reader.reader_loop(stdout).await;
        });

        match tokio::time::timeout(deadline, connection.inner.handshake()).await {
            Ok(Ok(())) => Ok(connection),
            Ok(Err(err)) => {
                connection.inner.close().await;
                Err(ConnectionError::Handshake {
                    server: descriptor.name.clone(),
                    message: err.to_string(),
                })
            }
            Err(_) => {
                connection.inner.close().await;
                Err(ConnectionError::Timeout {
                    server: descriptor.name.clone(),
                })
            }
        }
    }
}

#[async_trait]
impl ToolServerConnection for StdioConnection {
    fn server_name(&self) -> &str {
        &self.inner.server
    }

    async fn list_tools(&self) -> Result<Value, ToolInvokeError> {
        self.inner.send_request("tools/list", json!({})).await
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolInvokeError> {
        let params = json!({
            "name": tool,
            "arguments": match arguments {
                Value::Null => Value::Object(Default::default()),
                other => other,
            }
        });
        self.inner.send_request("tools/call", params).await
    }

    async fn shutdown(&self) {
        self.inner.close().await;
    }
}

impl Inner {
    async fn handshake(&self) -> Result<(), ToolInvokeError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": {}
        });
        self.send_request("initialize", params).await?;
        self.send_notification("notifications/initialized", json!({}))
            .await
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(raw)) = lines.next_line().await {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(message) => self.route_inbound(message).await,
                Err(source) => {
                    warn!(
                        server = %self.server,
                        line = trimmed,
                        %source,
                        "received invalid JSON from MCP server"
                    );
                }
            }
        }
        self.close().await;
    }

    async fn route_inbound(&self, message: Value) {
        let id = message.get("id").cloned();
        let is_request = message.get("method").is_some();

        match (id, is_request) {
            (Some(id), true) => self.answer_server_request(id, &message).await,
            (Some(id), false) => self.resolve_pending(&id, message).await,
            (None, true) => {
                let method = message.get("method").and_then(Value::as_str).unwrap_or("");
                debug!(server = %self.server, method, "notification from MCP server");
            }
            (None, false) => {}
        }
    }

    /// Servers may ping mid-session; anything else gets a method-not-found.
    async fn answer_server_request(&self, id: Value, message: &Value) {
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let reply = if method == "ping" {
            json!({ "jsonrpc": "2.0", "id": id, "result": {} })
        } else {
            warn!(server = %self.server, method, "server sent unsupported request");
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": -32601,
                    "message": format!("client does not implement method '{method}'"),
                }
            })
        };
        if let Err(err) = self.write_message(&reply).await {
            warn!(server = %self.server, %err, "failed to answer server request");
        }
    }

    async fn resolve_pending(&self, id: &Value, message: Value) {
        let Some(key) = id.as_u64() else {
            debug!(server = %self.server, "response with non-numeric id ignored");
            return;
        };
        let responder = self.pending.lock().await.remove(&key);
        let Some(sender) = responder else {
            debug!(server = %self.server, response_id = key, "response for unknown request");
            return;
        };

        let outcome = if let Some(error) = message.get("error") {
            Err(ToolInvokeError::Rpc {
                server: self.server.clone(),
                code: error.get("code").and_then(Value::as_i64).unwrap_or(-32000),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            })
        } else {
            Ok(message.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = sender.send(outcome);
    }

    async fn send_request(&self, method: &str, params: Value) -> Result<Value, ToolInvokeError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        });
        if let Err(err) = self.write_message(&payload).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ToolInvokeError::Terminated {
                server: self.server.clone(),
            }),
        }
    }

    async fn send_notification(&self, method: &str, params: Value) -> Result<(), ToolInvokeError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });
        self.write_message(&payload).await
    }

    async fn write_message(&self, message: &Value) -> Result<(), ToolInvokeError> {
        let encoded = serde_json::to_string(message).map_err(|source| {
            ToolInvokeError::InvalidJson {
                server: self.server.clone(),
                source,
            }
        })?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| ToolInvokeError::Terminated {
            server: self.server.clone(),
        })?;

        for step in [encoded.as_bytes(), b"\n".as_slice()] {
            writer
                .write_all(step)
                .await
                .map_err(|source| ToolInvokeError::Transport {
                    server: self.server.clone(),
                    message: source.to_string(),
                })?;
        }
        writer
            .flush()
            .await
            .map_err(|source| ToolInvokeError::Transport {
                server: self.server.clone(),
                message: source.to_string(),
            })
    }

    async fn close(&self) {
        self.writer.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.kill().await {
                debug!(
                    server = %self.server,
                    %err,
                    "failed to kill MCP server process (may have already exited)"
                );
            }
            let _ = child.wait().await;
        }

        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(ToolInvokeError::Terminated {
                server: self.server.clone(),
            }));
        }
    }
}
