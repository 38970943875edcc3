//! Event-stream transport: JSON-RPC requests are POSTed to the endpoint the
//! server announces, responses arrive over a long-lived SSE channel.

use super::error::{ConnectionError, ToolInvokeError};
use super::interface::ToolServerConnection;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use reqwest_eventsource::{Event, EventSource};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, warn};

const PROTOCOL_VERSION: &str = "2025-06-18";

pub struct SseConnection {
    inner: Arc<Inner>,
}

struct Inner {
    server: String,
    http: reqwest::Client,
    endpoint: AsyncMutex<Option<Url>>,
    pending: AsyncMutex<HashMap<u64, oneshot::Sender<Result<Value, ToolInvokeError>>>>,
    id_counter: AtomicU64,
    stop: AsyncMutex<Option<oneshot::Sender<()>>>,
}

impl SseConnection {
    /// Open the SSE channel, wait for the server to announce its message
    /// endpoint, then run the MCP initialize handshake. Bounded by `deadline`.
    pub async fn connect(
        server: &str,
        url: &str,
        deadline: Duration,
    ) -> Result<Self, ConnectionError> {
        let base = Url::parse(url).map_err(|err| ConnectionError::Endpoint {
            server: server.to_string(),
            message: err.to_string(),
        })?;

        let source = EventSource::get(base.clone());
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let connection = Self {
            inner: Arc::new(Inner {
                server: server.to_string(),
                http: reqwest::Client::new(),
                endpoint: AsyncMutex::new(None),
                pending: AsyncMutex::new(HashMap::new()),
                id_counter: AtomicU64::new(1),
                stop: AsyncMutex::new(Some(stop_tx)),
            }),
        };

        let reader = Arc::clone(&connection.inner);
        tokio::spawn(async move {
            reader.reader_loop(source, base, endpoint_tx, stop_rx).await;
        });

        let setup = async {
            let endpoint = endpoint_rx
                .await
                .map_err(|_| ConnectionError::Handshake {
                    server: server.to_string(),
                    message: "event stream closed before announcing an endpoint".into(),
                })??;
            *connection.inner.endpoint.lock().await = Some(endpoint);
            connection
                .inner
                .handshake()
                .await
                .map_err(|err| ConnectionError::Handshake {
                    server: server.to_string(),
                    message: err.to_string(),
                })
        };

        match tokio::time::timeout(deadline, setup).await {
            Ok(Ok(())) => Ok(connection),
            Ok(Err(err)) => {
                connection.inner.close().await;
                Err(err)
            }
            Err(_) => {
                connection.inner.close().await;
                Err(ConnectionError::Timeout {
                    server: server.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl ToolServerConnection for SseConnection {
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
        self.post(&json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
            "params": {}
        }))
        .await
    }

    async fn reader_loop(
        self: Arc<Self>,
        mut source: EventSource,
        base: Url,
        endpoint_tx: oneshot::Sender<Result<Url, ConnectionError>>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let mut endpoint_tx = Some(endpoint_tx);
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    source.close();
                    break;
                }
                event = source.next() => match event {
                    Some(Ok(Event::Open)) => {
                        debug!(server = %self.server, "event stream opened");
                    }
                    Some(Ok(Event::Message(message))) if message.event == "endpoint" => {
                        if let Some(tx) = endpoint_tx.take() {
                            let resolved = base.join(message.data.trim()).map_err(|err| {
                                ConnectionError::Endpoint {
                                    server: self.server.clone(),
                                    message: err.to_string(),
                                }
                            });
                            let _ = tx.send(resolved);
                        }
                    }
                    Some(Ok(Event::Message(message))) => {
                        match serde_json::from_str::<Value>(&message.data) {
                            Ok(value) => self.route_inbound(value).await,
                            Err(source) => warn!(
                                server = %self.server,
                                data = %message.data,
                                %source,
                                "received invalid JSON over event stream"
                            ),
                        }
                    }
                    Some(Err(err)) => {
                        warn!(server = %self.server, %err, "event stream failed");
                        source.close();
                        break;
                    }
                    None => break,
                }
            }
        }
        self.fail_pending().await;
    }

    async fn route_inbound(&self, message: Value) {
        if message.get("method").is_some() {
            let method = message.get("method").and_then(Value::as_str).unwrap_or("");
            debug!(server = %self.server, method, "ignoring server-initiated message");
            return;
        }
        let Some(key) = message.get("id").and_then(Value::as_u64) else {
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
        if let Err(err) = self.post(&payload).await {
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

    async fn post(&self, payload: &Value) -> Result<(), ToolInvokeError> {
        let endpoint = {
            let guard = self.endpoint.lock().await;
            guard.clone().ok_or_else(|| ToolInvokeError::Terminated {
                server: self.server.clone(),
            })?
        };

        let response = self
            .http
            .post(endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|source| ToolInvokeError::Transport {
                server: self.server.clone(),
                message: source.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ToolInvokeError::Transport {
                server: self.server.clone(),
                message: format!("endpoint returned HTTP {}", response.status()),
            });
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(stop) = self.stop.lock().await.take() {
            let _ = stop.send(());
        }
        self.endpoint.lock().await.take();
        self.fail_pending().await;
    }

    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(ToolInvokeError::Terminated {
                server: self.server.clone(),
            }));
        }
    }
}
