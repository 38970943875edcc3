//! Tool-call execution with per-call failure isolation.
//!
//! Whatever goes wrong inside one call (undecodable arguments, unknown name,
//! transport failure, deadline) is folded into an error payload on the
//! transcript so the model can react; the conversation loop never sees an
//! `Err` from here.

use super::catalog::ToolCatalog;
use super::error::{ToolCallError, ToolInvokeError};
use super::interface::ToolServerConnection;
use crate::application::stream::ChunkSender;
use crate::domain::types::ToolCallRequest;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The always-successful shape a tool call resolves to.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub tool: String,
    pub call_id: String,
    pub payload: Value,
    pub is_error: bool,
}

pub struct ToolInvoker {
    catalog: Arc<ToolCatalog>,
    connections: HashMap<String, Arc<dyn ToolServerConnection>>,
    call_timeout: Duration,
}

impl ToolInvoker {
    pub fn new(
        catalog: Arc<ToolCatalog>,
        connections: HashMap<String, Arc<dyn ToolServerConnection>>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            connections,
            call_timeout,
        }
    }

    /// Execute one model-issued call and annotate the live stream with the
    /// rendered result.
    pub(crate) async fn execute(&self, call: &ToolCallRequest, sink: &ChunkSender) -> ToolOutcome {
        let outcome = match self.dispatch(call).await {
            Ok(payload) => {
                let is_error = payload
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                ToolOutcome {
                    tool: call.name.clone(),
                    call_id: call.id.clone(),
                    payload,
                    is_error,
                }
            }
            Err(err) => {
                warn!(tool = %call.name, %err, "tool call folded into error payload");
                ToolOutcome {
                    tool: call.name.clone(),
                    call_id: call.id.clone(),
                    payload: json!({ "error": err.to_string() }),
                    is_error: true,
                }
            }
        };

        info!(tool = %outcome.tool, success = !outcome.is_error, "tool executed");
        sink.text(render_result_annotation(&outcome)).await;
        outcome
    }

    async fn dispatch(&self, call: &ToolCallRequest) -> Result<Value, ToolCallError> {
        let arguments = decode_arguments(&call.arguments)?;

        let descriptor = self
            .catalog
            .get(&call.name)
            .ok_or_else(|| ToolCallError::UnknownTool(call.name.clone()))?;

        let connection = self.connections.get(&descriptor.server).ok_or_else(|| {
            ToolCallError::Execution {
                tool: call.name.clone(),
                source: ToolInvokeError::Terminated {
                    server: descriptor.server.clone(),
                },
            }
        })?;

        debug!(tool = %call.name, server = %descriptor.server, "dispatching tool call");
        match tokio::time::timeout(self.call_timeout, connection.call_tool(&call.name, arguments))
            .await
        {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(source)) => Err(ToolCallError::Execution {
                tool: call.name.clone(),
                source,
            }),
            Err(_) => Err(ToolCallError::Execution {
                tool: call.name.clone(),
                source: ToolInvokeError::Timeout {
                    server: descriptor.server.clone(),
                },
            }),
        }
    }
}

/// Textual arguments are parsed as JSON after trimming; structured objects
/// pass through; every other shape is a decode failure.
pub(crate) fn decode_arguments(arguments: &Value) -> Result<Value, ToolCallError> {
    match arguments {
        Value::String(raw) => serde_json::from_str(raw.trim())
            .map_err(|err| ToolCallError::ArgumentDecode(err.to_string())),
        Value::Object(_) => Ok(arguments.clone()),
        other => Err(ToolCallError::ArgumentDecode(format!(
            "expected a JSON object or encoded string, got {other}"
        ))),
    }
}

fn render_result_annotation(outcome: &ToolOutcome) -> String {
    let rendered = serde_json::to_string_pretty(&outcome.payload)
        .unwrap_or_else(|_| outcome.payload.to_string());
    let kind = if outcome.is_error { "error" } else { "result" };
    format!("\n\n[tool {kind}: {}]\n{rendered}\n", outcome.tool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::stream;
    use async_trait::async_trait;
    use futures::StreamExt;
    use tokio::sync::Mutex;

    struct RecordingConnection {
        name: String,
        calls: Mutex<Vec<(String, Value)>>,
        response: Result<Value, ()>,
        delay: Option<Duration>,
    }

    impl RecordingConnection {
        fn succeeding(name: &str, response: Value) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                calls: Mutex::new(Vec::new()),
                response: Ok(response),
                delay: None,
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                calls: Mutex::new(Vec::new()),
                response: Err(()),
                delay: None,
            })
        }

        fn stalling(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                calls: Mutex::new(Vec::new()),
                response: Ok(Value::Null),
                delay: Some(delay),
            })
        }
    }

    #[async_trait]
    impl ToolServerConnection for RecordingConnection {
        fn server_name(&self) -> &str {
            &self.name
        }

        async fn list_tools(&self) -> Result<Value, ToolInvokeError> {
            Ok(json!([{ "name": "lookup" }]))
        }

        async fn call_tool(&self, tool: &str, arguments: Value) -> Result<Value, ToolInvokeError> {
            self.calls.lock().await.push((tool.to_string(), arguments));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.response {
                Ok(value) => Ok(value.clone()),
                Err(()) => Err(ToolInvokeError::Transport {
                    server: self.name.clone(),
                    message: "pipe broke".into(),
                }),
            }
        }

        async fn shutdown(&self) {}
    }

    async fn invoker_for(
        connection: Arc<RecordingConnection>,
    ) -> (ToolInvoker, Arc<RecordingConnection>) {
        let as_trait: Arc<dyn ToolServerConnection> = connection.clone();
        let catalog = ToolCatalog::query_all(std::slice::from_ref(&as_trait), Duration::from_secs(5))
            .await
            .expect("catalog builds");
        let connections = HashMap::from([(connection.name.clone(), as_trait)]);
        (
            ToolInvoker::new(Arc::new(catalog), connections, Duration::from_secs(5)),
            connection,
        )
    }

    fn call(name: &str, arguments: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: "call_1".into(),
            name: name.into(),
            arguments,
        }
    }

    #[test]
    fn decodes_json_encoded_string_arguments() {
        let decoded = decode_arguments(&json!("  {\"a\":1} ")).expect("decodes");
        assert_eq!(decoded, json!({ "a": 1 }));
    }

    #[test]
    fn structured_arguments_pass_through() {
        let structured = json!({ "a": 1 });
        assert_eq!(decode_arguments(&structured).expect("passes"), structured);
    }

    #[test]
    fn other_argument_kinds_fail_to_decode() {
        for bad in [json!(42), json!(true), json!([1, 2]), Value::Null] {
            assert!(matches!(
                decode_arguments(&bad),
                Err(ToolCallError::ArgumentDecode(_))
            ));
        }
    }

    #[tokio::test]
    async fn executes_known_tool_with_decoded_arguments() {
        let (invoker, connection) =
            invoker_for(RecordingConnection::succeeding("srv", json!({ "ok": true }))).await;
        let (sink, mut output) = stream::channel(8);

        let outcome = invoker
            .execute(&call("lookup", json!("{\"q\": \"rust\"}")), &sink)
            .await;
        drop(sink);

        assert!(!outcome.is_error);
        assert_eq!(outcome.payload, json!({ "ok": true }));

        let calls = connection.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "lookup");
        assert_eq!(calls[0].1, json!({ "q": "rust" }));

        let annotation = output.next().await.expect("annotation").expect("is text");
        assert!(annotation.contains("[tool result: lookup]"));
    }

    #[tokio::test]
    async fn unknown_tool_skips_the_server_and_folds() {
        let (invoker, connection) =
            invoker_for(RecordingConnection::succeeding("srv", json!({}))).await;
        let (sink, mut output) = stream::channel(8);

        let outcome = invoker.execute(&call("missing", json!({})), &sink).await;
        drop(sink);

        assert!(outcome.is_error);
        assert!(
            outcome.payload["error"]
                .as_str()
                .expect("error text")
                .contains("missing")
        );
        assert!(connection.calls.lock().await.is_empty(), "no server call");

        let annotation = output.next().await.expect("annotation").expect("is text");
        assert!(annotation.contains("[tool error: missing]"));
    }

    #[tokio::test]
    async fn transport_failure_folds_into_error_payload() {
        let (invoker, _) = invoker_for(RecordingConnection::failing("srv")).await;
        let (sink, _output) = stream::channel(8);

        let outcome = invoker.execute(&call("lookup", json!({})), &sink).await;
        assert!(outcome.is_error);
        assert!(
            outcome.payload["error"]
                .as_str()
                .expect("error text")
                .contains("pipe broke")
        );
    }

    #[tokio::test]
    async fn undecodable_arguments_fold_without_a_server_call() {
        let (invoker, connection) =
            invoker_for(RecordingConnection::succeeding("srv", json!({}))).await;
        let (sink, _output) = stream::channel(8);

        let outcome = invoker.execute(&call("lookup", json!(7)), &sink).await;
        assert!(outcome.is_error);
        assert!(connection.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn slow_call_times_out_and_folds() {
        let connection = RecordingConnection::stalling("srv", Duration::from_secs(30));
        let as_trait: Arc<dyn ToolServerConnection> = connection.clone();
        let catalog = ToolCatalog::query_all(std::slice::from_ref(&as_trait), Duration::from_secs(5))
            .await
            .expect("catalog builds");
        let invoker = ToolInvoker::new(
            Arc::new(catalog),
            HashMap::from([("srv".to_string(), as_trait)]),
            Duration::from_millis(20),
        );
        let (sink, _output) = stream::channel(8);

        let outcome = invoker.execute(&call("lookup", json!({})), &sink).await;
        assert!(outcome.is_error);
        assert!(
            outcome.payload["error"]
                .as_str()
                .expect("error text")
                .contains("timed out")
        );
    }

    #[tokio::test]
    async fn server_flagged_error_payload_is_surfaced() {
        let (invoker, _) = invoker_for(RecordingConnection::succeeding(
            "srv",
            json!({ "isError": true, "content": [] }),
        ))
        .await;
        let (sink, _output) = stream::channel(8);

        let outcome = invoker.execute(&call("lookup", json!({})), &sink).await;
        assert!(outcome.is_error);
    }
}
