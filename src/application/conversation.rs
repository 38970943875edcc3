//! The conversation loop: model turn, tool execution, repeat.
//!
//! One invocation owns its conversation outright; the caller's messages are
//! copied in at the start and nothing survives the request. Text deltas are
//! forwarded to the output stream as they arrive; tool calls announced by a
//! turn are executed sequentially in the order the backend emitted them, and
//! every result lands on the transcript before the next model call.

use super::stream::ChunkSender;
use super::tooling::ToolInvoker;
use crate::domain::types::{ChatMessage, ChatSettings, MessageRole, ToolCallRequest};
use crate::infrastructure::model::{ModelBackend, ModelRequest};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

pub(crate) struct ConversationLoop {
    backend: Arc<dyn ModelBackend>,
    invoker: ToolInvoker,
    tools: Vec<Value>,
    max_iterations: u32,
}

impl ConversationLoop {
    pub(crate) fn new(
        backend: Arc<dyn ModelBackend>,
        invoker: ToolInvoker,
        tools: Vec<Value>,
        max_iterations: u32,
    ) -> Self {
        Self {
            backend,
            invoker,
            tools,
            max_iterations,
        }
    }

    pub(crate) async fn run(
        self,
        settings: ChatSettings,
        mut conversation: Vec<ChatMessage>,
        sink: ChunkSender,
    ) {
        let mut iterations = 0u32;
        loop {
            iterations += 1;
            if iterations > self.max_iterations {
                // Reaching the bound ends the stream cleanly, not as an error.
                debug!(max = self.max_iterations, "iteration bound reached, ending stream");
                return;
            }

            let request = ModelRequest {
                model: settings.model.clone(),
                messages: conversation.clone(),
                tools: self.tools.clone(),
                temperature: settings.temperature,
                max_tokens: settings.max_tokens,
            };

            let mut chunks = match self.backend.stream(request).await {
                Ok(receiver) => receiver,
                Err(err) => {
                    error!(backend = self.backend.name(), %err, "model call failed");
                    sink.fail(err.into()).await;
                    return;
                }
            };

            let mut content = String::new();
            let mut calls: Vec<ToolCallRequest> = Vec::new();
            while let Some(item) = chunks.recv().await {
                match item {
                    Ok(chunk) => {
                        if let Some(text) = chunk.content {
                            if !sink.text(text.clone()).await {
                                debug!("consumer went away, cancelling loop");
                                return;
                            }
                            content.push_str(&text);
                        }
                        calls.extend(chunk.tool_calls);
                        if chunk.done {
                            break;
                        }
                    }
                    Err(err) => {
                        error!(backend = self.backend.name(), %err, "model stream aborted");
                        sink.fail(err.into()).await;
                        return;
                    }
                }
            }

            if calls.is_empty() {
                conversation.push(ChatMessage::new(MessageRole::Assistant, content));
                debug!(iterations, "conversation finished");
                return;
            }

            // Surface the raw call structures on the stream and keep them on
            // the assistant message so the transcript stays self-describing.
            let annotation = render_tool_call_block(&calls);
            if !sink.text(annotation.clone()).await {
                return;
            }
            content.push_str(&annotation);
            conversation.push(ChatMessage::assistant_with_calls(content, calls.clone()));

            for call in &calls {
                let outcome = self.invoker.execute(call, &sink).await;
                let serialized = serde_json::to_string(&outcome.payload)
                    .unwrap_or_else(|_| outcome.payload.to_string());
                conversation.push(ChatMessage::tool_result(outcome.call_id.clone(), serialized));
            }
        }
    }
}

fn render_tool_call_block(calls: &[ToolCallRequest]) -> String {
    let rendered = serde_json::to_string_pretty(calls).unwrap_or_else(|_| "[]".into());
    format!("\n\n[tool calls]\n{rendered}\n")
}
