//! OpenAI-compatible chat-completions client, the production `ModelBackend`.
//!
//! Streaming uses the SSE wire format: `data:` framed JSON deltas terminated
//! by `[DONE]`. Tool-call arguments arrive as string fragments keyed by
//! index and are reassembled before the final chunk is emitted.

use super::traits::ModelBackend;
use super::{ModelChunk, ModelError, ModelRequest, ModelResponse};
use crate::domain::types::{ChatMessage, MessageRole, ToolCallRequest};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct OpenAiCompatBackend {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatBackend {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn request_body(&self, request: &ModelRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": to_api_messages(&request.messages),
            "stream": stream,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response, ModelError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| ModelError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(backend = %self.name, status = status.as_u16(), "model backend error");
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        debug!(backend = %self.name, model = %request.model, "sending completion request");
        let response = self.post(&self.request_body(&request, false)).await?;
        let payload: ApiResponse = response
            .json()
            .await
            .map_err(|err| ModelError::InvalidResponse(err.to_string()))?;

        let choice = payload
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::InvalidResponse("response carried no choices".into()))?;

        let calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(ApiToolCall::into_request)
            .collect();

        Ok(ModelResponse {
            message: ChatMessage {
                role: MessageRole::Assistant,
                content: choice.message.content.unwrap_or_default(),
                tool_calls: calls,
                tool_call_id: None,
            },
        })
    }

    async fn stream(
        &self,
        request: ModelRequest,
    ) -> Result<mpsc::Receiver<Result<ModelChunk, ModelError>>, ModelError> {
        debug!(backend = %self.name, model = %request.model, "sending streaming request");
        let response = self.post(&self.request_body(&request, true)).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = String::new();
            let mut assembler = ToolCallAssembler::default();

            while let Some(piece) = bytes.next().await {
                let piece = match piece {
                    Ok(piece) => piece,
                    Err(err) => {
                        let _ = tx
                            .send(Err(ModelError::StreamInterrupted(err.to_string())))
                            .await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&piece));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer.drain(..=line_end);

                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        let _ = tx
                            .send(Ok(ModelChunk {
                                content: None,
                                tool_calls: assembler.finish(),
                                done: true,
                            }))
                            .await;
                        return;
                    }

                    let payload: StreamPayload = match serde_json::from_str(data) {
                        Ok(payload) => payload,
                        Err(err) => {
                            let _ = tx
                                .send(Err(ModelError::InvalidResponse(err.to_string())))
                                .await;
                            return;
                        }
                    };

                    let Some(choice) = payload.choices.into_iter().next() else {
                        continue;
                    };
                    for delta in choice.delta.tool_calls.unwrap_or_default() {
                        assembler.absorb(delta);
                    }
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty()
                            && tx
                                .send(Ok(ModelChunk {
                                    content: Some(content),
                                    tool_calls: Vec::new(),
                                    done: false,
                                }))
                                .await
                                .is_err()
                        {
                            return;
                        }
                    }
                }
            }

            // Stream ended without [DONE]; flush what we have.
            let _ = tx
                .send(Ok(ModelChunk {
                    content: None,
                    tool_calls: assembler.finish(),
                    done: true,
                }))
                .await;
        });

        Ok(rx)
    }
}

fn to_api_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            let mut entry = json!({
                "role": message.role.as_str(),
                "content": message.content,
            });
            if !message.tool_calls.is_empty() {
                entry["tool_calls"] = json!(
                    message
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "id": call.id,
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": arguments_as_string(&call.arguments),
                                }
                            })
                        })
                        .collect::<Vec<_>>()
                );
            }
            if let Some(call_id) = &message.tool_call_id {
                entry["tool_call_id"] = json!(call_id);
            }
            entry
        })
        .collect()
}

fn arguments_as_string(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

/// Reassembles index-keyed tool-call deltas into complete requests.
#[derive(Debug, Default)]
struct ToolCallAssembler {
    parts: BTreeMap<u32, PartialCall>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl ToolCallAssembler {
    fn absorb(&mut self, delta: DeltaToolCall) {
        let part = self.parts.entry(delta.index).or_default();
        if let Some(id) = delta.id {
            part.id = Some(id);
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                part.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                part.arguments.push_str(&arguments);
            }
        }
    }

    fn finish(&mut self) -> Vec<ToolCallRequest> {
        std::mem::take(&mut self.parts)
            .into_values()
            .filter(|part| !part.name.is_empty())
            .map(|part| ToolCallRequest {
                id: part.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                name: part.name,
                arguments: Value::String(part.arguments),
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ApiToolCall {
    id: Option<String>,
    function: ApiFunction,
}

#[derive(Debug, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

impl ApiToolCall {
    fn into_request(self) -> ToolCallRequest {
        ToolCallRequest {
            id: self.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: self.function.name,
            arguments: Value::String(self.function.arguments),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<DeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct DeltaToolCall {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<DeltaFunction>,
}

#[derive(Debug, Deserialize)]
struct DeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}
