use super::{ModelChunk, ModelError, ModelRequest, ModelResponse};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// The inference-service boundary.
///
/// The conversation loop only ever talks to this trait; backends that cannot
/// stream fall back to the one-chunk default.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;

    async fn stream(
        &self,
        request: ModelRequest,
    ) -> Result<mpsc::Receiver<Result<ModelChunk, ModelError>>, ModelError> {
        let response = self.complete(request).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx
            .send(Ok(ModelChunk {
                content: Some(response.message.content),
                tool_calls: response.message.tool_calls,
                done: true,
            }))
            .await;
        Ok(rx)
    }
}
