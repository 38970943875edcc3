//! Channel-backed response stream.
//!
//! The conversation loop pushes text chunks into a bounded channel; the
//! caller consumes them as a lazy, finite, non-restartable stream. Dropping
//! the consumer closes the channel, which cancels the producer at its next
//! send.

use super::engine::EngineError;
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub type Chunk = Result<String, EngineError>;

pub(crate) fn channel(capacity: usize) -> (ChunkSender, ResponseStream) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ChunkSender { tx },
        ResponseStream {
            inner: ReceiverStream::new(rx),
        },
    )
}

/// Producer half, held by the conversation loop.
#[derive(Clone)]
pub(crate) struct ChunkSender {
    tx: mpsc::Sender<Chunk>,
}

impl ChunkSender {
    /// Push one text chunk. Returns false when the consumer has gone away,
    /// which the loop treats as cancellation.
    pub(crate) async fn text(&self, chunk: impl Into<String>) -> bool {
        self.tx.send(Ok(chunk.into())).await.is_ok()
    }

    /// Terminate the stream with an error. Chunks already sent stay
    /// deliverable; the error is the last item the consumer observes.
    pub(crate) async fn fail(&self, err: EngineError) {
        let _ = self.tx.send(Err(err)).await;
    }
}

/// The live text-chunk sequence returned at the request boundary.
#[derive(Debug)]
pub struct ResponseStream {
    inner: ReceiverStream<Chunk>,
}

impl Stream for ResponseStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
