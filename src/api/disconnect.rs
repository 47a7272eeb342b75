use crate::core::metrics::get_metrics;
use crate::core::{StreamCancelHandle, StreamOutcome};
use axum::body::Bytes;
use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Response body wrapper that signals the cancel handle when hyper drops it.
///
/// hyper drops the body when the client goes away, so a drop before the
/// coordinator marked the stream complete is a client disconnect.
pub struct DisconnectStream<S> {
    pub stream: S,
    pub cancel_handle: StreamCancelHandle,
}

impl<S, E> Stream for DisconnectStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl<S> Drop for DisconnectStream<S> {
    fn drop(&mut self) {
        if self.cancel_handle.cancel() {
            tracing::info!("Client disconnected, abandoning backend stream");
            get_metrics()
                .stream_outcomes
                .with_label_values(&[StreamOutcome::ClientDisconnect.as_str()])
                .inc();
        }
    }
}
