//! Per-request streaming delivery of engine outputs.
//!
//! The engine routes each tick's outputs to subscribed requests over
//! unbounded channels; a subscriber's stream ends when its request
//! finishes or is aborted.

use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::output::EngineOutput;
use super::types::RequestId;

/// Routes outputs produced by `step` to per-request subscribers.
#[derive(Default)]
pub struct OutputRouter {
    senders: HashMap<RequestId, mpsc::UnboundedSender<EngineOutput>>,
}

impl OutputRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a stream of outputs for one request id.
    pub fn subscribe(&mut self, request_id: impl Into<RequestId>) -> OutputStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(request_id.into(), tx);
        OutputStream {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// Deliver one output to its subscriber, if any. Closes the channel
    /// when the request is finished.
    pub fn route(&mut self, output: &EngineOutput) {
        let request_id = output.request_id();
        let Some(sender) = self.senders.get(request_id) else {
            return;
        };
        // A dropped receiver just means the caller lost interest.
        let _ = sender.send(output.clone());
        if output.is_finished() {
            self.senders.remove(request_id);
        }
    }

    /// End a subscriber's stream without a final output (abort path).
    pub fn close(&mut self, request_id: &str) {
        self.senders.remove(request_id);
    }
}

/// Stream of [`EngineOutput`]s for a single request.
pub struct OutputStream {
    inner: UnboundedReceiverStream<EngineOutput>,
}

impl Stream for OutputStream {
    type Item = EngineOutput;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
