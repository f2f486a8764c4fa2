// Capturing body - forwards frames untouched while keeping a bounded copy
// The copy is handed to the exchange recorder once the stream ends, fails or is dropped

use bytes::{Bytes, BytesMut};
use hyper::body::{Body, Frame, SizeHint};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

/// Bytes kept from a body stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Captured {
    pub bytes: Bytes,
    /// Every data byte that passed through, including the part beyond the cap
    pub wire_length: u64,
    pub truncated: bool,
}

/// How a captured stream ended
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    /// Stream reached its end
    Complete(Captured),
    /// Stream yielded an error
    Failed { captured: Captured, error: String },
    /// Body was dropped before reaching its end
    Aborted(Captured),
}

/// Receives the outcome of a [`CaptureBody`]
pub struct CaptureHandle(oneshot::Receiver<CaptureOutcome>);

impl CaptureHandle {
    pub async fn outcome(self) -> CaptureOutcome {
        self.0
            .await
            .unwrap_or_else(|_| CaptureOutcome::Aborted(Captured::default()))
    }
}

/// Body wrapper that tees data frames into a bounded buffer
pub struct CaptureBody<B: Body> {
    inner: B,
    buffer: BytesMut,
    wire_length: u64,
    limit: usize,
    truncated: bool,
    tx: Option<oneshot::Sender<CaptureOutcome>>,
}

impl<B: Body> CaptureBody<B> {
    /// Wrap `inner`, keeping at most `limit` bytes
    pub fn new(inner: B, limit: usize) -> (Self, CaptureHandle) {
        let (tx, rx) = oneshot::channel();
        let body = Self {
            inner,
            buffer: BytesMut::new(),
            wire_length: 0,
            limit,
            truncated: false,
            tx: Some(tx),
        };
        (body, CaptureHandle(rx))
    }

    fn record(&mut self, data: &[u8]) {
        self.wire_length += data.len() as u64;

        let room = self.limit.saturating_sub(self.buffer.len());
        if data.len() > room {
            self.truncated = true;
        }
        self.buffer.extend_from_slice(&data[..data.len().min(room)]);
    }

    fn finish(&mut self, outcome: impl FnOnce(Captured) -> CaptureOutcome) {
        if let Some(tx) = self.tx.take() {
            let captured = Captured {
                bytes: std::mem::take(&mut self.buffer).freeze(),
                wire_length: self.wire_length,
                truncated: self.truncated,
            };
            if captured.truncated {
                debug!(
                    wire_length = captured.wire_length,
                    limit = self.limit,
                    "Captured body truncated"
                );
            }
            let _ = tx.send(outcome(captured));
        }
    }
}

impl<B> Body for CaptureBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: fmt::Display,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.record(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                let error = e.to_string();
                this.finish(|captured| CaptureOutcome::Failed { captured, error });
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(CaptureOutcome::Complete);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B: Body> Drop for CaptureBody<B> {
    fn drop(&mut self) {
        // Hyper may stop polling once the inner body reports its end
        if self.inner.is_end_stream() {
            self.finish(CaptureOutcome::Complete);
        } else {
            self.finish(CaptureOutcome::Aborted);
        }
    }
}
