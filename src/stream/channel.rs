//! Bounded per-request output channel
//!
//! The scheduler side never blocks: [`ContinuationSender::push`] reports
//! overflow and disconnects instead of waiting. One buffer slot is always
//! held back so the terminal event can be delivered even when the consumer
//! has stopped reading.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;

use super::cancel::{CancelFlag, CancelHandle};
use crate::request::{RequestId, Termination};

/// One item of a request's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Token(u32),
    /// Always the last event
    Finished(Termination),
}

/// Result of pushing one token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    /// Consumer dropped its stream
    Disconnected,
    /// Consumer is a full buffer behind
    Overflow,
}

/// Scheduler-side writer for one request
#[derive(Debug)]
pub struct ContinuationSender {
    tx: mpsc::Sender<StreamEvent>,
    delivered: usize,
    finished: bool,
}

impl ContinuationSender {
    pub fn push(&mut self, token: u32) -> PushOutcome {
        if self.finished || self.tx.is_closed() {
            return PushOutcome::Disconnected;
        }
        if self.tx.capacity() <= 1 {
            return PushOutcome::Overflow;
        }
        match self.tx.try_send(StreamEvent::Token(token)) {
            Ok(()) => {
                self.delivered += 1;
                PushOutcome::Delivered
            }
            Err(TrySendError::Full(_)) => PushOutcome::Overflow,
            Err(TrySendError::Closed(_)) => PushOutcome::Disconnected,
        }
    }

    /// Deliver the terminal event. Returns `false` if the consumer is gone.
    /// Later calls are no-ops.
    pub fn finish(&mut self, termination: Termination) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        self.tx.try_send(StreamEvent::Finished(termination)).is_ok()
    }

    /// Tokens accepted into the buffer so far
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    pub fn is_disconnected(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Everything a request produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutput {
    pub tokens: Vec<u32>,
    /// `None` if the stream ended without a terminal event
    pub termination: Option<Termination>,
}

/// Consumer side of a request's output
///
/// Yields `Token`s followed by exactly one `Finished`, then ends.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<StreamEvent>,
    done: bool,
}

impl TokenStream {
    /// Drain the stream to its end
    pub async fn collect_output(mut self) -> StreamOutput {
        let mut tokens = Vec::new();
        let mut termination = None;
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Token(t) => tokens.push(t),
                StreamEvent::Finished(t) => termination = Some(t),
            }
        }
        StreamOutput {
            tokens,
            termination,
        }
    }
}

impl Stream for TokenStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if matches!(event, StreamEvent::Finished(_)) {
                    self.done = true;
                    self.rx.close();
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Client handle for a submitted request
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    stream: TokenStream,
    cancel: CancelHandle,
}

impl RequestHandle {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Idempotent
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn canceller(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn stream_mut(&mut self) -> &mut TokenStream {
        &mut self.stream
    }

    pub fn into_parts(self) -> (TokenStream, CancelHandle) {
        (self.stream, self.cancel)
    }

    pub async fn collect_output(self) -> StreamOutput {
        self.stream.collect_output().await
    }
}

/// Create the channel pair for one request.
///
/// `buffer` counts the terminal event, so at most `buffer - 1` tokens can
/// be outstanding.
pub fn continuation(
    id: RequestId,
    buffer: usize,
    wake: Arc<Notify>,
) -> (ContinuationSender, CancelFlag, RequestHandle) {
    let (tx, rx) = mpsc::channel(buffer.max(2));
    let flag = CancelFlag::new();
    let handle = RequestHandle {
        id: id.clone(),
        stream: TokenStream { rx, done: false },
        cancel: CancelHandle::new(id, flag.clone(), wake),
    };
    let sender = ContinuationSender {
        tx,
        delivered: 0,
        finished: false,
    };
    (sender, flag, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CancelReason, FinishReason};

    fn pair(buffer: usize) -> (ContinuationSender, CancelFlag, RequestHandle) {
        continuation(RequestId::from("s"), buffer, Arc::new(Notify::new()))
    }

    #[tokio::test]
    async fn test_tokens_then_single_terminal() {
        let (mut tx, _flag, handle) = pair(8);
        assert_eq!(tx.push(1), PushOutcome::Delivered);
        assert_eq!(tx.push(2), PushOutcome::Delivered);
        assert!(tx.finish(Termination::Completed(FinishReason::Length)));
        assert!(!tx.finish(Termination::Completed(FinishReason::Length)));
        assert_eq!(tx.delivered(), 2);

        let output = handle.collect_output().await;
        assert_eq!(output.tokens, vec![1, 2]);
        assert_eq!(
            output.termination,
            Some(Termination::Completed(FinishReason::Length))
        );
    }

    #[tokio::test]
    async fn test_overflow_keeps_room_for_terminal() {
        let (mut tx, _flag, handle) = pair(3);
        assert_eq!(tx.push(1), PushOutcome::Delivered);
        assert_eq!(tx.push(2), PushOutcome::Delivered);
        assert_eq!(tx.push(3), PushOutcome::Overflow);
        assert!(tx.finish(Termination::Cancelled(CancelReason::SlowConsumer)));

        let output = handle.collect_output().await;
        assert_eq!(output.tokens, vec![1, 2]);
        assert_eq!(
            output.termination,
            Some(Termination::Cancelled(CancelReason::SlowConsumer))
        );
    }

    #[tokio::test]
    async fn test_dropped_consumer_is_disconnect() {
        let (mut tx, _flag, handle) = pair(4);
        drop(handle);
        assert_eq!(tx.push(1), PushOutcome::Disconnected);
        assert!(tx.is_disconnected());
        assert!(!tx.finish(Termination::Cancelled(CancelReason::Disconnected)));
    }

    #[tokio::test]
    async fn test_stream_ends_after_terminal() {
        let (mut tx, _flag, mut handle) = pair(4);
        tx.finish(Termination::Cancelled(CancelReason::Client));
        let first = handle.stream_mut().next().await;
        assert!(matches!(first, Some(StreamEvent::Finished(_))));
        assert!(handle.stream_mut().next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_without_terminal() {
        let (mut tx, _flag, handle) = pair(4);
        tx.push(9);
        drop(tx);
        let output = handle.collect_output().await;
        assert_eq!(output.tokens, vec![9]);
        assert!(output.termination.is_none());
    }

    #[test]
    fn test_handle_cancel_sets_shared_flag() {
        let (_tx, flag, handle) = pair(4);
        let canceller = handle.canceller();
        handle.cancel();
        assert!(flag.is_set());
        assert!(canceller.is_cancelled());
    }
}
