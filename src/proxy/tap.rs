//! Stream tap: one upstream body, two independent readers.
//!
//! A pump task pulls the upstream body and hands every chunk to both
//! branches. The caller branch is bounded, so a slow client still
//! back-pressures upstream. The observer branch is unbounded, so the usage
//! accumulator can never hold the caller back.

use crate::core::StreamCancelHandle;
use crate::proxy::ByteStream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};

/// Chunks buffered ahead of the caller before the pump waits.
const CALLER_BUFFER: usize = 32;

/// How long the pump waits for room to tell the caller it was cut off.
const INTERRUPT_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

type Chunk = Result<Bytes, io::Error>;

/// One reader's view of a tapped body.
pub struct TapBranch {
    inner: ByteStream,
}

impl TapBranch {
    fn new(stream: impl Stream<Item = Chunk> + Send + 'static) -> Self {
        Self {
            inner: stream.boxed(),
        }
    }
}

impl Stream for TapBranch {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Split `source` into a caller branch and an observer branch.
///
/// Both branches see the same chunks in the same order. Upstream errors are
/// delivered to both and end the stream. Dropping one branch leaves the other
/// running; the upstream body is dropped once both are gone. Cancelling
/// `cancel` stops reading upstream and ends both branches.
///
/// Must be called from within a Tokio runtime.
pub fn tap(source: ByteStream, cancel: StreamCancelHandle) -> (TapBranch, TapBranch) {
    let (caller_tx, caller_rx) = mpsc::channel(CALLER_BUFFER);
    let (observer_tx, observer_rx) = mpsc::unbounded_channel();

    tokio::spawn(pump(source, caller_tx, observer_tx, cancel));

    (
        TapBranch::new(ReceiverStream::new(caller_rx)),
        TapBranch::new(UnboundedReceiverStream::new(observer_rx)),
    )
}

async fn pump(
    mut source: ByteStream,
    caller: mpsc::Sender<Chunk>,
    observer: mpsc::UnboundedSender<Chunk>,
    cancel: StreamCancelHandle,
) {
    let mut caller = Some(caller);
    let mut observer = Some(observer);
    let mut interrupted = false;

    while caller.is_some() || observer.is_some() {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                interrupted = true;
                break;
            }
            item = source.next() => item,
        };
        let Some(item) = item else {
            break;
        };

        let failed = item.is_err();
        let (for_caller, for_observer) = duplicate(item);

        if let Some(tx) = &observer {
            if tx.send(for_observer).is_err() {
                observer = None;
            }
        }
        if let Some(tx) = &caller {
            let delivered = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                sent = tx.send(for_caller) => sent.is_ok(),
            };
            if !delivered {
                caller = None;
            }
        }

        if failed {
            break;
        }
    }

    if interrupted {
        drop(observer);
        if let Some(tx) = caller {
            notify_interrupted(&tx).await;
        }
        tracing::debug!("Stream tap cancelled");
    }
}

/// Queue the shutdown error behind whatever the caller has not read yet.
async fn notify_interrupted(caller: &mpsc::Sender<Chunk>) {
    let notice = Err(io::Error::new(
        io::ErrorKind::Interrupted,
        "proxy is shutting down",
    ));
    if tokio::time::timeout(INTERRUPT_NOTICE_TIMEOUT, caller.send(notice))
        .await
        .is_err()
    {
        tracing::warn!("Caller did not drain its buffer, interruption not delivered");
    }
}

/// `io::Error` is not `Clone`; the observer gets an equivalent error.
fn duplicate(item: Chunk) -> (Chunk, Chunk) {
    match item {
        Ok(bytes) => (Ok(bytes.clone()), Ok(bytes)),
        Err(e) => {
            let copy = io::Error::new(e.kind(), e.to_string());
            (Err(e), Err(copy))
        }
    }
}
