//! Streaming Bridge
//!
//! Adapts one thread-blocking [`ModelRuntime::generate`] call into an async
//! sequence the event loop can consume without blocking.
//!
//! ```text
//!   worker thread                         event loop
//!   ─────────────                         ──────────
//!   runtime.generate(params, sink)
//!     sink(Text)  ──blocking_send──▶ ┌─────────────┐
//!     sink(Text)  ──blocking_send──▶ │ mpsc (bound)│ ──recv().await──▶ BridgeReceiver
//!   Ok(full)      ──Finished──────▶  │             │
//!   Err(e)        ──Failed────────▶  └─────────────┘
//! ```
//!
//! The channel is single-producer/single-consumer per request, so events come
//! out in exactly the order the runtime emitted them. `Finished` is the
//! completion sentinel and `Failed` wraps the runtime error so the consumer
//! re-raises it.
//!
//! # Cancellation
//!
//! The worker thread is never killed. Dropping or cancelling the receiver
//! raises a [`CancellationFlag`]; the sink then answers `ControlFlow::Break`
//! to the runtime, which may stop between fragments. A runtime that never
//! returns to the sink keeps its thread until it finishes on its own.

use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::runtime::{Emission, GenerationParams, ModelRuntime, RuntimeError};

/// Shared flag telling a worker its consumer has gone away
pub type CancellationFlag = Arc<AtomicBool>;

/// Items crossing the thread boundary
#[derive(Debug)]
enum BridgeItem {
    Emission(Emission),
    Finished(String),
    Failed(RuntimeError),
}

/// Event observed by the consumer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Text delta
    Text(String),
    /// Phase marker
    Phase(String),
    /// Generation finished; carries the full text as returned by the runtime
    Finished(String),
}

/// Failure observed by the consumer
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The runtime raised an error
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// The worker went away without sending the sentinel (panic or teardown)
    #[error("generation worker exited without completing")]
    WorkerLost,

    /// No worker thread could be started
    #[error("failed to start generation worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Consumer half of a bridge
///
/// Implements [`Stream`]; the stream ends after the first `Finished` event or
/// error.
#[derive(Debug)]
pub struct BridgeReceiver {
    rx: mpsc::Receiver<BridgeItem>,
    cancel: CancellationFlag,
    done: bool,
}

impl BridgeReceiver {
    /// Ask the worker to stop at its next emission
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Flag shared with the worker
    #[must_use]
    pub fn cancellation_flag(&self) -> CancellationFlag {
        Arc::clone(&self.cancel)
    }

    /// Await the next event
    pub async fn next_event(&mut self) -> Option<Result<BridgeEvent, BridgeError>> {
        std::future::poll_fn(|cx| self.poll_event(cx)).await
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<BridgeEvent, BridgeError>>> {
        if self.done {
            return Poll::Ready(None);
        }

        let item = match self.rx.poll_recv(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(item) => item,
        };

        let event = match item {
            Some(BridgeItem::Emission(Emission::Text(text))) => Ok(BridgeEvent::Text(text)),
            Some(BridgeItem::Emission(Emission::Phase(name))) => Ok(BridgeEvent::Phase(name)),
            Some(BridgeItem::Finished(full)) => {
                self.done = true;
                Ok(BridgeEvent::Finished(full))
            }
            Some(BridgeItem::Failed(error)) => {
                self.done = true;
                Err(BridgeError::Runtime(error))
            }
            None => {
                self.done = true;
                Err(BridgeError::WorkerLost)
            }
        };
        Poll::Ready(Some(event))
    }
}

impl Stream for BridgeReceiver {
    type Item = Result<BridgeEvent, BridgeError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_event(cx)
    }
}

impl Drop for BridgeReceiver {
    fn drop(&mut self) {
        if !self.done {
            self.cancel();
        }
    }
}

/// Start `runtime.generate(params)` on a dedicated worker thread
///
/// `capacity` bounds how many undelivered events may queue up before the
/// worker blocks on the hand-off.
///
/// # Errors
///
/// Returns [`BridgeError::Spawn`] if the OS refuses a new thread.
pub fn spawn(
    request_id: Uuid,
    runtime: Arc<dyn ModelRuntime>,
    params: GenerationParams,
    capacity: usize,
) -> Result<BridgeReceiver, BridgeError> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let cancel: CancellationFlag = Arc::new(AtomicBool::new(false));
    let worker_cancel = Arc::clone(&cancel);

    std::thread::Builder::new()
        .name(format!("generation-{}", &request_id.simple().to_string()[..8]))
        .spawn(move || run_worker(request_id, &*runtime, &params, &tx, &worker_cancel))
        .map_err(BridgeError::Spawn)?;

    Ok(BridgeReceiver {
        rx,
        cancel,
        done: false,
    })
}

fn run_worker(
    request_id: Uuid,
    runtime: &dyn ModelRuntime,
    params: &GenerationParams,
    tx: &mpsc::Sender<BridgeItem>,
    cancel: &CancellationFlag,
) {
    tracing::debug!(%request_id, runtime = runtime.name(), "Generation worker started");

    let mut sink = |emission: Emission| {
        if cancel.load(Ordering::SeqCst) {
            return ControlFlow::Break(());
        }
        if tx.blocking_send(BridgeItem::Emission(emission)).is_err() {
            cancel.store(true, Ordering::SeqCst);
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    };

    let terminal = match runtime.generate(params, &mut sink) {
        Ok(full) => {
            if !params.stream && !full.is_empty() {
                let _ = tx.blocking_send(BridgeItem::Emission(Emission::Text(full.clone())));
            }
            BridgeItem::Finished(full)
        }
        Err(error) => BridgeItem::Failed(error),
    };

    let delivered = tx.blocking_send(terminal).is_ok();
    tracing::debug!(
        %request_id,
        delivered,
        cancelled = cancel.load(Ordering::SeqCst),
        "Generation worker finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ScriptStep, ScriptedRuntime};
    use std::time::Duration;

    async fn drain(mut rx: BridgeReceiver) -> Vec<Result<BridgeEvent, String>> {
        let mut out = Vec::new();
        while let Some(item) = rx.next_event().await {
            out.push(item.map_err(|e| e.to_string()));
        }
        out
    }

    #[tokio::test]
    async fn test_events_arrive_in_emission_order() {
        let runtime = Arc::new(ScriptedRuntime::fragments(&["a", "b", "c", "d"]));
        let rx = spawn(Uuid::new_v4(), runtime, GenerationParams::new("p"), 1).unwrap();

        let events = drain(rx).await;
        assert_eq!(
            events,
            vec![
                Ok(BridgeEvent::Text("a".into())),
                Ok(BridgeEvent::Text("b".into())),
                Ok(BridgeEvent::Text("c".into())),
                Ok(BridgeEvent::Text("d".into())),
                Ok(BridgeEvent::Finished("abcd".into())),
            ]
        );
    }

    #[tokio::test]
    async fn test_runtime_error_is_reraised() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            ScriptStep::Text("partial".into()),
            ScriptStep::Fail(RuntimeError::Failed("kaboom".into())),
        ]));
        let mut rx = spawn(Uuid::new_v4(), runtime, GenerationParams::new("p"), 4).unwrap();

        assert_eq!(
            rx.next_event().await.unwrap().unwrap(),
            BridgeEvent::Text("partial".into())
        );
        match rx.next_event().await {
            Some(Err(BridgeError::Runtime(RuntimeError::Failed(msg)))) => assert_eq!(msg, "kaboom"),
            other => panic!("expected runtime failure, got {other:?}"),
        }
        assert!(rx.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_non_streaming_delivers_single_text() {
        let runtime = Arc::new(ScriptedRuntime::fragments(&["x", "y"]));
        let params = GenerationParams::new("p").with_stream(false);
        let events = drain(spawn(Uuid::new_v4(), runtime, params, 4).unwrap()).await;

        assert_eq!(
            events,
            vec![
                Ok(BridgeEvent::Text("xy".into())),
                Ok(BridgeEvent::Finished("xy".into())),
            ]
        );
    }

    #[tokio::test]
    async fn test_dropping_receiver_stops_cooperative_worker() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![
            ScriptStep::Text("one".into()),
            ScriptStep::Sleep(Duration::from_millis(50)),
            ScriptStep::Text("two".into()),
            ScriptStep::Sleep(Duration::from_millis(50)),
            ScriptStep::Text("three".into()),
        ]));
        let mut rx = spawn(
            Uuid::new_v4(),
            runtime.clone(),
            GenerationParams::new("p"),
            1,
        )
        .unwrap();

        assert_eq!(
            rx.next_event().await.unwrap().unwrap(),
            BridgeEvent::Text("one".into())
        );
        let flag = rx.cancellation_flag();
        drop(rx);
        assert!(flag.load(Ordering::SeqCst));

        for _ in 0..50 {
            if runtime.active_calls() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(runtime.active_calls(), 0);
        assert!(runtime.stopped_early());
    }
}
