//! Ordered operation dispatcher: the single serialization point for every
//! engine-visible side effect.
//!
//! `Dispatcher::new()` builds a dedicated one-thread tokio runtime and spawns a
//! background task that owns the receiving end of an unbounded queue.
//! `launch()` is a channel send, never blocking the caller. The background
//! task runs operations one at a time, in submission order.
//!
//! In testing mode `launch()` runs the operation on the caller's thread
//! instead, so tests can assert right after calling an API.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::{PingwellError, Result};

type Operation = Box<dyn FnOnce() + Send + 'static>;

/// Commands sent to the background worker.
enum Command {
    /// Run one operation and signal its completion.
    Run {
        operation: Operation,
        done: oneshot::Sender<()>,
    },
    /// Stop after everything queued before this command has run.
    Shutdown { reply: oneshot::Sender<()> },
}

/// Handle on the eventual completion of a dispatched operation.
///
/// Resolves once the operation has run. Can be waited on from synchronous
/// code with [`Completion::wait`] or `.await`ed.
#[derive(Debug)]
#[must_use = "a Completion does nothing unless waited on; drop it to fire and forget"]
pub struct Completion {
    rx: Option<oneshot::Receiver<()>>,
}

impl Completion {
    /// A completion that is already resolved.
    pub(crate) fn ready() -> Self {
        Self { rx: None }
    }

    /// Block the current thread until the operation has run.
    ///
    /// Must not be called from inside an async runtime or a dispatched
    /// operation.
    pub fn wait(self) -> Result<()> {
        match self.rx {
            None => Ok(()),
            Some(rx) => rx.blocking_recv().map_err(|_| PingwellError::ChannelClosed),
        }
    }

    /// Whether the operation has already run.
    pub fn is_complete(&mut self) -> bool {
        match self.rx.as_mut() {
            None => true,
            Some(rx) => !matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)),
        }
    }
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|r| r.map_err(|_| PingwellError::ChannelClosed)),
        }
    }
}

/// The single-worker dispatcher.
pub struct Dispatcher {
    sender: mpsc::UnboundedSender<Command>,
    testing_mode: AtomicBool,
    /// Taken on drop.
    runtime: Option<Runtime>,
}

impl Dispatcher {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("pingwell-dispatch")
            .enable_all()
            .build()
            .map_err(|e| PingwellError::Other(e.to_string()))?;

        let (sender, receiver) = mpsc::unbounded_channel::<Command>();
        runtime.spawn(worker(receiver));

        debug!("Dispatcher started");

        Ok(Self {
            sender,
            testing_mode: AtomicBool::new(false),
            runtime: Some(runtime),
        })
    }

    /// Submit an operation. Non-blocking outside testing mode.
    pub fn launch<F>(&self, operation: F) -> Completion
    where
        F: FnOnce() + Send + 'static,
    {
        if self.testing_mode() {
            operation();
            return Completion::ready();
        }

        let (done, rx) = oneshot::channel();
        if self
            .sender
            .send(Command::Run {
                operation: Box::new(operation),
                done,
            })
            .is_err()
        {
            // The returned completion resolves to `ChannelClosed`.
            warn!("Dispatcher is shut down, dropping operation");
        }
        Completion { rx: Some(rx) }
    }

    /// Switch synchronous execution on or off. Anything already queued runs
    /// to completion before the switch takes effect.
    pub fn set_testing_mode(&self, enabled: bool) {
        if let Err(e) = self.block_on_queue() {
            warn!("Could not drain dispatcher queue: {}", e);
        }
        self.testing_mode.store(enabled, Ordering::SeqCst);
    }

    pub fn testing_mode(&self) -> bool {
        self.testing_mode.load(Ordering::SeqCst)
    }

    /// Block until every operation submitted so far has run.
    pub fn block_on_queue(&self) -> Result<()> {
        if self.testing_mode() {
            return Ok(());
        }
        self.launch(|| {}).wait()
    }

    /// Run everything queued, then stop the worker. Later launches are dropped.
    pub fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(Command::Shutdown { reply: tx }).is_ok() {
            let _ = rx.blocking_recv();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        let queued = self.sender.send(Command::Shutdown { reply: tx }).is_ok();
        let drain = move || {
            if queued {
                let _ = runtime.block_on(async { tokio::time::timeout(Duration::from_secs(5), rx).await });
            }
        };

        // Neither blocking nor dropping a runtime is allowed inside another
        // runtime, so drain and drop it on a plain thread there.
        if tokio::runtime::Handle::try_current().is_ok() {
            std::thread::spawn(drain);
        } else {
            drain();
        }
    }
}

// ─── Background worker ───────────────────────────────────────────────────────

async fn worker(mut receiver: mpsc::UnboundedReceiver<Command>) {
    while let Some(cmd) = receiver.recv().await {
        match cmd {
            Command::Run { operation, done } => {
                if panic::catch_unwind(AssertUnwindSafe(operation)).is_err() {
                    error!("Dispatched operation panicked");
                }
                let _ = done.send(());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }
    debug!("Dispatcher worker exiting");
}
