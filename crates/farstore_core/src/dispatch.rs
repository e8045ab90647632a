//! Serialized request dispatch.
//!
//! Every compiled operation (entity save/refresh/delete and query
//! find/count/map-reduce, blocking or not) passes through one
//! [`Dispatcher`] per client. The dispatcher executes operations strictly
//! one at a time in submission order. The remote service exposes no
//! optimistic-concurrency primitives, so serializing protects against
//! interleaved partial updates to one record from the same process and
//! keeps outbound concurrency bounded and predictable.
//!
//! The dispatcher never reorders, retries, or batches; retry and backoff
//! belong to the transport collaborator.

use crate::error::{CoreResult, Error};
use crate::transport::{Transport, WireRequest, WireResponse};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::trace;

/// A unit of work executed on the dispatch thread.
pub type Job = Box<dyn FnOnce(&dyn Transport) + Send + 'static>;

/// Cancellation token for a non-blocking operation.
///
/// Cancelling suppresses the operation's completion callback. It does not
/// abort a transport call that is already in flight; at most it prevents
/// the result from being delivered.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Creates a fresh, uncancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The single ordering domain for a client's network operations.
pub struct Dispatcher {
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawns the dispatch thread over the given transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = std::thread::spawn(move || {
            while let Ok(job) = receiver.recv() {
                trace!("executing queued operation");
                job(transport.as_ref());
            }
        });
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queues a job for execution in submission order.
    pub fn submit(&self, job: Job) -> CoreResult<()> {
        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(Error::Shutdown)?;
        sender.send(job).map_err(|_| Error::Shutdown)
    }

    /// Queues a single operation and waits for its turn and its result.
    pub fn execute_blocking(&self, request: WireRequest) -> CoreResult<WireResponse> {
        let (done, result) = mpsc::channel();
        self.submit(Box::new(move |transport| {
            let _ = done.send(transport.execute(&request));
        }))?;
        result
            .recv()
            .map_err(|_| Error::Shutdown)?
            .map_err(Error::from)
    }

    /// Stops accepting work and waits for queued operations to finish.
    ///
    /// Safe to call more than once. When invoked from the dispatch thread
    /// itself (a completion dropping the last client handle), the queue is
    /// closed but not joined.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = worker.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
