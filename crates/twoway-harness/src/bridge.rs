//! Hand-off primitives between test code and an agent's worker thread.
//!
//! A [`Promise`]/[`CommandFuture`] pair carries one result back to the
//! caller. The mailbox carries closures the other way; it holds a single
//! job, so a second submission blocks until the worker has taken the first.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::warn;

use crate::error::HarnessError;

/// Write side of a one-shot result. Dropping it unset resolves the future
/// to [`HarnessError::AgentStopped`].
pub struct Promise<T> {
    tx: Sender<T>,
}

impl<T> Promise<T> {
    pub fn set(self, value: T) {
        // The caller may have given up already
        let _ = self.tx.send(value);
    }
}

/// Read side of a one-shot result with a bounded wait.
pub struct CommandFuture<T> {
    rx: Receiver<T>,
    timeout: Duration,
    operation: String,
}

pub fn promise<T>(operation: &str, timeout: Duration) -> (Promise<T>, CommandFuture<T>) {
    let (tx, rx) = bounded(1);
    (
        Promise { tx },
        CommandFuture {
            rx,
            timeout,
            operation: operation.to_string(),
        },
    )
}

impl<T> CommandFuture<T> {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Block until the value arrives, the bound elapses, or the promise is dropped.
    pub fn wait(self) -> Result<T, HarnessError> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => Err(HarnessError::Timeout {
                operation: self.operation,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(HarnessError::AgentStopped),
        }
    }
}

impl CommandFuture<bool> {
    /// Collapse every failure into `false`.
    pub fn wait_ok(self) -> bool {
        let operation = self.operation.clone();
        match self.wait() {
            Ok(value) => value,
            Err(e) => {
                warn!("{} failed: {}", operation, e);
                false
            }
        }
    }
}

impl<T> CommandFuture<Result<T, HarnessError>> {
    /// Wait and flatten the command's own result into the wait result.
    pub fn resolve(self) -> Result<T, HarnessError> {
        self.wait()?
    }
}

/// A closure to run on a worker thread against its state `C`.
pub type Job<C> = Box<dyn FnOnce(&mut C) + Send>;

/// Sending half of a worker's single-slot mailbox.
pub struct Mailbox<C> {
    tx: Sender<Job<C>>,
}

pub fn mailbox<C>() -> (Mailbox<C>, Receiver<Job<C>>) {
    let (tx, rx) = bounded(1);
    (Mailbox { tx }, rx)
}

impl<C> Mailbox<C> {
    /// Hand `job` to the worker, waiting up to `timeout` for the slot to
    /// free. Returns false if the job could not be delivered; it is then
    /// dropped along with any promise it captured.
    pub fn post(&self, job: Job<C>, timeout: Duration) -> bool {
        self.tx.send_timeout(job, timeout).is_ok()
    }
}
