use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::oneshot;

use crate::{batch::Batch, error::SendError};

type Outcome = Result<String, SendError>;

/// The original block-style interface: a success, a failure and a finally callback.
///
/// Exactly one of `on_success` and `on_failure` runs, and `on_finally` always runs last.
/// All three run on the link's task, so they should not block.
#[derive(Default)]
pub struct Callbacks {
    on_success: Option<Box<dyn FnOnce(String) + Send>>,
    on_failure: Option<Box<dyn FnOnce(SendError) + Send>>,
    on_finally: Option<Box<dyn FnOnce() + Send>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, f: impl FnOnce(String) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_failure(mut self, f: impl FnOnce(SendError) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(f));
        self
    }

    pub fn on_finally(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_finally = Some(Box::new(f));
        self
    }

    fn call(self, outcome: Outcome) {
        match outcome {
            Ok(response) => {
                if let Some(f) = self.on_success {
                    f(response);
                }
            }
            Err(e) => {
                if let Some(f) = self.on_failure {
                    f(e);
                }
            }
        }
        if let Some(f) = self.on_finally {
            f();
        }
    }
}

enum Target {
    Reply(oneshot::Sender<Outcome>),
    Callbacks(Callbacks),
}

/// Where a request's outcome goes.
///
/// Resolving consumes the completion, so it can only happen once. A completion that is
/// dropped unresolved resolves itself with [`SendError::LinkClosed`].
pub struct Completion {
    target: Option<Target>,
}

impl Completion {
    pub fn reply() -> (Self, Response) {
        let (tx, rx) = oneshot::channel();
        let completion = Completion {
            target: Some(Target::Reply(tx)),
        };
        (completion, Response { rx })
    }

    pub fn callbacks(callbacks: Callbacks) -> Self {
        Completion {
            target: Some(Target::Callbacks(callbacks)),
        }
    }

    pub fn resolve(mut self, outcome: Outcome) {
        self.fire(outcome);
    }

    fn fire(&mut self, outcome: Outcome) {
        match self.target.take() {
            // The caller may have stopped waiting; that's fine.
            Some(Target::Reply(tx)) => {
                let _ = tx.send(outcome);
            }
            Some(Target::Callbacks(cbs)) => cbs.call(outcome),
            None => {}
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.fire(Err(SendError::LinkClosed));
    }
}

/// Resolves to the response of the last line of a request.
#[must_use = "a response does nothing unless awaited"]
pub struct Response {
    rx: oneshot::Receiver<Outcome>,
}

impl Future for Response {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(SendError::LinkClosed)))
    }
}

/// A batch together with its position and completion, owned by the send queue until it
/// resolves.
pub struct PendingRequest {
    batch: Batch,
    cursor: usize,
    completion: Completion,
}

impl PendingRequest {
    pub fn new(batch: Batch, completion: Completion) -> Self {
        PendingRequest {
            batch,
            cursor: 0,
            completion,
        }
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The line to send (or that is in flight). Only call on a validated batch.
    pub fn current_line(&self) -> &str {
        &self.batch.lines()[self.cursor]
    }

    /// Moves to the next line, returning false if the current line was the last.
    pub fn advance(&mut self) -> bool {
        if self.cursor + 1 < self.batch.len() {
            self.cursor += 1;
            true
        } else {
            false
        }
    }

    pub fn succeed(self, response: String) {
        self.completion.resolve(Ok(response));
    }

    pub fn fail(self, err: SendError) {
        self.completion.resolve(Err(err));
    }
}
