//! The per-connection task and its handle.
//!
//! All sequencing state lives in one spawned task. Caller requests and transport events
//! are both delivered to it as messages, so the queue is only ever touched from one
//! place and callbacks run in the order things happened there.

use std::time::Duration;

use lathser_protocol::{classify, is_ack_line, Incoming};
use tokio::sync::{mpsc, watch};

use crate::{
    batch::Batch,
    error::SendError,
    request::{Callbacks, Completion, PendingRequest, Response},
    sequencer::SendQueue,
    state::{ConnectionManager, ConnectionState, Delegate},
    transport::{EventReceiver, Transport, TransportEvent},
};

#[derive(Clone, Debug, Default)]
pub struct LinkConfig {
    /// How long to wait for an ack before failing the request. `None` waits until the
    /// transport reports a disconnect.
    pub ack_timeout: Option<Duration>,
}

enum Command {
    Scan,
    Disconnect,
    Send(PendingRequest),
}

/// A cheap, cloneable handle to a link task.
///
/// The task stops (disconnecting and failing whatever is pending) once every handle is
/// dropped.
#[derive(Clone)]
pub struct Link {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl Link {
    /// Spawns the link task on the current tokio runtime. `events` must be the receiving
    /// end of the channel `transport` reports to.
    pub fn spawn<T, D>(
        transport: T,
        events: EventReceiver<T::Peripheral>,
        delegate: D,
        config: LinkConfig,
    ) -> Link
    where
        T: Transport,
        D: Delegate,
    {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (connection, state) = ConnectionManager::new();
        let task = LinkTask {
            transport,
            delegate,
            queue: SendQueue::new(config.ack_timeout),
            connection,
            commands,
            events,
        };
        tokio::spawn(task.run());

        Link {
            commands: commands_tx,
            state,
        }
    }

    pub fn scan_for_peripherals(&self) {
        self.command(Command::Scan);
    }

    pub fn disconnect(&self) {
        self.command(Command::Disconnect);
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), SendError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| SendError::LinkClosed)
    }

    /// A receiver that only reports state changes from now on.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        let mut state = self.state.clone();
        state.borrow_and_update();
        state
    }

    pub fn send_string(&self, line: impl Into<String>) -> Response {
        self.send_lines(Batch::single(line))
    }

    /// Sends the lines one at a time. Resolves with the last line's response, or with
    /// the first failure (in which case the remaining lines were never sent).
    pub fn send_lines(&self, lines: impl Into<Batch>) -> Response {
        let (completion, response) = Completion::reply();
        self.enqueue(lines.into(), completion);
        response
    }

    pub fn send_string_with(&self, line: impl Into<String>, callbacks: Callbacks) {
        self.send_lines_with(Batch::single(line), callbacks);
    }

    pub fn send_lines_with(&self, lines: impl Into<Batch>, callbacks: Callbacks) {
        self.enqueue(lines.into(), Completion::callbacks(callbacks));
    }

    fn enqueue(&self, batch: Batch, completion: Completion) {
        // If the task is gone the request is dropped here, which resolves it as closed.
        self.command(Command::Send(PendingRequest::new(batch, completion)));
    }

    fn command(&self, cmd: Command) {
        if self.commands.send(cmd).is_err() {
            log::debug!("link task has exited");
        }
    }
}

struct LinkTask<T: Transport, D> {
    transport: T,
    delegate: D,
    queue: SendQueue,
    connection: ConnectionManager,
    commands: mpsc::UnboundedReceiver<Command>,
    events: EventReceiver<T::Peripheral>,
}

impl<T: Transport, D: Delegate> LinkTask<T, D> {
    async fn run(mut self) {
        loop {
            let deadline = self.queue.deadline();
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(ev) = self.events.recv() => self.handle_event(ev),
                _ = ack_deadline(deadline) => self.queue.on_ack_timeout(&mut self.transport),
            }
        }

        log::debug!("all link handles dropped, shutting down");
        self.connection
            .disconnect(&mut self.transport, &mut self.queue, &mut self.delegate);
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Scan => self
                .connection
                .scan_for_peripherals(&mut self.transport, &mut self.delegate),
            Command::Disconnect => {
                self.connection
                    .disconnect(&mut self.transport, &mut self.queue, &mut self.delegate)
            }
            Command::Send(request) => {
                let connected = self.connection.is_connected();
                self.queue.enqueue(request, connected, &mut self.transport);
            }
        }
    }

    fn handle_event(&mut self, ev: TransportEvent<T::Peripheral>) {
        match ev {
            TransportEvent::PeripheralFound(p) => {
                self.connection.on_peripheral_found(p, &mut self.transport)
            }
            TransportEvent::Connected => self
                .connection
                .on_connected(&mut self.transport, &mut self.delegate),
            TransportEvent::Disconnected => self
                .connection
                .on_disconnected(&mut self.queue, &mut self.delegate),
            TransportEvent::LineReceived(line) => self.handle_line(&line),
        }
    }

    fn handle_line(&mut self, line: &str) {
        log::trace!("< {line}");
        match classify(line, self.queue.is_awaiting_ack()) {
            Incoming::Ack(payload) => self.queue.on_ack(payload, &mut self.transport),
            Incoming::Unsolicited(text) => {
                if is_ack_line(text) {
                    log::warn!("ack {text:?} with nothing in flight, passing it on");
                }
                self.delegate.message_received(text);
            }
        }
    }
}

async fn ack_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
