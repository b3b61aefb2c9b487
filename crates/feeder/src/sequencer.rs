//! The send queue.
//!
//! At most one line is in flight. Requests are served in submission order, lines within
//! a request in order, and the next line is only written once the current one is
//! acknowledged. There is no retransmission: a request that fails is simply dropped
//! from the queue.

use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

use crate::{error::SendError, request::PendingRequest, transport::Transport};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    AwaitingAck,
}

pub struct SendQueue {
    queue: VecDeque<PendingRequest>,
    state: QueueState,
    ack_timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl SendQueue {
    pub fn new(ack_timeout: Option<Duration>) -> Self {
        SendQueue {
            queue: VecDeque::new(),
            state: QueueState::Idle,
            ack_timeout,
            deadline: None,
        }
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.state == QueueState::AwaitingAck
    }

    /// Requests not yet resolved, including the one in flight.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// When the in-flight line times out, if a bounded wait is configured.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Appends a request, starting it right away if nothing is in flight.
    ///
    /// Invalid requests and requests made while disconnected fail immediately without
    /// touching the transport.
    pub fn enqueue<T: Transport>(
        &mut self,
        request: PendingRequest,
        connected: bool,
        transport: &mut T,
    ) {
        if let Err(e) = request.batch().validate() {
            log::debug!("rejecting request: {e}");
            request.fail(e);
            return;
        }
        if !connected {
            log::debug!("rejecting request while not connected");
            request.fail(SendError::NotConnected);
            return;
        }

        self.queue.push_back(request);
        if self.state == QueueState::Idle {
            self.transmit(transport);
        }
    }

    /// Resolves the in-flight line with an ack.
    pub fn on_ack<T: Transport>(&mut self, payload: &str, transport: &mut T) {
        if self.state != QueueState::AwaitingAck {
            log::warn!("ack {payload:?} with nothing in flight");
            return;
        }
        let Some(head) = self.queue.front_mut() else {
            log::warn!("ack {payload:?} with an empty queue");
            self.state = QueueState::Idle;
            return;
        };

        if head.advance() {
            log::trace!("intermediate ack {payload:?}");
            self.transmit(transport);
            return;
        }

        if let Some(done) = self.queue.pop_front() {
            done.succeed(payload.to_owned());
        }
        self.transmit(transport);
    }

    /// Fails the in-flight line after the bounded wait elapsed. The rest of its batch is
    /// not sent; the next request starts.
    pub fn on_ack_timeout<T: Transport>(&mut self, transport: &mut T) {
        let (Some(timeout), QueueState::AwaitingAck) = (self.ack_timeout, self.state) else {
            return;
        };
        if let Some(head) = self.queue.pop_front() {
            log::warn!(
                "no ack for {:?} after {timeout:?}, failing its request",
                head.current_line()
            );
            head.fail(SendError::Timeout(timeout));
        }
        self.transmit(transport);
    }

    /// Fails everything outstanding with [`SendError::Disconnected`].
    pub fn on_disconnected(&mut self) {
        if !self.queue.is_empty() {
            log::debug!("failing {} pending requests", self.queue.len());
        }
        self.state = QueueState::Idle;
        self.deadline = None;
        for request in self.queue.drain(..) {
            request.fail(SendError::Disconnected);
        }
    }

    // Writes the current line of the head request, or goes idle if there is none.
    fn transmit<T: Transport>(&mut self, transport: &mut T) {
        match self.queue.front() {
            Some(head) => {
                let line = head.current_line();
                log::trace!("> {line}");
                transport.write(line);
                self.state = QueueState::AwaitingAck;
                self.deadline = self.ack_timeout.map(|t| Instant::now() + t);
            }
            None => {
                self.state = QueueState::Idle;
                self.deadline = None;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;

    use super::*;
    use crate::{
        batch::Batch,
        request::{Callbacks, Completion},
    };

    #[derive(Default)]
    pub struct RecordingTransport {
        pub written: Vec<String>,
        pub disconnects: usize,
    }

    impl Transport for RecordingTransport {
        type Peripheral = ();

        fn scan(&mut self) {}
        fn connect(&mut self, _: ()) {}
        fn disconnect(&mut self) {
            self.disconnects += 1;
        }
        fn write(&mut self, line: &str) {
            self.written.push(line.to_owned());
        }
    }

    pub type Log = Arc<Mutex<Vec<String>>>;

    /// A request whose callbacks append `"<tag> ok <resp>"`, `"<tag> err <e>"` and
    /// `"<tag> finally"` to the log.
    pub fn request(tag: &str, lines: &[&str], log: &Log) -> PendingRequest {
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        let (t1, t2, t3) = (tag.to_owned(), tag.to_owned(), tag.to_owned());
        let cbs = Callbacks::new()
            .on_success(move |r| a.lock().unwrap().push(format!("{t1} ok {r}")))
            .on_failure(move |e| b.lock().unwrap().push(format!("{t2} err {e:?}")))
            .on_finally(move || c.lock().unwrap().push(format!("{t3} finally")));
        PendingRequest::new(
            Batch::new(lines.iter().copied()),
            Completion::callbacks(cbs),
        )
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn bare_ack_succeeds_with_empty_response() {
        let log = Log::default();
        let mut t = RecordingTransport::default();
        let mut q = SendQueue::new(None);

        q.enqueue(request("a", &["M3"], &log), true, &mut t);
        assert_eq!(t.written, ["M3"]);
        assert_eq!(q.state(), QueueState::AwaitingAck);

        q.on_ack("", &mut t);
        assert_eq!(entries(&log), ["a ok ", "a finally"]);
        assert_eq!(q.state(), QueueState::Idle);
        assert!(q.is_empty());
    }

    #[test]
    fn ack_payload_is_the_response() {
        let log = Log::default();
        let mut t = RecordingTransport::default();
        let mut q = SendQueue::new(None);

        q.enqueue(request("a", &["TEMP?"], &log), true, &mut t);
        q.on_ack("OK 12.5", &mut t);
        assert_eq!(entries(&log), ["a ok OK 12.5", "a finally"]);
    }

    #[test]
    fn not_connected_never_writes() {
        let log = Log::default();
        let mut t = RecordingTransport::default();
        let mut q = SendQueue::new(None);

        q.enqueue(request("a", &["M3"], &log), false, &mut t);
        assert!(t.written.is_empty());
        assert_eq!(entries(&log), ["a err NotConnected", "a finally"]);
        assert_eq!(q.state(), QueueState::Idle);
    }

    #[test]
    fn invalid_requests_never_write() {
        let log = Log::default();
        let mut t = RecordingTransport::default();
        let mut q = SendQueue::new(None);

        q.enqueue(request("a", &[], &log), true, &mut t);
        q.enqueue(request("b", &["ok", "not\nok"], &log), true, &mut t);
        assert!(t.written.is_empty());
        assert_eq!(
            entries(&log),
            [
                "a err EmptyBatch",
                "a finally",
                "b err InvalidLine(\"not\\nok\")",
                "b finally"
            ]
        );
    }

    #[test]
    fn one_line_in_flight_across_requests() {
        let log = Log::default();
        let mut t = RecordingTransport::default();
        let mut q = SendQueue::new(None);

        q.enqueue(request("a", &["1"], &log), true, &mut t);
        q.enqueue(request("b", &["2"], &log), true, &mut t);
        q.enqueue(request("c", &["3"], &log), true, &mut t);
        assert_eq!(t.written, ["1"]);
        assert_eq!(q.len(), 3);

        q.on_ack("x", &mut t);
        assert_eq!(t.written, ["1", "2"]);
        q.on_ack("y", &mut t);
        assert_eq!(t.written, ["1", "2", "3"]);
        q.on_ack("z", &mut t);

        assert_eq!(
            entries(&log),
            [
                "a ok x",
                "a finally",
                "b ok y",
                "b finally",
                "c ok z",
                "c finally"
            ]
        );
        assert_eq!(q.state(), QueueState::Idle);
    }

    #[test]
    fn batch_reports_last_payload_only() {
        let log = Log::default();
        let mut t = RecordingTransport::default();
        let mut q = SendQueue::new(None);

        q.enqueue(request("a", &["G28", "M3", "M5"], &log), true, &mut t);
        q.on_ack("homed", &mut t);
        q.on_ack("", &mut t);
        assert!(entries(&log).is_empty());
        q.on_ack("done", &mut t);

        assert_eq!(t.written, ["G28", "M3", "M5"]);
        assert_eq!(entries(&log), ["a ok done", "a finally"]);
    }

    #[test]
    fn disconnect_mid_batch_stops_the_batch() {
        let log = Log::default();
        let mut t = RecordingTransport::default();
        let mut q = SendQueue::new(None);

        q.enqueue(request("a", &["1", "2", "3", "4"], &log), true, &mut t);
        q.enqueue(request("b", &["5"], &log), true, &mut t);
        q.on_ack("", &mut t);
        q.on_disconnected();

        assert_eq!(t.written, ["1", "2"]);
        assert_eq!(
            entries(&log),
            ["a err Disconnected", "a finally", "b err Disconnected", "b finally"]
        );
        assert_eq!(q.state(), QueueState::Idle);
        assert!(q.is_empty());

        // A late ack is ignored.
        q.on_ack("", &mut t);
        assert_eq!(t.written, ["1", "2"]);
    }

    #[test]
    fn timeout_fails_head_and_moves_on() {
        let log = Log::default();
        let mut t = RecordingTransport::default();
        let timeout = Duration::from_secs(2);
        let mut q = SendQueue::new(Some(timeout));

        q.enqueue(request("a", &["1", "2"], &log), true, &mut t);
        q.enqueue(request("b", &["3"], &log), true, &mut t);
        assert!(q.deadline().is_some());

        q.on_ack_timeout(&mut t);
        assert_eq!(t.written, ["1", "3"]);
        q.on_ack("", &mut t);
        assert_eq!(
            entries(&log),
            [
                format!("a err {:?}", SendError::Timeout(timeout)),
                "a finally".to_owned(),
                "b ok ".to_owned(),
                "b finally".to_owned()
            ]
        );
        assert_eq!(q.deadline(), None);
    }

    #[test]
    fn no_deadline_without_timeout() {
        let log = Log::default();
        let mut t = RecordingTransport::default();
        let mut q = SendQueue::new(None);

        q.enqueue(request("a", &["1"], &log), true, &mut t);
        assert_eq!(q.deadline(), None);
        q.on_ack_timeout(&mut t);
        assert!(entries(&log).is_empty());
        assert_eq!(q.state(), QueueState::AwaitingAck);
    }

    proptest! {
        // Whatever the batch sizes, lines go out in submission order, one at a time.
        #[test]
        fn lines_leave_in_submission_order(sizes in prop::collection::vec(1usize..5, 1..8)) {
            let log = Log::default();
            let mut t = RecordingTransport::default();
            let mut q = SendQueue::new(None);

            let mut expected = Vec::new();
            for (i, n) in sizes.iter().enumerate() {
                let lines: Vec<String> = (0..*n).map(|j| format!("{i}.{j}")).collect();
                expected.extend(lines.iter().cloned());
                let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
                q.enqueue(request(&i.to_string(), &refs, &log), true, &mut t);
            }

            let mut acks = 0;
            while q.is_awaiting_ack() {
                prop_assert_eq!(t.written.len(), acks + 1);
                q.on_ack("", &mut t);
                acks += 1;
            }
            prop_assert_eq!(&t.written, &expected);

            let finals = entries(&log).iter().filter(|e| e.ends_with("finally")).count();
            prop_assert_eq!(finals, sizes.len());
        }
    }
}
