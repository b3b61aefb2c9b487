use tokio::sync::{mpsc, watch};

use crate::{sequencer::SendQueue, transport::Transport};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    NotConnected,
    Scanning,
    Connected,
}

/// Receives what the device says on its own, and connection changes.
///
/// Called on the link's task, in the order things happen there.
pub trait Delegate: Send + 'static {
    fn message_received(&mut self, text: &str);
    fn connection_state_changed(&mut self, state: ConnectionState);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Message(String),
    StateChanged(ConnectionState),
}

impl Delegate for mpsc::UnboundedSender<LinkEvent> {
    fn message_received(&mut self, text: &str) {
        // Nobody listening is not our problem.
        let _ = self.send(LinkEvent::Message(text.to_owned()));
    }

    fn connection_state_changed(&mut self, state: ConnectionState) {
        let _ = self.send(LinkEvent::StateChanged(state));
    }
}

/// A delegate that ignores everything.
impl Delegate for () {
    fn message_received(&mut self, _: &str) {}
    fn connection_state_changed(&mut self, _: ConnectionState) {}
}

/// Tracks whether we're connected, and drives the transport to get there.
pub struct ConnectionManager {
    state: ConnectionState,
    watch: watch::Sender<ConnectionState>,
    // Sessions we hung up whose `Disconnected` hasn't come back yet.
    hanging_up: usize,
}

impl ConnectionManager {
    pub fn new() -> (Self, watch::Receiver<ConnectionState>) {
        let (watch, rx) = watch::channel(ConnectionState::NotConnected);
        let manager = ConnectionManager {
            state: ConnectionState::NotConnected,
            watch,
            hanging_up: 0,
        };
        (manager, rx)
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Starts looking for a peripheral, unless we're already scanning or connected.
    pub fn scan_for_peripherals<T: Transport>(
        &mut self,
        transport: &mut T,
        delegate: &mut impl Delegate,
    ) {
        if self.state != ConnectionState::NotConnected {
            log::debug!("scan requested while {:?}, ignoring", self.state);
            return;
        }
        transport.scan();
        self.transition(ConnectionState::Scanning, delegate);
    }

    /// Connects to the first peripheral found while scanning.
    pub fn on_peripheral_found<T: Transport>(
        &mut self,
        peripheral: T::Peripheral,
        transport: &mut T,
    ) {
        if self.state == ConnectionState::Scanning {
            log::info!("found {peripheral:?}, connecting");
            transport.connect(peripheral);
        } else {
            log::debug!("ignoring {peripheral:?} while {:?}", self.state);
        }
    }

    pub fn on_connected<T: Transport>(&mut self, transport: &mut T, delegate: &mut impl Delegate) {
        match self.state {
            ConnectionState::Scanning => self.transition(ConnectionState::Connected, delegate),
            ConnectionState::Connected => {}
            ConnectionState::NotConnected => {
                // We were told to disconnect while the connection was being set up.
                log::info!("connection completed after disconnect, dropping it");
                transport.disconnect();
            }
        }
    }

    /// Drops the connection at the caller's request, failing everything pending.
    pub fn disconnect<T: Transport>(
        &mut self,
        transport: &mut T,
        queue: &mut SendQueue,
        delegate: &mut impl Delegate,
    ) {
        if self.state != ConnectionState::NotConnected {
            self.hanging_up += 1;
        }
        transport.disconnect();
        queue.on_disconnected();
        self.transition(ConnectionState::NotConnected, delegate);
    }

    /// The transport's session ended.
    ///
    /// If we asked for that, this is just the confirmation: by now we may already be
    /// scanning again, and that scan must not be cancelled.
    pub fn on_disconnected(&mut self, queue: &mut SendQueue, delegate: &mut impl Delegate) {
        if self.hanging_up > 0 {
            self.hanging_up -= 1;
            log::debug!("transport confirmed hang-up");
            return;
        }
        queue.on_disconnected();
        self.transition(ConnectionState::NotConnected, delegate);
    }

    fn transition(&mut self, to: ConnectionState, delegate: &mut impl Delegate) {
        if self.state == to {
            return;
        }
        log::info!("connection state {:?} -> {to:?}", self.state);
        self.state = to;
        self.watch.send_replace(to);
        delegate.connection_state_changed(to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::tests::{request, Log, RecordingTransport};

    #[derive(Default)]
    struct Recorder {
        states: Vec<ConnectionState>,
    }

    impl Delegate for Recorder {
        fn message_received(&mut self, _: &str) {}

        fn connection_state_changed(&mut self, state: ConnectionState) {
            self.states.push(state);
        }
    }

    fn connected() -> (ConnectionManager, RecordingTransport, Recorder) {
        let (mut mgr, _) = ConnectionManager::new();
        let mut t = RecordingTransport::default();
        let mut d = Recorder::default();
        mgr.scan_for_peripherals(&mut t, &mut d);
        mgr.on_peripheral_found((), &mut t);
        mgr.on_connected(&mut t, &mut d);
        (mgr, t, d)
    }

    #[test]
    fn scan_connect() {
        let (mgr, _, d) = connected();
        assert!(mgr.is_connected());
        assert_eq!(
            d.states,
            [ConnectionState::Scanning, ConnectionState::Connected]
        );
    }

    #[test]
    fn scan_is_a_noop_unless_idle() {
        let (mut mgr, mut t, mut d) = connected();
        mgr.scan_for_peripherals(&mut t, &mut d);
        assert_eq!(d.states.len(), 2);
        assert_eq!(mgr.state(), ConnectionState::Connected);
    }

    #[test]
    fn watch_follows_state() {
        let (mut mgr, rx) = ConnectionManager::new();
        let mut t = RecordingTransport::default();
        mgr.scan_for_peripherals(&mut t, &mut ());
        assert_eq!(*rx.borrow(), ConnectionState::Scanning);
    }

    #[test]
    fn disconnect_fails_everything_and_transitions_once() {
        let (mut mgr, mut t, mut d) = connected();
        let log = Log::default();
        let mut q = SendQueue::new(None);
        for tag in ["a", "b", "c"] {
            q.enqueue(request(tag, &["x"], &log), true, &mut t);
        }

        mgr.disconnect(&mut t, &mut q, &mut d);
        // The transport confirming the disconnect is not another transition.
        mgr.on_disconnected(&mut q, &mut d);

        assert_eq!(t.disconnects, 1);
        assert_eq!(t.written, ["x"]);
        assert!(q.is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            [
                "a err Disconnected",
                "a finally",
                "b err Disconnected",
                "b finally",
                "c err Disconnected",
                "c finally"
            ]
        );
        assert_eq!(
            d.states,
            [
                ConnectionState::Scanning,
                ConnectionState::Connected,
                ConnectionState::NotConnected
            ]
        );
    }

    #[test]
    fn disconnect_while_scanning() {
        let (mut mgr, _) = ConnectionManager::new();
        let mut t = RecordingTransport::default();
        let mut d = Recorder::default();
        let mut q = SendQueue::new(None);
        mgr.scan_for_peripherals(&mut t, &mut d);
        mgr.disconnect(&mut t, &mut q, &mut d);

        // The connection attempt finishes anyway; we hang up again.
        mgr.on_connected(&mut t, &mut d);
        assert_eq!(t.disconnects, 2);
        assert_eq!(mgr.state(), ConnectionState::NotConnected);
        assert_eq!(
            d.states,
            [ConnectionState::Scanning, ConnectionState::NotConnected]
        );
    }

    #[test]
    fn rescan_survives_hang_up_confirmation() {
        let (mut mgr, mut t, mut d) = connected();
        let mut q = SendQueue::new(None);
        mgr.disconnect(&mut t, &mut q, &mut d);
        mgr.scan_for_peripherals(&mut t, &mut d);

        // The old session's end arrives after the new scan started.
        mgr.on_disconnected(&mut q, &mut d);
        assert_eq!(mgr.state(), ConnectionState::Scanning);
        mgr.on_peripheral_found((), &mut t);
        mgr.on_connected(&mut t, &mut d);
        assert!(mgr.is_connected());

        // A later loss is a real one.
        mgr.on_disconnected(&mut q, &mut d);
        assert_eq!(mgr.state(), ConnectionState::NotConnected);
    }

    #[test]
    fn scan_failure_after_idle_disconnect() {
        let (mut mgr, _) = ConnectionManager::new();
        let mut t = RecordingTransport::default();
        let mut d = Recorder::default();
        let mut q = SendQueue::new(None);
        // Nothing to hang up, so nothing to wait for.
        mgr.disconnect(&mut t, &mut q, &mut d);
        mgr.scan_for_peripherals(&mut t, &mut d);

        mgr.on_disconnected(&mut q, &mut d);
        assert_eq!(mgr.state(), ConnectionState::NotConnected);
        assert_eq!(
            d.states,
            [ConnectionState::Scanning, ConnectionState::NotConnected]
        );
    }

    #[test]
    fn found_is_ignored_unless_scanning() {
        let (mut mgr, _) = ConnectionManager::new();
        let mut t = RecordingTransport::default();
        mgr.on_peripheral_found((), &mut t);
        assert_eq!(mgr.state(), ConnectionState::NotConnected);
    }
}
