use std::sync::{Arc, Mutex, MutexGuard};

use crate::transport::{event_channel, EventReceiver, EventSender, Transport, TransportEvent};

pub const SIMULATED_NAME: &str = "Lathser (simulated)";

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

#[derive(Default)]
struct Shared {
    // Between a scan and the end of the connection that followed it.
    session: bool,
    connected: bool,
    written: Vec<String>,
}

impl Shared {
    /// Whether there was a session to end.
    fn end_session(&mut self) -> bool {
        self.connected = false;
        std::mem::replace(&mut self.session, false)
    }
}

/// An in-process stand-in for the laser controller.
///
/// Scanning immediately finds it, connecting immediately succeeds, and every line written
/// to it is answered by the responder (by default, a bare `*`).
pub struct SimulatedDevice {
    pub transport: SimTransport,
    pub events: EventReceiver<String>,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::with_responder(|_| vec!["*".to_owned()])
    }

    /// `responder` returns the lines the device sends back after receiving a line.
    /// Returning nothing leaves the line unacknowledged.
    pub fn with_responder(responder: impl FnMut(&str) -> Vec<String> + Send + 'static) -> Self {
        let (tx, rx) = event_channel();
        SimulatedDevice {
            transport: SimTransport {
                shared: Arc::default(),
                events: tx,
                responder: Box::new(responder),
            },
            events: rx,
        }
    }

    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            shared: self.transport.shared.clone(),
            events: self.transport.events.clone(),
        }
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SimTransport {
    shared: Arc<Mutex<Shared>>,
    events: EventSender<String>,
    responder: Responder,
}

impl SimTransport {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    fn emit(&self, ev: TransportEvent<String>) {
        // The link is gone; nobody cares what the device says.
        let _ = self.events.send(ev);
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    // Nothing panics while holding this lock, but don't cascade if something does.
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

impl Transport for SimTransport {
    type Peripheral = String;

    fn scan(&mut self) {
        self.shared().session = true;
        self.emit(TransportEvent::PeripheralFound(SIMULATED_NAME.to_owned()));
    }

    fn connect(&mut self, peripheral: String) {
        log::debug!("simulator connecting to {peripheral}");
        self.shared().connected = true;
        self.emit(TransportEvent::Connected);
    }

    fn disconnect(&mut self) {
        let ended = self.shared().end_session();
        if ended {
            self.emit(TransportEvent::Disconnected);
        }
    }

    fn write(&mut self, line: &str) {
        {
            let mut shared = self.shared();
            if !shared.connected {
                log::debug!("simulator dropping {line:?} while disconnected");
                return;
            }
            shared.written.push(line.to_owned());
        }
        for reply in (self.responder)(line) {
            self.emit(TransportEvent::LineReceived(reply));
        }
    }
}

/// Lets tests (and the command line) observe and poke the simulated device.
#[derive(Clone)]
pub struct SimulatorHandle {
    shared: Arc<Mutex<Shared>>,
    events: EventSender<String>,
}

impl SimulatorHandle {
    /// Every line the device has received, in order.
    pub fn written(&self) -> Vec<String> {
        lock(&self.shared).written.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared).connected
    }

    /// Makes the device send a line of its own accord.
    pub fn inject(&self, line: impl Into<String>) {
        let _ = self.events.send(TransportEvent::LineReceived(line.into()));
    }

    /// Simulates losing the radio link.
    pub fn drop_connection(&self) {
        if lock(&self.shared).end_session() {
            let _ = self.events.send(TransportEvent::Disconnected);
        }
    }
}
