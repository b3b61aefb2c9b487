use std::fmt;

use tokio::sync::mpsc;

/// Something that carries protocol lines to and from a peripheral.
///
/// None of these methods block or report errors directly: results come back as
/// [`TransportEvent`]s on the channel the transport was built with. Writes are
/// best-effort.
///
/// A session runs from `scan` until the scan, the connection attempt or the connection
/// ends. The end of a session is reported with exactly one
/// [`TransportEvent::Disconnected`], whatever the cause, including a call to
/// `disconnect`. Calling `disconnect` with no session running reports nothing. Events
/// are delivered in the order they happened.
pub trait Transport: Send + 'static {
    /// Identifies a discovered peripheral.
    type Peripheral: Clone + fmt::Debug + Send + 'static;

    fn scan(&mut self);
    fn connect(&mut self, peripheral: Self::Peripheral);
    fn disconnect(&mut self);
    /// Sends one line. The transport adds the line terminator.
    fn write(&mut self, line: &str);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent<P> {
    PeripheralFound(P),
    Connected,
    /// The session ended: the connection was lost, refused, or hung up, or the scan
    /// failed.
    Disconnected,
    /// A complete line from the device, without its terminator.
    LineReceived(String),
}

pub type EventSender<P> = mpsc::UnboundedSender<TransportEvent<P>>;
pub type EventReceiver<P> = mpsc::UnboundedReceiver<TransportEvent<P>>;

pub fn event_channel<P>() -> (EventSender<P>, EventReceiver<P>) {
    mpsc::unbounded_channel()
}
