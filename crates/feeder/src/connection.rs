//! A [`Transport`] over a Bluetooth LE UART service.
//!
//! The laser controller exposes the Nordic UART service: we write lines to the TX
//! characteristic and the device notifies us on the RX characteristic. The radio is
//! slow (effectively 9600 baud), writes are chopped into small chunks, and notifications
//! are reassembled into lines before they are handed on.

use std::pin::Pin;

use anyhow::anyhow;
use btleplug::{
    api::{
        Central as _, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        ValueNotification, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::{Stream, StreamExt as _};
use lathser_protocol::{frame_line, LineBuffer};
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::{uuid, Uuid};

use crate::transport::{EventSender, Transport, TransportEvent};

pub const UART_SERVICE_UUID: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");
pub const UART_TX_UUID: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");
pub const UART_RX_UUID: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// Largest write that fits in a default-MTU packet.
pub const DEFAULT_WRITE_CHUNK: usize = 20;

#[derive(Clone, Debug)]
pub struct BleConfig {
    /// Only connect to a peripheral advertising this name. If unset, the first
    /// peripheral advertising the UART service is used.
    pub local_name: Option<String>,
    pub service: Uuid,
    /// Characteristic we write to.
    pub tx: Uuid,
    /// Characteristic the device notifies on.
    pub rx: Uuid,
    pub write_chunk: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        BleConfig {
            local_name: None,
            service: UART_SERVICE_UUID,
            tx: UART_TX_UUID,
            rx: UART_RX_UUID,
            write_chunk: DEFAULT_WRITE_CHUNK,
        }
    }
}

#[derive(Debug)]
enum Op {
    Scan,
    Connect(PeripheralId),
    Disconnect,
    Write(String),
}

/// Hands operations to a background task that owns the adapter and the connection.
pub struct BleTransport {
    ops: mpsc::UnboundedSender<Op>,
}

impl BleTransport {
    /// Spawns the bluetooth task on the current tokio runtime. It reports to `events`.
    ///
    /// Once the transport is dropped the task hangs up and exits; await the returned
    /// handle to know the peripheral has been released.
    pub fn spawn(config: BleConfig, events: EventSender<PeripheralId>) -> (Self, JoinHandle<()>) {
        let (ops, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(ble_connection(config, rx, events));
        (BleTransport { ops }, task)
    }

    fn op(&self, op: Op) {
        if let Err(e) = self.ops.send(op) {
            log::warn!("bluetooth task has exited, dropping {:?}", e.0);
        }
    }
}

impl Transport for BleTransport {
    type Peripheral = PeripheralId;

    fn scan(&mut self) {
        self.op(Op::Scan);
    }

    fn connect(&mut self, peripheral: PeripheralId) {
        self.op(Op::Connect(peripheral));
    }

    fn disconnect(&mut self) {
        self.op(Op::Disconnect);
    }

    fn write(&mut self, line: &str) {
        self.op(Op::Write(line.to_owned()));
    }
}

type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

struct Uart {
    peripheral: Peripheral,
    tx: Characteristic,
    notifications: BoxStream<ValueNotification>,
    lines: LineBuffer,
}

struct Worker {
    config: BleConfig,
    events: EventSender<PeripheralId>,
    // Keep the manager alive for as long as we use its adapter.
    _manager: Option<Manager>,
    adapter: Option<Adapter>,
    central_events: Option<BoxStream<CentralEvent>>,
    scanning: bool,
    // Between a scan and the end of the connection that followed it.
    session: bool,
    // Whether this scan already produced a peripheral.
    reported: bool,
    uart: Option<Uart>,
}

async fn ble_connection(
    config: BleConfig,
    mut ops: mpsc::UnboundedReceiver<Op>,
    events: EventSender<PeripheralId>,
) {
    let mut worker = Worker {
        config,
        events,
        _manager: None,
        adapter: None,
        central_events: None,
        scanning: false,
        session: false,
        reported: false,
        uart: None,
    };

    loop {
        tokio::select! {
            op = ops.recv() => match op {
                Some(op) => worker.handle(op).await,
                None => break,
            },
            ev = next_item(worker.central_events.as_mut()) => match ev {
                Some(ev) => worker.on_central_event(ev).await,
                None => worker.central_events = None,
            },
            n = next_item(worker.uart.as_mut().map(|u| &mut u.notifications)) => match n {
                Some(n) => worker.on_notification(n),
                None => {
                    log::warn!("notification stream ended");
                    worker.hang_up().await;
                }
            },
        }
    }

    worker.hang_up().await;
}

// Waits forever if there's no stream.
async fn next_item<S: Stream + Unpin>(stream: Option<&mut S>) -> Option<S::Item> {
    match stream {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

impl Worker {
    fn emit(&self, ev: TransportEvent<PeripheralId>) {
        let _ = self.events.send(ev);
    }

    async fn handle(&mut self, op: Op) {
        let result = match op {
            Op::Scan => {
                self.session = true;
                self.scan().await
            }
            Op::Connect(id) => {
                self.session = true;
                self.connect(id).await
            }
            Op::Disconnect => {
                self.hang_up().await;
                Ok(())
            }
            Op::Write(line) => self.write(&line).await,
        };
        if let Err(e) = result {
            log::warn!("bluetooth error: {e:#}");
            self.hang_up().await;
        }
    }

    async fn adapter(&mut self) -> anyhow::Result<Adapter> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(anyhow!("no bluetooth adapter"))?;
        self._manager = Some(manager);
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    async fn scan(&mut self) -> anyhow::Result<()> {
        let adapter = self.adapter().await?;
        if self.central_events.is_none() {
            self.central_events = Some(adapter.events().await?);
        }
        adapter
            .start_scan(ScanFilter {
                services: vec![self.config.service],
            })
            .await?;
        self.scanning = true;
        self.reported = false;
        log::info!("scanning for {:?}", self.config.local_name);

        // Peripherals the adapter already knows about may not be announced again.
        for p in adapter.peripherals().await? {
            if self.try_report(&p).await? {
                break;
            }
        }
        Ok(())
    }

    async fn try_report(&mut self, p: &Peripheral) -> anyhow::Result<bool> {
        if !self.scanning || self.reported {
            return Ok(false);
        }
        let Some(props) = p.properties().await? else {
            return Ok(false);
        };
        let wanted = match &self.config.local_name {
            Some(name) => props.local_name.as_deref() == Some(name.as_str()),
            None => props.services.contains(&self.config.service),
        };
        if wanted {
            log::info!("found {:?} ({:?})", props.local_name, p.id());
            self.reported = true;
            self.emit(TransportEvent::PeripheralFound(p.id()));
        }
        Ok(wanted)
    }

    async fn on_central_event(&mut self, ev: CentralEvent) {
        match ev {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if !self.scanning || self.reported {
                    return;
                }
                let Some(adapter) = self.adapter.clone() else {
                    return;
                };
                let result = match adapter.peripheral(&id).await {
                    Ok(p) => self.try_report(&p).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = result {
                    log::debug!("couldn't inspect {id:?}: {e}");
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                if self.uart.as_ref().is_some_and(|u| u.peripheral.id() == id) {
                    log::info!("peripheral {id:?} disconnected");
                    self.uart = None;
                    self.end_session();
                }
            }
            _ => {}
        }
    }

    async fn connect(&mut self, id: PeripheralId) -> anyhow::Result<()> {
        let adapter = self.adapter().await?;
        if self.scanning {
            adapter.stop_scan().await?;
            self.scanning = false;
        }

        let peripheral = adapter.peripheral(&id).await?;
        peripheral.connect().await?;
        let uart = match self.open_uart(peripheral.clone()).await {
            Ok(uart) => uart,
            Err(e) => {
                let _ = peripheral.disconnect().await;
                return Err(e);
            }
        };
        self.uart = Some(uart);
        log::info!("connected to {id:?}");
        self.emit(TransportEvent::Connected);
        Ok(())
    }

    async fn open_uart(&mut self, peripheral: Peripheral) -> anyhow::Result<Uart> {
        peripheral.discover_services().await?;

        let find = |uuid: Uuid| {
            peripheral
                .characteristics()
                .into_iter()
                .find(|ch| ch.uuid == uuid)
                .ok_or_else(|| anyhow!("peripheral is missing the characteristic {uuid}"))
        };
        let tx = find(self.config.tx)?;
        let rx = find(self.config.rx)?;

        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(&rx).await?;

        Ok(Uart {
            peripheral,
            tx,
            notifications,
            lines: LineBuffer::new(),
        })
    }

    async fn write(&mut self, line: &str) -> anyhow::Result<()> {
        let (peripheral, tx) = match &self.uart {
            Some(uart) => (uart.peripheral.clone(), uart.tx.clone()),
            None => {
                log::debug!("not connected, dropping {line:?}");
                return Ok(());
            }
        };
        let buf = match frame_line(line) {
            Ok(buf) => buf,
            Err(e) => {
                log::warn!("not sending {line:?}: {e}");
                return Ok(());
            }
        };

        for chunk in buf.chunks(self.config.write_chunk.max(1)) {
            peripheral
                .write(&tx, chunk, WriteType::WithoutResponse)
                .await?;
        }
        Ok(())
    }

    fn on_notification(&mut self, n: ValueNotification) {
        if n.uuid != self.config.rx {
            return;
        }
        let Some(uart) = &mut self.uart else {
            return;
        };
        for line in uart.lines.push(&n.value) {
            match line {
                Ok(line) => {
                    let _ = self.events.send(TransportEvent::LineReceived(line));
                }
                Err(e) => log::warn!("dropping input from the device: {e}"),
            }
        }
    }

    async fn hang_up(&mut self) {
        if self.scanning {
            if let Some(adapter) = &self.adapter {
                if let Err(e) = adapter.stop_scan().await {
                    log::debug!("error stopping scan: {e}");
                }
            }
            self.scanning = false;
        }
        if let Some(uart) = self.uart.take() {
            if let Err(e) = uart.peripheral.disconnect().await {
                log::debug!("error disconnecting: {e}");
            }
        }
        self.end_session();
    }

    // Each session ends exactly once, however it ends.
    fn end_session(&mut self) {
        if std::mem::replace(&mut self.session, false) {
            self.emit(TransportEvent::Disconnected);
        }
    }
}
