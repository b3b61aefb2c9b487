use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::anyhow;
use clap::Parser;
use indicatif::{MultiProgress, ProgressBar};
use lathser_feeder::{
    connection::{BleConfig, BleTransport},
    simulator::SimulatedDevice,
    transport::{event_channel, EventReceiver},
    Batch, ConnectionState, Link, LinkConfig, LinkEvent, SendError, Transport,
};
use reedline::{DefaultPrompt, Prompt, Reedline};
use tokio::sync::mpsc;

const TICK: Duration = Duration::from_millis(50);

#[derive(Parser)]
struct Args {
    /// Send the commands in this file as a single batch, instead of prompting for them.
    path: Option<PathBuf>,

    /// Only connect to a peripheral advertising this name.
    #[arg(long)]
    name: Option<String>,

    /// Fail a command if it isn't acknowledged within this many milliseconds.
    #[arg(long)]
    ack_timeout_ms: Option<u64>,

    /// Talk to a simulated device instead of real hardware.
    #[arg(long)]
    simulate: bool,
}

#[derive(Debug)]
enum Error {
    Exit,
    Err(anyhow::Error),
}

impl<E> From<E> for Error
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Error::Err(e.into())
    }
}

type Result<T> = std::result::Result<T, Error>;

async fn connect(link: &Link) -> Result<()> {
    let progress = MultiProgress::new();
    let bar = progress.add(ProgressBar::new_spinner().with_message("Searching..."));
    bar.enable_steady_tick(TICK);

    // A hang-up from a previous attempt may still be on its way.
    link.wait_for_state(ConnectionState::NotConnected).await?;
    let mut state = link.watch_state();
    link.scan_for_peripherals();
    loop {
        state.changed().await.map_err(|_| SendError::LinkClosed)?;
        let current = *state.borrow_and_update();
        match current {
            ConnectionState::Scanning => {}
            ConnectionState::Connected => break,
            ConnectionState::NotConnected => {
                bar.abandon_with_message("failed!");
                Err(anyhow!("couldn't connect"))?;
            }
        }
    }
    bar.finish_with_message("connected!");
    Ok(())
}

async fn send_file(link: &Link, path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)?;
    let batch = Batch::from_script(&text);
    if batch.is_empty() {
        Err(anyhow!("{} has no commands", path.display()))?;
    }

    let bar = ProgressBar::new_spinner().with_message(format!("Sending {} lines...", batch.len()));
    bar.enable_steady_tick(TICK);
    let response = link.send_lines(batch).await?;
    bar.finish_with_message("done!");

    if !response.is_empty() {
        println!("{response}");
    }
    Ok(())
}

fn read_cmd(reed: &mut Reedline, prompt: &dyn Prompt) -> Result<String> {
    let s = reed.read_line(prompt)?;
    match s {
        reedline::Signal::Success(s) => Ok(s),
        reedline::Signal::CtrlC | reedline::Signal::CtrlD => Err(Error::Exit),
    }
}

async fn command_mode(link: &Link) -> Result<()> {
    let mut reed = Reedline::create();
    let prompt = DefaultPrompt::default();
    loop {
        let s = read_cmd(&mut reed, &prompt)?;
        let s = s.trim();

        if s.is_empty() {
            continue;
        } else if s == "quit" {
            break;
        }

        match link.send_string(s).await {
            Ok(response) if response.is_empty() => eprintln!("ok"),
            Ok(response) => println!("{response}"),
            Err(e @ (SendError::Disconnected | SendError::NotConnected)) => Err(e)?,
            Err(e) => eprintln!("error: {e}"),
        }
    }

    Ok(())
}

async fn handle_connection(link: &Link, args: &Args) -> Result<()> {
    connect(link).await?;

    if let Some(path) = &args.path {
        send_file(link, path).await
    } else {
        command_mode(link).await
    }
}

async fn run<T: Transport>(
    transport: T,
    events: EventReceiver<T::Peripheral>,
    args: &Args,
) -> anyhow::Result<()> {
    let config = LinkConfig {
        ack_timeout: args.ack_timeout_ms.map(Duration::from_millis),
    };
    let (delegate, mut link_events) = mpsc::unbounded_channel();
    let link = Link::spawn(transport, events, delegate, config);

    tokio::spawn(async move {
        while let Some(ev) = link_events.recv().await {
            match ev {
                LinkEvent::Message(msg) => eprintln!("device: {msg}"),
                LinkEvent::StateChanged(state) => log::info!("connection: {state:?}"),
            }
        }
    });

    let result = loop {
        match handle_connection(&link, args).await {
            // Resending a partly sent file is not safe, so only the prompt reconnects.
            Err(Error::Err(e)) if args.path.is_none() => {
                eprintln!("lost connection, restarting (cause: {e})");
                link.disconnect();
            }
            Err(Error::Err(e)) => break Err(e),
            Ok(()) | Err(Error::Exit) => {
                eprintln!("exiting...");
                break Ok(());
            }
        }
    };

    link.disconnect();
    link.wait_for_state(ConnectionState::NotConnected).await?;
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    if args.simulate {
        let device = SimulatedDevice::new();
        run(device.transport, device.events, &args).await
    } else {
        let (events_tx, events_rx) = event_channel();
        let config = BleConfig {
            local_name: args.name.clone(),
            ..BleConfig::default()
        };
        let (transport, worker) = BleTransport::spawn(config, events_tx);
        let result = run(transport, events_rx, &args).await;
        // The link is gone by now, so the worker is hanging up and will exit.
        if let Err(e) = worker.await {
            log::warn!("bluetooth task failed: {e}");
        }
        result
    }
}
