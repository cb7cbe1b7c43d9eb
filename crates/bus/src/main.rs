mod cli;
mod config;
mod signals;

use std::process::ExitCode;

use bus_core::{Connector, Controller, Interface, Proxy, Segment, ThreadedResolver, Transport, bind_listener};
use bus_utils::{ThreadPriority, thread_boot};
use clap::Parser;
use config::{Config, Role};
use signals::{SignalEvent, SignalWatcher};
use tracing::{error, info};

/// The three role-specific connectors, dispatched on at startup instead of
/// at compile time: one binary serves every role.
enum Node {
    Controller(Connector<Controller>),
    Segment(Connector<Segment>),
    Proxy(Connector<Proxy>),
}

impl Node {
    fn tick(&mut self) -> std::io::Result<()> {
        match self {
            Self::Controller(c) => c.tick(),
            Self::Segment(c) => c.tick(),
            Self::Proxy(c) => c.tick(),
        }
    }

    fn drain(&mut self) {
        match self {
            Self::Controller(c) => c.drain(),
            Self::Segment(c) => c.drain(),
            Self::Proxy(c) => c.drain(),
        }
    }

    fn is_draining(&self) -> bool {
        match self {
            Self::Controller(c) => c.is_draining(),
            Self::Segment(c) => c.is_draining(),
            Self::Proxy(c) => c.is_draining(),
        }
    }

    fn is_idle(&self) -> bool {
        match self {
            Self::Controller(c) => c.is_idle(),
            Self::Segment(c) => c.is_idle(),
            Self::Proxy(c) => c.is_idle(),
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = cli::Cli::parse();
    let path = cli.file.unwrap_or_else(|| "bus.ini".into());
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, path = %path.display(), "failed to load config");
            return ExitCode::from(1);
        }
    };

    thread_boot(None, ThreadPriority::OSDefault);

    let mut node = match build_node(&config) {
        Ok(node) => node,
        Err(err) => {
            error!(%err, "failed to bind node");
            return ExitCode::from(1);
        }
    };

    let mut signals = match SignalWatcher::new() {
        Ok(s) => s,
        Err(err) => {
            error!(%err, "failed to install signal handlers");
            return ExitCode::from(1);
        }
    };

    let mut exit_code: Option<i32> = None;
    loop {
        if let Some(event) = signals.poll() {
            match event {
                SignalEvent::Terminate(sig) => return ExitCode::from(sig as u8),
                SignalEvent::Drain(sig) => {
                    info!(signal = sig, "draining");
                    node.drain();
                    exit_code = Some(sig);
                }
            }
        }

        if let Err(err) = node.tick() {
            error!(%err, "tick failed");
            return ExitCode::from(1);
        }

        if node.is_draining() && node.is_idle() {
            break;
        }
    }

    ExitCode::from(exit_code.unwrap_or(0) as u8)
}

fn transport_of(uri: &str) -> Transport {
    if uri.starts_with("unix://") { Transport::Unix } else { Transport::Tcp }
}

fn build_node(config: &Config) -> std::io::Result<Node> {
    let resolver = Box::new(ThreadedResolver::spawn());
    let north_ifaces: Vec<Interface> =
        config.bind.iter().map(|uri| Interface::new(uri.clone(), transport_of(uri))).collect();
    let south_ifaces: Vec<Interface> =
        config.backend.iter().map(|uri| Interface::new(uri.clone(), transport_of(uri))).collect();
    let mode = config.mode;

    macro_rules! build {
        ($variant:ident) => {{
            let mut connector = Connector::new(mode, north_ifaces, south_ifaces, resolver)?;
            for (idx, uri) in config.bind.iter().enumerate() {
                let (listener, _transport) = bind_listener(uri)?;
                connector.listen(idx, listener)?;
            }
            Node::$variant(connector)
        }};
    }

    Ok(match config.role {
        Role::Controller => build!(Controller),
        Role::Segment => build!(Segment),
        Role::Proxy => build!(Proxy),
    })
}
