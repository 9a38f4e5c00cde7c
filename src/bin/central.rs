use std::time::Duration;

use anyhow::{bail, Result};
use clap::{arg, value_parser, ArgAction, Command};
use log::{error, info};
use scanrelay::{
    central::{BluezStack, CentralSession, GattTargets, NotificationRelay},
    config::{self, CentralConfig, SerialConfig},
    link,
};
use tokio::{
    sync::mpsc,
    time::{interval, sleep, MissedTickBehavior},
};

/// Keep the serial side alive, reopening the port after a write error.
async fn uplink_writer(
    serial: SerialConfig,
    mut frames: mpsc::Receiver<Vec<u8>>,
    write_timeout: Duration,
) {
    loop {
        match link::open(&serial) {
            Ok(mut port) => {
                info!("uart initialized on `{}`", serial.path);
                match link::drain_uplink(&mut frames, &mut port, write_timeout).await {
                    Ok(()) => return,
                    Err(e) => error!("{e:#}"),
                }
            }
            Err(e) => error!("uart initialization failed: {e:#}"),
        }
        sleep(Duration::from_secs_f32(0.5)).await;
    }
}

async fn run() -> Result<()> {
    let matches = Command::new("scanrelay central")
        .version("0.1")
        .arg(
            arg!(
                -c --config <PATH> "Read settings from a json config file"
            )
            .required(false),
        )
        .arg(
            arg!(
                -s --serial <PATH> "Set the serial port connected to the uplink node"
            )
            .required(false),
        )
        .arg(
            arg!(
                -b --baud <BAUD> "Set the baud rate for the serial port"
            )
            .required(false)
            .value_parser(value_parser!(u32)),
        )
        .arg(
            arg!(
                -p --peer <ADDRESS> "Connect to this advertised address, e.g. `AB:2B:00:02:C7:9D (public)`"
            )
            .required(false)
            .action(ArgAction::Append),
        )
        .get_matches();

    let mut cfg: CentralConfig = match matches.get_one::<String>("config") {
        Some(path) => config::load(path).await?,
        None => CentralConfig::default(),
    };
    if let Some(x) = matches.get_one::<String>("serial") {
        cfg.serial.path = x.clone();
    }
    if let Some(x) = matches.get_one::<u32>("baud") {
        cfg.serial.baud = *x;
    }
    if let Some(peers) = matches.get_many::<String>("peer") {
        cfg.peers = peers.map(|x| (x.clone(), "command line".to_string())).collect();
    }
    if cfg.peers.is_empty() {
        bail!("no peer addresses configured");
    }

    let (uplink, frames) = mpsc::channel(cfg.uplink_queue.max(1));
    tokio::spawn(uplink_writer(
        cfg.serial.clone(),
        frames,
        cfg.write_timeout(),
    ));

    let (events_send, mut events) = mpsc::unbounded_channel();
    let stack = BluezStack::new(events_send).await?;

    let targets = GattTargets {
        service: cfg.service_uuid,
        characteristic: cfg.characteristic_uuid,
    };
    let mut session = CentralSession::new(
        stack,
        cfg.peers.clone(),
        targets,
        NotificationRelay::new(uplink),
    );

    let mut resume = interval(cfg.rescan_interval());
    resume.set_missed_tick_behavior(MissedTickBehavior::Delay);

    session.start();

    info!("entering central loop");
    loop {
        tokio::select! {
            evt = events.recv() => match evt {
                Some(evt) => session.handle(evt),
                None => bail!("bluetooth stack quit"),
            },
            _ = resume.tick() => session.resume(),
        }
    }
}

fn main() -> Result<()> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(run())
}
