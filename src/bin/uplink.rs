use std::time::Duration;

use anyhow::Result;
use clap::{arg, value_parser, ArgAction, Command};
use log::{error, info};
use scanrelay::{
    config::{self, UplinkConfig},
    link::{self, FrameReader},
    uplink::DeliveryPipeline,
};
use tokio::time::sleep;

async fn run() -> Result<()> {
    let matches = Command::new("scanrelay uplink")
        .version("0.1")
        .arg(
            arg!(
                -c --config <PATH> "Read settings from a json config file"
            )
            .required(false),
        )
        .arg(
            arg!(
                -s --serial <PATH> "Set the serial port connected to the central node"
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
                -e --endpoint <URL> "The url barcodes are posted to"
            )
            .required(false),
        )
        .arg(
            arg!(
                --"strict-status" "Only count 2xx responses as delivered"
            )
            .action(ArgAction::SetTrue),
        )
        .get_matches();

    let mut cfg: UplinkConfig = match matches.get_one::<String>("config") {
        Some(path) => config::load(path).await?,
        None => UplinkConfig::default(),
    };
    if let Some(x) = matches.get_one::<String>("serial") {
        cfg.serial.path = x.clone();
    }
    if let Some(x) = matches.get_one::<u32>("baud") {
        cfg.serial.baud = *x;
    }
    if let Some(x) = matches.get_one::<String>("endpoint") {
        cfg.endpoint = x.clone();
    }
    if *matches.get_one::<bool>("strict-status").unwrap_or(&false) {
        cfg.strict_status = true;
    }

    let pipeline = DeliveryPipeline::from_config(&cfg)?;

    info!("entering uplink loop");
    loop {
        let port = match link::open(&cfg.serial) {
            Ok(x) => x,
            Err(e) => {
                error!("{e:#}");
                sleep(Duration::from_secs_f32(0.5)).await;
                continue;
            }
        };
        info!("uart initialized on `{}`", cfg.serial.path);
        let mut reader = FrameReader::new(port, cfg.poll_timeout(), cfg.frame_gap());

        loop {
            match reader.poll_frame().await {
                Ok(Some(barcode)) => {
                    info!("barcode: {barcode}");
                    let delivery = pipeline.deliver(&barcode).await;
                    if !delivery.delivered() {
                        error!(
                            "barcode {:?} was not delivered after {} attempts",
                            delivery.barcode,
                            delivery.attempts.len()
                        );
                    }
                    sleep(cfg.cooldown()).await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("{e:#}");
                    break;
                }
            }
        }

        sleep(Duration::from_secs_f32(0.5)).await;
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
