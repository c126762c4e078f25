use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use aperture_capture::SyntheticSensor;
use aperture_link::LoopbackAttachment;
use aperture_ops::init_tracing;
use aperture_orchestrator::{Appliance, Peripherals};
use aperture_types::{
    config::{ApertureConfig, GrabPolicy},
    frame::FrameSize,
};
use clap::Parser;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "configs/aperture.toml";

/// Single-camera MJPEG streaming appliance.
#[derive(Debug, Parser)]
#[command(name = "aperture", version, about)]
struct Args {
    /// Configuration file (TOML).
    #[arg(long, env = "APERTURE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Sensor frame size, e.g. QVGA, VGA, SVGA. Unknown names fall back to SVGA.
    #[arg(long)]
    frame_size: Option<String>,

    /// Which frame `acquire` hands out: `when_empty` or `latest`.
    #[arg(long)]
    grab_policy: Option<GrabPolicy>,

    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    if let Some(level) = &args.log_level {
        config.ops.log_level = level.clone();
    }
    init_tracing(&config.ops)?;
    apply_overrides(&mut config, &args);
    config.validate().context("invalid configuration")?;

    let cancel = CancellationToken::new();
    let (attachment, link_events) =
        LoopbackAttachment::new(advertised_address(&config.http.bind_addr), Duration::from_millis(50));
    let peripherals = Peripherals {
        camera: Box::new(SyntheticSensor::new()),
        attachment: Arc::new(attachment),
        link_events,
    };

    let appliance = Appliance::new(config, cancel.clone());
    let running = appliance.start(peripherals).await?;

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received"),
            Err(err) => warn!("Unable to listen for Ctrl-C: {err}"),
        }
        cancel.cancel();
    });

    running.run().await?;
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ApertureConfig> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
    if !path.exists() {
        eprintln!(
            "Config file '{}' not found. Falling back to internal defaults.",
            path.display()
        );
        return Ok(ApertureConfig::default());
    }
    ApertureConfig::from_file(path)
        .with_context(|| format!("failed to load config from '{}'", path.display()))
}

fn apply_overrides(config: &mut ApertureConfig, args: &Args) {
    if let Some(port) = args.port {
        config.http.port = port;
    }
    if let Some(name) = &args.frame_size {
        config.camera.frame_size = FrameSize::from_name_lenient(name);
    }
    if let Some(policy) = args.grab_policy {
        config.camera.grab_policy = policy;
    }
}

/// Address the loopback link reports; a wildcard bind is reachable on localhost.
fn advertised_address(bind_addr: &str) -> IpAddr {
    match bind_addr.parse::<IpAddr>() {
        Ok(addr) if !addr.is_unspecified() => addr,
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}
