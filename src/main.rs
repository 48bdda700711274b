//! vdocap demo: pulls frames from the synthetic producer through a capture session

use std::path::{Path, PathBuf};

use color_eyre::{eyre::eyre, Result};
use image::ExtendedColorType;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vdocap::capture::{MonotonicClock, SyntheticSource};
use vdocap::{CaptureSession, Config, Image};

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("vdocap launching...");
    info!("Capture config: {:?}", config.capture);

    let source = SyntheticSource::new(MonotonicClock).with_pitch_align(64);
    let probe = source.probe();
    let mut session = CaptureSession::from_config(source, &config.capture);

    // Hand the previous image back every time so its buffer is recycled
    let mut image = None;
    for _ in 0..config.demo.frames {
        session.read(&mut image)?;
    }

    if let Some(frame) = &image {
        info!(
            "Last frame #{}: {}x{}x{} stride {}",
            frame.sequence(),
            frame.width(),
            frame.height(),
            frame.channels(),
            frame.stride()
        );
        if let Some(path) = &config.demo.snapshot {
            save_snapshot(path, frame)?;
            info!("Snapshot written to {}", path.display());
        }
    }

    info!("Session metrics: {:?}", session.metrics());
    session.close()?;
    info!(
        "vdocap shutting down: {} pulled, {} released",
        probe.pulled(),
        probe.released()
    );
    Ok(())
}

fn save_snapshot(path: &Path, frame: &Image) -> Result<()> {
    let color = match frame.channels() {
        3 => ExtendedColorType::Rgb8,
        1 => ExtendedColorType::L8,
        n => return Err(eyre!("Cannot save {}-channel image", n)),
    };
    image::save_buffer(path, &frame.to_packed(), frame.width(), frame.height(), color)?;
    Ok(())
}
