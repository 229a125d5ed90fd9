// Command-line host wiring the capture -> denoise -> route pipeline.

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use quiet_lib::audio::{Denoiser, DenoiserConfig, EventBus, EventKind, InputEngine, OutputRouter};
use quiet_lib::config::Config;
use quiet_lib::log::init_logging;

#[derive(Parser, Debug)]
#[command(name = "quiet", version, about = "Real-time microphone noise reduction")]
struct Args {
    /// Start without the interactive prompt
    #[arg(long)]
    minimized: bool,

    /// Raise the log level and enable audio debug output
    #[arg(long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("quiet: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let log_dir = dirs::data_dir().map(|d| d.join("quiet").join("logs"));
    let _log_guard = init_logging(args.debug, log_dir.as_deref())?;

    let config = match Config::default_path() {
        Some(path) => Config::load_or_default(&path)?,
        None => Config::default(),
    };
    info!(
        "capture {} Hz / {} samples, output {} ch @ {} Hz",
        config.audio.sample_rate,
        config.audio.buffer_size,
        config.virtual_device.channels,
        config.virtual_device.sample_rate
    );

    let bus = Arc::new(EventBus::new());
    bus.start();

    let mut denoiser = Denoiser::new(bus.clone());
    denoiser
        .init(config.audio.sample_rate)
        .context("denoiser initialization failed")?;
    denoiser.set_config(DenoiserConfig {
        enabled: config.processing.noise_reduction_enabled,
        strength: config.processing.reduction_level,
        vad_threshold: config.processing.vad_threshold,
        adaptive: config.processing.adaptive_mode,
    });

    let router = Arc::new(OutputRouter::new(bus.clone()));
    router
        .init()
        .context("virtual output routing unavailable")?;
    router.set_format(
        config.virtual_device.sample_rate,
        config.audio.buffer_size,
        config.virtual_device.channels,
    )?;

    // Start routing as soon as the hot-plug scan lands on an endpoint.
    let routing_router = router.clone();
    bus.subscribe(EventKind::RouterConnected, move |_| {
        let _ = routing_router.start_routing();
    });
    let _ = router.start_routing();

    let mut engine = InputEngine::new(bus.clone());
    engine.init()?;
    engine.set_format(config.audio.sample_rate, config.audio.buffer_size)?;
    if let Some(device_id) = &config.audio.input_device_id {
        if let Err(e) = engine.select(device_id) {
            warn!("configured input '{}' unavailable ({}), using default", device_id, e);
        }
    }

    let callback_router = router.clone();
    engine.set_callback(move |frame| {
        if denoiser.process(frame).is_ok() {
            let _ = callback_router.route(frame);
        }
    });

    engine
        .start()
        .context("failed to start audio capture")?;

    if args.minimized {
        loop {
            std::thread::sleep(Duration::from_secs(3600));
        }
    }

    println!("quiet is running. Type 'stats' for counters, 'quit' to exit.");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match line.trim() {
            "quit" | "q" | "exit" => break,
            "stats" => {
                let stats = router.stats();
                println!(
                    "routed {} buffers, dropped {}, latency {:.3} ms, level {:.3}, input {:.3}",
                    stats.buffers_routed,
                    stats.dropped_buffers,
                    stats.ema_latency_ms,
                    stats.output_level,
                    engine.input_level()
                );
            }
            "" => {}
            other => println!("unknown command '{}'", other),
        }
    }

    engine.stop();
    engine.shutdown();
    router.shutdown();
    bus.stop();
    info!("clean shutdown");
    Ok(())
}
