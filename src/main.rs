use std::process::exit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

use biorecorder_rs::logging::init_logging_with;
use biorecorder_rs::{Commutator, DeviceConfig, DeviceSession, DeviceType, SampleRate};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Variant {
    /// 2-channel recorder
    Two,
    /// 8-channel recorder
    Eight,
}

impl From<Variant> for DeviceType {
    fn from(variant: Variant) -> Self {
        match variant {
            Variant::Two => DeviceType::TwoChannel,
            Variant::Eight => DeviceType::EightChannel,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "biorecorder-demo", about = "Record from a biopotential recorder and print records")]
struct Args {
    /// Serial port (e.g., /dev/ttyUSB0 or /dev/rfcomm0)
    port: String,
    /// Hardware variant of the device
    #[arg(short, long, value_enum, default_value = "eight")]
    device: Variant,
    /// Sample rate in Hz (500, 1000 or 2000)
    #[arg(short, long, default_value_t = 500)]
    rate: u32,
    /// How long to record, in seconds
    #[arg(short, long, default_value_t = 10)]
    seconds: u64,
    /// Report battery charge
    #[arg(long)]
    battery: bool,
    /// Report electrode contact on every channel
    #[arg(long)]
    lead_off: bool,
    /// Feed the internal test signal into every channel
    #[arg(long)]
    test_signal: bool,
    /// Print every Nth record
    #[arg(long, default_value_t = 100)]
    every: usize,
    /// Log level (overrides BIORECORDER_LOG / RUST_LOG)
    #[arg(long)]
    log: Option<String>,
}

fn main() {
    let args = Args::parse();
    init_logging_with(args.log.as_deref());
    if let Err(e) = run(args) {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn build_config(args: &Args) -> Result<DeviceConfig> {
    let mut config = DeviceConfig::new(args.device.into());
    config.sample_rate = SampleRate::from_hz(args.rate)?;
    config.battery_voltage_enabled = args.battery;
    for i in 0..config.channel_count() {
        if let Some(ch) = config.channel_mut(i) {
            ch.lead_off_enabled = args.lead_off;
            if args.test_signal {
                ch.commutator = Commutator::TestSignal;
            }
        }
    }
    Ok(config)
}

fn run(args: Args) -> Result<()> {
    let config = build_config(&args)?;

    println!("Opening {} ({} device, {} Hz)", args.port, config.device_type(), args.rate);
    let session = DeviceSession::open_serial(&args.port)
        .with_context(|| format!("cannot open {}", args.port))?;

    let every = args.every.max(1);
    let records = Arc::new(AtomicUsize::new(0));
    let counter = records.clone();
    session.set_data_listener(move |samples, number| {
        if counter.fetch_add(1, Ordering::Relaxed) % every == 0 {
            println!("[{number:>8}] {samples:?}");
        }
    });
    session.set_message_listener(|kind, detail| println!("message: {kind:?} ({detail})"));
    session.set_battery_listener(|percentage| log::debug!("battery {percentage}%"));
    session.set_lead_off_listener(|mask| log::debug!("lead-off {mask:?}"));

    println!("Starting recording...");
    session
        .start_recording(&config)?
        .wait()
        .context("device did not start recording")?;

    thread::sleep(Duration::from_secs(args.seconds));

    println!("Stopping...");
    session.stop()?;
    session.disconnect()?;
    println!("Done: {} records.", records.load(Ordering::Relaxed));
    Ok(())
}
