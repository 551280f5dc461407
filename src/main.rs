//! inputd Daemon
//!
//! Acquires input from handheld gaming hardware (evdev controllers, IIO motion
//! sensors and hidraw gamepads) and hands every frame to a downstream
//! consumer through one bounded queue.

use std::path::PathBuf;

use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use inputd::{
    config::Config,
    evdev::EvdevSource,
    message::{Message, Payload},
    rumble::rumble_channel,
    source::DeviceSource,
    supervisor::{MessageReceiver, MessageSender, Supervisor, Timing},
    DeviceRegistry,
};

/// inputd - Input acquisition daemon for handheld controllers
#[derive(Parser, Debug)]
#[command(name = "inputd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/inputd/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// List input and hidraw devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("inputd starting...");

    let config = match &args.config {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config, using defaults: {}", e);
            Config::default()
        }
    };

    if args.list_devices {
        list_devices(&config);
        return Ok(());
    }

    let registry = DeviceRegistry::new(config.registry_capacity);
    let cancel = CancellationToken::new();
    let timing = config.timing.supervisor();
    let (queue_tx, queue_rx) = tokio::sync::mpsc::channel(config.timing.queue_capacity);

    let mut supervisors = Vec::new();
    // Held until shutdown so the rumble channel stays open.
    let mut rumble_senders = Vec::new();

    if let Some(evdev) = &config.evdev {
        let source = evdev.source(config.initial_batch_capacity, config.timing.read_timeout());
        let (rumble_tx, rumble_rx) = rumble_channel(evdev.rumble_queue);
        let supervisor = Supervisor::new(
            source,
            registry.clone(),
            config.pool_capacity,
            queue_tx.clone(),
            cancel.clone(),
            timing,
        )
        .with_rumble(rumble_rx, evdev.rumble_length_ms);
        supervisors.push(spawn_supervisor(supervisor));
        rumble_senders.push(rumble_tx);
    }

    if let Some(iio) = &config.iio {
        supervisors.push(start(iio.source(), &registry, &config, &queue_tx, &cancel, timing));
    }

    if let Some(hidraw) = &config.hidraw {
        let source = hidraw.source(config.timing.hidraw_discovery_interval());
        supervisors.push(start(source, &registry, &config, &queue_tx, &cancel, timing));
    }

    if supervisors.is_empty() {
        warn!("No device class configured, nothing to do");
        return Ok(());
    }

    // Only the supervisors hold senders now; the consumer ends when they do.
    drop(queue_tx);
    let consumer = tokio::spawn(consume(queue_rx));

    info!(classes = supervisors.len(), "inputd ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Unable to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received, exiting...");

    cancel.cancel();
    for handle in supervisors {
        if let Err(e) = handle.await {
            error!("Supervisor task panicked: {:?}", e);
        }
    }
    drop(rumble_senders);

    match consumer.await {
        Ok(count) => info!(messages = count, "Consumer drained"),
        Err(e) => error!("Consumer task panicked: {:?}", e),
    }

    Ok(())
}

fn start<S: DeviceSource>(
    source: S,
    registry: &DeviceRegistry,
    config: &Config,
    queue: &MessageSender,
    cancel: &CancellationToken,
    timing: Timing,
) -> JoinHandle<()> {
    spawn_supervisor(Supervisor::new(
        source,
        registry.clone(),
        config.pool_capacity,
        queue.clone(),
        cancel.clone(),
        timing,
    ))
}

fn spawn_supervisor<S: DeviceSource>(mut supervisor: Supervisor<S>) -> JoinHandle<()>
where
    Supervisor<S>: Send,
{
    tokio::spawn(async move { supervisor.run().await })
}

/// Log and release every message until all producers are gone
async fn consume(mut queue: MessageReceiver) -> u64 {
    let mut count = 0u64;
    while let Some(message) = queue.recv().await {
        count += 1;
        tracing::trace!("{}", describe(&message));
        message.release();
    }
    count
}

/// One-line summary of a message
fn describe(message: &Message) -> String {
    match &message.payload {
        Payload::Events(batch) => {
            let events: Vec<String> = batch
                .events()
                .iter()
                .map(|e| format!("{}:{}:{}", e.kind, e.code, e.value))
                .collect();
            format!("events [{}] flags={:?}", events.join(" "), batch.flags)
        }
        Payload::Motion(sample) => format!(
            "motion accel={:?} gyro={:?} temp={:?}",
            sample.accel, sample.gyro, sample.temperature
        ),
        Payload::Hidraw(frame) => format!("hidraw {} bytes {:02x?}", frame.len, frame.bytes()),
    }
}

/// List input and hidraw devices
fn list_devices(config: &Config) {
    let input_dir = config
        .evdev
        .as_ref()
        .map(|e| e.input_dir.clone())
        .unwrap_or_else(|| PathBuf::from(inputd::evdev::INPUT_DIR));

    println!("Scanning {} for input devices...\n", input_dir.display());
    let devices = EvdevSource::list_devices(&input_dir);
    if devices.is_empty() {
        println!("No input devices found.");
        println!("\nTroubleshooting:");
        println!("  - Check that udev rules are installed");
        println!("  - Verify user is in 'input' group");
    }
    for (i, device) in devices.iter().enumerate() {
        let ff_marker = if device.has_ff { " [FF]" } else { "" };
        println!("{}. {}{}", i + 1, device.name, ff_marker);
        println!("   Path:    {:?}", device.path);
        println!("   Vendor:  0x{:04X}", device.vendor_id);
        println!("   Product: 0x{:04X}", device.product_id);
        println!();
    }

    let hidraw = config
        .hidraw
        .as_ref()
        .map(|h| h.source(config.timing.hidraw_discovery_interval()))
        .unwrap_or_default();
    let nodes = hidraw.list_devices();
    println!("Found {} hidraw device(s):\n", nodes.len());
    for (path, id) in nodes {
        println!("   {:<16} HID_ID={}", path.display(), id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inputd::message::{EventBatch, HidrawFrame, MotionSample, RawEvent};
    use inputd::MessagePool;

    #[test]
    fn test_args_default_config() {
        let args = Args::parse_from(["inputd"]);
        assert!(args.config.is_none());
        assert!(!args.verbose);
        assert!(!args.list_devices);
    }

    #[test]
    fn test_args_config_path() {
        let args = Args::parse_from(["inputd", "--config", "/etc/inputd.json", "-v"]);
        assert_eq!(args.config, Some(PathBuf::from("/etc/inputd.json")));
        assert!(args.verbose);
    }

    #[test]
    fn test_args_list_devices() {
        let args = Args::parse_from(["inputd", "--list-devices"]);
        assert!(args.list_devices);
    }

    #[test]
    fn test_describe_events() {
        let mut batch = EventBatch::new();
        batch.push(RawEvent::new(1, 304, 1));
        batch.push(RawEvent::new(0, 0, 0));
        let text = describe(&Message::new(Payload::Events(batch)));
        assert!(text.starts_with("events [1:304:1 0:0:0]"));
    }

    #[test]
    fn test_describe_hidraw() {
        let mut frame = HidrawFrame::default();
        frame.data[..2].copy_from_slice(&[0x04, 0xff]);
        frame.len = 2;
        assert_eq!(describe(&Message::new(Payload::Hidraw(frame))), "hidraw 2 bytes [04, ff]");

        let text = describe(&Message::new(Payload::Motion(MotionSample::default())));
        assert!(text.starts_with("motion"));
    }

    #[tokio::test]
    async fn test_consumer_releases_messages() {
        let pool = MessagePool::new(3, || Payload::Hidraw(HidrawFrame::default()));
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        for _ in 0..3 {
            tx.send(pool.acquire().unwrap()).await.unwrap();
        }
        assert_eq!(pool.available(), 0);
        drop(tx);

        assert_eq!(consume(rx).await, 3);
        assert_eq!(pool.available(), 3);
    }
}
