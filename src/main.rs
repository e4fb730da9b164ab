//! mqttlink - bridge a sensor to an MQTT broker
//!
//! Usage:
//!   mqttlink [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>     Configuration file path
//!   -H, --host <HOST>       Broker host
//!   -p, --port <PORT>       Broker port
//!   --client-id <ID>        MQTT client identifier
//!   --keep-alive <SECS>     Keepalive interval in seconds
//!   -d, --device <PATH>     Sensor device, "-" for stdin
//!   -l, --log-level         Log level (error, warn, info, debug, trace)
//!   -h, --help              Print help

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::thread;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use mqttlink::bridge::{Bridge, Consumer, Message};
use mqttlink::config::Config;
use mqttlink::sensor::{LineFrameReader, Producer, SensorPoller, SerialFrameReader};
use mqttlink::supervisor::{ConnectionStatus, Supervisor};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// mqttlink - sensor to MQTT bridge
#[derive(Parser, Debug)]
#[command(name = "mqttlink")]
#[command(version)]
#[command(about = "Embedded MQTT v3.1/v3.1.1 client bridging a sensor to a broker")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broker host
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Broker port
    #[arg(short, long)]
    port: Option<u16>,

    /// MQTT client identifier
    #[arg(long)]
    client_id: Option<String>,

    /// Keepalive interval in seconds (0 disables)
    #[arg(long)]
    keep_alive: Option<u16>,

    /// Sensor device path, "-" reads line frames from stdin
    #[arg(short, long)]
    device: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Environment overrides apply even without a file
    let mut config = match args.config.as_deref().map_or_else(Config::from_env, Config::load) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI args override file config
    if let Some(host) = args.host {
        config.broker.host = host;
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    if let Some(client_id) = args.client_id {
        config.broker.client_id = client_id;
    }
    if let Some(keep_alive) = args.keep_alive {
        config.broker.keep_alive = keep_alive;
    }
    if let Some(device) = args.device {
        config.sensor.device = device;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // Setup logging - CLI overrides config
    let log_level = args.log_level.unwrap_or_else(|| {
        match config.log.level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let supervisor_config = match config.supervisor_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Cannot prepare broker connection: {}", e);
            std::process::exit(1);
        }
    };

    let bridge = Bridge::new(config.bridge.inbound_capacity, config.bridge.outbound_capacity);
    let status = ConnectionStatus::new();

    info!(
        "mqttlink starting: broker {}:{}, subscribe '{}', publish '{}'",
        config.broker.host, config.broker.port, config.topics.subscribe, config.topics.publish
    );

    // Network thread: single-threaded runtime owning supervisor, session and transport
    let network = {
        let supervisor = Supervisor::new(supervisor_config, bridge.clone()).with_status(status.clone());
        thread::Builder::new()
            .name("mqtt-client".to_string())
            .spawn(move || -> io::Result<()> {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(supervisor.run());
                Ok(())
            })?
    };

    // Consumer thread: inbound messages, strictly one at a time
    {
        let consumer = Consumer::new(bridge.inbound().clone(), |message: Message| {
            info!(
                "Received from topic [{}]: {} bytes: {}",
                message.topic(),
                message.len(),
                String::from_utf8_lossy(message.payload())
            );
        });
        thread::Builder::new()
            .name("user-recv".to_string())
            .spawn(move || consumer.run())?;
    }

    // Producer thread, plus the poller when reading a real device
    let qos = config.qos();
    if config.sensor.is_stdin() {
        let producer = Producer::new(
            LineFrameReader::new(BufReader::new(io::stdin())),
            bridge.outbound().clone(),
            status,
            config.topics.publish.clone(),
        )
        .with_qos(qos)
        .with_retain(config.topics.retain);
        thread::Builder::new()
            .name("sensor-recv".to_string())
            .spawn(move || producer.run())?;
    } else {
        let device: File = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&config.sensor.device)?;

        if config.sensor.poll_enabled {
            let poller = SensorPoller::new(device.try_clone()?, config.sensor.poll_interval);
            thread::Builder::new()
                .name("sensor-poll".to_string())
                .spawn(move || poller.run())?;
        }

        let producer = Producer::new(
            SerialFrameReader::new(BufReader::new(device)),
            bridge.outbound().clone(),
            status,
            config.topics.publish.clone(),
        )
        .with_qos(qos)
        .with_retain(config.topics.retain);
        thread::Builder::new()
            .name("sensor-recv".to_string())
            .spawn(move || producer.run())?;
    }

    match network.join() {
        Ok(result) => result?,
        Err(_) => error!("Network thread panicked"),
    }
    Ok(())
}
