use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use config::FileFormat;
use tracing::{error, info};

use naspaneld::collector::scheduler::{Collector, Target};
use naspaneld::collector::system::SystemCollector;
use naspaneld::{external, Broker, Config, ConfigError, MqttMode};

static DEFAULT_CONFIG: &str = include_str!("../naspaneld.yml");

#[derive(Parser)]
#[command(name = "naspaneld")]
#[command(about = "NAS panel telemetry publisher with an embedded MQTT 3.1.1 broker")]
struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    config: Option<String>,
    /// write the default configuration to PATH and exit
    #[arg(long, value_name = "PATH")]
    generate_config: Option<PathBuf>,
    /// run a single collection cycle, print it to stdout and exit
    #[arg(short, long)]
    test: bool,
    /// log level (v: debug, vv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let commandline = CommandLine::parse();

    if let Some(path) = &commandline.generate_config {
        return match std::fs::write(path, DEFAULT_CONFIG) {
            Ok(()) => {
                println!("wrote default configuration to {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("unable to write {}: {e}", path.display());
                ExitCode::FAILURE
            }
        };
    }

    let level = match commandline.verbose {
        0 => "naspaneld=info",
        1 => "naspaneld=debug",
        _ => "naspaneld=trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(level)
        .try_init()
        .expect("initialized subscriber succesfully");

    let config = match load_config(commandline.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error = {e}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("unable to build runtime, error = {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config, commandline.test)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal error = {e}");
            ExitCode::FAILURE
        }
    }
}

/// Embedded defaults, then the config file, then NAS_PANEL_* environment
/// overrides
fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder()
        .add_source(config::File::from_str(DEFAULT_CONFIG, FileFormat::Yaml));

    if let Some(path) = path {
        builder = builder.add_source(config::File::new(path, FileFormat::Yaml));
    }

    builder = builder.add_source(config::Environment::with_prefix("NAS_PANEL").separator("_"));

    let config: Config = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

async fn run(config: Config, test: bool) -> Result<(), Box<dyn std::error::Error>> {
    let sampler = Box::new(SystemCollector::new(&config.server));
    let mut collector = Collector::new(&config, sampler)?;

    if test {
        let telemetry = collector.collect_once().await;
        println!("{}", serde_json::to_string_pretty(&telemetry)?);
        return Ok(());
    }

    log_startup(&config);

    match config.mqtt.mode {
        MqttMode::Builtin => {
            let mut broker = Broker::new(config.clone());
            broker.start().await?;

            let (link_tx, link_rx) = broker.link("naspanel-collector")?;
            // acks the router sends back to the local link go nowhere
            tokio::spawn(async move { while link_rx.recv().await.is_ok() {} });
            tokio::spawn(collector.start(Target::Broker(link_tx)));

            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            broker.stop().await;
        }
        MqttMode::External => {
            let (client, _eventloop) = external::start(&config.mqtt);
            tokio::spawn(collector.start(Target::External(client)));

            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
        }
    }

    Ok(())
}

fn log_startup(config: &Config) {
    info!("server hostname: {}", config.server.hostname);
    match config.mqtt.mode {
        MqttMode::Builtin => info!(
            "builtin broker on {}:{}",
            config.mqtt.host, config.mqtt.port
        ),
        MqttMode::External => info!(
            "external broker at {}:{}",
            config.mqtt.host, config.mqtt.port
        ),
    }
    info!("mqtt topic: {}", config.mqtt.topic);
    info!("collection interval: {}s", config.collection.interval);

    if !config.custom_collectors.is_empty() {
        info!("custom collectors: {}", config.custom_collectors.len());
        for collector in &config.custom_collectors {
            info!("  - {}", collector.name);
        }
    }
}
