use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::mpsc;

mod config;
mod device;
mod dispatcher;
mod error;
mod heartbeat;
mod link;
mod manager;
mod manufacturer;
mod messages;
mod mqtt;
mod protocol;

use crate::config::AppConfig;
use crate::device::DeviceOptions;
use crate::dispatcher::{DispatchConfig, Dispatcher};
use crate::heartbeat::Heartbeat;
use crate::link::SerialConnector;
use crate::manager::{Manager, ManagerOptions};
use crate::mqtt::MqttClient;

/// Bridges serial BLE observer modules to MQTT.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

fn init_logging(config: &AppConfig) {
    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => builder.parse_filters(&filters),
        Err(_) => builder.parse_filters(&config.log_level()),
    };
    builder.init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;
    init_logging(&config);

    let scan = config.scan();
    let options = ManagerOptions {
        reconnect_delay: scan.reconnect_delay(),
        event_queue_capacity: scan.event_queue_capacity(),
        device: DeviceOptions {
            queue_capacity: scan.device_queue_capacity(),
            ..DeviceOptions::default()
        },
    };
    let (manager, mut events) = Manager::new(SerialConnector, config.device_configs(), options);

    let (mqtt_client, mut eventloop) = MqttClient::new(&config.mqtt);
    let (command_tx, mut command_rx) = mpsc::channel::<String>(16);
    let mqtt_loop = {
        let client = mqtt_client.clone();
        tokio::spawn(async move { client.event_loop(&mut eventloop, command_tx).await })
    };

    if let Err(e) = manager.initialize_all().await {
        let _ = manager.disconnect_all().await;
        mqtt_loop.abort();
        return Err(e).context("bringing up devices");
    }
    for device in manager.devices_info() {
        info!(
            "Device {} on {} ready (scanning: {})",
            device.device_id, device.serial_path, device.scanning
        );
    }

    let heartbeat = Heartbeat::new(manager.clone(), manager.sink(), scan.heartbeat_interval());
    heartbeat.start();

    let dispatcher = Dispatcher::new(
        manager.clone(),
        DispatchConfig {
            rssi: config.rssi(),
            use_config_rssi: config.use_config_rssi(),
        },
    );
    let commands = {
        let client = mqtt_client.clone();
        tokio::spawn(async move {
            while let Some(raw) = command_rx.recv().await {
                let response = dispatcher.handle(&raw).await;
                if let Err(e) = client.publish_response(&response).await {
                    error!("Error publishing response: {}", e);
                }
            }
        })
    };

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if let Err(e) = mqtt_client.publish_event(&event).await {
                        warn!("Error publishing event: {}", e);
                    }
                }
                None => break,
            },
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    error!("Error waiting for shutdown signal: {}", e);
                }
                info!("Shutting down");
                break;
            }
        }
    }

    heartbeat.stop().await;
    commands.abort();
    let result = manager.disconnect_all().await;
    if let Err(e) = mqtt_client.disconnect().await {
        warn!("Error disconnecting MQTT client: {}", e);
    }
    mqtt_loop.abort();

    result.context("disconnecting devices")
}
