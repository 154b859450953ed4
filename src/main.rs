use std::{
    process,
    sync::{Arc, OnceLock},
    time::Duration,
};

use tessw::{
    config::Config,
    core::{
        publisher::{PublishService, Publisher},
        session::PhotometerSession,
        supervisor::Supervisor,
    },
    logger::{component_directives, LoggerManager},
    print_error,
};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

fn log_photometers_table(cfg: &Config) {
    let width = cfg
        .photometers
        .iter()
        .map(|p| p.label.len())
        .max()
        .unwrap_or(0)
        .max("Label".len());

    info!("{:<width$} | Name     | Firmware | Endpoint", "Label", width = width);
    info!("{}-+-{}", "-".repeat(width), "-".repeat(40));
    for phot in &cfg.photometers {
        let firmware = if phot.legacy_firmware { "legacy" } else { "json" };
        info!(
            "{:<width$} | {:<8} | {:<8} | {}",
            phot.label,
            phot.name,
            firmware,
            phot.endpoint,
            width = width
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone(), component_directives(cfg))
        .unwrap_or_else(|e| {
            print_error!("Failed to setup Log Manager: {}", e);
            process::exit(1);
        });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting tessw version {}...", env!("CARGO_PKG_VERSION"));
    debug!("Log filter: {}", logger_manager.directives());
    debug!("{:#?}", cfg.mqtt);

    log_photometers_table(cfg);
    let sessions: Vec<Arc<PhotometerSession>> = cfg
        .photometers
        .iter()
        .map(|phot| {
            PhotometerSession::new(phot).map(Arc::new).unwrap_or_else(|e| {
                error!("Photometer {}: {}", phot.label, e);
                process::exit(1);
            })
        })
        .collect();

    info!("Starting MQTT client...");
    let manager = tessw_mqtt::MqttManager::from_config(cfg.mqtt.clone()).unwrap_or_else(|e| {
        error!("Failed to create MqttManager: {}", e);
        process::exit(1);
    });
    let instance = manager.build_and_start().await.unwrap_or_else(|e| {
        error!("Failed to build and start MQTT kernel: {}", e);
        process::exit(1);
    });
    info!("MQTT client started, topic root {}", instance.topic());

    let (register_tx, register_rx) = mpsc::unbounded_channel();
    let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let publisher: Arc<dyn Publisher> =
        Arc::new(tessw_mqtt::Publisher::new(Arc::new(instance.clone())));
    let service = PublishService::new(
        publisher,
        cfg.service.sensor_count,
        register_rx,
        telemetry_rx,
        events_tx,
    );
    let service_handle = tokio::spawn(service.run(instance.subscribe_state(), cancel.clone()));

    let supervisor = Supervisor::new(
        sessions.clone(),
        &cfg.service,
        register_tx,
        telemetry_tx,
        events_rx,
    )
    .unwrap_or_else(|e| {
        error!("Failed to create supervisor: {}", e);
        process::exit(1);
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut exit_code = 0;

    tokio::select! {
        result = supervisor.run(cancel.clone()) => match result {
            Ok(()) => warn!("Supervisor finished unexpectedly"),
            Err(e) => {
                error!("{}", e);
                exit_code = 1;
            }
        },
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown..."),
    }

    cancel.cancel();
    for session in &sessions {
        session.stop();
    }
    instance.shutdown().await;
    if tokio::time::timeout(Duration::from_secs(2), service_handle)
        .await
        .is_err()
    {
        warn!("Publish service did not stop in time");
    }
    info!("Shutdown complete");

    if exit_code != 0 {
        process::exit(exit_code);
    }
    Ok(())
}
