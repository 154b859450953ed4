//! Logging initialization.
//!
//! `LoggerManager` validates the `[logger]` section and installs the global
//! `tracing` subscriber with a console layer and/or a journald layer.
//!
//! Filtering follows `RUST_LOG` when it is set. Otherwise the filter is composed
//! from the component levels in the configuration (see [`component_directives`]):
//! the service level applies to this crate, the broker levels apply to the MQTT
//! crates, and each photometer's levels apply inside its `sensor` and `serial`
//! spans.

use std::io;

use thiserror::Error;
use tracing_subscriber::{fmt, fmt::format::FmtSpan, prelude::*, EnvFilter, Layer};
use validator::{Validate, ValidationErrors};

use crate::{
    config::{
        logger::{ConsoleConfig, LogFormat, LoggerConfig},
        Config,
    },
    print_info, print_warn,
};

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    /// IO error, typically while opening the journald socket.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    #[error("Failed to initialize journald logger while console output is enabled. Please check your configuration.")]
    JournaldFailedWithConsoleEnabled,

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

/// Builds the default filter from the configured component levels.
///
/// Sensor levels are span directives. Inside a sensor's spans an event passes if
/// either the span directive or the `tessw=` target level allows it, so a sensor
/// level can make that sensor louder than the service but never quieter.
///
/// ```text
/// warn,tessw=info,tessw_mqtt=info,rumqttc=warn,[sensor{label=phot1}]=info,[serial{label=phot1}]=warn
/// ```
pub fn component_directives(config: &Config) -> String {
    let mut directives = vec![
        config.logger.level.to_lowercase(),
        format!("tessw={}", config.service.log_level.to_lowercase()),
        format!("tessw_mqtt={}", config.mqtt.log_level.to_lowercase()),
        format!("rumqttc={}", config.mqtt.log_messages.to_lowercase()),
    ];
    for phot in &config.photometers {
        directives.push(format!(
            "[sensor{{label={}}}]={}",
            phot.label,
            phot.log_level.to_lowercase()
        ));
        directives.push(format!(
            "[serial{{label={}}}]={}",
            phot.label,
            phot.log_messages.to_lowercase()
        ));
    }
    directives.join(",")
}

pub struct LoggerManager {
    config: LoggerConfig,
    directives: String,
}

impl LoggerManager {
    /// # Errors
    ///
    /// Returns `LoggerError::ValidationError` if the `[logger]` section is invalid.
    pub fn new(config: LoggerConfig, directives: impl Into<String>) -> Result<Self, LoggerError> {
        config.validate()?;
        Ok(LoggerManager {
            config,
            directives: directives.into(),
        })
    }

    pub fn directives(&self) -> &str {
        &self.directives
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.directives))
    }

    /// Installs the global subscriber. Call once, before anything logs.
    ///
    /// # Errors
    ///
    /// Fails when no layer could be built, or when journald is requested alongside
    /// the console and cannot be reached.
    pub fn init(&mut self) -> Result<(), LoggerError> {
        let mut layers: Vec<BoxedLayer> = Vec::new();

        if let Some(console) = self.config.console.as_ref().filter(|c| c.enabled) {
            layers.push(console_layer(console, self.filter()));
        }

        if let Some(journald) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match tracing_journald::layer() {
                Ok(layer) => {
                    let layer = layer.with_syslog_identifier(journald.identifier.clone());
                    layers.push(layer.with_filter(self.filter()).boxed());
                    print_info!(
                        "Systemd journald logger initialized with identifier: {}",
                        journald.identifier
                    );
                }
                Err(e) => {
                    print_warn!("Failed to initialize systemd journald logger: {}", e);
                    if !layers.is_empty() {
                        return Err(LoggerError::JournaldFailedWithConsoleEnabled);
                    }
                }
            }
        }

        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }
        tracing_subscriber::registry().with(layers).try_init()?;
        Ok(())
    }
}

fn console_layer(config: &ConsoleConfig, filter: EnvFilter) -> BoxedLayer {
    let span_events = if config.show_spans {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_target(config.show_target)
        .with_thread_ids(config.show_thread_ids)
        .with_span_events(span_events)
        .with_writer(io::stdout);

    match config.format {
        LogFormat::Json => layer.json().with_filter(filter).boxed(),
        LogFormat::Pretty => layer
            .pretty()
            .with_ansi(config.ansi_colors)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => layer
            .compact()
            .with_ansi(config.ansi_colors)
            .with_filter(filter)
            .boxed(),
    }
}
