//! # tessw-mqtt: broker client for the photometer publisher
//!
//! A small async MQTT client layer built on `rumqttc`. It adds:
//!
//! - **Automatic reconnection** with exponential backoff that never gives up
//! - **State monitoring** through a `watch` channel
//! - **JSON publishing** under a configurable topic root with QoS 0
//! - **Graceful shutdown** that waits for in-flight publishes
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tessw_mqtt::{Config, MqttManager, Publisher};
//!
//! let instance = MqttManager::from_config(Config::default())?
//!     .build_and_start()
//!     .await?;
//! let mut state_rx = instance.subscribe_state();
//! let publisher = Publisher::new(Arc::new(instance));
//!
//! state_rx.wait_for(|s| s.is_connected()).await?;
//! publisher.publish(&reading, "stars1/reading").await?;
//! ```
//!
//! # Reconnection
//!
//! ```text
//! Attempt 1: wait 4s
//! Attempt 2: wait 8s
//! Attempt 3: wait 16s
//! ...
//! Attempt 9+: wait 600s (capped)
//! ```
//!
//! The schedule resets every time the broker accepts a connection.

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod publisher;
pub mod state;

pub use backoff::Backoff;
pub use client::ClientBuilder;
pub use config::Config;
pub use connection::ConnectionKernel;
pub use error::TransferError;
pub use manager::{MqttInstance, MqttManager};
pub use publisher::Publisher;
pub use state::ConnectionState;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, TransferError>;
