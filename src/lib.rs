//! tessw: serial-to-MQTT bridge for TESS-W sky brightness photometers
//!
//! Each configured photometer is read over its own serial line. A supervisor
//! polls the sensors round-robin, curates the latest reading of each one and
//! hands it to the publish service, which registers every sensor with the broker
//! and then streams readings as JSON.
//!
//! ## Modules
//!
//! * `config`: TOML configuration, defaults and validation via `validator`.
//!
//! * `core`: runtime components:
//!   - line protocols for legacy and JSON firmware
//!   - serial reader and per-photometer sessions
//!   - round-robin supervisor with registration rounds
//!   - publish service following the broker connection state
//!
//! * `logger`: `tracing` subscriber setup with console output (compact,
//!   pretty, JSON), optional systemd journald, and per-component levels.

pub mod config;
pub mod core;
pub mod logger;
