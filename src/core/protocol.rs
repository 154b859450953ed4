//! Photometer line protocols.
//!
//! Two firmware generations exist. Legacy units print fixed-width tokens:
//!
//! ```text
//! <fH 00100><tA +2350><tO -1025><mZ +2050>     frequency in Hz
//! <fm 12345><tA +2350><tO -1025><mZ +2050>     frequency in mHz
//! ```
//!
//! Newer units print one JSON object per line:
//!
//! ```text
//! {"udp":1,"rev":2,"name":"stars1","freq":9.6,"mag":18.2,"tamb":12.3,"tsky":-3.0,"wdBm":-54,"ain":330,"ZP":20.5}
//! ```
//!
//! Lines that match neither form are ignored. [`LineProtocol`] turns lines into
//! [`Reading`]s and pushes them into its [`Consumer`] unless paused or stopped.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::{debug, trace};

static LEGACY_READING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^<f([Hm])([ +]\d{5})><tA ([+-]\d{4})><tO ([+-]\d{4})><mZ ([+-]\d{4})>")
        .expect("legacy reading pattern is valid")
});

/// Which line format a photometer speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firmware {
    Legacy,
    Json,
}

impl Firmware {
    pub fn from_legacy_flag(legacy: bool) -> Self {
        if legacy {
            Firmware::Legacy
        } else {
            Firmware::Json
        }
    }

    /// Parses one line. Readings without a positive, finite frequency have no
    /// magnitude and are dropped.
    pub fn parse(self, line: &str, received_at: OffsetDateTime) -> Option<Reading> {
        let reading = match self {
            Firmware::Legacy => parse_legacy(line, received_at),
            Firmware::Json => parse_json(line, received_at),
        }?;
        if !(reading.freq.is_finite() && reading.freq > 0.0) {
            debug!("Dropping reading with frequency {}", reading.freq);
            return None;
        }
        Some(reading)
    }
}

/// One raw sample, before curation.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Hz.
    pub freq: f64,
    /// Enclosure temperature, °C.
    pub tamb: Option<f64>,
    /// Sky temperature, °C.
    pub tsky: Option<f64>,
    pub zero_point: Option<f64>,
    pub name: Option<String>,
    pub rev: Option<u32>,
    pub received_at: OffsetDateTime,
    /// Remaining device fields, verbatim.
    pub extra: Map<String, Value>,
}

/// Current UTC time truncated to whole seconds, plus half a second.
pub fn receive_timestamp() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now - time::Duration::nanoseconds(i64::from(now.nanosecond()))
        + time::Duration::milliseconds(500)
}

fn scaled(token: &str, divisor: f64) -> Option<f64> {
    token.trim().parse::<f64>().ok().map(|v| v / divisor)
}

pub fn parse_legacy(line: &str, received_at: OffsetDateTime) -> Option<Reading> {
    let caps = LEGACY_READING.captures(line)?;
    let divisor = if &caps[1] == "H" { 1.0 } else { 1000.0 };
    Some(Reading {
        freq: scaled(&caps[2], divisor)?,
        tamb: Some(scaled(&caps[3], 100.0)?),
        tsky: Some(scaled(&caps[4], 100.0)?),
        zero_point: Some(scaled(&caps[5], 100.0)?),
        name: None,
        rev: None,
        received_at,
        extra: Map::new(),
    })
}

pub fn parse_json(line: &str, received_at: OffsetDateTime) -> Option<Reading> {
    let Ok(Value::Object(mut fields)) = serde_json::from_str::<Value>(line) else {
        return None;
    };
    let freq = fields.get("freq").and_then(Value::as_f64)?;
    fields.remove("freq");

    let mut number = |key: &str| fields.remove(key).and_then(|v| v.as_f64());
    let tamb = number("tamb");
    let tsky = number("tsky");
    let zero_point = number("ZP");
    let name = match fields.remove("name") {
        Some(Value::String(name)) => Some(name),
        _ => None,
    };
    let rev = fields
        .remove("rev")
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok());

    Some(Reading {
        freq,
        tamb,
        tsky,
        zero_point,
        name,
        rev,
        received_at,
        extra: fields,
    })
}

/// Receiving end of a [`LineProtocol`].
pub trait Consumer: Send + Sync {
    fn write(&self, reading: Reading);
}

/// Signals a consumer sends back to its producer.
pub trait FlowControl {
    fn pause(&self);
    fn resume(&self);
    /// Permanent. Lines are dropped from now on.
    fn stop(&self);
}

/// Push producer of readings for one serial line. Starts paused.
pub struct LineProtocol {
    firmware: Firmware,
    paused: AtomicBool,
    stopped: AtomicBool,
    consumer: Mutex<Option<Arc<dyn Consumer>>>,
}

impl LineProtocol {
    pub fn new(firmware: Firmware) -> Self {
        Self {
            firmware,
            paused: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            consumer: Mutex::new(None),
        }
    }

    pub fn firmware(&self) -> Firmware {
        self.firmware
    }

    /// Attaches `consumer` and resumes production.
    pub fn register_consumer(&self, consumer: Arc<dyn Consumer>) {
        *self.consumer.lock().unwrap_or_else(PoisonError::into_inner) = Some(consumer);
        self.resume();
    }

    pub fn is_producing(&self) -> bool {
        !self.paused.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    /// Handles one line without its terminator. Bytes are decoded as Latin-1.
    ///
    /// Returns `true` if a reading was handed to the consumer.
    pub fn line_received(&self, raw: &[u8]) -> bool {
        let received_at = receive_timestamp();
        let line: String = raw.iter().map(|&b| char::from(b)).collect();
        debug!("<== [{:02}] {}", line.len(), line);

        if !self.is_producing() {
            trace!(
                paused = self.paused.load(Ordering::Acquire),
                stopped = self.stopped.load(Ordering::Acquire),
                "Producer not active, dropping line"
            );
            return false;
        }

        let Some(reading) = self.firmware.parse(&line, received_at) else {
            return false;
        };
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match consumer {
            Some(consumer) => {
                trace!("Parsed {:?}", reading);
                consumer.write(reading);
                true
            }
            None => false,
        }
    }
}

impl FlowControl for LineProtocol {
    fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::buffer::SingleSlot;

    fn at() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH
    }

    impl Consumer for SingleSlot<Reading> {
        fn write(&self, reading: Reading) {
            self.put(reading);
        }
    }

    #[test]
    fn test_legacy_hz_line() {
        let reading = parse_legacy("<fH 00100><tA +2350><tO -1025><mZ +2050>", at()).unwrap();
        assert_eq!(reading.freq, 100.0);
        assert_eq!(reading.tamb, Some(23.5));
        assert_eq!(reading.tsky, Some(-10.25));
        assert_eq!(reading.zero_point, Some(20.5));
        assert!(reading.extra.is_empty());
    }

    #[test]
    fn test_legacy_mhz_line() {
        let reading = parse_legacy("<fm+12345><tA -0050><tO +0000><mZ +2044>trailing", at()).unwrap();
        assert_eq!(reading.freq, 12.345);
        assert_eq!(reading.tamb, Some(-0.5));
        assert_eq!(reading.zero_point, Some(20.44));
    }

    #[test]
    fn test_legacy_rejects_other_lines() {
        for line in [
            "",
            "<fH 100><tA +2350><tO -1025><mZ +2050>",
            " <fH 00100><tA +2350><tO -1025><mZ +2050>",
            "<fX 00100><tA +2350><tO -1025><mZ +2050>",
            "<fH-00100><tA +2350><tO -1025><mZ +2050>",
            "{\"freq\": 10.0}",
        ] {
            assert!(parse_legacy(line, at()).is_none(), "accepted {line:?}");
        }
    }

    #[test]
    fn test_json_line() {
        let line = r#"{"udp":1,"rev":2,"name":"stars1","freq":9.6,"tamb":12.3,"tsky":-3.0,"wdBm":-54,"ain":330,"ZP":20.5}"#;
        let reading = parse_json(line, at()).unwrap();
        assert_eq!(reading.freq, 9.6);
        assert_eq!(reading.name.as_deref(), Some("stars1"));
        assert_eq!(reading.rev, Some(2));
        assert_eq!(reading.zero_point, Some(20.5));
        assert_eq!(reading.tamb, Some(12.3));
        assert_eq!(reading.extra.get("wdBm"), Some(&json!(-54)));
        assert_eq!(reading.extra.get("udp"), Some(&json!(1)));
        assert!(reading.extra.get("freq").is_none());
    }

    #[test]
    fn test_json_ignores_non_objects_and_garbage() {
        for line in ["[1,2,3]", "42", "\"text\"", "{not json", "{\"tamb\": 10.0}", "{\"freq\": \"fast\"}"] {
            assert!(parse_json(line, at()).is_none(), "accepted {line:?}");
        }
    }

    #[test]
    fn test_non_positive_frequency_is_dropped() {
        assert!(Firmware::Legacy
            .parse("<fH 00000><tA +2350><tO -1025><mZ +2050>", at())
            .is_none());
        assert!(Firmware::Legacy
            .parse("<fm 00000><tA +2350><tO -1025><mZ +2050>", at())
            .is_none());
        assert!(Firmware::Json.parse(r#"{"freq": 0}"#, at()).is_none());
        assert!(Firmware::Json.parse(r#"{"freq": -3.5}"#, at()).is_none());
        assert_eq!(
            Firmware::Json.parse(r#"{"freq": 0.01}"#, at()).unwrap().freq,
            0.01
        );
    }

    #[test]
    fn test_zero_frequency_line_never_reaches_consumer() {
        let protocol = LineProtocol::new(Firmware::Legacy);
        let slot = Arc::new(SingleSlot::<Reading>::new());
        protocol.register_consumer(slot.clone());

        assert!(!protocol.line_received(b"<fH 00000><tA +2350><tO -1025><mZ +2050>"));
        assert!(slot.is_empty());
    }

    #[test]
    fn test_receive_timestamp_is_half_second() {
        let ts = receive_timestamp();
        assert_eq!(ts.nanosecond(), 500_000_000);
    }

    #[test]
    fn test_protocol_starts_paused() {
        let protocol = LineProtocol::new(Firmware::Legacy);
        assert!(!protocol.is_producing());
        assert!(!protocol.line_received(b"<fH 00100><tA +2350><tO -1025><mZ +2050>"));
    }

    #[test]
    fn test_protocol_delivers_to_consumer() {
        let protocol = LineProtocol::new(Firmware::Legacy);
        let slot = Arc::new(SingleSlot::<Reading>::new());
        protocol.register_consumer(slot.clone());
        assert!(protocol.is_producing());

        assert!(protocol.line_received(b"<fH 00100><tA +2350><tO -1025><mZ +2050>"));
        assert!(!protocol.line_received(b"garbage"));
        assert_eq!(slot.take().unwrap().freq, 100.0);
    }

    #[test]
    fn test_protocol_pause_and_stop_drop_lines() {
        let protocol = LineProtocol::new(Firmware::Json);
        let slot = Arc::new(SingleSlot::<Reading>::new());
        protocol.register_consumer(slot.clone());

        protocol.pause();
        assert!(!protocol.line_received(br#"{"freq": 1.0}"#));
        protocol.resume();
        assert!(protocol.line_received(br#"{"freq": 2.0}"#));
        protocol.stop();
        protocol.resume();
        assert!(!protocol.line_received(br#"{"freq": 3.0}"#));

        assert_eq!(slot.take().unwrap().freq, 2.0);
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_latin1_decoding() {
        let protocol = LineProtocol::new(Firmware::Json);
        let slot = Arc::new(SingleSlot::<Reading>::new());
        protocol.register_consumer(slot.clone());

        assert!(protocol.line_received(b"{\"freq\": 5.0, \"site\": \"Sierra \xd1\"}"));
        let reading = slot.take().unwrap();
        assert_eq!(reading.extra.get("site"), Some(&json!("Sierra Ñ")));
    }
}
