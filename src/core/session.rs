//! One photometer on one serial line.
//!
//! A session owns the serial reader, the single-slot buffer the reader writes
//! into, and the registration info cache. The supervisor pulls readings out of
//! the buffer and asks the session to curate them.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::{
    buffer::SingleSlot,
    error::SessionError,
    message::{RegistrationInfo, Telemetry, PROTOCOL_REVISION},
    protocol::{Consumer, Firmware, FlowControl, LineProtocol, Reading},
    serial::{spawn_reader, SerialEndpoint},
};
use crate::config::photometer::PhotometerConfig;

/// How long new firmware gets to send a first reading.
pub const INFO_TIMEOUT: Duration = Duration::from_secs(60);

/// Configured identity, used as-is for legacy firmware and as a fallback otherwise.
#[derive(Debug, Clone)]
struct Identity {
    name: String,
    mac: String,
    zero_point: f64,
}

impl Identity {
    fn info_from(&self, reading: &Reading) -> RegistrationInfo {
        RegistrationInfo {
            name: reading.name.clone().unwrap_or_else(|| self.name.clone()),
            mac: self.mac.clone(),
            calib: reading.zero_point.unwrap_or(self.zero_point),
            rev: PROTOCOL_REVISION,
        }
    }

    fn static_info(&self) -> RegistrationInfo {
        RegistrationInfo {
            name: self.name.clone(),
            mac: self.mac.clone(),
            calib: self.zero_point,
            rev: PROTOCOL_REVISION,
        }
    }
}

#[derive(Default)]
struct InfoState {
    cached: Option<RegistrationInfo>,
    waiter: Option<oneshot::Sender<RegistrationInfo>>,
}

/// State shared with the blocking serial reader.
struct Shared {
    firmware: Firmware,
    identity: Identity,
    slot: SingleSlot<Reading>,
    info: Mutex<InfoState>,
}

impl Shared {
    fn info(&self) -> MutexGuard<'_, InfoState> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Caches `info` and wakes a pending request.
    fn refresh_info(&self, info: RegistrationInfo) {
        let mut state = self.info();
        if let Some(waiter) = state.waiter.take() {
            info!("Photometer info: {:?}", info);
            let _ = waiter.send(info.clone());
        }
        state.cached = Some(info);
    }
}

impl Consumer for Shared {
    fn write(&self, reading: Reading) {
        if self.firmware == Firmware::Json && self.info().waiter.is_some() {
            self.refresh_info(self.identity.info_from(&reading));
        }
        if self.slot.put(reading).is_some() {
            debug!("Unread reading overwritten");
        }
    }
}

pub struct PhotometerSession {
    label: String,
    endpoint: SerialEndpoint,
    shared: Arc<Shared>,
    protocol: Arc<LineProtocol>,
    sequence: AtomicU64,
    reader_cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl PhotometerSession {
    /// # Errors
    ///
    /// `SessionError::Endpoint` if the endpoint is not `serial:<device>:<baud>`.
    pub fn new(config: &PhotometerConfig) -> Result<Self, SessionError> {
        let span = info_span!("sensor", label = %config.label);
        let endpoint: SerialEndpoint = config.endpoint.parse()?;
        let firmware = Firmware::from_legacy_flag(config.legacy_firmware);
        let identity = Identity {
            name: config.name.clone(),
            mac: config.mac_address.clone(),
            zero_point: config.zero_point,
        };

        let mut info = InfoState::default();
        if firmware == Firmware::Legacy {
            info.cached = Some(identity.static_info());
        }
        let shared = Arc::new(Shared {
            firmware,
            identity,
            slot: SingleSlot::new(),
            info: Mutex::new(info),
        });

        span.in_scope(|| debug!("Building {:?} protocol", firmware));
        let protocol = Arc::new(LineProtocol::new(firmware));
        protocol.register_consumer(shared.clone());

        Ok(Self {
            label: config.label.clone(),
            endpoint,
            shared,
            protocol,
            sequence: AtomicU64::new(0),
            reader_cancel: CancellationToken::new(),
            reader: Mutex::new(None),
            span,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn firmware(&self) -> Firmware {
        self.shared.firmware
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// The producer feeding this session. Lines pushed here land in the buffer.
    pub fn protocol(&self) -> &Arc<LineProtocol> {
        &self.protocol
    }

    /// Starts the serial reader. Calling it twice has no effect.
    pub fn start(&self) {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        if reader.is_some() {
            return;
        }
        self.span.in_scope(|| info!("Starting photometer session on {}", self.endpoint));
        let serial_span = info_span!(parent: &self.span, "serial", label = %self.label);
        *reader = Some(spawn_reader(
            self.endpoint.clone(),
            self.protocol.clone(),
            self.reader_cancel.clone(),
            serial_span,
        ));
    }

    /// Stops the producer and the reader.
    pub fn stop(&self) {
        self.span.in_scope(|| warn!("Stopping photometer session"));
        self.protocol.stop();
        self.reader_cancel.cancel();
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Identity to register with.
    ///
    /// Legacy firmware answers from configuration at once. New firmware answers
    /// from the cache, or waits up to [`INFO_TIMEOUT`] for the first reading.
    pub async fn registration_info(&self) -> Result<RegistrationInfo, SessionError> {
        self.registration_info_within(INFO_TIMEOUT).await
    }

    pub async fn registration_info_within(
        &self,
        timeout: Duration,
    ) -> Result<RegistrationInfo, SessionError> {
        let waiter = {
            let mut state = self.shared.info();
            if let Some(info) = &state.cached {
                info!("Photometer info: {:?}", info);
                return Ok(info.clone());
            }
            let (tx, rx) = oneshot::channel();
            state.waiter = Some(tx);
            rx
        };

        match tokio::time::timeout(timeout, waiter)
            .instrument(self.span.clone())
            .await
        {
            Ok(Ok(info)) => Ok(info),
            Ok(Err(_)) => Err(SessionError::InfoSuperseded {
                label: self.label.clone(),
            }),
            Err(_) => Err(SessionError::InfoTimeout {
                label: self.label.clone(),
                timeout,
            }),
        }
    }

    /// Registration hook for every polled reading. Refreshes the cached info of
    /// new firmware and resolves a pending request.
    pub fn observe(&self, reading: &Reading) {
        if self.shared.firmware == Firmware::Json {
            self.shared.refresh_info(self.shared.identity.info_from(reading));
        }
    }

    pub fn take_reading(&self) -> Option<Reading> {
        self.shared.slot.take()
    }

    pub fn cached_info(&self) -> Option<RegistrationInfo> {
        self.shared.info().cached.clone()
    }

    /// Turns a raw reading into the publish payload and advances the sequence.
    pub fn curate(&self, reading: Reading) -> Telemetry {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let identity = &self.shared.identity;
        debug!(
            "Curating reading #{} received at {}",
            seq, reading.received_at
        );

        match self.shared.firmware {
            Firmware::Legacy => Telemetry {
                seq,
                name: identity.name.clone(),
                freq: reading.freq,
                mag: magnitude(identity.zero_point, reading.freq),
                tamb: None,
                tbox: reading.tamb,
                tsky: reading.tsky,
                rev: PROTOCOL_REVISION,
                alt: Some(0.0),
                azi: Some(0.0),
                wdbm: Some(0),
                extra: Default::default(),
            },
            Firmware::Json => {
                let info = identity.info_from(&reading);
                self.shared.info().cached = Some(info.clone());

                let mut extra = reading.extra;
                for internal in ["udp", "ain", "seq", "mag", "tstamp"] {
                    extra.remove(internal);
                }
                Telemetry {
                    seq,
                    mag: magnitude(info.calib, reading.freq),
                    name: info.name,
                    freq: reading.freq,
                    tamb: reading.tamb,
                    tbox: None,
                    tsky: reading.tsky,
                    rev: reading.rev.unwrap_or(PROTOCOL_REVISION),
                    alt: None,
                    azi: None,
                    wdbm: None,
                    extra,
                }
            }
        }
    }
}

impl Drop for PhotometerSession {
    fn drop(&mut self) {
        self.reader_cancel.cancel();
    }
}

/// `zero_point - 2.5 * log10(freq)`, rounded to two decimals.
pub fn magnitude(zero_point: f64, freq: f64) -> f64 {
    let mag = zero_point - 2.5 * freq.log10();
    (mag * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::OffsetDateTime;

    use super::*;

    fn config(legacy: bool) -> PhotometerConfig {
        PhotometerConfig {
            label: "phot1".into(),
            legacy_firmware: legacy,
            mac_address: "AA:BB:CC:DD:EE:FF".into(),
            name: "stars1".into(),
            zero_point: 20.5,
            endpoint: "serial:/dev/ttyUSB0:9600".into(),
            ..Default::default()
        }
    }

    fn reading(freq: f64) -> Reading {
        Reading {
            freq,
            tamb: Some(20.0),
            tsky: Some(-5.0),
            zero_point: None,
            name: None,
            rev: None,
            received_at: OffsetDateTime::UNIX_EPOCH,
            extra: Default::default(),
        }
    }

    #[test]
    fn test_magnitude() {
        assert_eq!(magnitude(20.5, 100.0), 15.5);
        assert_eq!(magnitude(20.44, 9.6), 17.98);
    }

    #[test]
    fn test_bad_endpoint_is_rejected() {
        let cfg = PhotometerConfig {
            endpoint: "tcp:192.168.4.1:23".into(),
            ..config(true)
        };
        assert!(matches!(
            PhotometerSession::new(&cfg),
            Err(SessionError::Endpoint { .. })
        ));
    }

    #[test]
    fn test_sequence_starts_at_zero_without_gaps() {
        let session = PhotometerSession::new(&config(true)).unwrap();
        let seqs: Vec<u64> = (0..5).map(|_| session.curate(reading(100.0)).seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_legacy_curation() {
        let session = PhotometerSession::new(&config(true)).unwrap();
        let telemetry = session.curate(reading(100.0));

        assert_eq!(
            serde_json::to_value(&telemetry).unwrap(),
            json!({
                "seq": 0, "name": "stars1", "freq": 100.0, "mag": 15.5,
                "tbox": 20.0, "tsky": -5.0, "rev": 2,
                "alt": 0.0, "azi": 0.0, "wdBm": 0
            })
        );
    }

    #[test]
    fn test_json_curation_uses_device_fields() {
        let session = PhotometerSession::new(&config(false)).unwrap();
        let mut raw = reading(100.0);
        raw.zero_point = Some(20.0);
        raw.name = Some("stars99".into());
        raw.rev = Some(3);
        raw.extra.insert("udp".into(), json!(1));
        raw.extra.insert("ain".into(), json!(330));
        raw.extra.insert("mag".into(), json!(1.0));
        raw.extra.insert("wdBm".into(), json!(-54));

        let telemetry = session.curate(raw);
        let value = serde_json::to_value(&telemetry).unwrap();
        assert_eq!(value["name"], json!("stars99"));
        assert_eq!(value["mag"], json!(15.0));
        assert_eq!(value["rev"], json!(3));
        assert_eq!(value["wdBm"], json!(-54));
        assert!(value.get("udp").is_none());
        assert!(value.get("ain").is_none());
        assert!(value.get("ZP").is_none());
        assert!(value.get("alt").is_none());

        assert_eq!(
            session.cached_info(),
            Some(RegistrationInfo {
                name: "stars99".into(),
                mac: "AA:BB:CC:DD:EE:FF".into(),
                calib: 20.0,
                rev: 2,
            })
        );
    }

    #[test]
    fn test_rejected_line_does_not_use_sequence_number() {
        let session = PhotometerSession::new(&config(true)).unwrap();
        assert!(!session
            .protocol()
            .line_received(b"<fH 00000><tA +2350><tO -1025><mZ +2050>"));
        assert!(session.take_reading().is_none());

        assert!(session
            .protocol()
            .line_received(b"<fH 00100><tA +2350><tO -1025><mZ +2050>"));
        let telemetry = session.curate(session.take_reading().unwrap());
        assert_eq!(telemetry.seq, 0);
        assert_eq!(telemetry.mag, 15.5);
        assert_eq!(telemetry.tbox, Some(23.5));
        assert!(telemetry.tamb.is_none());
    }

    #[test]
    fn test_json_curation_falls_back_to_config() {
        let session = PhotometerSession::new(&config(false)).unwrap();
        let telemetry = session.curate(reading(100.0));
        assert_eq!(telemetry.name, "stars1");
        assert_eq!(telemetry.mag, 15.5);
        assert_eq!(telemetry.rev, 2);
    }

    #[tokio::test]
    async fn test_legacy_info_is_immediate() {
        let session = PhotometerSession::new(&config(true)).unwrap();
        let info = session.registration_info().await.unwrap();
        assert_eq!(
            info,
            RegistrationInfo {
                name: "stars1".into(),
                mac: "AA:BB:CC:DD:EE:FF".into(),
                calib: 20.5,
                rev: 2,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_info_times_out() {
        let session = PhotometerSession::new(&config(false)).unwrap();
        let err = session.registration_info().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::InfoTimeout { timeout, .. } if timeout == INFO_TIMEOUT
        ));
        assert!(session.cached_info().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_info_resolves_from_first_line() {
        let session = Arc::new(PhotometerSession::new(&config(false)).unwrap());
        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.registration_info().await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(session
            .protocol()
            .line_received(br#"{"freq": 9.6, "ZP": 20.44, "name": "stars7"}"#));

        let info = pending.await.unwrap().unwrap();
        assert_eq!(info.name, "stars7");
        assert_eq!(info.calib, 20.44);
        assert_eq!(session.take_reading().unwrap().freq, 9.6);

        // Cached from now on.
        assert_eq!(session.registration_info().await.unwrap(), info);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_resolves_pending_info() {
        let session = Arc::new(PhotometerSession::new(&config(false)).unwrap());
        let pending = {
            let session = session.clone();
            tokio::spawn(async move { session.registration_info().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        session.observe(&reading(50.0));
        let info = pending.await.unwrap().unwrap();
        assert_eq!(info.name, "stars1");
        assert_eq!(info.calib, 20.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_request_supersedes_first() {
        let session = Arc::new(PhotometerSession::new(&config(false)).unwrap());
        let first = {
            let session = session.clone();
            tokio::spawn(async move { session.registration_info().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = {
            let session = session.clone();
            tokio::spawn(async move { session.registration_info().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(matches!(
            first.await.unwrap(),
            Err(SessionError::InfoSuperseded { .. })
        ));
        session.observe(&reading(50.0));
        assert!(second.await.unwrap().is_ok());
    }

    #[test]
    fn test_buffer_keeps_latest_line() {
        let session = PhotometerSession::new(&config(true)).unwrap();
        session
            .protocol()
            .line_received(b"<fH 00100><tA +2350><tO -1025><mZ +2050>");
        session
            .protocol()
            .line_received(b"<fH 00200><tA +2350><tO -1025><mZ +2050>");

        assert_eq!(session.take_reading().unwrap().freq, 200.0);
        assert!(session.take_reading().is_none());
    }

    #[test]
    fn test_stop_drops_further_lines() {
        let session = PhotometerSession::new(&config(true)).unwrap();
        session.stop();
        assert!(!session
            .protocol()
            .line_received(b"<fH 00100><tA +2350><tO -1025><mZ +2050>"));
        assert!(session.take_reading().is_none());
    }
}
