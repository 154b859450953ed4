//! Round-robin polling and registration of all photometer sessions.
//!
//! The supervisor owns the sessions and the per-sensor bookkeeping. It runs as a
//! single task that multiplexes four event sources:
//!
//! ```text
//!            ┌── poll tick (period / N) ──> service sensor i, i = (i + 1) mod N
//! Supervisor ├── registration task done ──> registration queue
//!            ├── broker event ────────────> new registration round / log
//!            └── shutdown ────────────────> stop sessions
//! ```
//!
//! When every sensor has missed `max_misses` consecutive polls the supervisor
//! gives up with [`SupervisorError::TotalOutage`].

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task::{JoinError, JoinSet},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    error::{SessionError, SupervisorError},
    message::{
        BrokerEvent, RegistrationInfo, RegistrationMessage, RegistrationOutcome, Telemetry,
    },
    session::PhotometerSession,
};
use crate::config::service::ServiceConfig;

type RegistrationResult = (usize, Result<RegistrationInfo, SessionError>);

/// Supervisor-side view of one sensor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorState {
    pub registration_done: bool,
    /// Consecutive empty polls, capped at `max_misses`.
    pub miss_count: u32,
}

pub struct Supervisor {
    sessions: Vec<Arc<PhotometerSession>>,
    states: Vec<SensorState>,
    index: usize,
    poll_interval: Duration,
    max_misses: u32,
    round: u64,
    pending: usize,
    registrations: JoinSet<RegistrationResult>,
    register_tx: UnboundedSender<RegistrationMessage>,
    telemetry_tx: UnboundedSender<Telemetry>,
    events_rx: UnboundedReceiver<BrokerEvent>,
}

impl Supervisor {
    /// # Errors
    ///
    /// `SupervisorError::NoSensors` if `sessions` is empty.
    pub fn new(
        sessions: Vec<Arc<PhotometerSession>>,
        config: &ServiceConfig,
        register_tx: UnboundedSender<RegistrationMessage>,
        telemetry_tx: UnboundedSender<Telemetry>,
        events_rx: UnboundedReceiver<BrokerEvent>,
    ) -> Result<Self, SupervisorError> {
        if sessions.is_empty() {
            return Err(SupervisorError::NoSensors);
        }
        let states = vec![SensorState::default(); sessions.len()];
        let poll_interval = config.tick_interval().max(Duration::from_secs(1));
        Ok(Self {
            sessions,
            states,
            index: 0,
            poll_interval,
            max_misses: config.max_misses.max(1),
            round: 0,
            pending: 0,
            registrations: JoinSet::new(),
            register_tx,
            telemetry_tx,
            events_rx,
        })
    }

    pub fn states(&self) -> &[SensorState] {
        &self.states
    }

    /// Index of the sensor the next tick services.
    pub fn next_index(&self) -> usize {
        self.index
    }

    pub fn tick_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Starts the sessions, runs registration round 0 and polls until cancelled
    /// or until every sensor is dead.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), SupervisorError> {
        info!(
            "Supervising {} photometers, one poll every {:?}",
            self.sessions.len(),
            self.poll_interval
        );
        for session in &self.sessions {
            session.start();
        }

        self.start_round(0);
        let mut interval = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        break Err(e);
                    }
                }
                Some(joined) = self.registrations.join_next() => {
                    if let Err(e) = self.on_registration(joined) {
                        break Err(e);
                    }
                }
                Some(event) = self.events_rx.recv() => self.on_broker_event(event),
            }
        };

        for session in &self.sessions {
            session.stop();
        }
        result
    }

    /// Issues `registration_info` to every session concurrently. Replaces any
    /// round still in progress.
    pub fn start_round(&mut self, round: u64) {
        info!("Getting info from all photometers (round {})", round);
        // Dropping the old set aborts its tasks.
        self.registrations = JoinSet::new();
        self.round = round;
        self.pending = self.sessions.len();

        for (i, session) in self.sessions.iter().enumerate() {
            let session = session.clone();
            self.registrations
                .spawn(async move { (i, session.registration_info().await) });
        }
    }

    fn on_registration(
        &mut self,
        joined: Result<RegistrationResult, JoinError>,
    ) -> Result<(), SupervisorError> {
        let (label, outcome) = match joined {
            Ok((i, Ok(info))) => {
                let session = &self.sessions[i];
                let _span = session.span().enter();
                info!("Passing {} photometer info to register queue", info.name);
                self.states[i].registration_done = true;
                (session.label().to_string(), RegistrationOutcome::Info(info))
            }
            Ok((i, Err(e))) => {
                let session = &self.sessions[i];
                let _span = session.span().enter();
                warn!("Registration info unavailable: {}", e);
                (session.label().to_string(), RegistrationOutcome::Unavailable)
            }
            Err(e) => {
                error!("Registration task failed: {}", e);
                (String::new(), RegistrationOutcome::Unavailable)
            }
        };

        self.register_tx
            .send(RegistrationMessage {
                round: self.round,
                label,
                outcome,
            })
            .map_err(|_| SupervisorError::ChannelClosed("registration"))?;

        self.pending = self.pending.saturating_sub(1);
        if self.pending == 0 {
            info!(
                "Finished getting info from all photometers (round {})",
                self.round
            );
        }
        Ok(())
    }

    fn on_broker_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Reregister { round } if round > self.round => self.start_round(round),
            BrokerEvent::Reregister { round } => {
                debug!("Ignoring stale re-registration request for round {}", round)
            }
            BrokerEvent::RegistryComplete { round } => {
                info!("Broker registry complete (round {})", round)
            }
        }
    }

    /// Services the current sensor and advances the round-robin index.
    pub fn tick(&mut self) -> Result<(), SupervisorError> {
        let i = self.index;
        self.index = (i + 1) % self.sessions.len();

        let session = &self.sessions[i];
        let state = &mut self.states[i];
        let _span = session.span().enter();

        let Some(reading) = session.take_reading() else {
            state.miss_count = (state.miss_count + 1).min(self.max_misses);
            error!(
                "Photometer[{}] no reading available ({}/{} misses)",
                i, state.miss_count, self.max_misses
            );
            if self.states.iter().all(|s| s.miss_count >= self.max_misses) {
                error!("No photometer is producing readings, giving up");
                return Err(SupervisorError::TotalOutage {
                    sensors: self.sessions.len(),
                    max_misses: self.max_misses,
                });
            }
            return Ok(());
        };

        state.miss_count = 0;
        session.observe(&reading);
        if !state.registration_done {
            warn!("Not yet registered. Ignoring sample from Photometer[{}]", i);
            return Ok(());
        }

        let telemetry = session.curate(reading);
        info!("Photometer[{}] = {:?}", i, telemetry);
        self.telemetry_tx
            .send(telemetry)
            .map_err(|_| SupervisorError::ChannelClosed("telemetry"))
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{self, error::TryRecvError};
    use tracing_test::traced_test;

    use super::*;
    use crate::config::photometer::PhotometerConfig;

    const LEGACY_LINE: &[u8] = b"<fH 00100><tA +2350><tO -1025><mZ +2050>";

    struct Harness {
        supervisor: Supervisor,
        sessions: Vec<Arc<PhotometerSession>>,
        register_rx: mpsc::UnboundedReceiver<RegistrationMessage>,
        telemetry_rx: mpsc::UnboundedReceiver<Telemetry>,
        events_tx: mpsc::UnboundedSender<BrokerEvent>,
    }

    fn harness(legacy: &[bool], period: u64, max_misses: u32) -> Harness {
        let sessions: Vec<_> = legacy
            .iter()
            .enumerate()
            .map(|(i, &legacy_firmware)| {
                Arc::new(
                    PhotometerSession::new(&PhotometerConfig {
                        label: format!("phot{}", i + 1),
                        name: format!("stars{}", i + 1),
                        legacy_firmware,
                        endpoint: format!("serial:/dev/tessw-test-{}:9600", i),
                        ..Default::default()
                    })
                    .unwrap(),
                )
            })
            .collect();
        let config = ServiceConfig {
            sensor_count: sessions.len(),
            period,
            max_misses,
            ..Default::default()
        };
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Harness {
            supervisor: Supervisor::new(
                sessions.clone(),
                &config,
                register_tx,
                telemetry_tx,
                events_rx,
            )
            .unwrap(),
            sessions,
            register_rx,
            telemetry_rx,
            events_tx,
        }
    }

    fn feed(session: &PhotometerSession) {
        assert!(session.protocol().line_received(LEGACY_LINE));
    }

    #[test]
    fn test_rejects_empty_session_list() {
        let (register_tx, _register_rx) = mpsc::unbounded_channel();
        let (telemetry_tx, _telemetry_rx) = mpsc::unbounded_channel();
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let result = Supervisor::new(
            Vec::new(),
            &ServiceConfig::default(),
            register_tx,
            telemetry_tx,
            events_rx,
        );
        assert!(matches!(result, Err(SupervisorError::NoSensors)));
    }

    #[test]
    fn test_tick_interval() {
        let h = harness(&[true, true], 10, 3);
        assert_eq!(h.supervisor.tick_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_round_robin_order() {
        let mut h = harness(&[true, true, true], 30, 100);
        let mut order = Vec::new();
        for _ in 0..7 {
            order.push(h.supervisor.next_index());
            h.supervisor.tick().unwrap();
        }
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    #[traced_test]
    fn test_scenario_one_live_one_empty() {
        let mut h = harness(&[true, true], 10, 3);
        feed(&h.sessions[0]);

        h.supervisor.tick().unwrap();
        h.supervisor.tick().unwrap();

        assert_eq!(h.supervisor.states()[0].miss_count, 0);
        assert_eq!(h.supervisor.states()[1].miss_count, 1);
        // Not registered yet, so nothing is forwarded.
        assert!(matches!(h.telemetry_rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(logs_contain("Not yet registered"));
    }

    #[test]
    fn test_total_outage_when_every_sensor_is_dead() {
        let mut h = harness(&[true, true], 10, 2);
        let mut result = Ok(());
        for _ in 0..4 {
            result = h.supervisor.tick();
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(
            result,
            Err(SupervisorError::TotalOutage {
                sensors: 2,
                max_misses: 2
            })
        ));
        assert!(h.supervisor.states().iter().all(|s| s.miss_count == 2));
    }

    #[test]
    fn test_one_live_sensor_prevents_outage() {
        let mut h = harness(&[true, true], 10, 2);
        for _ in 0..20 {
            feed(&h.sessions[0]);
            h.supervisor.tick().unwrap();
        }
        assert_eq!(h.supervisor.states()[0].miss_count, 0);
        assert_eq!(h.supervisor.states()[1].miss_count, 2);
    }

    #[test]
    fn test_reading_resets_miss_count() {
        let mut h = harness(&[true], 10, 3);
        h.supervisor.tick().unwrap();
        h.supervisor.tick().unwrap();
        assert_eq!(h.supervisor.states()[0].miss_count, 2);

        feed(&h.sessions[0]);
        h.supervisor.tick().unwrap();
        assert_eq!(h.supervisor.states()[0].miss_count, 0);
    }

    #[tokio::test]
    async fn test_registration_gates_telemetry() {
        let mut h = harness(&[true], 10, 3);
        h.supervisor.start_round(0);
        let joined = h.supervisor.registrations.join_next().await.unwrap();
        h.supervisor.on_registration(joined).unwrap();

        let msg = h.register_rx.try_recv().unwrap();
        assert_eq!(msg.round, 0);
        assert_eq!(msg.label, "phot1");
        assert!(matches!(msg.outcome, RegistrationOutcome::Info(ref info) if info.name == "stars1"));
        assert!(h.supervisor.states()[0].registration_done);

        feed(&h.sessions[0]);
        h.supervisor.tick().unwrap();
        let telemetry = h.telemetry_rx.try_recv().unwrap();
        assert_eq!(telemetry.seq, 0);
        assert_eq!(telemetry.mag, 15.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_registers_and_polls() {
        let h = harness(&[true, true], 10, 100);
        let Harness {
            supervisor,
            sessions,
            mut register_rx,
            mut telemetry_rx,
            events_tx: _events_tx,
        } = h;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        let mut names = vec![
            register_rx.recv().await.unwrap(),
            register_rx.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|m| m.label)
        .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec!["phot1", "phot2"]);

        feed(&sessions[0]);
        feed(&sessions[1]);
        let first = telemetry_rx.recv().await.unwrap();
        let second = telemetry_rx.recv().await.unwrap();
        assert_eq!(first.name, "stars1");
        assert_eq!(second.name, "stars2");

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
        assert!(!sessions[0].protocol().is_producing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_total_outage() {
        let h = harness(&[true], 2, 3);
        let result = h.supervisor.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(SupervisorError::TotalOutage { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_sensor_times_out_without_blocking_others() {
        let h = harness(&[false, true], 10, 1000);
        let Harness {
            supervisor,
            mut register_rx,
            events_tx: _events_tx,
            ..
        } = h;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        let first = register_rx.recv().await.unwrap();
        assert_eq!(first.label, "phot2");
        assert!(matches!(first.outcome, RegistrationOutcome::Info(_)));

        let second = register_rx.recv().await.unwrap();
        assert_eq!(second.label, "phot1");
        assert_eq!(second.outcome, RegistrationOutcome::Unavailable);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregister_starts_new_round() {
        let h = harness(&[true], 10, 1000);
        let Harness {
            supervisor,
            mut register_rx,
            events_tx,
            ..
        } = h;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));

        assert_eq!(register_rx.recv().await.unwrap().round, 0);
        events_tx.send(BrokerEvent::Reregister { round: 1 }).unwrap();
        let msg = register_rx.recv().await.unwrap();
        assert_eq!(msg.round, 1);
        assert!(matches!(msg.outcome, RegistrationOutcome::Info(_)));

        // Stale requests are ignored.
        events_tx.send(BrokerEvent::Reregister { round: 1 }).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(register_rx.try_recv().is_err());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
