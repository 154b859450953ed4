//! Broker connection driver with automatic reconnection and state tracking.
//!
//! `ConnectionKernel` owns the rumqttc event loop. It pumps packets, notices
//! failures, waits out the exponential backoff and publishes every transition on a
//! `watch` channel. Publishers only hold the cloned `AsyncClient`.
//!
//! ```text
//! PublishService ──(AsyncClient)──> rumqttc ──> Network
//!       ▲                             │
//!       └──(watch<ConnectionState>)── ConnectionKernel (drives EventLoop)
//! ```
//!
//! ```ignore
//! let (client, event_loop) = ClientBuilder::from_config(&config)?.build();
//! let mut kernel = ConnectionKernel::new(client, event_loop, cancel_token);
//! let mut state_rx = kernel.subscribe_state();
//! kernel.reconnect().await;
//! ```

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Packet};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{backoff::Backoff, state::ConnectionState};

/// Drives the broker connection.
///
/// Runs on a single task. Every connection error is retried: a broker outage is
/// never fatal, the kernel only stops when its cancellation token fires.
pub struct ConnectionKernel {
    client: AsyncClient,
    event_loop: EventLoop,
    backoff: Backoff,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionKernel {
    /// Creates a kernel in the `Connecting` state with the default backoff schedule.
    pub fn new(client: AsyncClient, event_loop: EventLoop, cancel: CancellationToken) -> Self {
        Self::with_backoff(client, event_loop, cancel, Backoff::default())
    }

    /// Same as [`ConnectionKernel::new`] with a custom backoff schedule.
    pub fn with_backoff(
        client: AsyncClient,
        event_loop: EventLoop,
        cancel: CancellationToken,
        backoff: Backoff,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        Self {
            client,
            event_loop,
            backoff,
            cancel,
            state_tx,
            state_rx,
        }
    }

    /// Returns a receiver that observes every connection state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn update_state(&mut self, state: ConnectionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        info!("Connection state changed to: {}", state);
        // The kernel keeps its own receiver, so the channel never closes.
        let _ = self.state_tx.send(state);
    }

    /// Main connection loop. Returns once the cancellation token fires.
    ///
    /// - CONNACK accepted: state becomes `Connected` and the backoff is reset.
    /// - Poll error: state becomes `Disconnected(reason)`, the kernel sleeps for
    ///   the next backoff delay, then moves to `Connecting` and polls again
    ///   (rumqttc reconnects on the next poll).
    /// - Cancellation: a DISCONNECT is queued and the loop exits.
    pub async fn reconnect(&mut self) {
        self.update_state(ConnectionState::Connecting);
        self.backoff.reset();

        info!("Starting broker connection loop");
        loop {
            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                polled = self.event_loop.poll() => polled,
            };

            match polled {
                Ok(event) => self.handle_event(event),
                Err(e) => {
                    let reason = root_cause(&e);
                    let delay = self.backoff.next_sleep();
                    error!(
                        "Broker connection failed: {}. Reconnecting in {:.0} seconds (attempt {})",
                        reason,
                        delay.as_secs_f64(),
                        self.backoff.attempt()
                    );
                    self.update_state(ConnectionState::Disconnected(reason));

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.update_state(ConnectionState::Connecting);
                }
            }
        }

        info!("Shutdown signal received, closing broker connection");
        self.disconnect().await;
        self.update_state(ConnectionState::Disconnected("shutdown".into()));
        info!("Connection kernel shutdown completed");
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(conn_ack)) => {
                if conn_ack.code == ConnectReturnCode::Success {
                    info!("Connection established successfully");
                    self.backoff.reset();
                    self.update_state(ConnectionState::Connected);
                } else {
                    // rumqttc turns refused CONNACKs into poll errors; keep this visible anyway.
                    warn!("Broker refused connection: {:?}", conn_ack.code);
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
                self.update_state(ConnectionState::Disconnected(
                    "Disconnected by broker".into(),
                ));
            }
            Event::Incoming(packet) => trace!("Incoming packet: {:?}", packet),
            Event::Outgoing(outgoing) => trace!("Outgoing packet: {:?}", outgoing),
        }
    }

    /// Best effort: the connection closes either way.
    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Error queueing disconnect packet: {:?}", e);
        }
    }
}

/// Innermost message of an error chain, without surrounding quotes.
fn root_cause(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
