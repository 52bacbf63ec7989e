/// Connection/retry state machine (§4.D): brokers XMPP session lifecycle
/// under failure, wrapping a boxed `XmppClient` capability object.
///
/// Grounded on the existing reconnect loop in the composition root
/// (stability threshold before resetting backoff, `tokio::select!` against
/// `ctrl_c()`, special-cased disconnect reasons), generalized into an
/// explicit state type instead of loop-local variables so the Bridge and
/// tests can read a snapshot of "are we connected" without owning the loop.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::xmpp::{XmppClient, XmppCommand, XmppEvent};

/// How long a connection must be up before backoff resets to its initial
/// delay, matching the existing reconnect loop's stability window.
const STABILITY_THRESHOLD: Duration = Duration::from_secs(60);

/// Send outcomes older than this are pruned from the degraded-state tracker.
const ERROR_WINDOW: Duration = Duration::from_secs(30);

/// Failure rate over the trailing window above which the connection is
/// considered `Degraded`.
const DEGRADED_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Degraded = 3,
    Reconnecting = 4,
    Terminal = 5,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Degraded,
            4 => ConnectionState::Reconnecting,
            _ => ConnectionState::Terminal,
        }
    }

    /// Lower-case name surfaced to JSON-RPC callers (`ping`'s `connection_state`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Terminal => "terminal",
        }
    }
}

/// Sliding window of timestamped send outcomes, used to detect the
/// `Degraded` state. Owned exclusively by the connection state machine task.
struct ErrorWindow {
    outcomes: VecDeque<(Instant, bool)>,
}

impl ErrorWindow {
    fn new() -> Self {
        Self { outcomes: VecDeque::new() }
    }

    fn record(&mut self, now: Instant, success: bool) {
        self.outcomes.push_back((now, success));
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some((ts, _)) = self.outcomes.front() {
            if now.duration_since(*ts) > ERROR_WINDOW {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.outcomes.len() as f64
    }
}

/// A read-only snapshot handle other tasks can poll without touching the
/// state machine's internals (§5: "other tasks read via atomic snapshot").
#[derive(Clone)]
pub struct ConnectionStateReader {
    state: Arc<AtomicU8>,
}

impl ConnectionStateReader {
    pub fn snapshot(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.snapshot(), ConnectionState::Connected | ConnectionState::Degraded)
    }
}

pub struct ConnectionStateMachine {
    state: Arc<AtomicU8>,
    error_window: Mutex<ErrorWindow>,
    cancel: CancellationToken,
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8)),
            error_window: Mutex::new(ErrorWindow::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn reader(&self) -> ConnectionStateReader {
        ConnectionStateReader { state: self.state.clone() }
    }

    fn set(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// Records a send outcome for the degraded-state tracker; promotes to or
    /// demotes from `Degraded` based on the trailing-30s failure rate.
    pub async fn record_send_outcome(&self, success: bool) {
        if self.snapshot() == ConnectionState::Terminal {
            return;
        }
        let mut window = self.error_window.lock().await;
        window.record(Instant::now(), success);
        let rate = window.failure_rate();
        drop(window);

        if rate > DEGRADED_THRESHOLD {
            if self.snapshot() == ConnectionState::Connected {
                warn!("Send failure rate {:.0}% over 30s, entering degraded state", rate * 100.0);
                self.set(ConnectionState::Degraded);
            }
        } else if self.snapshot() == ConnectionState::Degraded {
            info!("Send failure rate recovered, leaving degraded state");
            self.set(ConnectionState::Connected);
        }
    }

    /// Cancels the running reconnect loop cooperatively (`stop()`, §4.D).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drives `start()`/reconnect against `client_factory`, forwarding
    /// XMPP events onto `event_tx` and taking outbound commands from
    /// `cmd_rx`. Returns once `stop()` is called or a fatal error occurs.
    ///
    /// `client_factory` is called once per connection attempt so a fresh
    /// `Box<dyn XmppClient>` (its `connect` takes `self` by value) is
    /// available for every retry.
    pub async fn run<F>(
        &self,
        mut client_factory: F,
        event_tx: mpsc::Sender<XmppEvent>,
        mut cmd_rx: mpsc::Receiver<XmppCommand>,
        max_attempts: u32,
    ) where
        F: FnMut() -> Box<dyn XmppClient>,
    {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2);

        loop {
            if self.cancel.is_cancelled() {
                self.set(ConnectionState::Disconnected);
                return;
            }

            self.set(ConnectionState::Connecting);
            let client = client_factory();

            match client.connect().await {
                Ok((mut upstream_rx, upstream_cmd_tx)) => {
                    self.set(ConnectionState::Connected);
                    let connected_at = Instant::now();
                    info!("XMPP connection established");

                    loop {
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                self.set(ConnectionState::Disconnected);
                                return;
                            }
                            maybe_event = upstream_rx.recv() => {
                                match maybe_event {
                                    Some(XmppEvent::Disconnected { reason, fatal }) => {
                                        if fatal {
                                            warn!("Fatal disconnect: {reason}");
                                            self.set(ConnectionState::Terminal);
                                            return;
                                        }
                                        warn!("Transient disconnect: {reason}");
                                        break;
                                    }
                                    Some(event) => {
                                        let _ = event_tx.send(event).await;
                                    }
                                    None => break,
                                }
                            }
                            maybe_cmd = cmd_rx.recv() => {
                                match maybe_cmd {
                                    Some(cmd) => {
                                        let _ = upstream_cmd_tx.send(cmd).await;
                                    }
                                    None => {
                                        self.set(ConnectionState::Disconnected);
                                        return;
                                    }
                                }
                            }
                        }
                    }

                    if connected_at.elapsed() >= STABILITY_THRESHOLD {
                        backoff.reset();
                        info!("Connection was stable, backoff reset");
                    }
                }
                Err(e) => {
                    warn!("Connection attempt failed: {e}");
                }
            }

            if backoff.exceeded_max_attempts(max_attempts) {
                warn!("Exceeded {max_attempts} reconnection attempts, giving up");
                self.set(ConnectionState::Terminal);
                return;
            }

            self.set(ConnectionState::Reconnecting);
            let delay = backoff.next_delay_jittered();
            info!("Reconnecting in {:?} (attempt {})", delay, backoff.attempt);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    self.set(ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_disconnected() {
        let sm = ConnectionStateMachine::new();
        assert_eq!(sm.snapshot(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_reader_reflects_state() {
        let sm = ConnectionStateMachine::new();
        let reader = sm.reader();
        assert!(!reader.is_connected());
        sm.set(ConnectionState::Connected);
        assert!(reader.is_connected());
    }

    #[tokio::test]
    async fn test_degraded_on_high_failure_rate() {
        let sm = ConnectionStateMachine::new();
        sm.set(ConnectionState::Connected);
        for _ in 0..3 {
            sm.record_send_outcome(false).await;
        }
        assert_eq!(sm.snapshot(), ConnectionState::Degraded);
    }

    #[tokio::test]
    async fn test_recovers_from_degraded_on_success() {
        let sm = ConnectionStateMachine::new();
        sm.set(ConnectionState::Connected);
        for _ in 0..3 {
            sm.record_send_outcome(false).await;
        }
        assert_eq!(sm.snapshot(), ConnectionState::Degraded);
        for _ in 0..10 {
            sm.record_send_outcome(true).await;
        }
        assert_eq!(sm.snapshot(), ConnectionState::Connected);
    }

    #[test]
    fn test_error_window_prunes_old_outcomes() {
        let mut window = ErrorWindow::new();
        let t0 = Instant::now();
        window.record(t0, false);
        let later = t0 + ERROR_WINDOW + Duration::from_secs(1);
        window.prune(later);
        assert!(window.outcomes.is_empty());
    }

    #[test]
    fn test_state_as_str() {
        assert_eq!(ConnectionState::Connected.as_str(), "connected");
        assert_eq!(ConnectionState::Degraded.as_str(), "degraded");
    }

    #[test]
    fn test_cancel_sets_cancellation() {
        let sm = ConnectionStateMachine::new();
        assert!(!sm.cancel.is_cancelled());
        sm.cancel();
        assert!(sm.cancel.is_cancelled());
    }
}
