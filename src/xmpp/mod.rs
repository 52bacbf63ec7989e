pub mod client;
pub mod component;
pub mod sasl;
pub mod stanzas;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{ConnectionMode, ServerConfig};
use stanzas::{IncomingMessage, IncomingPresence, RosterItem};

/// Events emitted by the XMPP layer up to the bridge. This is the core's
/// entire view of what happens on the wire: one tagged variant, matched
/// by the bridge's incoming worker — no inheritance hierarchy of stanza types.
#[derive(Debug)]
pub enum XmppEvent {
    Connected,
    Message(IncomingMessage),
    Presence(IncomingPresence),
    RosterUpdate(Vec<RosterItem>),
    Disconnected { reason: String, fatal: bool },
}

/// What a `Send` command resolved to on the wire: a transport-level success,
/// a retriable transient failure (e.g. a single write error that doesn't
/// necessarily mean the whole stream is down), or a fatal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    Transient,
    Fatal,
}

/// Commands accepted from the bridge. The bridge hands over fully-built,
/// already-escaped stanza strings (see `crate::converters::outbound_to_stanza`);
/// this layer only knows how to write bytes to the wire. The response channel
/// lets the caller (the bridge's outgoing worker) observe the real transport
/// outcome of that particular send, rather than just whether the internal
/// command channel accepted it, so per-message retry can be driven by it.
#[derive(Debug)]
pub enum XmppCommand {
    Send(String, tokio::sync::oneshot::Sender<SendOutcome>),
}

/// The capability set the core depends on (§4.D): connect, disconnect, send,
/// fetch the roster, and a stream of inbound events. A concrete transport
/// (component or C2S client) implements this; the connection state machine
/// and bridge are exercised in tests against `FakeXmppClient` instead.
#[async_trait]
pub trait XmppClient: Send {
    /// Connects and spawns the read/write tasks, returning the event stream
    /// and a command sender used to push outbound stanzas. Takes `self` by
    /// boxed value so a `Box<dyn XmppClient>` can be connected exactly once.
    async fn connect(
        self: Box<Self>,
    ) -> anyhow::Result<(mpsc::Receiver<XmppEvent>, mpsc::Sender<XmppCommand>)>;
}

/// Connects to the XMPP server using the mode specified in config, returning
/// a boxed `XmppClient` implementation appropriate for that mode.
pub fn client_for(config: ServerConfig, allowed_jids: Vec<String>) -> Box<dyn XmppClient> {
    match &config.mode {
        ConnectionMode::Component { .. } => Box::new(component::XmppComponent::new(config)),
        ConnectionMode::Client { .. } => {
            Box::new(client::XmppClient::new(config).with_allowed_jids(allowed_jids))
        }
    }
}

#[cfg(test)]
pub mod fake {
    //! An in-memory `XmppClient` double for bridge/dispatcher tests (§8).
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    /// Records every stanza handed to `send`, and can be scripted to fail
    /// a configurable number of times before succeeding (§8 scenario 6).
    pub struct FakeXmppClient {
        pub sent: Arc<AsyncMutex<Vec<String>>>,
        pub outcomes: Arc<AsyncMutex<Vec<SendOutcome>>>,
        event_tx: Option<mpsc::Sender<XmppEvent>>,
        event_rx: Option<mpsc::Receiver<XmppEvent>>,
    }

    impl FakeXmppClient {
        pub fn new() -> Self {
            let (event_tx, event_rx) = mpsc::channel(100);
            Self {
                sent: Arc::new(AsyncMutex::new(Vec::new())),
                outcomes: Arc::new(AsyncMutex::new(Vec::new())),
                event_tx: Some(event_tx),
                event_rx: Some(event_rx),
            }
        }

        /// Queues outcomes consumed in order by successive `send` calls;
        /// once exhausted, `send` always succeeds.
        pub async fn script(&self, outcomes: Vec<SendOutcome>) {
            *self.outcomes.lock().await = outcomes;
        }

        /// A handle usable to push synthetic events (messages, presence, roster)
        /// into the connection after `connect()` has handed out the event_tx.
        pub fn event_sender(&self) -> mpsc::Sender<XmppEvent> {
            self.event_tx.clone().expect("event sender already taken")
        }
    }

    #[async_trait]
    impl XmppClient for FakeXmppClient {
        async fn connect(
            mut self: Box<Self>,
        ) -> anyhow::Result<(mpsc::Receiver<XmppEvent>, mpsc::Sender<XmppCommand>)> {
            let event_rx = self.event_rx.take().expect("connect called twice");
            let event_tx = self.event_tx.clone().expect("event sender already taken");
            let (cmd_tx, mut cmd_rx) = mpsc::channel::<XmppCommand>(100);
            let sent = self.sent.clone();
            let outcomes = self.outcomes.clone();

            let _ = event_tx.send(XmppEvent::Connected).await;

            tokio::spawn(async move {
                while let Some(XmppCommand::Send(stanza, resp)) = cmd_rx.recv().await {
                    sent.lock().await.push(stanza);
                    let outcome = {
                        let mut o = outcomes.lock().await;
                        if o.is_empty() {
                            SendOutcome::Success
                        } else {
                            o.remove(0)
                        }
                    };
                    let _ = resp.send(outcome);
                    // A transient write failure is a per-message retry signal, not a
                    // connection teardown — only a fatal outcome tears down the transport.
                    if outcome == SendOutcome::Fatal {
                        let _ = event_tx
                            .send(XmppEvent::Disconnected {
                                reason: "fatal_error".into(),
                                fatal: true,
                            })
                            .await;
                    }
                }
            });

            Ok((event_rx, cmd_tx))
        }
    }
}
