/// The two-queue engine (§4.E): bridges the XMPP connection and the JSON-RPC
/// dispatcher through an incoming queue (received events, fed to the
/// dispatcher/inbox) and an outgoing queue (outbound sends, fed to the
/// connection state machine), each with its own bounded capacity and a
/// small high-priority lane for control traffic.
///
/// Grounded on the same mutex-guarded-collection idiom as `AddressBook` and
/// `Inbox`, but a plain `mpsc` channel cannot express the spec's "drop an
/// existing entry to make room instead of rejecting the newest one" policy
/// at 100% capacity, since `mpsc` has no arbitrary-position removal. Hence a
/// hand-rolled `Mutex<VecDeque<T>>` + `Notify` queue, the same pairing Tokio's
/// own channel internals use, just without the channel's closed-bit bookkeeping.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{ConnectionState, ConnectionStateMachine};
use crate::converters::{xml_unescape, OutboundMessage, Priority};
use crate::error::BridgeError;
use crate::inbox::Inbox;
use crate::xmpp::{SendOutcome, XmppCommand, XmppEvent};

/// Retry schedule for outgoing sends (§4.E): 3 attempts at 500ms * 2^n.
const MAX_SEND_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(500);

/// How long a low/medium priority send is deferred while the connection is
/// `Degraded` (§4.D). High-priority sends are never deferred.
const DEGRADED_DEFER: Duration = Duration::from_millis(250);

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackPressureTier {
    Normal,
    High,
    Critical,
    Full,
}

fn tier_for(len: usize, capacity: usize) -> BackPressureTier {
    if capacity == 0 {
        return BackPressureTier::Full;
    }
    let pct = (len as f64 / capacity as f64) * 100.0;
    if pct >= 100.0 {
        BackPressureTier::Full
    } else if pct >= 90.0 {
        BackPressureTier::Critical
    } else if pct >= 70.0 {
        BackPressureTier::High
    } else {
        BackPressureTier::Normal
    }
}

/// A bounded FIFO queue that, when full, evicts the oldest entry to make
/// room for the newest rather than rejecting the push — the bridge's
/// "incoming" policy at 100% (§4.E).
struct BoundedQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> BoundedQueue<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    /// Pushes an item, evicting the oldest if at capacity. Returns the
    /// evicted item, if any, and the queue length after the push.
    async fn push_evicting(&self, item: T) -> (Option<T>, usize) {
        let mut items = self.items.lock().await;
        let evicted = if items.len() >= self.capacity {
            items.pop_front()
        } else {
            None
        };
        items.push_back(item);
        let len = items.len();
        drop(items);
        self.notify.notify_one();
        (evicted, len)
    }

    /// Pushes an item only if there is room; returns `false` if full.
    async fn try_push(&self, item: T) -> bool {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
        true
    }

    async fn pop(&self) -> Option<T> {
        self.items.lock().await.pop_front()
    }

    /// Removes the first item matching `pred`, if any. Used by the incoming
    /// queue's 100%-full policy: drop the oldest low-priority entry to make
    /// room instead of rejecting a higher-priority arrival outright.
    async fn evict_if<F: Fn(&T) -> bool>(&self, pred: F) -> bool {
        let mut items = self.items.lock().await;
        if let Some(pos) = items.iter().position(&pred) {
            items.remove(pos);
            true
        } else {
            false
        }
    }

    async fn wait_and_pop(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            if let Some(item) = self.pop().await {
                return Some(item);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

/// A tagged event entering the bridge from the XMPP side, carrying its
/// implicit priority (§4.E: roster/ack/nack = high, received = medium,
/// presence = low).
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    ReceivedMessage { from_jid: String, body: String, ts: u64 },
    PresenceChanged { from_jid: String, state: String },
    RosterUpdate { entries: Vec<(String, Option<String>)> },
    DeliveryAck { outbound_id: u64 },
    DeliveryNack { outbound_id: u64, kind: String },
}

impl BridgeEvent {
    fn priority(&self) -> Priority {
        match self {
            BridgeEvent::RosterUpdate { .. }
            | BridgeEvent::DeliveryAck { .. }
            | BridgeEvent::DeliveryNack { .. } => Priority::High,
            BridgeEvent::ReceivedMessage { .. } => Priority::Medium,
            BridgeEvent::PresenceChanged { .. } => Priority::Low,
        }
    }
}

/// A queued outbound send, tracking retry state (§4.E: 3 attempts at
/// 500ms * 2^n).
struct PendingSend {
    id: u64,
    message: OutboundMessage,
    attempts: u32,
}

pub struct Bridge {
    incoming: BoundedQueue<BridgeEvent>,
    priority: BoundedQueue<BridgeEvent>,
    outgoing: BoundedQueue<PendingSend>,
    /// Separate outbound priority lane (§3/§4.E): drained before `outgoing`,
    /// never subject to the percentage-tier gating below, only to its own
    /// capacity.
    outbound_priority: BoundedQueue<PendingSend>,
    next_outbound_id: AtomicU64,
    inbox: Arc<Inbox>,
    connection: Arc<ConnectionStateMachine>,
    cancel: CancellationToken,
}

/// `priority_capacity` sizes both priority lanes: the incoming-side lane for
/// `high`-priority `BridgeEvent`s and the outbound-side lane for `high`-priority
/// sends (§3: "capacity default 100" for each).
pub struct BridgeConfig {
    pub incoming_capacity: usize,
    pub outgoing_capacity: usize,
    pub priority_capacity: usize,
}

impl Bridge {
    pub fn new(config: BridgeConfig, inbox: Arc<Inbox>, connection: Arc<ConnectionStateMachine>) -> Self {
        Self {
            incoming: BoundedQueue::new(config.incoming_capacity),
            priority: BoundedQueue::new(config.priority_capacity),
            outgoing: BoundedQueue::new(config.outgoing_capacity),
            outbound_priority: BoundedQueue::new(config.priority_capacity),
            next_outbound_id: AtomicU64::new(1),
            inbox,
            connection,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Back-pressure tier of the incoming queue, for health reporting.
    pub async fn incoming_tier(&self) -> BackPressureTier {
        tier_for(self.incoming.len().await, self.incoming.capacity)
    }

    /// Enqueues an outbound message, assigning it a fresh id. `high` priority
    /// goes to the dedicated priority lane (rejected only if that lane itself
    /// is full); `medium`/`low` are gated by the percentage-tier back-pressure
    /// policy on the main outgoing queue (§4.E): accept-all below 70%, reject
    /// `low` at 70-90%, reject everything non-`high` at 90% and above.
    pub async fn enqueue_outbound(&self, message: OutboundMessage) -> Result<u64, BridgeError> {
        let id = self.next_outbound_id.fetch_add(1, Ordering::Relaxed);
        let priority = message.priority.clone();
        let pending = PendingSend { id, message, attempts: 0 };

        if priority == Priority::High {
            return if self.outbound_priority.try_push(pending).await {
                Ok(id)
            } else {
                Err(BridgeError::Overloaded)
            };
        }

        let tier = tier_for(self.outgoing.len().await, self.outgoing.capacity);
        let admitted = match tier {
            BackPressureTier::Normal => true,
            BackPressureTier::High => priority != Priority::Low,
            BackPressureTier::Critical | BackPressureTier::Full => false,
        };
        if !admitted {
            return Err(BridgeError::Overloaded);
        }

        if self.outgoing.try_push(pending).await {
            Ok(id)
        } else {
            Err(BridgeError::Overloaded)
        }
    }

    /// Routes an inbound XMPP event into the appropriately prioritized
    /// queue. `high` priority always lands in the dedicated lane, unthrottled.
    /// `medium`/`low` are gated by the same percentage-tier policy as outbound
    /// (§4.E); at 100% a `medium` arrival may still be admitted by evicting
    /// the oldest `low` priority entry already queued.
    pub async fn enqueue_event(&self, event: BridgeEvent) {
        let priority = event.priority();
        if priority == Priority::High {
            let (evicted, len) = self.priority.push_evicting(event).await;
            if evicted.is_some() {
                warn!("priority queue at capacity ({len}), evicted oldest entry");
            }
            return;
        }

        let tier = tier_for(self.incoming.len().await, self.incoming.capacity);
        let admitted = match tier {
            BackPressureTier::Normal => true,
            BackPressureTier::High => priority != Priority::Low,
            BackPressureTier::Critical | BackPressureTier::Full => false,
        };

        if admitted {
            let (evicted, len) = self.incoming.push_evicting(event).await;
            if evicted.is_some() {
                warn!("incoming queue at capacity ({len}), evicted oldest entry");
            }
            return;
        }

        if tier == BackPressureTier::Full
            && self.incoming.evict_if(|e| e.priority() == Priority::Low).await
        {
            self.incoming.try_push(event).await;
            return;
        }

        debug!("incoming queue saturated ({tier:?}), dropping {priority:?} event");
    }

    /// Drains received XMPP events into the incoming/priority queues.
    pub async fn run_incoming(&self, mut event_rx: tokio::sync::mpsc::Receiver<XmppEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                maybe_event = event_rx.recv() => {
                    match maybe_event {
                        Some(event) => self.translate_and_enqueue(event).await,
                        None => return,
                    }
                }
            }
        }
    }

    async fn translate_and_enqueue(&self, event: XmppEvent) {
        match event {
            XmppEvent::Message(msg) => {
                let ts = unix_now();
                let message_type = match msg.message_type {
                    crate::xmpp::stanzas::MessageType::GroupChat => "groupchat",
                    crate::xmpp::stanzas::MessageType::Chat => "chat",
                }
                .to_string();
                self.enqueue_event(BridgeEvent::ReceivedMessage {
                    from_jid: msg.from.clone(),
                    body: xml_unescape(&msg.body),
                    ts,
                })
                .await;
                self.inbox
                    .append(crate::converters::ReceivedEvent {
                        from_jid: msg.from,
                        body: xml_unescape(&msg.body),
                        message_type,
                        ts,
                    })
                    .await;
            }
            XmppEvent::Presence(presence) => {
                self.enqueue_event(BridgeEvent::PresenceChanged {
                    from_jid: presence.from,
                    state: presence.presence_type.as_state_str().to_string(),
                })
                .await;
            }
            XmppEvent::RosterUpdate(items) => {
                let entries = items.into_iter().map(|i| (i.jid, i.name)).collect();
                self.enqueue_event(BridgeEvent::RosterUpdate { entries }).await;
            }
            XmppEvent::Connected | XmppEvent::Disconnected { .. } => {
                debug!("connection-lifecycle event surfaced via ConnectionStateMachine, not queued");
            }
        }
    }

    /// Drains the outbound priority lane and the outgoing queue (priority
    /// lane first, per §4.E), sending each message via `cmd_tx` and retrying
    /// transient failures up to `MAX_SEND_ATTEMPTS` with backoff. While the
    /// connection is `Degraded`, non-`high` sends are deferred (§4.D).
    pub async fn run_outgoing(&self, cmd_tx: tokio::sync::mpsc::Sender<XmppCommand>) {
        loop {
            let pending = match self.wait_and_pop_outbound(&self.cancel).await {
                Some(p) => p,
                None => return,
            };

            if pending.message.priority != Priority::High
                && self.connection.snapshot() == ConnectionState::Degraded
            {
                tokio::select! {
                    _ = tokio::time::sleep(DEGRADED_DEFER) => {}
                    _ = self.cancel.cancelled() => return,
                }
            }

            self.send_with_retry(pending, &cmd_tx).await;
        }
    }

    /// Waits for and pops the next pending send, preferring the priority
    /// lane over the main FIFO queue.
    async fn wait_and_pop_outbound(&self, cancel: &CancellationToken) -> Option<PendingSend> {
        loop {
            if let Some(p) = self.outbound_priority.pop().await {
                return Some(p);
            }
            if let Some(p) = self.outgoing.pop().await {
                return Some(p);
            }
            tokio::select! {
                _ = self.outbound_priority.notify.notified() => {}
                _ = self.outgoing.notify.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    async fn send_with_retry(&self, mut pending: PendingSend, cmd_tx: &tokio::sync::mpsc::Sender<XmppCommand>) {
        loop {
            let stanza = crate::converters::outbound_to_stanza(&pending.message);
            let (resp_tx, resp_rx) = tokio::sync::oneshot::channel();

            let outcome = if cmd_tx.send(XmppCommand::Send(stanza, resp_tx)).await.is_err() {
                SendOutcome::Transient
            } else {
                resp_rx.await.unwrap_or(SendOutcome::Transient)
            };

            self.connection.record_send_outcome(outcome == SendOutcome::Success).await;

            match outcome {
                SendOutcome::Success => {
                    self.enqueue_event(BridgeEvent::DeliveryAck { outbound_id: pending.id }).await;
                    return;
                }
                SendOutcome::Fatal => {
                    self.enqueue_event(BridgeEvent::DeliveryNack {
                        outbound_id: pending.id,
                        kind: "fatal_error".to_string(),
                    })
                    .await;
                    return;
                }
                SendOutcome::Transient => {
                    pending.attempts += 1;
                    if pending.attempts >= MAX_SEND_ATTEMPTS {
                        self.enqueue_event(BridgeEvent::DeliveryNack {
                            outbound_id: pending.id,
                            kind: "disconnected".to_string(),
                        })
                        .await;
                        return;
                    }

                    let delay = RETRY_BASE * 2u32.pow(pending.attempts - 1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    /// Pops the next highest-priority queued event, if any (priority lane
    /// drains before the general incoming queue).
    pub async fn poll_event(&self) -> Option<BridgeEvent> {
        if let Some(event) = self.priority.pop().await {
            return Some(event);
        }
        self.incoming.pop().await
    }
}
