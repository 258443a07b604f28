//! Collaboration message bus with port relaying.
//!
//! Collaboration traffic (step commits, session events) is high-frequency
//! and bidirectional, so it rides a dedicated port rather than the action
//! bridge. The bus is a topic-keyed publish/subscribe fan-out; attaching a
//! port spawns a relay that forwards local publishes to the peer and feeds
//! peer messages into the local bus. Every message carries a unique id and
//! the relay keeps a seen-set, so traffic received from the peer is never
//! reflected back at it.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::channel::{Envelope, MessagePort};

/// Topic for committed step announcements.
pub const TOPIC_STEPS: &str = "collab::steps";
/// Topic for session lifecycle events.
pub const TOPIC_SESSION: &str = "collab::session";

/// A bus message: identity for dedup, topic for routing, opaque payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: Uuid,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| BusError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BusError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| BusError::Codec(e.to_string()))?;
        Ok(msg)
    }
}

struct Subscriber {
    /// `None` subscribes to every topic.
    topic: Option<String>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

/// Bounded set of message ids already seen from (or sent to) the peer.
struct SeenSet {
    set: HashSet<Uuid>,
    order: VecDeque<Uuid>,
    cap: usize,
}

impl SeenSet {
    fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    fn insert(&mut self, id: Uuid) {
        if self.set.insert(id) {
            self.order.push_back(id);
            if self.order.len() > self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.set.contains(id)
    }
}

struct BusShared {
    subs: Mutex<Vec<Subscriber>>,
    seen: Mutex<SeenSet>,
    relays: Mutex<Vec<tokio::task::AbortHandle>>,
}

impl BusShared {
    fn publish(&self, msg: BusMessage) {
        let mut subs = self.subs.lock().unwrap();
        subs.retain(|sub| {
            let wants = match &sub.topic {
                None => true,
                Some(topic) => topic == &msg.topic,
            };
            if !wants {
                return !sub.tx.is_closed();
            }
            // A dropped receiver unsubscribes implicitly.
            sub.tx.send(msg.clone()).is_ok()
        });
    }
}

/// Wildcard publish/subscribe bus for collaboration-protocol messages.
///
/// Cheap to clone; clones share subscribers, the seen-set, and attached
/// relays.
#[derive(Clone)]
pub struct MessageBus {
    shared: Arc<BusShared>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(BusShared {
                subs: Mutex::new(Vec::new()),
                seen: Mutex::new(SeenSet::new(1024)),
                relays: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Subscribe to one topic.
    pub fn subscribe(&self, topic: impl Into<String>) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subs.lock().unwrap().push(Subscriber {
            topic: Some(topic.into()),
            tx,
        });
        rx
    }

    /// Subscribe to every topic.
    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<BusMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .subs
            .lock()
            .unwrap()
            .push(Subscriber { topic: None, tx });
        rx
    }

    /// Publish to local subscribers (and through any attached relays).
    pub fn publish(&self, msg: BusMessage) {
        log::trace!("bus: publish {} on {:?}", msg.id, msg.topic);
        self.shared.publish(msg);
    }

    /// Wire a transferred port into this bus: local traffic flows out to
    /// the peer, peer traffic flows in, and nothing echoes back.
    pub fn attach_port(&self, port: MessagePort) {
        let mut local = self.subscribe_all();
        let (tx, mut rx) = port.split();
        let shared = self.shared.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(msg) = local.recv() => {
                        let from_peer = shared.seen.lock().unwrap().contains(&msg.id);
                        if from_peer {
                            continue;
                        }
                        match msg.encode() {
                            Ok(bytes) => {
                                // Peer teardown turns this into a no-op.
                                tx.send(Envelope::new(bytes));
                            }
                            Err(e) => log::error!("bus relay: encode failed: {e}"),
                        }
                    }
                    env = rx.recv() => {
                        let Some(env) = env else {
                            log::debug!("bus relay: peer port closed");
                            break;
                        };
                        match BusMessage::decode(&env.bytes) {
                            Ok(msg) => {
                                shared.seen.lock().unwrap().insert(msg.id);
                                shared.publish(msg);
                            }
                            Err(e) => {
                                log::warn!("bus relay: ignoring undecodable message: {e}");
                            }
                        }
                    }
                    else => break,
                }
            }
        });
        self.shared
            .relays
            .lock()
            .unwrap()
            .push(handle.abort_handle());
    }

    /// Number of live relays attached.
    pub fn relay_count(&self) -> usize {
        self.shared.relays.lock().unwrap().len()
    }

    /// Abort every relay, closing the attached ports. Peer sends become
    /// no-ops after this.
    pub fn detach_all(&self) {
        for relay in self.shared.relays.lock().unwrap().drain(..) {
            relay.abort();
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Bus errors.
#[derive(Debug, Clone)]
pub enum BusError {
    Codec(String),
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::Codec(e) => write!(f, "bus codec error: {e}"),
        }
    }
}

impl std::error::Error for BusError {}
