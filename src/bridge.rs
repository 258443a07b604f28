//! Cross-process store bridge: action forwarding and state mirroring.
//!
//! ```text
//! window Store ── forward(action) ──► WindowBridge ──┐
//!        │                                           │ MessagePort
//!        └── mirror(slice) ─► patch batch ───────────┤ (bincode wire)
//!                                                    ▼
//!                                             WorkerBridge pump
//!                                               │         │
//!                                   dispatch(remote)   MirrorReplica
//!                                               ▼         │
//!                                         worker Store   gap? ──► ResyncRequest
//! ```
//!
//! Only actions whose name starts with a whitelisted prefix cross the
//! boundary; everything else is window-local by construction, which also
//! guarantees side effects registered on the worker never run twice.
//! Unknown incoming traffic is logged and dropped, never fatal.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use tokio::sync::watch;

use crate::action::{Action, ActionKind, SerializerTable, WirePayload};
use crate::channel::{Envelope, MessagePort, PortTx};
use crate::patch::{diff, ApplyOutcome, MirrorReplica, PatchBatch, PatchOp};
use crate::store::{Forwarder, Store, StoreState};

/// Namespace prefixes of actions that are forwarded to the worker.
pub const FORWARD_PREFIXES: &[&str] = &["action::workspace:", "action::note:", "action::collab:"];

/// Whether an action name qualifies for forwarding.
pub fn should_forward(name: &str) -> bool {
    FORWARD_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Top-level wire message between the two bridge halves.
///
/// JSON payloads stay JSON-encoded byte blobs; the bincode layer only ever
/// carries primitives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    Action {
        name: String,
        store: String,
        payload: Vec<u8>,
        has_transfer: bool,
    },
    Patch {
        id: u64,
        patches: Vec<u8>,
    },
    ResyncRequest,
    Resync {
        id: u64,
        snapshot: Vec<u8>,
    },
}

impl WireMessage {
    pub fn encode(&self) -> Result<Vec<u8>, BridgeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| BridgeError::Wire(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BridgeError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| BridgeError::Wire(e.to_string()))?;
        Ok(msg)
    }
}

struct MirrorState {
    /// Last-sent value per tracked slice.
    tracked: HashMap<String, Value>,
    /// Patches accumulated since the last flush (coalesced into one batch).
    pending: Vec<PatchOp>,
    next_id: u64,
}

/// Window half: serializes qualifying actions onto the port and replicates
/// tracked slices as patch batches.
pub struct WindowBridge {
    tx: PortTx,
    table: Arc<SerializerTable>,
    store_name: String,
    mirror: Mutex<MirrorState>,
    pump: Mutex<Option<tokio::task::AbortHandle>>,
}

impl WindowBridge {
    /// Validate the serializer table, take ownership of the port, and
    /// start the return-path pump (it answers worker resync requests).
    pub fn spawn(
        port: MessagePort,
        table: Arc<SerializerTable>,
        store_name: impl Into<String>,
    ) -> Result<Arc<Self>, BridgeError> {
        table.validate()?;
        let (tx, mut rx) = port.split();

        let bridge = Arc::new(Self {
            tx,
            table,
            store_name: store_name.into(),
            mirror: Mutex::new(MirrorState {
                tracked: HashMap::new(),
                pending: Vec::new(),
                next_id: 0,
            }),
            pump: Mutex::new(None),
        });

        let b = bridge.clone();
        let handle = tokio::spawn(async move {
            while let Some(env) = rx.recv().await {
                match WireMessage::decode(&env.bytes) {
                    Ok(WireMessage::ResyncRequest) => b.send_resync(),
                    Ok(other) => {
                        log::warn!("window bridge: ignoring unexpected message {other:?}");
                    }
                    Err(e) => {
                        log::warn!("window bridge: ignoring undecodable message: {e}");
                    }
                }
            }
            log::debug!("window bridge: pump finished, worker port closed");
        });
        *bridge.pump.lock().unwrap() = Some(handle.abort_handle());

        Ok(bridge)
    }

    /// Serialize and send a qualifying action.
    ///
    /// Panics if the kind has no serializer: the table was validated at
    /// startup, so that is a programming error, not a runtime condition.
    pub fn forward(&self, mut action: Action) -> Result<(), BridgeError> {
        if !should_forward(action.kind.as_name()) {
            log::trace!("bridge: {} stays window-local", action.kind.as_name());
            return Ok(());
        }

        let serializer = self
            .table
            .get(action.kind)
            .unwrap_or_else(|| panic!("no serializer registered for {}", action.kind.as_name()));

        let (value, transfer) = match serializer.encode(&mut action)? {
            WirePayload::Plain(v) => (v, None),
            WirePayload::WithPort(v, port) => (v, Some(port)),
        };
        let payload =
            serde_json::to_vec(&value).map_err(|e| BridgeError::Wire(e.to_string()))?;
        let msg = WireMessage::Action {
            name: action.kind.as_name().to_string(),
            store: self.store_name.clone(),
            payload,
            has_transfer: transfer.is_some(),
        };
        let bytes = msg.encode()?;
        let envelope = match transfer {
            Some(port) => Envelope::with_transfer(bytes, port),
            None => Envelope::new(bytes),
        };
        if !self.tx.send(envelope) {
            log::debug!("bridge: worker gone, dropped {}", action.kind.as_name());
        }
        Ok(())
    }

    /// A forwarding hook suitable for [`Store::set_forwarder`]. The hook
    /// keeps the bridge alive; call on a clone of the handle.
    pub fn forwarder(self: Arc<Self>) -> Forwarder {
        let bridge = self;
        Box::new(move |action: Action| {
            let kind = action.kind;
            if let Err(e) = bridge.forward(action) {
                log::error!("bridge: failed to forward {}: {e}", kind.as_name());
            }
        })
    }

    /// Start replicating a slice; its initial value becomes the first
    /// pending patch.
    pub fn track(&self, slice: &str, initial: &Value) {
        let mut mirror = self.mirror.lock().unwrap();
        mirror.pending.push(PatchOp {
            path: vec![slice.to_string()],
            op: crate::patch::PatchValue::Replace(initial.clone()),
        });
        mirror.tracked.insert(slice.to_string(), initial.clone());
    }

    /// Record a tracked slice change as structural patches against the
    /// last-sent value. Patches accumulate until [`Self::flush_mirror`].
    pub fn mirror(&self, slice: &str, new: &Value) {
        let mut mirror = self.mirror.lock().unwrap();
        let Some(old) = mirror.tracked.get(slice) else {
            log::debug!("bridge: mirror update for untracked slice {slice:?}");
            return;
        };
        for mut op in diff(old, new) {
            op.path.insert(0, slice.to_string());
            mirror.pending.push(op);
        }
        mirror.tracked.insert(slice.to_string(), new.clone());
    }

    /// Send everything accumulated since the last flush as one batch.
    /// Coalesces a burst of UI changes into a single message.
    pub fn flush_mirror(&self) -> Result<(), BridgeError> {
        let (id, patches) = {
            let mut mirror = self.mirror.lock().unwrap();
            if mirror.pending.is_empty() {
                return Ok(());
            }
            let id = mirror.next_id;
            mirror.next_id += 1;
            (id, std::mem::take(&mut mirror.pending))
        };
        let patches =
            serde_json::to_vec(&patches).map_err(|e| BridgeError::Wire(e.to_string()))?;
        let bytes = WireMessage::Patch { id, patches }.encode()?;
        if !self.tx.send(Envelope::new(bytes)) {
            log::debug!("bridge: worker gone, dropped patch batch {id}");
        }
        Ok(())
    }

    /// Drive the mirror from a store subscription: each state change
    /// diffs every tracked slice against the new snapshot and flushes one
    /// batch. The task ends when the store is destroyed; hand the returned
    /// handle to [`Store::own_task`] so teardown aborts it early. The task
    /// keeps the bridge alive; call on a clone of the handle.
    pub fn mirror_store(
        self: Arc<Self>,
        mut states: watch::Receiver<Arc<StoreState>>,
    ) -> tokio::task::AbortHandle {
        let bridge = self;
        let handle = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = states.borrow_and_update().clone();
                let tracked: Vec<String> = {
                    let mirror = bridge.mirror.lock().unwrap();
                    mirror.tracked.keys().cloned().collect()
                };
                for slice in tracked {
                    if let Some(value) = state.slice(&slice) {
                        bridge.mirror(&slice, value);
                    }
                }
                if let Err(e) = bridge.flush_mirror() {
                    log::error!("bridge: mirror flush failed: {e}");
                }
            }
            log::debug!("bridge: mirror task finished, store gone");
        });
        handle.abort_handle()
    }

    fn send_resync(&self) {
        let (id, snapshot) = {
            let mut mirror = self.mirror.lock().unwrap();
            // The snapshot supersedes anything pending.
            mirror.pending.clear();
            let id = mirror.next_id;
            mirror.next_id += 1;
            let mut root = Map::new();
            for (name, value) in &mirror.tracked {
                root.insert(name.clone(), value.clone());
            }
            (id, Value::Object(root))
        };
        let snapshot = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("bridge: failed to encode resync snapshot: {e}");
                return;
            }
        };
        match (WireMessage::Resync { id, snapshot }).encode() {
            Ok(bytes) => {
                log::info!("bridge: sending full resync at id {id}");
                self.tx.send(Envelope::new(bytes));
            }
            Err(e) => log::error!("bridge: failed to encode resync: {e}"),
        }
    }

    /// Stop the return-path pump. Dropping the bridge closes the port.
    pub fn close(&self) {
        if let Some(handle) = self.pump.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for WindowBridge {
    fn drop(&mut self) {
        self.close();
    }
}

/// Worker half: decodes incoming traffic, re-dispatches remote actions
/// into the worker store, and maintains the mirror replica.
pub struct WorkerBridge {
    replica: Arc<Mutex<MirrorReplica>>,
    pump: tokio::task::AbortHandle,
}

impl WorkerBridge {
    /// Validate the table and start the pump over the given port.
    pub fn spawn(
        port: MessagePort,
        table: Arc<SerializerTable>,
        store: Arc<tokio::sync::Mutex<Store>>,
    ) -> Result<Self, BridgeError> {
        table.validate()?;
        let (tx, mut rx) = port.split();
        let replica = Arc::new(Mutex::new(MirrorReplica::new()));
        let replica_task = replica.clone();

        let handle = tokio::spawn(async move {
            while let Some(mut env) = rx.recv().await {
                match WireMessage::decode(&env.bytes) {
                    Ok(WireMessage::Action { name, payload, .. }) => {
                        let Some(kind) = ActionKind::from_name(&name) else {
                            log::warn!("worker bridge: ignoring unknown action name {name:?}");
                            continue;
                        };
                        let value: Value = match serde_json::from_slice(&payload) {
                            Ok(v) => v,
                            Err(e) => {
                                log::warn!("worker bridge: bad payload for {name}: {e}");
                                continue;
                            }
                        };
                        let serializer = table.get(kind).unwrap_or_else(|| {
                            panic!("no serializer registered for {}", kind.as_name())
                        });
                        match serializer.decode(kind, value, env.transfer.take()) {
                            Ok(action) => store.lock().await.dispatch(action),
                            Err(e) => {
                                log::warn!("worker bridge: failed to decode {name}: {e}");
                            }
                        }
                    }
                    Ok(WireMessage::Patch { id, patches }) => {
                        let patches: Vec<PatchOp> = match serde_json::from_slice(&patches) {
                            Ok(p) => p,
                            Err(e) => {
                                log::warn!("worker bridge: bad patch batch {id}: {e}");
                                continue;
                            }
                        };
                        let outcome = replica_task
                            .lock()
                            .unwrap()
                            .apply(PatchBatch { id, patches });
                        if outcome == ApplyOutcome::ResyncNeeded {
                            match WireMessage::ResyncRequest.encode() {
                                Ok(bytes) => {
                                    tx.send(Envelope::new(bytes));
                                }
                                Err(e) => log::error!("worker bridge: {e}"),
                            }
                        }
                    }
                    Ok(WireMessage::Resync { id, snapshot }) => {
                        match serde_json::from_slice(&snapshot) {
                            Ok(tree) => replica_task.lock().unwrap().resync(tree, id),
                            Err(e) => log::warn!("worker bridge: bad resync snapshot: {e}"),
                        }
                    }
                    Ok(WireMessage::ResyncRequest) => {
                        log::warn!("worker bridge: ignoring resync request from window side");
                    }
                    Err(e) => {
                        log::warn!("worker bridge: ignoring undecodable message: {e}");
                    }
                }
            }
            log::debug!("worker bridge: pump finished, window port closed");
        });

        Ok(Self {
            replica,
            pump: handle.abort_handle(),
        })
    }

    /// The replicated window substate.
    pub fn replica(&self) -> Arc<Mutex<MirrorReplica>> {
        self.replica.clone()
    }

    pub fn close(&self) {
        self.pump.abort();
    }
}

impl Drop for WorkerBridge {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bridge errors.
#[derive(Debug, Clone)]
pub enum BridgeError {
    Wire(String),
    Serializer(crate::action::ActionError),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::Wire(e) => write!(f, "wire codec error: {e}"),
            BridgeError::Serializer(e) => write!(f, "serializer error: {e}"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<crate::action::ActionError> for BridgeError {
    fn from(e: crate::action::ActionError) -> Self {
        BridgeError::Serializer(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel_pair;
    use crate::store::StoreBuilder;
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_should_forward_whitelist() {
        assert!(should_forward("action::note:create"));
        assert!(should_forward("action::workspace:create"));
        assert!(should_forward("action::collab:connect"));
        assert!(!should_forward("action::page:navigate"));
        assert!(!should_forward("action::ui:set-theme"));
        assert!(!should_forward("note:create"));
    }

    #[test]
    fn test_wire_message_roundtrip() {
        let msg = WireMessage::Action {
            name: "action::note:create".into(),
            store: "worker".into(),
            payload: br#"{"title":"x"}"#.to_vec(),
            has_transfer: false,
        };
        let bytes = msg.encode().unwrap();
        match WireMessage::decode(&bytes).unwrap() {
            WireMessage::Action { name, store, payload, has_transfer } => {
                assert_eq!(name, "action::note:create");
                assert_eq!(store, "worker");
                assert_eq!(payload, br#"{"title":"x"}"#);
                assert!(!has_transfer);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_wire_decode_garbage_fails() {
        assert!(WireMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[tokio::test]
    async fn test_forward_sends_only_whitelisted() {
        let (window_port, mut worker_port) = channel_pair();
        let bridge = WindowBridge::spawn(
            window_port,
            Arc::new(SerializerTable::standard()),
            "worker",
        )
        .unwrap();

        // Window-local: nothing on the channel.
        bridge
            .forward(Action::new(ActionKind::PageNavigate, json!({"route": "/x"})))
            .unwrap();
        // Whitelisted: one message.
        bridge
            .forward(Action::new(ActionKind::NoteCreate, json!({"title": "n"})))
            .unwrap();

        let env = timeout(Duration::from_secs(1), worker_port.recv())
            .await
            .unwrap()
            .unwrap();
        match WireMessage::decode(&env.bytes).unwrap() {
            WireMessage::Action { name, .. } => assert_eq!(name, "action::note:create"),
            other => panic!("wrong variant: {other:?}"),
        }
        // No second message pending.
        let pending = timeout(Duration::from_millis(100), worker_port.recv()).await;
        assert!(pending.is_err(), "only the whitelisted action crosses");
    }

    #[tokio::test]
    async fn test_forward_transfers_port() {
        let (window_port, mut worker_port) = channel_pair();
        let bridge = WindowBridge::spawn(
            window_port,
            Arc::new(SerializerTable::standard()),
            "worker",
        )
        .unwrap();

        let (keep, give) = channel_pair();
        bridge
            .forward(Action::with_transfer(
                ActionKind::CollabConnect,
                json!({"capability": "steps"}),
                give,
            ))
            .unwrap();

        let env = timeout(Duration::from_secs(1), worker_port.recv())
            .await
            .unwrap()
            .unwrap();
        let moved = env.transfer.expect("port moved with the message");
        assert!(matches!(
            WireMessage::decode(&env.bytes).unwrap(),
            WireMessage::Action { has_transfer: true, .. }
        ));

        // Moved endpoint still wired to the retained one.
        moved.send(Envelope::new(b"hello".to_vec()));
        let (_tx, mut rx) = keep.split();
        assert_eq!(rx.recv().await.unwrap().bytes, b"hello");
    }

    #[tokio::test]
    async fn test_mirror_coalesces_into_one_batch() {
        let (window_port, mut worker_port) = channel_pair();
        let bridge = WindowBridge::spawn(
            window_port,
            Arc::new(SerializerTable::standard()),
            "worker",
        )
        .unwrap();

        bridge.track("page", &json!({"route": "/"}));
        bridge.mirror("page", &json!({"route": "/a"}));
        bridge.mirror("page", &json!({"route": "/b", "dirty": true}));
        bridge.flush_mirror().unwrap();

        let env = timeout(Duration::from_secs(1), worker_port.recv())
            .await
            .unwrap()
            .unwrap();
        match WireMessage::decode(&env.bytes).unwrap() {
            WireMessage::Patch { id, patches } => {
                assert_eq!(id, 0);
                let ops: Vec<PatchOp> = serde_json::from_slice(&patches).unwrap();
                // Initial replace + two route changes + dirty flag, one message.
                assert!(ops.len() >= 3);
            }
            other => panic!("wrong variant: {other:?}"),
        }
        // Burst coalesced: no extra messages.
        assert!(timeout(Duration::from_millis(100), worker_port.recv())
            .await
            .is_err());

        // Empty flush sends nothing.
        bridge.flush_mirror().unwrap();
        assert!(timeout(Duration::from_millis(100), worker_port.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_mirror_store_follows_subscription() {
        struct PageSlice;
        impl crate::store::StoreSlice for PageSlice {
            fn name(&self) -> &'static str {
                "page"
            }
            fn init(&self) -> Value {
                json!({"route": "/"})
            }
            fn apply(&self, state: &Value, action: &Action) -> Option<Value> {
                if action.kind == ActionKind::PageNavigate {
                    let mut next = state.clone();
                    next["route"] = action.value["route"].clone();
                    Some(next)
                } else {
                    None
                }
            }
        }

        let (window_port, mut worker_port) = channel_pair();
        let bridge = WindowBridge::spawn(
            window_port,
            Arc::new(SerializerTable::standard()),
            "worker",
        )
        .unwrap();
        let mut store = StoreBuilder::new("window").slice(PageSlice).build().unwrap();

        bridge.track("page", store.state().slice("page").unwrap());
        store.own_task(bridge.clone().mirror_store(store.subscribe()));

        // No manual mirror/flush: the change notification drives the batch.
        store.dispatch(Action::new(
            ActionKind::PageNavigate,
            json!({"route": "/settings"}),
        ));

        let env = timeout(Duration::from_secs(2), worker_port.recv())
            .await
            .unwrap()
            .unwrap();
        match WireMessage::decode(&env.bytes).unwrap() {
            WireMessage::Patch { patches, .. } => {
                let ops: Vec<PatchOp> = serde_json::from_slice(&patches).unwrap();
                let found = ops.iter().any(|op| {
                    matches!(&op.op, crate::patch::PatchValue::Replace(v) if v == &json!("/settings"))
                });
                assert!(found, "route change never mirrored");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_bridge_redispatches_remote_actions() {
        struct TitleSlice;
        impl crate::store::StoreSlice for TitleSlice {
            fn name(&self) -> &'static str {
                "notes"
            }
            fn init(&self) -> Value {
                json!({"titles": []})
            }
            fn apply(&self, state: &Value, action: &Action) -> Option<Value> {
                if action.kind == ActionKind::NoteCreate {
                    let mut next = state.clone();
                    next["titles"]
                        .as_array_mut()
                        .unwrap()
                        .push(action.value["title"].clone());
                    Some(next)
                } else {
                    None
                }
            }
        }

        let (window_port, worker_port) = channel_pair();
        let table = Arc::new(SerializerTable::standard());
        let window = WindowBridge::spawn(window_port, table.clone(), "worker").unwrap();

        let store = Arc::new(tokio::sync::Mutex::new(
            StoreBuilder::new("worker").slice(TitleSlice).build().unwrap(),
        ));
        let _worker = WorkerBridge::spawn(worker_port, table, store.clone()).unwrap();

        window
            .forward(Action::new(ActionKind::NoteCreate, json!({"title": "remote"})))
            .unwrap();

        // Wait for the pump to dispatch.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let titles = store
                .lock()
                .await
                .state()
                .slice("notes")
                .unwrap()["titles"]
                .clone();
            if titles == json!(["remote"]) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "dispatch never landed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_worker_bridge_ignores_unknown_traffic() {
        let (window_port, worker_port) = channel_pair();
        let table = Arc::new(SerializerTable::standard());
        let store = Arc::new(tokio::sync::Mutex::new(
            StoreBuilder::new("worker").build().unwrap(),
        ));
        let worker = WorkerBridge::spawn(worker_port, table.clone(), store).unwrap();

        let (tx, _rx) = window_port.split();
        // Garbage bytes, then an unknown action name: both dropped.
        tx.send(Envelope::new(vec![0xDE, 0xAD]));
        let unknown = WireMessage::Action {
            name: "action::future:verb".into(),
            store: "worker".into(),
            payload: b"{}".to_vec(),
            has_transfer: false,
        };
        tx.send(Envelope::new(unknown.encode().unwrap()));

        // A valid patch after the junk still applies: the pump survived.
        let patch = WireMessage::Patch {
            id: 0,
            patches: serde_json::to_vec(&vec![PatchOp {
                path: vec!["page".into()],
                op: crate::patch::PatchValue::Replace(json!({"route": "/ok"})),
            }])
            .unwrap(),
        };
        tx.send(Envelope::new(patch.encode().unwrap()));

        let replica = worker.replica();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if replica.lock().unwrap().next_id() == 1 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "patch never applied");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            replica.lock().unwrap().tree()["page"]["route"],
            json!("/ok")
        );
    }

    #[tokio::test]
    async fn test_gap_triggers_resync_roundtrip() {
        let (window_port, worker_port) = channel_pair();
        let table = Arc::new(SerializerTable::standard());
        let window = WindowBridge::spawn(window_port, table.clone(), "worker").unwrap();
        let store = Arc::new(tokio::sync::Mutex::new(
            StoreBuilder::new("worker").build().unwrap(),
        ));
        let worker = WorkerBridge::spawn(worker_port, table, store).unwrap();

        window.track("page", &json!({"route": "/"}));
        window.flush_mirror().unwrap(); // batch 0
        window.mirror("page", &json!({"route": "/lost"}));
        // Simulate a dropped batch: consume id 1 without sending it.
        {
            let mut mirror = window.mirror.lock().unwrap();
            mirror.pending.clear();
            mirror.next_id += 1;
        }
        window.mirror("page", &json!({"route": "/after-gap"}));
        window.flush_mirror().unwrap(); // batch 2, leaving a gap at 1

        // The worker detects the gap, requests resync, and the window's
        // pump answers with a full snapshot; the replica converges.
        let replica = worker.replica();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            {
                let r = replica.lock().unwrap();
                if r.tree()["page"]["route"] == json!("/after-gap") {
                    break;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "replica never converged after gap"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
