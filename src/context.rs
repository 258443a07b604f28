//! Process-lifetime context for the worker side.
//!
//! Everything with process lifetime lives here, owned by one explicit
//! object handed to whoever needs it: the message bus, the debounced
//! disk, the session manager, and the backing stores. Construction wires
//! them together; `dispose` tears them down in dependency order.

use std::sync::Arc;

use crate::action::Action;
use crate::backing::{DocStore, MemoryDocs, MemoryRecords, RecordStore};
use crate::bus::MessageBus;
use crate::disk::{DebouncedDisk, DiskConfig};
use crate::session::{SessionConfig, SessionManager};
use crate::store::Effect;

/// Combined configuration for a context.
#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    pub disk: DiskConfig,
    pub session: SessionConfig,
}

impl ContextConfig {
    pub fn for_testing() -> Self {
        Self {
            disk: DiskConfig::for_testing(),
            session: SessionConfig::for_testing(),
        }
    }
}

/// The worker-side service container.
pub struct CollabContext {
    bus: MessageBus,
    disk: Arc<DebouncedDisk>,
    sessions: Arc<SessionManager>,
    records: Arc<dyn RecordStore>,
    docs: Arc<dyn DocStore>,
}

impl CollabContext {
    pub fn new(
        config: ContextConfig,
        records: Arc<dyn RecordStore>,
        docs: Arc<dyn DocStore>,
    ) -> Arc<Self> {
        let bus = MessageBus::new();
        let disk = DebouncedDisk::new(config.disk, docs.clone());
        let sessions = SessionManager::spawn(config.session, disk.clone(), bus.clone());
        Arc::new(Self {
            bus,
            disk,
            sessions,
            records,
            docs,
        })
    }

    /// A context over volatile stores, for tests and scratch embedding.
    pub fn in_memory(config: ContextConfig) -> Arc<Self> {
        Self::new(
            config,
            Arc::new(MemoryRecords::new()),
            Arc::new(MemoryDocs::new()),
        )
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn disk(&self) -> &Arc<DebouncedDisk> {
        &self.disk
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn docs(&self) -> &Arc<dyn DocStore> {
        &self.docs
    }

    /// The worker effect for the collab-connect handshake: takes the port
    /// that rode in with the action and attaches it to this context's bus.
    /// This is the only way the worker learns a collab channel exists.
    /// The effect keeps the context alive; call on a clone of the handle.
    pub fn connect_effect(self: Arc<Self>) -> Effect {
        let ctx = self;
        Box::new(move |action: &mut Action| match action.transfer.take() {
            Some(port) => {
                log::info!("collab: attaching transferred channel to the bus");
                ctx.bus.attach_port(port);
            }
            None => {
                log::warn!("collab: connect action arrived without a channel, ignoring");
            }
        })
    }

    /// Tear down: destroy sessions (flushing each), drain the disk, and
    /// detach bus relays so peer sends become no-ops.
    pub async fn dispose(&self) {
        self.sessions.shutdown().await;
        self.disk.shutdown().await;
        self.bus.detach_all();
        log::info!("collab context disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use crate::bus::{BusMessage, TOPIC_STEPS};
    use crate::channel::channel_pair;
    use crate::store::StoreBuilder;
    use serde_json::json;
    use tokio::time::{timeout, Duration};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_connect_effect_attaches_port() {
        let ctx = CollabContext::in_memory(ContextConfig::for_testing());
        let mut worker_store = StoreBuilder::new("worker")
            .effect(ActionKind::CollabConnect, ctx.clone().connect_effect())
            .build()
            .unwrap();

        // Window side keeps one end, hands the other over in the action.
        let window_bus = MessageBus::new();
        let (window_end, worker_end) = channel_pair();
        window_bus.attach_port(window_end);

        worker_store.dispatch(Action::with_transfer(
            ActionKind::CollabConnect,
            json!({"capability": "steps"}),
            worker_end,
        ));
        assert_eq!(ctx.bus().relay_count(), 1);

        // Traffic now crosses the attached channel in both directions.
        let mut on_worker = ctx.bus().subscribe(TOPIC_STEPS);
        window_bus.publish(BusMessage::new(TOPIC_STEPS, b"over the wire".to_vec()));
        let got = timeout(Duration::from_secs(2), on_worker.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.payload, b"over the wire");
    }

    #[tokio::test]
    async fn test_connect_effect_tolerates_missing_port() {
        let ctx = CollabContext::in_memory(ContextConfig::for_testing());
        let mut worker_store = StoreBuilder::new("worker")
            .effect(ActionKind::CollabConnect, ctx.clone().connect_effect())
            .build()
            .unwrap();

        worker_store.dispatch(Action::new(ActionKind::CollabConnect, json!({})));
        assert_eq!(ctx.bus().relay_count(), 0);
    }

    #[tokio::test]
    async fn test_dispose_flushes_and_detaches() {
        let docs = Arc::new(MemoryDocs::new());
        let ctx = CollabContext::new(
            ContextConfig::for_testing(),
            Arc::new(MemoryRecords::new()),
            docs.clone(),
        );

        let doc_id = Uuid::new_v4();
        ctx.disk().write(doc_id, "unsaved".into()).unwrap();

        let (window_end, worker_end) = channel_pair();
        ctx.bus().attach_port(worker_end);

        ctx.dispose().await;

        assert_eq!(ctx.disk().pending_writes(), 0);
        assert_eq!(
            docs.read(&format!("docs/{doc_id}")).unwrap(),
            Some("unsaved".into())
        );
        assert_eq!(ctx.bus().relay_count(), 0);
        // The peer's send is swallowed, not an error.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!window_end.send(crate::channel::Envelope::new(vec![1])));
    }
}
