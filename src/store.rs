//! Reactive state container, one per execution context.
//!
//! A store is composed of named slices. Dispatching an [`Action`] runs
//! every slice reducer against the current snapshot and, if anything
//! changed, publishes a new immutable snapshot; old snapshots stay valid
//! for whoever still holds them. After the reducers, per-kind effects run
//! (registered on exactly one side, conventionally the worker), and
//! locally-originated actions are handed to the forwarder for the bridge
//! to ship across the boundary.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::action::{Action, ActionKind};

/// One named piece of store state with its init/apply logic.
pub trait StoreSlice: Send + Sync {
    fn name(&self) -> &'static str;

    /// Initial slice value.
    fn init(&self) -> Value;

    /// Reduce an action against the current slice value. `None` means the
    /// slice is unaffected.
    fn apply(&self, state: &Value, action: &Action) -> Option<Value>;
}

/// Immutable snapshot of every slice.
#[derive(Debug, Clone, Default)]
pub struct StoreState {
    slices: HashMap<String, Value>,
}

impl StoreState {
    pub fn slice(&self, name: &str) -> Option<&Value> {
        self.slices.get(name)
    }
}

/// Effect callback, run after reducers. Takes the action mutably so a
/// handshake effect can consume the transferred port.
pub type Effect = Box<dyn Fn(&mut Action) + Send + Sync>;

/// Forwarder hook: receives locally-originated actions by value (the
/// bridge decides whether they cross the boundary).
pub type Forwarder = Box<dyn Fn(Action) + Send + Sync>;

/// Builder for a [`Store`]; rejects duplicate slice names at build time.
pub struct StoreBuilder {
    name: String,
    slices: Vec<Box<dyn StoreSlice>>,
    effects: HashMap<ActionKind, Vec<Effect>>,
}

impl StoreBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slices: Vec::new(),
            effects: HashMap::new(),
        }
    }

    pub fn slice(mut self, slice: impl StoreSlice + 'static) -> Self {
        self.slices.push(Box::new(slice));
        self
    }

    pub fn effect(mut self, kind: ActionKind, effect: Effect) -> Self {
        self.effects.entry(kind).or_default().push(effect);
        self
    }

    pub fn build(self) -> Result<Store, StoreError> {
        let mut slices_state = HashMap::new();
        for slice in &self.slices {
            if slices_state
                .insert(slice.name().to_string(), slice.init())
                .is_some()
            {
                return Err(StoreError::DuplicateSlice(slice.name().to_string()));
            }
        }

        let state = Arc::new(StoreState {
            slices: slices_state,
        });
        let (state_tx, _) = watch::channel(state.clone());

        Ok(Store {
            name: self.name,
            slices: self.slices,
            state,
            state_tx,
            effects: self.effects,
            forwarder: None,
            tasks: Vec::new(),
            destroyed: false,
        })
    }
}

/// The state container itself. Owned by a single context; all transitions
/// go through [`Store::dispatch`] and are serialized by construction.
pub struct Store {
    name: String,
    slices: Vec<Box<dyn StoreSlice>>,
    state: Arc<StoreState>,
    state_tx: watch::Sender<Arc<StoreState>>,
    effects: HashMap<ActionKind, Vec<Effect>>,
    forwarder: Option<Forwarder>,
    tasks: Vec<AbortHandle>,
    destroyed: bool,
}

impl Store {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Install the bridge's forwarding hook.
    pub fn set_forwarder(&mut self, forwarder: Forwarder) {
        self.forwarder = Some(forwarder);
    }

    /// Register a long-lived task against this store's lifetime; it is
    /// aborted on [`Store::destroy`].
    pub fn own_task(&mut self, handle: AbortHandle) {
        self.tasks.push(handle);
    }

    /// Current snapshot.
    pub fn state(&self) -> Arc<StoreState> {
        self.state.clone()
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<StoreState>> {
        self.state_tx.subscribe()
    }

    /// Apply an action: reducers, then effects, then forwarding.
    pub fn dispatch(&mut self, mut action: Action) {
        if self.destroyed {
            log::warn!("store {}: dispatch after destroy, dropping {:?}", self.name, action.kind);
            return;
        }
        log::trace!("store {}: dispatch {:?}", self.name, action.kind);

        let mut next = (*self.state).clone();
        let mut changed = false;
        for slice in &self.slices {
            let current = next
                .slices
                .get(slice.name())
                .cloned()
                .unwrap_or(Value::Null);
            if let Some(updated) = slice.apply(&current, &action) {
                next.slices.insert(slice.name().to_string(), updated);
                changed = true;
            }
        }
        if changed {
            self.state = Arc::new(next);
            let _ = self.state_tx.send(self.state.clone());
        }

        if let Some(effects) = self.effects.get(&action.kind) {
            for effect in effects {
                effect(&mut action);
            }
        }

        if !action.from_remote {
            if let Some(forwarder) = &self.forwarder {
                forwarder(action);
            }
        }
    }

    /// Tear down: abort owned tasks, drop the forwarder (closing any port
    /// it holds), refuse further dispatch.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        log::info!("store {}: destroyed", self.name);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.forwarder = None;
        self.destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Store construction errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    DuplicateSlice(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DuplicateSlice(name) => {
                write!(f, "slice {name:?} registered twice")
            }
        }
    }
}

impl std::error::Error for StoreError {}
