//! # Tandem
//!
//! The window/worker split core of a collaborative notes application:
//! a reactive store mirrored across an in-process channel boundary, a
//! message bus with transferable ports, step-based collaborative editing
//! sessions, and debounced persistence.
//!
//! ```text
//!        window context                        worker context
//!  ┌─────────────────────┐              ┌──────────────────────────┐
//!  │ Store ──► Window    │  MessagePort │  WorkerBridge ──► Store  │
//!  │   │       Bridge ───┼──────────────┼──►  │  (remote dispatch) │
//!  │   └─ mirror patches │   (bincode)  │     └─ MirrorReplica     │
//!  │                     │              │                          │
//!  │ MessageBus ◄────────┼── transferred┼──► MessageBus            │
//!  └─────────────────────┘     port     │     │                    │
//!                                       │  SessionManager          │
//!                                       │     │  steps/rebase      │
//!                                       │  DebouncedDisk           │
//!                                       │     │  debounce+ceiling  │
//!                                       │  backing stores          │
//!                                       └──────────────────────────┘
//! ```
//!
//! The window store forwards whitelisted actions over the bridge; the
//! worker re-dispatches them so effects run exactly once, on the worker.
//! Window substate replicates to the worker as structural patch batches,
//! with gap detection and full resync. Collaboration traffic rides a
//! separate port established by a transfer handshake and fanned out by
//! the [`bus::MessageBus`]. Documents are edited through
//! [`session::SessionManager`] (the authority) and [`client::CollabClient`]
//! (which rebases), and persisted through [`disk::DebouncedDisk`].
//!
//! The library never installs a logger; embedders bring their own `log`
//! backend.

pub mod action;
pub mod backing;
pub mod bridge;
pub mod bus;
pub mod channel;
pub mod client;
pub mod context;
pub mod disk;
pub mod patch;
pub mod session;
pub mod steps;
pub mod store;

pub use action::{Action, ActionKind, ActionSerializer, SerializerTable, WirePayload};
pub use backing::{DocStore, MemoryDocs, MemoryRecords, RecordStore};
pub use bridge::{should_forward, WindowBridge, WireMessage, WorkerBridge, FORWARD_PREFIXES};
pub use bus::{BusMessage, MessageBus, TOPIC_SESSION, TOPIC_STEPS};
pub use channel::{channel_pair, Envelope, MessagePort};
pub use client::CollabClient;
pub use context::{CollabContext, ContextConfig};
pub use disk::{DebouncedDisk, DiskConfig, SaveFailure};
pub use patch::{diff, ApplyOutcome, MirrorReplica, PatchBatch, PatchOp, PatchValue};
pub use session::{
    JoinInfo, SessionConfig, SessionEvent, SessionManager, StepsCommit, SubmitOutcome,
};
pub use steps::{rebase_steps, Step};
pub use store::{Store, StoreBuilder, StoreSlice, StoreState};
