//! Actions and the per-kind serializer table.
//!
//! Every state-change request is an [`Action`]: a closed [`ActionKind`]
//! tag, a JSON value, and a unique id. Name strings like
//! `action::note:create` exist only at the wire boundary; routing inside
//! the process is by enum, so a known kind with a missing handler is a
//! compile error, while an unknown incoming name is tolerated and dropped.
//!
//! Serializers convert actions to wire payloads and back. Most kinds use
//! the plain JSON form; the collaboration handshake kind instead produces
//! an owned-handle payload that moves a [`MessagePort`] with the message
//! rather than copying it.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::channel::MessagePort;

/// Closed set of action kinds the system routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Window-only navigation change.
    PageNavigate,
    /// Window-only theme change.
    UiSetTheme,
    /// Create a workspace (forwarded; worker owns the side effect).
    WorkspaceCreate,
    /// Create a note (forwarded).
    NoteCreate,
    /// Rename a note (forwarded).
    NoteRename,
    /// Delete a note (forwarded).
    NoteDelete,
    /// Collaboration handshake: transfers a channel endpoint to the worker.
    CollabConnect,
}

impl ActionKind {
    /// Every routable kind, for startup validation sweeps.
    pub const ALL: [ActionKind; 7] = [
        ActionKind::PageNavigate,
        ActionKind::UiSetTheme,
        ActionKind::WorkspaceCreate,
        ActionKind::NoteCreate,
        ActionKind::NoteRename,
        ActionKind::NoteDelete,
        ActionKind::CollabConnect,
    ];

    /// Namespaced wire name, `action::<owner>:<verb>`.
    pub fn as_name(&self) -> &'static str {
        match self {
            ActionKind::PageNavigate => "action::page:navigate",
            ActionKind::UiSetTheme => "action::ui:set-theme",
            ActionKind::WorkspaceCreate => "action::workspace:create",
            ActionKind::NoteCreate => "action::note:create",
            ActionKind::NoteRename => "action::note:rename",
            ActionKind::NoteDelete => "action::note:delete",
            ActionKind::CollabConnect => "action::collab:connect",
        }
    }

    /// Resolve a wire name; `None` for names this build does not know.
    pub fn from_name(name: &str) -> Option<ActionKind> {
        Self::ALL.iter().copied().find(|k| k.as_name() == name)
    }
}

/// A named, immutable state-change request.
///
/// The `transfer` slot carries a port for handshake-style kinds; it is
/// consumed exactly once, by either the forwarding serializer (window
/// side) or the registered effect (worker side).
pub struct Action {
    pub kind: ActionKind,
    pub value: Value,
    pub id: Uuid,
    /// Set on actions re-dispatched from the peer context; stops the
    /// bridge from forwarding them back (no infinite loop).
    pub from_remote: bool,
    pub transfer: Option<MessagePort>,
}

impl Action {
    pub fn new(kind: ActionKind, value: Value) -> Self {
        Self {
            kind,
            value,
            id: Uuid::new_v4(),
            from_remote: false,
            transfer: None,
        }
    }

    /// An action that moves a port to the peer context.
    pub fn with_transfer(kind: ActionKind, value: Value, port: MessagePort) -> Self {
        Self {
            kind,
            value,
            id: Uuid::new_v4(),
            from_remote: false,
            transfer: Some(port),
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Action")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("from_remote", &self.from_remote)
            .field("transfer", &self.transfer.is_some())
            .finish()
    }
}

/// Output of a serializer: either a plain wire-safe value, or a value plus
/// an owned port that the transport must move with the message.
pub enum WirePayload {
    Plain(Value),
    WithPort(Value, MessagePort),
}

/// Per-kind encode/decode.
pub trait ActionSerializer: Send + Sync {
    /// Encode for the wire. May consume the action's transfer slot.
    fn encode(&self, action: &mut Action) -> Result<WirePayload, ActionError>;

    /// Rebuild an action from wire parts. Decoded actions are marked
    /// `from_remote`.
    fn decode(
        &self,
        kind: ActionKind,
        value: Value,
        transfer: Option<MessagePort>,
    ) -> Result<Action, ActionError>;
}

/// Serializer for ordinary copyable action values.
pub struct PlainSerializer;

impl ActionSerializer for PlainSerializer {
    fn encode(&self, action: &mut Action) -> Result<WirePayload, ActionError> {
        if action.transfer.is_some() {
            return Err(ActionError::UnexpectedTransfer(action.kind));
        }
        Ok(WirePayload::Plain(action.value.clone()))
    }

    fn decode(
        &self,
        kind: ActionKind,
        value: Value,
        transfer: Option<MessagePort>,
    ) -> Result<Action, ActionError> {
        if transfer.is_some() {
            return Err(ActionError::UnexpectedTransfer(kind));
        }
        Ok(Action {
            kind,
            value,
            id: Uuid::new_v4(),
            from_remote: true,
            transfer: None,
        })
    }
}

/// Serializer for handshake kinds whose payload carries a port. The port
/// is marked for transfer, never copied.
pub struct PortSerializer;

impl ActionSerializer for PortSerializer {
    fn encode(&self, action: &mut Action) -> Result<WirePayload, ActionError> {
        let port = action
            .transfer
            .take()
            .ok_or(ActionError::MissingTransfer(action.kind))?;
        Ok(WirePayload::WithPort(action.value.clone(), port))
    }

    fn decode(
        &self,
        kind: ActionKind,
        value: Value,
        transfer: Option<MessagePort>,
    ) -> Result<Action, ActionError> {
        let port = transfer.ok_or(ActionError::MissingTransfer(kind))?;
        Ok(Action {
            kind,
            value,
            id: Uuid::new_v4(),
            from_remote: true,
            transfer: Some(port),
        })
    }
}

/// Typed registration table: exactly one serializer per kind, checked at
/// startup so "unregistered action" cannot surface mid-flight.
pub struct SerializerTable {
    map: HashMap<ActionKind, Arc<dyn ActionSerializer>>,
}

impl SerializerTable {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// The standard table covering every kind in [`ActionKind::ALL`].
    pub fn standard() -> Self {
        let mut table = Self::new();
        for kind in ActionKind::ALL {
            let ser: Arc<dyn ActionSerializer> = match kind {
                ActionKind::CollabConnect => Arc::new(PortSerializer),
                _ => Arc::new(PlainSerializer),
            };
            // Fresh table, one insert per kind: cannot collide.
            let _ = table.register(kind, ser);
        }
        table
    }

    /// Register a serializer; rejects double registration.
    pub fn register(
        &mut self,
        kind: ActionKind,
        serializer: Arc<dyn ActionSerializer>,
    ) -> Result<(), ActionError> {
        if self.map.contains_key(&kind) {
            return Err(ActionError::DuplicateSerializer(kind));
        }
        self.map.insert(kind, serializer);
        Ok(())
    }

    /// Startup validation: every kind has a serializer.
    pub fn validate(&self) -> Result<(), ActionError> {
        for kind in ActionKind::ALL {
            if !self.map.contains_key(&kind) {
                return Err(ActionError::MissingSerializer(kind));
            }
        }
        Ok(())
    }

    pub fn get(&self, kind: ActionKind) -> Option<&Arc<dyn ActionSerializer>> {
        self.map.get(&kind)
    }
}

impl Default for SerializerTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Action model errors.
#[derive(Debug, Clone)]
pub enum ActionError {
    MissingSerializer(ActionKind),
    DuplicateSerializer(ActionKind),
    MissingTransfer(ActionKind),
    UnexpectedTransfer(ActionKind),
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionError::MissingSerializer(k) => {
                write!(f, "no serializer registered for {}", k.as_name())
            }
            ActionError::DuplicateSerializer(k) => {
                write!(f, "serializer already registered for {}", k.as_name())
            }
            ActionError::MissingTransfer(k) => {
                write!(f, "{} requires a transferred port", k.as_name())
            }
            ActionError::UnexpectedTransfer(k) => {
                write!(f, "{} does not accept a transferred port", k.as_name())
            }
        }
    }
}

impl std::error::Error for ActionError {}
