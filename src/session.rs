//! Per-document collaboration sessions.
//!
//! The manager owns one session per open document. A session holds the
//! authoritative document text, a strictly monotonic version, the log of
//! committed steps, and the set of clients it has heard from recently.
//! Submissions at the current version commit atomically; submissions at an
//! older version get back the steps they missed so the client can rebase
//! and retry. The manager never transforms a client's steps itself.
//!
//! A sweep task runs in the background: clients silent past
//! `user_wait_timeout` are dropped, a session with no clients left goes
//! idle, and an idle session past `instance_cleanup_timeout` is flushed
//! and destroyed. The session stays resident through idle so a quick
//! rejoin skips the reload.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::bus::{BusMessage, MessageBus, TOPIC_SESSION, TOPIC_STEPS};
use crate::disk::DebouncedDisk;
use crate::steps::{Step, StepError};

/// Session lifecycle tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// A client silent for longer than this is dropped at the next sweep.
    pub user_wait_timeout: Duration,
    /// An idle session older than this is flushed and destroyed.
    pub instance_cleanup_timeout: Duration,
    /// Sweep cadence.
    pub collect_users_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_wait_timeout: Duration::from_secs(30),
            instance_cleanup_timeout: Duration::from_secs(60),
            collect_users_interval: Duration::from_secs(10),
        }
    }
}

impl SessionConfig {
    /// Small timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            user_wait_timeout: Duration::from_millis(80),
            instance_cleanup_timeout: Duration::from_millis(120),
            collect_users_interval: Duration::from_millis(25),
        }
    }
}

/// What a joining client needs to start editing.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub version: u64,
    pub doc: String,
}

/// Result of a step submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Steps committed; `version` is the new authoritative version.
    Accepted { version: u64 },
    /// The submission was based on an older version. `steps` are the
    /// commits made since that base; the client rebases and retries.
    Rebase { version: u64, steps: Vec<Step> },
}

/// Commit announcement published on [`TOPIC_STEPS`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepsCommit {
    pub doc_id: Uuid,
    pub client_id: Uuid,
    pub base_version: u64,
    pub version: u64,
    pub steps: Vec<Step>,
}

/// Lifecycle announcement published on [`TOPIC_SESSION`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    Created { doc_id: Uuid },
    Idle { doc_id: Uuid },
    Destroyed { doc_id: Uuid },
}

#[derive(Debug, Clone, Copy)]
enum SessionState {
    Active,
    Idle { since: Instant },
}

/// Committed steps retained for rebase responses. Older entries are
/// compacted away; a client based before the retained window gets
/// `StaleBase` and must rejoin.
const MAX_LOG_STEPS: usize = 512;

struct Session {
    doc_id: Uuid,
    version: u64,
    doc: String,
    /// Retained committed steps. `log[i]` produced version `log_base + i + 1`.
    log: Vec<Step>,
    log_base: u64,
    clients: HashMap<Uuid, Instant>,
    state: SessionState,
}

impl Session {
    fn new(doc_id: Uuid, doc: String) -> Self {
        Self {
            doc_id,
            version: 0,
            doc,
            log: Vec::new(),
            log_base: 0,
            clients: HashMap::new(),
            state: SessionState::Active,
        }
    }

    fn touch(&mut self, client_id: Uuid) {
        self.clients.insert(client_id, Instant::now());
        if matches!(self.state, SessionState::Idle { .. }) {
            log::debug!("session {}: idle -> active", self.doc_id);
            self.state = SessionState::Active;
        }
    }
}

type SharedSession = Arc<tokio::sync::Mutex<Session>>;

/// Owns every live session and the background sweep task.
pub struct SessionManager {
    config: SessionConfig,
    sessions: Mutex<HashMap<Uuid, SharedSession>>,
    disk: Arc<DebouncedDisk>,
    bus: MessageBus,
    sweeper: Mutex<Option<tokio::task::AbortHandle>>,
}

impl SessionManager {
    /// Create the manager and start its sweep task. The task holds only a
    /// weak handle, so dropping the manager stops it.
    pub fn spawn(config: SessionConfig, disk: Arc<DebouncedDisk>, bus: MessageBus) -> Arc<Self> {
        let interval = config.collect_users_interval;
        let manager = Arc::new(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            disk,
            bus,
            sweeper: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&manager);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else { break };
                manager.sweep().await;
            }
        });
        *manager.sweeper.lock().unwrap() = Some(handle.abort_handle());
        manager
    }

    /// Join a document, creating the session from persisted content on
    /// first join. Joining an idle session cancels its cleanup deadline.
    pub async fn join(&self, doc_id: Uuid, client_id: Uuid) -> Result<JoinInfo, SessionError> {
        let session = self.get_or_load(doc_id)?;
        let mut s = session.lock().await;
        s.touch(client_id);
        log::debug!(
            "session {doc_id}: client {client_id} joined at version {}",
            s.version
        );
        Ok(JoinInfo {
            version: s.version,
            doc: s.doc.clone(),
        })
    }

    /// Submit steps against a base version. Concurrent submits for one
    /// document serialize on the session lock; arrival order is
    /// acceptance order.
    pub async fn submit_steps(
        &self,
        doc_id: Uuid,
        client_id: Uuid,
        steps: Vec<Step>,
        base_version: u64,
    ) -> Result<SubmitOutcome, SessionError> {
        let session = self.get(doc_id)?;
        let mut s = session.lock().await;
        s.touch(client_id);

        if base_version > s.version {
            return Err(SessionError::FutureBase {
                base: base_version,
                version: s.version,
            });
        }
        if base_version < s.version {
            if base_version < s.log_base {
                return Err(SessionError::StaleBase {
                    base: base_version,
                    oldest: s.log_base,
                });
            }
            let missed = s.log[(base_version - s.log_base) as usize..].to_vec();
            log::debug!(
                "session {doc_id}: client {client_id} behind ({base_version} < {}), {} steps to rebase over",
                s.version,
                missed.len()
            );
            return Ok(SubmitOutcome::Rebase {
                version: s.version,
                steps: missed,
            });
        }

        if steps.is_empty() {
            return Ok(SubmitOutcome::Accepted { version: s.version });
        }

        // Stage on a copy so a rejected step leaves the session untouched.
        let mut doc = s.doc.clone();
        for step in &steps {
            doc = step.apply(&doc).map_err(SessionError::InvalidStep)?;
        }

        // Enqueue persistence before committing; a refused write leaves
        // the version unchanged and the submitter sees the failure.
        self.disk
            .write(doc_id, doc.clone())
            .map_err(|e| SessionError::Backend(e.to_string()))?;

        let base = s.version;
        s.doc = doc;
        s.version += steps.len() as u64;
        s.log.extend(steps.iter().cloned());
        if s.log.len() > MAX_LOG_STEPS {
            let excess = s.log.len() - MAX_LOG_STEPS;
            s.log.drain(..excess);
            s.log_base += excess as u64;
            log::debug!(
                "session {doc_id}: compacted {excess} steps, rebase window now starts at {}",
                s.log_base
            );
        }
        let version = s.version;
        drop(s);

        log::debug!(
            "session {doc_id}: committed {} steps from {client_id}, version {base} -> {version}",
            steps.len()
        );
        let commit = StepsCommit {
            doc_id,
            client_id,
            base_version: base,
            version,
            steps,
        };
        match serde_json::to_vec(&commit) {
            Ok(bytes) => self.bus.publish(BusMessage::new(TOPIC_STEPS, bytes)),
            Err(e) => log::error!("session {doc_id}: commit announcement encode failed: {e}"),
        }

        Ok(SubmitOutcome::Accepted { version })
    }

    /// Refresh a client's liveness. A client the session has already
    /// forgotten is simply re-registered.
    pub async fn heartbeat(&self, doc_id: Uuid, client_id: Uuid) -> Result<(), SessionError> {
        let session = self.get(doc_id)?;
        let mut s = session.lock().await;
        if !s.clients.contains_key(&client_id) {
            log::debug!("session {doc_id}: heartbeat re-registered client {client_id}");
        }
        s.touch(client_id);
        Ok(())
    }

    /// Flush a session's content and remove it. The cleanup timeout and
    /// explicit teardown share this path.
    pub async fn destroy(&self, doc_id: Uuid) -> Result<(), SessionError> {
        let session = self.sessions.lock().unwrap().remove(&doc_id);
        let Some(session) = session else {
            return Err(SessionError::UnknownDoc(doc_id));
        };
        let _guard = session.lock().await;
        self.disk
            .flush_key(doc_id)
            .await
            .map_err(|e| SessionError::Backend(e.to_string()))?;
        log::info!("session {doc_id}: destroyed");
        self.announce(SessionEvent::Destroyed { doc_id });
        Ok(())
    }

    /// Whether a session for this document is currently resident.
    pub fn contains(&self, doc_id: Uuid) -> bool {
        self.sessions.lock().unwrap().contains_key(&doc_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub async fn client_count(&self, doc_id: Uuid) -> Result<usize, SessionError> {
        let session = self.get(doc_id)?;
        let s = session.lock().await;
        Ok(s.clients.len())
    }

    /// Stop sweeping and destroy every session, flushing each.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        let doc_ids: Vec<Uuid> = self.sessions.lock().unwrap().keys().copied().collect();
        for doc_id in doc_ids {
            if let Err(e) = self.destroy(doc_id).await {
                log::error!("session {doc_id}: shutdown destroy failed: {e}");
            }
        }
    }

    fn get(&self, doc_id: Uuid) -> Result<SharedSession, SessionError> {
        self.sessions
            .lock()
            .unwrap()
            .get(&doc_id)
            .cloned()
            .ok_or(SessionError::UnknownDoc(doc_id))
    }

    fn get_or_load(&self, doc_id: Uuid) -> Result<SharedSession, SessionError> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get(&doc_id) {
            return Ok(session.clone());
        }
        let doc = self
            .disk
            .read(doc_id)
            .map_err(|e| SessionError::Backend(e.to_string()))?
            .unwrap_or_default();
        log::info!("session {doc_id}: created ({} chars loaded)", doc.chars().count());
        let session = Arc::new(tokio::sync::Mutex::new(Session::new(doc_id, doc)));
        sessions.insert(doc_id, session.clone());
        drop(sessions);
        self.announce(SessionEvent::Created { doc_id });
        Ok(session)
    }

    fn announce(&self, event: SessionEvent) {
        match serde_json::to_vec(&event) {
            Ok(bytes) => self.bus.publish(BusMessage::new(TOPIC_SESSION, bytes)),
            Err(e) => log::error!("session event encode failed: {e}"),
        }
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let snapshot: Vec<(Uuid, SharedSession)> = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();

        let mut expired = Vec::new();
        for (doc_id, session) in snapshot {
            let mut s = session.lock().await;
            let wait = self.config.user_wait_timeout;
            s.clients.retain(|client_id, last_seen| {
                let keep = now.duration_since(*last_seen) <= wait;
                if !keep {
                    log::debug!("session {doc_id}: dropping silent client {client_id}");
                }
                keep
            });
            match s.state {
                SessionState::Active if s.clients.is_empty() => {
                    log::info!("session {doc_id}: no clients left, going idle");
                    s.state = SessionState::Idle { since: now };
                    self.announce(SessionEvent::Idle { doc_id });
                }
                SessionState::Idle { since }
                    if now.duration_since(since) >= self.config.instance_cleanup_timeout =>
                {
                    expired.push(doc_id);
                }
                _ => {}
            }
        }

        for doc_id in expired {
            if let Err(e) = self.destroy(doc_id).await {
                log::error!("session {doc_id}: cleanup destroy failed: {e}");
            }
        }
    }
}

/// Session manager errors.
#[derive(Debug, Clone)]
pub enum SessionError {
    UnknownDoc(Uuid),
    /// Base version ahead of the authoritative version.
    FutureBase { base: u64, version: u64 },
    /// Base version older than the retained step log.
    StaleBase { base: u64, oldest: u64 },
    InvalidStep(StepError),
    Backend(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::UnknownDoc(doc_id) => write!(f, "no session for document {doc_id}"),
            SessionError::FutureBase { base, version } => {
                write!(f, "base version {base} is ahead of authoritative version {version}")
            }
            SessionError::StaleBase { base, oldest } => {
                write!(f, "base version {base} predates retained history (oldest {oldest})")
            }
            SessionError::InvalidStep(e) => write!(f, "step rejected: {e}"),
            SessionError::Backend(e) => write!(f, "persistence failed: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}
