//! Client-side editing state for one collaborative document.
//!
//! The client keeps the last confirmed authoritative text, the local view
//! (confirmed text plus unconfirmed local steps), and the queue of steps
//! not yet accepted by the session manager. All transformation happens
//! here: on a rebase response the client maps its queued steps over the
//! commits it missed, rebuilds the local view, and retries.

use uuid::Uuid;

use crate::session::{JoinInfo, SessionError, SessionManager, StepsCommit, SubmitOutcome};
use crate::steps::{rebase_steps, Step, StepError};

/// How many rebase-and-retry rounds one `sync` call will attempt.
const MAX_SYNC_ATTEMPTS: usize = 16;

pub struct CollabClient {
    client_id: Uuid,
    doc_id: Uuid,
    /// Last version confirmed by the manager.
    version: u64,
    /// Authoritative text at `version`.
    confirmed: String,
    /// Local view: `confirmed` with `unconfirmed` applied on top.
    doc: String,
    unconfirmed: Vec<Step>,
}

impl CollabClient {
    /// Join a document through the manager.
    pub async fn join(manager: &SessionManager, doc_id: Uuid) -> Result<Self, ClientError> {
        let client_id = Uuid::new_v4();
        let JoinInfo { version, doc } = manager.join(doc_id, client_id).await?;
        Ok(Self {
            client_id,
            doc_id,
            version,
            confirmed: doc.clone(),
            doc,
            unconfirmed: Vec::new(),
        })
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// The local view, including unconfirmed edits.
    pub fn doc(&self) -> &str {
        &self.doc
    }

    pub fn unconfirmed_len(&self) -> usize {
        self.unconfirmed.len()
    }

    /// Apply an edit locally and queue it for the next sync.
    pub fn apply_local(&mut self, step: Step) -> Result<(), ClientError> {
        self.doc = step.apply(&self.doc).map_err(ClientError::Step)?;
        self.unconfirmed.push(step);
        Ok(())
    }

    /// Push unconfirmed steps to the manager, rebasing and retrying until
    /// they land. Never drops an edit; gives up only after
    /// `MAX_SYNC_ATTEMPTS` rebase rounds.
    pub async fn sync(&mut self, manager: &SessionManager) -> Result<(), ClientError> {
        for _ in 0..MAX_SYNC_ATTEMPTS {
            if self.unconfirmed.is_empty() {
                return Ok(());
            }
            let outcome = manager
                .submit_steps(
                    self.doc_id,
                    self.client_id,
                    self.unconfirmed.clone(),
                    self.version,
                )
                .await?;
            match outcome {
                SubmitOutcome::Accepted { version } => {
                    self.version = version;
                    self.confirmed = self.doc.clone();
                    self.unconfirmed.clear();
                    return Ok(());
                }
                SubmitOutcome::Rebase { version, steps } => {
                    log::debug!(
                        "client {}: rebasing {} local steps over {} missed commits",
                        self.client_id,
                        self.unconfirmed.len(),
                        steps.len()
                    );
                    self.advance(version, &steps)?;
                }
            }
        }
        Err(ClientError::RetriesExhausted {
            attempts: MAX_SYNC_ATTEMPTS,
        })
    }

    /// Fold a remote commit in. Returns `true` if the commit was applied;
    /// `false` if it was stale, our own, or not contiguous with the known
    /// version (the next `sync` reconciles in that case).
    pub fn pull(&mut self, commit: &StepsCommit) -> Result<bool, ClientError> {
        if commit.doc_id != self.doc_id
            || commit.client_id == self.client_id
            || commit.version <= self.version
        {
            return Ok(false);
        }
        if commit.base_version != self.version {
            log::debug!(
                "client {}: commit base {} does not match known version {}, deferring to sync",
                self.client_id,
                commit.base_version,
                self.version
            );
            return Ok(false);
        }
        self.advance(commit.version, &commit.steps)?;
        Ok(true)
    }

    /// Heartbeat passthrough.
    pub async fn heartbeat(&self, manager: &SessionManager) -> Result<(), ClientError> {
        manager.heartbeat(self.doc_id, self.client_id).await?;
        Ok(())
    }

    /// Advance the confirmed text through committed steps, rebase the
    /// unconfirmed queue over them, and rebuild the local view.
    fn advance(&mut self, version: u64, committed: &[Step]) -> Result<(), ClientError> {
        for step in committed {
            self.confirmed = step.apply(&self.confirmed).map_err(ClientError::Step)?;
        }
        self.version = version;
        self.unconfirmed = rebase_steps(&self.unconfirmed, committed);
        self.doc = self.confirmed.clone();
        for step in &self.unconfirmed {
            self.doc = step.apply(&self.doc).map_err(ClientError::Step)?;
        }
        Ok(())
    }
}

/// Client-side errors.
#[derive(Debug)]
pub enum ClientError {
    Session(SessionError),
    Step(StepError),
    RetriesExhausted { attempts: usize },
}

impl From<SessionError> for ClientError {
    fn from(e: SessionError) -> Self {
        ClientError::Session(e)
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Session(e) => write!(f, "session error: {e}"),
            ClientError::Step(e) => write!(f, "local step failed: {e}"),
            ClientError::RetriesExhausted { attempts } => {
                write!(f, "sync gave up after {attempts} rebase rounds")
            }
        }
    }
}

impl std::error::Error for ClientError {}
