//! Debounced persistence between in-memory documents and the doc store.
//!
//! Writes land in a pending map and flush after `debounce_wait` of
//! quiescence on that key, but never later than `debounce_max_wait` after
//! the first unflushed write. The ceiling means a document under
//! continuous edit still reaches durable storage periodically.
//! Per-key timers are independent; flushing one key never blocks another.
//!
//! The pending count is observable through a watch channel and is the
//! backpressure signal upstream logic uses to hold "unsaved changes"
//! warnings open. An entry counts as pending until its payload is durably
//! written, including while a flush attempt is in flight or retrying. A
//! write that keeps failing after its retries stays pending (the count
//! never lies) and the failure is reported on the save-failure channel.
//!
//! Every write gets a generation number. Flushes for the same key are
//! serialized and record the generation they made durable; a flush that
//! lost the race to a newer one is dropped instead of regressing the
//! stored content.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::{sleep, sleep_until, Duration, Instant};
use uuid::Uuid;

use crate::backing::DocStore;

/// Disk tuning knobs.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Quiescence window per key before a flush.
    pub debounce_wait: Duration,
    /// Hard ceiling from the first unflushed write to a key.
    pub debounce_max_wait: Duration,
    /// Additional write attempts after the first failure.
    pub flush_retries: u32,
    /// Delay between attempts.
    pub retry_delay: Duration,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            debounce_wait: Duration::from_millis(500),
            debounce_max_wait: Duration::from_secs(3),
            flush_retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

impl DiskConfig {
    /// Small windows for tests.
    pub fn for_testing() -> Self {
        Self {
            debounce_wait: Duration::from_millis(40),
            debounce_max_wait: Duration::from_millis(120),
            flush_retries: 1,
            retry_delay: Duration::from_millis(10),
        }
    }
}

/// A save that exhausted its retries.
#[derive(Debug, Clone)]
pub struct SaveFailure {
    pub doc_id: Uuid,
    pub error: String,
}

struct Pending {
    payload: String,
    generation: u64,
    first_enqueued: Instant,
    last_write: Instant,
}

struct DiskInner {
    entries: HashMap<Uuid, Pending>,
    /// Flushes drained from `entries` but not yet durable (or failed).
    in_flight: usize,
    /// Generation assigned to the next write. Starts at 1; 0 means "none".
    next_gen: u64,
    /// Highest generation durably written, per key.
    durable: HashMap<Uuid, u64>,
    closed: bool,
}

/// The debounced persistence disk.
pub struct DebouncedDisk {
    config: DiskConfig,
    backing: Arc<dyn DocStore>,
    inner: Mutex<DiskInner>,
    pending_tx: watch::Sender<usize>,
    failure_tx: mpsc::UnboundedSender<SaveFailure>,
    failure_rx: Mutex<Option<mpsc::UnboundedReceiver<SaveFailure>>>,
    /// Per-key flush serialization.
    flush_locks: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    /// Handle to self for spawning per-key timer tasks.
    me: Weak<DebouncedDisk>,
}

fn doc_path(doc_id: Uuid) -> String {
    format!("docs/{doc_id}")
}

impl DebouncedDisk {
    pub fn new(config: DiskConfig, backing: Arc<dyn DocStore>) -> Arc<Self> {
        let (pending_tx, _) = watch::channel(0);
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            config,
            backing,
            inner: Mutex::new(DiskInner {
                entries: HashMap::new(),
                in_flight: 0,
                next_gen: 1,
                durable: HashMap::new(),
                closed: false,
            }),
            pending_tx,
            failure_tx,
            failure_rx: Mutex::new(Some(failure_rx)),
            flush_locks: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    /// Enqueue (or overwrite) the pending entry for a document. Does not
    /// write through; the per-key timer decides when the flush happens.
    pub fn write(&self, doc_id: Uuid, content: String) -> Result<(), DiskError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Err(DiskError::Closed);
            }
            let now = Instant::now();
            let generation = inner.next_gen;
            inner.next_gen += 1;
            match inner.entries.get_mut(&doc_id) {
                Some(entry) => {
                    entry.payload = content;
                    entry.generation = generation;
                    entry.last_write = now;
                }
                None => {
                    inner.entries.insert(
                        doc_id,
                        Pending {
                            payload: content,
                            generation,
                            first_enqueued: now,
                            last_write: now,
                        },
                    );
                    self.spawn_timer(doc_id);
                }
            }
        }
        self.notify_pending();
        Ok(())
    }

    fn spawn_timer(&self, doc_id: Uuid) {
        if let Some(disk) = self.me.upgrade() {
            tokio::spawn(disk.run_timer(doc_id));
        }
    }

    fn deadline(&self, entry: &Pending) -> Instant {
        let quiesced = entry.last_write + self.config.debounce_wait;
        let ceiling = entry.first_enqueued + self.config.debounce_max_wait;
        quiesced.min(ceiling)
    }

    /// Per-key timer. Sleeps toward the current deadline and re-evaluates
    /// on wake, so later writes within the quiescence window push the
    /// flush out, up to the ceiling. Exits quietly if the entry was
    /// drained by `flush_all`/`flush_key` meanwhile.
    async fn run_timer(self: Arc<Self>, doc_id: Uuid) {
        loop {
            let deadline = {
                let inner = self.inner.lock().unwrap();
                match inner.entries.get(&doc_id) {
                    None => return,
                    Some(entry) => self.deadline(entry),
                }
            };
            sleep_until(deadline).await;
            let due = {
                let inner = self.inner.lock().unwrap();
                match inner.entries.get(&doc_id) {
                    None => return,
                    Some(entry) => Instant::now() >= self.deadline(entry),
                }
            };
            if due {
                break;
            }
        }

        if let Some((payload, generation)) = self.take_entry(doc_id) {
            if let Err(e) = self.flush_payload(doc_id, payload, generation).await {
                log::error!("disk: debounced flush failed for {doc_id}: {e}");
            }
            self.finish_flush();
        }
    }

    /// Remove the entry and count it as in flight, atomically, so the
    /// observable pending count never dips before the write is durable.
    fn take_entry(&self, doc_id: Uuid) -> Option<(String, u64)> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.remove(&doc_id)?;
        inner.in_flight += 1;
        Some((entry.payload, entry.generation))
    }

    fn finish_flush(&self) {
        self.inner.lock().unwrap().in_flight -= 1;
        self.notify_pending();
    }

    fn key_lock(&self, doc_id: Uuid) -> Arc<AsyncMutex<()>> {
        self.flush_locks
            .lock()
            .unwrap()
            .entry(doc_id)
            .or_default()
            .clone()
    }

    /// Write through with retries. Flushes for one key run one at a time;
    /// a flush whose generation is already superseded by a durable newer
    /// one is dropped. On final failure the payload is put back as pending
    /// (unless a newer write already replaced it) and the failure is
    /// reported.
    async fn flush_payload(
        &self,
        doc_id: Uuid,
        payload: String,
        generation: u64,
    ) -> Result<(), DiskError> {
        let key_lock = self.key_lock(doc_id);
        let _guard = key_lock.lock().await;

        let superseded = {
            let inner = self.inner.lock().unwrap();
            inner.durable.get(&doc_id).is_some_and(|g| *g >= generation)
        };
        if superseded {
            log::debug!("disk: dropping superseded flush for {doc_id}");
            return Ok(());
        }

        let path = doc_path(doc_id);
        let mut attempt = 0u32;
        loop {
            match self.backing.write(&path, &payload) {
                Ok(()) => {
                    let mut inner = self.inner.lock().unwrap();
                    let durable = inner.durable.entry(doc_id).or_insert(0);
                    if generation > *durable {
                        *durable = generation;
                    }
                    log::debug!("disk: flushed {doc_id} ({} bytes)", payload.len());
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.flush_retries {
                        log::error!("disk: giving up on {doc_id} after {attempt} attempts: {e}");
                        self.reinsert_failed(doc_id, payload, generation);
                        let _ = self.failure_tx.send(SaveFailure {
                            doc_id,
                            error: e.to_string(),
                        });
                        return Err(DiskError::Backend(e.to_string()));
                    }
                    log::warn!("disk: write attempt {attempt} for {doc_id} failed, retrying: {e}");
                    sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    fn reinsert_failed(&self, doc_id: Uuid, payload: String, generation: u64) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.entries.contains_key(&doc_id) {
                // A newer write supersedes the failed payload.
                return;
            }
            let now = Instant::now();
            inner.entries.insert(
                doc_id,
                Pending {
                    payload,
                    generation,
                    first_enqueued: now,
                    last_write: now,
                },
            );
            if !inner.closed {
                self.spawn_timer(doc_id);
            }
        }
        self.notify_pending();
    }

    /// Drain every pending entry right now, regardless of timer state.
    /// Returns the number of successful flushes.
    pub async fn flush_all(&self) -> usize {
        let drained: Vec<(Uuid, String, u64)> = {
            let mut inner = self.inner.lock().unwrap();
            let items: Vec<_> = inner
                .entries
                .drain()
                .map(|(id, e)| (id, e.payload, e.generation))
                .collect();
            inner.in_flight += items.len();
            items
        };

        let mut flushed = 0;
        for (doc_id, payload, generation) in drained {
            if self.flush_payload(doc_id, payload, generation).await.is_ok() {
                flushed += 1;
            }
            self.finish_flush();
        }
        flushed
    }

    /// Flush one key immediately. `Ok(false)` if nothing was pending.
    pub async fn flush_key(&self, doc_id: Uuid) -> Result<bool, DiskError> {
        let Some((payload, generation)) = self.take_entry(doc_id) else {
            return Ok(false);
        };
        let result = self.flush_payload(doc_id, payload, generation).await;
        self.finish_flush();
        result.map(|()| true)
    }

    /// Read through: the pending payload wins over durable content.
    pub fn read(&self, doc_id: Uuid) -> Result<Option<String>, DiskError> {
        if let Some(entry) = self.inner.lock().unwrap().entries.get(&doc_id) {
            return Ok(Some(entry.payload.clone()));
        }
        self.backing
            .read(&doc_path(doc_id))
            .map_err(|e| DiskError::Backend(e.to_string()))
    }

    /// Number of writes not yet durable: queued entries plus flushes in
    /// flight.
    pub fn pending_writes(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.entries.len() + inner.in_flight
    }

    /// Observe every change to the pending count.
    pub fn watch_pending(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    /// Take the save-failure receiver (first caller wins).
    pub fn take_failures(&self) -> Option<mpsc::UnboundedReceiver<SaveFailure>> {
        self.failure_rx.lock().unwrap().take()
    }

    /// Refuse further writes, then drain whatever is pending.
    pub async fn shutdown(&self) -> usize {
        self.inner.lock().unwrap().closed = true;
        self.flush_all().await
    }

    fn notify_pending(&self) {
        let count = {
            let inner = self.inner.lock().unwrap();
            inner.entries.len() + inner.in_flight
        };
        self.pending_tx.send_replace(count);
    }
}

/// Disk errors.
#[derive(Debug, Clone)]
pub enum DiskError {
    Closed,
    Backend(String),
}

impl std::fmt::Display for DiskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskError::Closed => write!(f, "disk is shut down"),
            DiskError::Backend(e) => write!(f, "backend write failed: {e}"),
        }
    }
}

impl std::error::Error for DiskError {}
