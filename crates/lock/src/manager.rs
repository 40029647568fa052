use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use exclave_store::KeyValueStore;

use crate::config::LockConfig;
use crate::error::LockError;
use crate::reader::NotificationReader;
use crate::registry::WaiterRegistry;

/// Value stored under a held lock key. Carries no ownership information:
/// release is unconditional, there is no fencing token.
const LOCK_VALUE: &str = "1";

/// Payload published on a key's release channel. Waiters only care that a
/// message arrived.
const RELEASE_PAYLOAD: &str = "released";

/// Notification reader lifecycle. `Idle` both before the first `start` and
/// after `stop`; a fresh `start` opens a new subscriber connection.
enum ReaderState {
    Idle,
    Running {
        shutdown_tx: mpsc::Sender<()>,
        handle: JoinHandle<()>,
    },
}

/// Distributed mutual-exclusion lock manager.
///
/// Mutual exclusion is enforced by the backing store's atomic conditional
/// set; at most one holder per key exists store-wide while the key's TTL has
/// not elapsed, across every process sharing the store. The pub/sub wake-up
/// path only shortens the wait of contended acquirers — each wake leads back
/// to a retry of the conditional set, which is the sole source of truth.
///
/// `acquire` and `release` may be called concurrently from any number of
/// tasks. [`start`](Self::start) runs the background notification reader;
/// without it, contended acquires still work but wake only on their own
/// timeout.
pub struct LockManager {
    store: Arc<dyn KeyValueStore>,
    config: LockConfig,
    registry: Arc<Mutex<WaiterRegistry>>,
    reset_tx: broadcast::Sender<()>,
    reader: Mutex<ReaderState>,
}

impl LockManager {
    /// Create a new lock manager on top of `store`.
    pub fn new(store: Arc<dyn KeyValueStore>, config: LockConfig) -> Self {
        let (reset_tx, _) = broadcast::channel(16);
        Self {
            store,
            config,
            registry: Arc::new(Mutex::new(WaiterRegistry::default())),
            reset_tx,
            reader: Mutex::new(ReaderState::Idle),
        }
    }

    /// Release channel for a lock key.
    fn channel(&self, key: &str) -> String {
        format!("{}:{}", self.config.channel_prefix, key)
    }

    /// Start the background notification reader. Idempotent while the
    /// reader is alive; if it already exited on a transport failure, this
    /// reaps it and opens a fresh subscriber connection.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::StoreUnavailable`] if the dedicated subscriber
    /// connection cannot be opened.
    pub async fn start(&self) -> Result<(), LockError> {
        let mut reader = self.reader.lock().await;
        if let ReaderState::Running { handle, .. } = &*reader {
            if !handle.is_finished() {
                return Ok(());
            }
        }
        if let ReaderState::Running { handle, .. } =
            std::mem::replace(&mut *reader, ReaderState::Idle)
        {
            if let Err(e) = handle.await {
                warn!(error = %e, "notification reader task panicked");
            }
        }

        let (control, stream) = self.store.subscriber().await?;
        self.registry.lock().await.control = Some(control);

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = NotificationReader::new(
            stream,
            Arc::clone(&self.registry),
            self.reset_tx.clone(),
            self.config.channel_prefix.clone(),
            shutdown_rx,
        );
        let handle = tokio::spawn(task.run());
        *reader = ReaderState::Running {
            shutdown_tx,
            handle,
        };
        info!("lock manager started");
        Ok(())
    }

    /// Stop the background notification reader and drop the dedicated
    /// subscriber connection. Idempotent; safe to call when never started.
    pub async fn stop(&self) {
        let mut reader = self.reader.lock().await;
        let ReaderState::Running {
            shutdown_tx,
            handle,
        } = std::mem::replace(&mut *reader, ReaderState::Idle)
        else {
            return;
        };

        // The reader may already have exited on a transport failure; then
        // the send fails and the join returns immediately.
        let _ = shutdown_tx.send(()).await;
        if let Err(e) = handle.await {
            warn!(error = %e, "notification reader task panicked");
        }
        self.registry.lock().await.control = None;
        info!("lock manager stopped");
    }

    /// Acquire the lock for `key`, waiting up to `timeout`.
    ///
    /// Returns `true` once the lock is held, `false` if the deadline passed
    /// first; `false` is "not acquired", never an error. A `timeout` of zero
    /// tries the conditional set once and does not wait.
    ///
    /// # Errors
    ///
    /// [`LockError::EmptyKey`] for an empty key;
    /// [`LockError::StoreUnavailable`] if the conditional set cannot reach
    /// the store, in which case the lock state is unknown.
    pub async fn acquire(&self, key: &str, timeout: Duration) -> Result<bool, LockError> {
        if key.is_empty() {
            return Err(LockError::EmptyKey);
        }
        let deadline = Instant::now() + timeout;

        loop {
            if self
                .store
                .set_if_absent(key, LOCK_VALUE, self.config.lock_ttl)
                .await?
            {
                debug!(key, "lock acquired");
                return Ok(true);
            }

            if Instant::now() >= deadline {
                debug!(key, ?timeout, "lock acquisition timed out");
                return Ok(false);
            }

            self.wait_for_release(key, deadline).await;
            // A wake is only a hint that the key may be free; the retry of
            // the conditional set above decides the race.
        }
    }

    /// Release the lock for `key`: delete the key, then publish on its
    /// release channel. Idempotent — releasing an unheld or already-expired
    /// key deletes nothing and is not an error.
    ///
    /// Ownership is not verified; callers must only release keys they
    /// acquired.
    ///
    /// # Errors
    ///
    /// [`LockError::EmptyKey`] for an empty key;
    /// [`LockError::StoreUnavailable`] if the delete or publish cannot reach
    /// the store.
    pub async fn release(&self, key: &str) -> Result<(), LockError> {
        if key.is_empty() {
            return Err(LockError::EmptyKey);
        }

        self.store.delete(key).await?;
        let receivers = self
            .store
            .publish(&self.channel(key), RELEASE_PAYLOAD)
            .await?;
        debug!(key, receivers, "lock released");
        Ok(())
    }

    /// Acquire the lock for `key` and return a [`LockHandle`] describing the
    /// acquisition, or `None` on timeout.
    ///
    /// # Errors
    ///
    /// Same as [`acquire`](Self::acquire).
    pub async fn lock(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        if self.acquire(key, timeout).await? {
            Ok(Some(LockHandle {
                key: key.to_owned(),
                acquired_at: Instant::now(),
                ttl: self.config.lock_ttl,
            }))
        } else {
            Ok(None)
        }
    }

    /// Release the lock described by `handle`.
    ///
    /// # Errors
    ///
    /// Same as [`release`](Self::release).
    pub async fn unlock(&self, handle: LockHandle) -> Result<(), LockError> {
        self.release(&handle.key).await
    }

    /// Number of lock keys with waiters currently parked in this process.
    /// Intended for observability and tests.
    pub async fn waiting_keys(&self) -> usize {
        self.registry.lock().await.waiting_keys()
    }

    /// Park until the key's release channel fires, the reader broadcasts a
    /// reset, or the deadline passes — whichever comes first.
    async fn wait_for_release(&self, key: &str, deadline: Instant) {
        let channel = self.channel(key);
        // Subscribe to resets before registering so a reset fired in
        // between is buffered, not lost.
        let mut reset_rx = self.reset_tx.subscribe();
        let waiter = WaiterGuard::new(Arc::clone(&self.registry), key.to_owned(), channel.clone());

        let mut registry = self.registry.lock().await;
        let (notify, first) = registry.register(key);
        if first {
            match registry.control.as_mut() {
                Some(control) => {
                    if let Err(e) = control.subscribe(&channel).await {
                        // Non-fatal: the deadline-bounded wait below doubles
                        // as a polling fallback.
                        warn!(channel = %channel, error = %e, "subscribe failed; waiting on timeout only");
                    }
                }
                None => {
                    debug!(key, "notification reader not running; waiting on timeout only");
                }
            }
        }

        let notified = notify.notified();
        tokio::pin!(notified);
        // Register interest before releasing the guard so a notification
        // dispatched in between is not lost.
        notified.as_mut().enable();
        drop(registry);

        tokio::select! {
            () = notified => debug!(key, "woken by release notification"),
            _ = reset_rx.recv() => debug!(key, "woken by reset broadcast"),
            () = time::sleep_until(deadline) => {}
        }

        waiter.resolve().await;
    }
}

/// One successful lock acquisition.
///
/// The handle is descriptive, not authoritative: the store alone decides
/// when the key expires, and dropping the handle does not release the lock.
#[derive(Debug, Clone)]
pub struct LockHandle {
    key: String,
    acquired_at: Instant,
    ttl: Duration,
}

impl LockHandle {
    /// The lock key this handle was acquired for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// When the acquisition succeeded.
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// TTL placed on the underlying key at acquisition.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Time left before the store expires the key, assuming no release and
    /// no clock drift against the store.
    pub fn remaining(&self) -> Duration {
        self.ttl.saturating_sub(self.acquired_at.elapsed())
    }
}

/// Cleanup guard for one registered waiter.
///
/// The normal path calls [`resolve`](Self::resolve) after waking. If the
/// acquire future is dropped mid-wait instead (caller cancelled), `Drop`
/// finishes the bookkeeping on a task of its own so the registration and
/// its subscription cannot leak for the lifetime of the manager.
struct WaiterGuard {
    registry: Arc<Mutex<WaiterRegistry>>,
    key: String,
    channel: String,
    armed: bool,
}

impl WaiterGuard {
    fn new(registry: Arc<Mutex<WaiterRegistry>>, key: String, channel: String) -> Self {
        Self {
            registry,
            key,
            channel,
            armed: true,
        }
    }

    async fn resolve(mut self) {
        self.armed = false;
        Self::unregister(&self.registry, &self.key, &self.channel).await;
    }

    async fn unregister(registry: &Arc<Mutex<WaiterRegistry>>, key: &str, channel: &str) {
        let mut guard = registry.lock().await;
        if guard.unregister(key) {
            if let Some(control) = guard.control.as_mut() {
                if let Err(e) = control.unsubscribe(channel).await {
                    warn!(channel = %channel, error = %e, "unsubscribe failed");
                }
            }
        }
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let key = std::mem::take(&mut self.key);
        let channel = std::mem::take(&mut self.channel);
        tokio::spawn(async move {
            WaiterGuard::unregister(&registry, &key, &channel).await;
        });
    }
}
