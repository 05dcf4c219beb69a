//! The toggle repository: owns the active [`Snapshot`] and keeps it in sync with the server.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized -> Bootstrapping -> Synchronizing -> Synchronized <-> Stale
//!                                                   (any state)  -> Stopped
//! ```
//!
//! [`Repository::start`] seeds the snapshot from the bootstrap source and/or the backup, then
//! launches a poller thread that fetches definitions on a fixed interval. Each tick sends the
//! validation token of the active snapshot; "not modified" leaves everything untouched, new
//! definitions replace the snapshot atomically, get persisted, and produce an
//! [`Event::Changed`]. Failed ticks keep the previous snapshot and produce an [`Event::Error`].
//!
//! Lookups ([`Repository::get_toggle`], [`Repository::get_toggles`]) only read the in-memory
//! snapshot and never block on I/O.
use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock, TryLockError,
    },
    time::Duration,
};

use crate::{
    bootstrap::BootstrapSource,
    events::{Event, EventListener, Listeners},
    fetcher::{FetchResponse, ToggleFetcher},
    poller::{PollerConfig, PollerThread, Signal},
    snapshot_store::SnapshotStore,
    storage::StorageProvider,
    toggles::{Snapshot, ToggleDefinition, ToggleDelta},
    Error, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum RepositoryState {
    /// Not started yet.
    #[display(fmt = "uninitialized")]
    Uninitialized,
    /// Loading bootstrap data and the backup.
    #[display(fmt = "bootstrapping")]
    Bootstrapping,
    /// Waiting for the first fetch to complete.
    #[display(fmt = "synchronizing")]
    Synchronizing,
    /// The last fetch succeeded.
    #[display(fmt = "synchronized")]
    Synchronized,
    /// The last fetch failed; the previous snapshot (if any) is still in use.
    #[display(fmt = "stale")]
    Stale,
    /// Stopped for good.
    #[display(fmt = "stopped")]
    Stopped,
}

/// Which snapshot wins at startup when both bootstrap data and a backup are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartupPrecedence {
    /// Use the bootstrap data, overriding the backup.
    #[default]
    BootstrapFirst,
    /// Use the backup; bootstrap data is only used when there is no backup.
    BackupFirst,
}

/// Result of a single synchronization tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// New definitions were adopted. The delta is empty if only the validation token changed.
    Updated(ToggleDelta),
    /// The server reported no change.
    NotModified,
    /// Another tick was in progress, so this one didn't run.
    Skipped,
    /// The repository was stopped before or during the tick; any response was discarded.
    Cancelled,
}

/// Configuration for [`Repository`].
#[derive(Debug, Clone, Default)]
pub struct RepositoryConfig {
    pub poller: PollerConfig,
    pub bootstrap: BootstrapSource,
    pub startup_precedence: StartupPrecedence,
}

pub struct Repository {
    inner: Arc<Inner>,
    poller: Mutex<Option<PollerThread>>,
}

struct Inner {
    store: SnapshotStore,
    /// The mutex doubles as the "tick in progress" flag: ticks `try_lock` it and skip if busy.
    fetcher: Mutex<Box<dyn ToggleFetcher>>,
    storage: Arc<dyn StorageProvider>,
    bootstrap: BootstrapSource,
    precedence: StartupPrecedence,
    poller_config: PollerConfig,
    listeners: RwLock<Listeners>,
    lifecycle: Mutex<Lifecycle>,
    ready: AtomicBool,
    synchronized: AtomicBool,
    /// Set once the first tick has completed, successfully or not.
    first_tick: Signal,
    /// Set on the first successful synchronization, or on a fatal error.
    first_sync: Signal,
}

struct Lifecycle {
    state: RepositoryState,
    started: bool,
    /// Bumped on stop. A tick only applies its response if the epoch didn't change while the
    /// request was in flight.
    epoch: u64,
}

impl Repository {
    pub fn new(
        fetcher: impl ToggleFetcher + 'static,
        storage: Arc<dyn StorageProvider>,
        config: RepositoryConfig,
    ) -> Repository {
        Repository {
            inner: Arc::new(Inner {
                store: SnapshotStore::new(),
                fetcher: Mutex::new(Box::new(fetcher)),
                storage,
                bootstrap: config.bootstrap,
                precedence: config.startup_precedence,
                poller_config: config.poller,
                listeners: RwLock::new(Listeners::default()),
                lifecycle: Mutex::new(Lifecycle {
                    state: RepositoryState::Uninitialized,
                    started: false,
                    epoch: 0,
                }),
                ready: AtomicBool::new(false),
                synchronized: AtomicBool::new(false),
                first_tick: Signal::default(),
                first_sync: Signal::default(),
            }),
            poller: Mutex::new(None),
        }
    }

    /// Register a listener for repository events.
    pub fn add_listener(&self, listener: impl EventListener + 'static) {
        self.add_shared_listener(Arc::new(listener));
    }

    pub(crate) fn add_shared_listener(&self, listener: Arc<dyn EventListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub(crate) fn emit(&self, event: Event) {
        self.inner.emit(event);
    }

    pub fn state(&self) -> RepositoryState {
        self.inner.lock_lifecycle().state
    }

    /// `true` once the repository holds toggle definitions from any source.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Seed the snapshot, start polling, and block until the first fetch has completed.
    ///
    /// A failed first fetch is not an error here: it is reported through [`Event::Error`] and the
    /// bootstrap or backup snapshot (if any) stays in use. Errors are returned only if the
    /// repository was stopped or the poller thread couldn't run.
    pub fn start(&self) -> Result<()> {
        self.start_in_background()?;
        self.inner.first_tick.wait()
    }

    /// Like [`Repository::start`], but returns right after seeding without waiting for the first
    /// fetch. Calling it on a started repository does nothing.
    pub fn start_in_background(&self) -> Result<()> {
        {
            let mut lifecycle = self.inner.lock_lifecycle();
            if lifecycle.state == RepositoryState::Stopped {
                return Err(Error::Stopped);
            }
            if lifecycle.started {
                return Ok(());
            }
            lifecycle.started = true;
            // A manual synchronize() may have run already.
            if lifecycle.state == RepositoryState::Uninitialized {
                lifecycle.state = RepositoryState::Bootstrapping;
            }
        }

        log::debug!(target: "unleash", "starting repository");
        self.inner.seed();

        {
            let mut lifecycle = self.inner.lock_lifecycle();
            if lifecycle.state == RepositoryState::Bootstrapping {
                lifecycle.state = RepositoryState::Synchronizing;
            }
        }

        let poller = {
            let inner = self.inner.clone();
            let panicked = self.inner.clone();
            PollerThread::start(
                self.inner.poller_config.clone(),
                move || inner.tick(),
                move || panicked.poller_panicked(),
            )?
        };

        let mut slot = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state() == RepositoryState::Stopped {
            // stop() ran while we were starting and didn't see the thread.
            poller.stop();
        }
        *slot = Some(poller);

        Ok(())
    }

    /// Block until the first successful synchronization with the server.
    ///
    /// # Errors
    ///
    /// - [`Error::Stopped`] if the repository is stopped before that happens.
    /// - A fatal fetch error, e.g. [`Error::InvalidUrl`].
    /// - [`Error::PollerThreadPanicked`]
    pub fn wait_for_sync(&self) -> Result<()> {
        self.inner.first_sync.wait()
    }

    /// Like [`Repository::wait_for_sync`] with a timeout. Returns `None` if the timeout elapsed.
    pub fn wait_for_sync_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        self.inner.first_sync.wait_timeout(timeout)
    }

    /// Run one synchronization tick now, on the calling thread.
    ///
    /// Returns [`SyncOutcome::Skipped`] without doing anything if another tick is in progress.
    /// Fetch failures are returned and also emitted as [`Event::Error`].
    pub fn synchronize(&self) -> Result<SyncOutcome> {
        self.inner.synchronize()
    }

    /// Stop polling. Idempotent.
    ///
    /// Once this returns no new request is started, and no response received afterwards is
    /// applied. A request that was already being sent when `stop` was called may still reach the
    /// server; its response is discarded.
    ///
    /// Does not wait for the poller thread to exit; see [`Repository::shutdown`].
    pub fn stop(&self) {
        {
            let mut lifecycle = self.inner.lock_lifecycle();
            if lifecycle.state == RepositoryState::Stopped {
                return;
            }
            lifecycle.state = RepositoryState::Stopped;
            lifecycle.epoch += 1;
        }

        self.inner.first_tick.set(Err(Error::Stopped));
        self.inner.first_sync.set(Err(Error::Stopped));

        if let Some(poller) = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            poller.stop();
        }

        log::debug!(target: "unleash", "repository stopped");
    }

    /// Stop polling and block waiting for the poller thread to exit.
    pub fn shutdown(&self) -> Result<()> {
        self.stop();

        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match poller {
            Some(poller) => poller.shutdown(),
            None => Ok(()),
        }
    }

    /// The active snapshot. Use this to read several toggles from one consistent state.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.inner.store.get()
    }

    pub fn get_toggle(&self, name: &str) -> Option<ToggleDefinition> {
        self.inner.store.get()?.get(name).cloned()
    }

    pub fn get_toggles(&self) -> Vec<ToggleDefinition> {
        self.inner
            .store
            .get()
            .map(|snapshot| snapshot.toggles().to_vec())
            .unwrap_or_default()
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("state", &self.state())
            .field("revision", &self.snapshot().map(|s| s.revision()))
            .finish()
    }
}

impl Inner {
    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: Event) {
        // Clone the list so listeners can register other listeners.
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        listeners.emit(event);
    }

    /// Adopt the bootstrap snapshot or the backup, whichever takes precedence.
    fn seed(&self) {
        // Serialize with ticks, there is a single writer at any time.
        let _fetcher = self.fetcher.lock().unwrap_or_else(PoisonError::into_inner);

        let backup = match self.storage.load() {
            Ok(backup) => backup,
            Err(err) => {
                log::warn!(target: "unleash", "failed to load backup: {}", err);
                self.emit(Event::Warning(format!("failed to load backup: {err}")));
                None
            }
        };
        let bootstrap = self.bootstrap.load();

        let (snapshot, from_bootstrap) = match (self.precedence, bootstrap, backup) {
            (StartupPrecedence::BootstrapFirst, Some(bootstrap), _) => (bootstrap, true),
            (StartupPrecedence::BackupFirst, _, Some(backup)) => (backup, false),
            (_, Some(bootstrap), None) => (bootstrap, true),
            (_, None, Some(backup)) => (backup, false),
            (_, None, None) => {
                log::debug!(target: "unleash", "no bootstrap data or backup, waiting for the server");
                return;
            }
        };

        let snapshot = {
            let lifecycle = self.lock_lifecycle();
            if lifecycle.state == RepositoryState::Stopped || self.store.get().is_some() {
                return;
            }
            // Bootstrap data didn't come with a validation token, so the first fetch must be
            // unconditional.
            let snapshot = if from_bootstrap {
                Arc::new(snapshot.restamp(None, 1))
            } else {
                Arc::new(snapshot)
            };
            self.store.set(snapshot.clone());
            snapshot
        };

        log::debug!(target: "unleash",
                    toggles = snapshot.len(),
                    revision = snapshot.revision(),
                    from_bootstrap = from_bootstrap;
                    "seeded toggle snapshot");

        if from_bootstrap {
            self.persist(&snapshot);
        }
        self.announce(ToggleDelta::between(None, &snapshot));
    }

    fn tick(&self) -> ControlFlow<()> {
        let outcome = self.synchronize();
        self.first_tick.set(Ok(()));

        match outcome {
            Ok(SyncOutcome::Cancelled) => ControlFlow::Break(()),
            Err(err) if err.is_fatal() => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        }
    }

    fn synchronize(&self) -> Result<SyncOutcome> {
        let mut fetcher = match self.fetcher.try_lock() {
            Ok(fetcher) => fetcher,
            Err(TryLockError::WouldBlock) => {
                log::debug!(target: "unleash", "synchronization already in progress, skipping tick");
                return Ok(SyncOutcome::Skipped);
            }
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let etag = self
            .store
            .get()
            .and_then(|snapshot| snapshot.etag().map(str::to_owned));

        // Last check before the request goes out. A `stop()` that lands after this point is
        // handled by the epoch comparison below.
        let epoch = {
            let lifecycle = self.lock_lifecycle();
            if lifecycle.state == RepositoryState::Stopped {
                log::debug!(target: "unleash", "repository stopped, not fetching");
                return Ok(SyncOutcome::Cancelled);
            }
            lifecycle.epoch
        };
        let result = fetcher.fetch(etag.as_deref());

        let applied = {
            let mut lifecycle = self.lock_lifecycle();
            if lifecycle.state == RepositoryState::Stopped || lifecycle.epoch != epoch {
                log::debug!(target: "unleash", "discarding response received after stop");
                return Ok(SyncOutcome::Cancelled);
            }

            match result {
                Ok(FetchResponse::NotModified) => {
                    lifecycle.state = RepositoryState::Synchronized;
                    Ok(None)
                }
                Ok(FetchResponse::Modified { response, etag }) => {
                    let previous = self.store.get();
                    let revision = previous.as_ref().map_or(0, |s| s.revision()) + 1;
                    let snapshot = Arc::new(Snapshot::from_response(response, etag, revision));
                    let delta = ToggleDelta::between(previous.as_deref(), &snapshot);
                    self.store.set(snapshot.clone());
                    lifecycle.state = RepositoryState::Synchronized;
                    Ok(Some((snapshot, delta)))
                }
                Err(err) => {
                    lifecycle.state = RepositoryState::Stale;
                    Err(err)
                }
            }
        };

        // Still holding the fetcher lock: persistence writes happen in tick order.
        match applied {
            Ok(None) => {
                log::debug!(target: "unleash", etag:debug = etag; "toggles not modified");
                self.mark_synchronized();
                Ok(SyncOutcome::NotModified)
            }
            Ok(Some((snapshot, delta))) => {
                log::debug!(target: "unleash",
                            toggles = snapshot.len(),
                            revision = snapshot.revision(),
                            changed = delta.names().len();
                            "adopted new toggle snapshot");
                self.persist(&snapshot);
                self.announce(delta.clone());
                self.mark_synchronized();
                Ok(SyncOutcome::Updated(delta))
            }
            Err(err) => {
                log::warn!(target: "unleash", "failed to fetch toggles: {}", err);
                self.emit(Event::Error(err.clone()));
                if err.is_fatal() {
                    self.first_sync.set(Err(err.clone()));
                }
                Err(err)
            }
        }
    }

    /// Best-effort: a failed write is a warning, the in-memory snapshot stays authoritative.
    fn persist(&self, snapshot: &Snapshot) {
        if let Err(err) = self.storage.save(snapshot) {
            log::warn!(target: "unleash", "failed to save backup: {}", err);
            self.emit(Event::Warning(format!("failed to save backup: {err}")));
        }
    }

    fn announce(&self, delta: ToggleDelta) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            self.emit(Event::Ready);
        }
        if !delta.is_empty() {
            self.emit(Event::Changed(delta));
        }
    }

    fn mark_synchronized(&self) {
        if !self.synchronized.swap(true, Ordering::SeqCst) {
            self.first_sync.set(Ok(()));
            self.emit(Event::Synchronized);
        }
    }

    fn poller_panicked(&self) {
        self.first_tick.set(Err(Error::PollerThreadPanicked));
        self.first_sync.set(Err(Error::PollerThreadPanicked));
        self.emit(Event::Error(Error::PollerThreadPanicked));
    }
}
