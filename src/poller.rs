//! A background thread that calls a synchronization tick on a fixed interval.
use std::{
    ops::ControlFlow,
    sync::{mpsc::RecvTimeoutError, Condvar, Mutex},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{Error, Result};

/// Configuration for [`PollerThread`].
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Interval to wait between ticks. A zero interval runs a single tick and exits.
    pub interval: Duration,
    /// Random duration subtracted from each interval, so that many clients started at the same
    /// time don't hit the server in lockstep.
    pub jitter: Duration,
}

impl PollerConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);
    pub const DEFAULT_JITTER: Duration = Duration::from_secs(3);
}

impl Default for PollerConfig {
    fn default() -> PollerConfig {
        PollerConfig {
            interval: PollerConfig::DEFAULT_INTERVAL,
            jitter: PollerConfig::DEFAULT_JITTER,
        }
    }
}

/// A poller thread.
///
/// Ticks run one after another on the same thread, so a tick never overlaps the previous one.
pub(crate) struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,
}

impl PollerThread {
    /// Start the thread. `tick` runs immediately and then once per interval until it returns
    /// `ControlFlow::Break` or the thread is stopped. `on_panic` runs if `tick` panics.
    pub fn start(
        config: PollerConfig,
        mut tick: impl FnMut() -> ControlFlow<()> + Send + 'static,
        on_panic: impl FnOnce() + Send + 'static,
    ) -> std::io::Result<PollerThread> {
        // Using `sync_channel` here as it makes `stop_sender` `Sync`. Buffer size of 1 is enough:
        // we `try_send()` and ignore a full buffer (a stop command is already pending).
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let join_handle = std::thread::Builder::new()
            .name("unleash-poller".to_owned())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop {
                    if tick().is_break() {
                        log::debug!(target: "unleash", "poller thread finished");
                        return;
                    }

                    if config.interval.is_zero() {
                        log::debug!(target: "unleash", "polling disabled, poller thread exiting after first fetch");
                        return;
                    }

                    let timeout = jitter(config.interval, config.jitter);
                    match stop_receiver.recv_timeout(timeout) {
                        Err(RecvTimeoutError::Timeout) => {
                            // Timed out. Loop back to tick again.
                        }
                        Ok(()) => {
                            log::debug!(target: "unleash", "poller thread received stop command");
                            return;
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            log::debug!(target: "unleash", "poller thread received disconnected");
                            return;
                        }
                    }
                }));

                if result.is_err() {
                    log::warn!(target: "unleash", "poller thread panicked");
                    on_panic();
                }
            })?;

        Ok(PollerThread {
            join_handle,
            stop_sender,
        })
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited) or a stop command is already
        // pending. Either way the thread is stopping.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    pub fn shutdown(self) -> Result<()> {
        self.stop();

        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;

        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

/// A value that is set once and can be awaited from other threads.
#[derive(Debug, Default)]
pub(crate) struct Signal {
    value: Mutex<Option<Result<()>>>,
    condvar: Condvar,
}

impl Signal {
    /// Set the value unless it was set already. Returns `true` if this call set it.
    pub fn set(&self, value: Result<()>) -> bool {
        let mut slot = self
            .value
            .lock()
            .expect("thread holding signal lock should not panic");
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.condvar.notify_all();
        true
    }

    #[cfg(test)]
    pub fn is_set(&self) -> bool {
        self.value
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(true)
    }

    /// Block until the value is set.
    pub fn wait(&self) -> Result<()> {
        let slot = self
            .value
            .lock()
            .map_err(|_| Error::PollerThreadPanicked)?;
        let slot = self
            .condvar
            .wait_while(slot, |slot| slot.is_none())
            .map_err(|_| Error::PollerThreadPanicked)?;
        slot.clone().unwrap_or(Err(Error::PollerThreadPanicked))
    }

    /// Block until the value is set or `timeout` elapses. Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let slot = self.value.lock().ok()?;
        let (slot, _) = self
            .condvar
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .ok()?;
        slot.clone()
    }
}
