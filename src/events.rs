//! Notifications emitted by the repository and the client.
use std::sync::Arc;

use crate::{toggles::ToggleDelta, Error};

#[derive(Debug, Clone)]
pub enum Event {
    /// The repository holds toggle definitions for the first time (from bootstrap, backup, or
    /// the server). Emitted once.
    Ready,
    /// The first successful synchronization with the server. Emitted once.
    Synchronized,
    /// Toggle definitions changed. Carries the names of added, removed, and modified toggles.
    Changed(ToggleDelta),
    /// A recoverable failure: fetching or parsing toggles failed. The previous definitions stay
    /// in effect.
    Error(Error),
    /// A non-fatal problem, e.g. the backup couldn't be written or a toggle uses an unknown
    /// strategy.
    Warning(String),
}

/// Receives [`Event`]s.
///
/// Listeners are called synchronously from the thread that produced the event (usually the
/// poller thread), so they should return quickly.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<T: Fn(&Event) + Send + Sync> EventListener for T {
    fn on_event(&self, event: &Event) {
        self(event);
    }
}

/// Fans events out to all registered listeners.
#[derive(Clone, Default)]
pub(crate) struct Listeners {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl Listeners {
    pub fn push(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    pub fn emit(&self, event: Event) {
        for listener in &self.listeners {
            listener.on_event(&event);
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("len", &self.listeners.len())
            .finish()
    }
}
