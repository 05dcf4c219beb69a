use std::{sync::Arc, time::Duration};

use crate::{
    events::Event,
    repository::{Repository, RepositoryState, SyncOutcome},
    toggles::{Snapshot, ToggleDefinition, Variant},
    ClientConfig, Context, Evaluation, Result, StrategyEngine,
};

/// A feature toggle client.
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// Evaluation methods never fail and never block on I/O: they read the toggle definitions the
/// client currently holds and fall back to caller-supplied defaults when a toggle is unknown or
/// nothing was loaded yet.
///
/// # Examples
/// ```
/// # use unleash_client::{Client, ClientConfig, Context};
/// let client = Client::new(ClientConfig::new("my-app", "https://unleash.example.com/api/"))?;
/// // Not started, so every toggle evaluates to its fallback.
/// assert!(!client.is_enabled("new-checkout", &Context::new().with_user_id("42"), false));
/// # Ok::<(), unleash_client::Error>(())
/// ```
pub struct Client {
    repository: Repository,
    engine: StrategyEngine,
    app_name: String,
    environment: String,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// Same as [`ClientConfig::to_client`].
    pub fn new(config: ClientConfig) -> Result<Client> {
        config.to_client()
    }

    pub(crate) fn from_parts(
        repository: Repository,
        engine: StrategyEngine,
        app_name: String,
        environment: String,
    ) -> Client {
        Client {
            repository,
            engine,
            app_name,
            environment,
        }
    }

    /// Load bootstrap data or the backup, start polling, and wait for the first fetch to
    /// complete. See [`Repository::start`].
    pub fn start(&self) -> Result<()> {
        self.repository.start()
    }

    /// Start without waiting for the first fetch. See [`Repository::start_in_background`].
    pub fn start_in_background(&self) -> Result<()> {
        self.repository.start_in_background()
    }

    /// Block until the first successful synchronization with the server.
    pub fn wait_for_sync(&self) -> Result<()> {
        self.repository.wait_for_sync()
    }

    pub fn wait_for_sync_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        self.repository.wait_for_sync_timeout(timeout)
    }

    /// Fetch toggle definitions now instead of waiting for the next poll.
    pub fn synchronize(&self) -> Result<SyncOutcome> {
        self.repository.synchronize()
    }

    /// Stop polling. The client keeps evaluating with the definitions it holds.
    pub fn stop(&self) {
        self.repository.stop();
    }

    /// Stop polling and wait for the poller thread to exit.
    pub fn shutdown(&self) -> Result<()> {
        self.repository.shutdown()
    }

    /// `true` once toggle definitions were loaded from any source.
    pub fn is_ready(&self) -> bool {
        self.repository.is_ready()
    }

    pub fn state(&self) -> RepositoryState {
        self.repository.state()
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Check whether a toggle is enabled for `context`. Returns `fallback` if the toggle is
    /// unknown or no definitions were loaded yet.
    pub fn is_enabled(&self, toggle_name: &str, context: &Context, fallback: bool) -> bool {
        self.is_enabled_with(toggle_name, context, |_, _| fallback)
    }

    /// Like [`Client::is_enabled`], but computes the fallback lazily.
    ///
    /// ```
    /// # use unleash_client::{Client, ClientConfig, Context};
    /// # let client = Client::new(ClientConfig::new("my-app", "https://unleash.example.com/api/"))?;
    /// let enabled = client.is_enabled_with("beta", &Context::new(), |_name, context| {
    ///     context.properties.get("beta").is_some()
    /// });
    /// # assert!(!enabled);
    /// # Ok::<(), unleash_client::Error>(())
    /// ```
    pub fn is_enabled_with(
        &self,
        toggle_name: &str,
        context: &Context,
        fallback: impl FnOnce(&str, &Context) -> bool,
    ) -> bool {
        match self.evaluate(toggle_name, context) {
            Some(evaluation) => evaluation.enabled,
            None => fallback(toggle_name, context),
        }
    }

    /// Select a variant of a toggle for `context`. Returns the disabled variant if the toggle is
    /// unknown, disabled, or has no variants.
    pub fn get_variant(&self, toggle_name: &str, context: &Context) -> Variant {
        self.get_variant_or(toggle_name, context, Variant::disabled())
    }

    /// Like [`Client::get_variant`] with a custom fallback variant.
    pub fn get_variant_or(&self, toggle_name: &str, context: &Context, fallback: Variant) -> Variant {
        match self.evaluate(toggle_name, context) {
            Some(Evaluation {
                enabled: true,
                variant: Some(variant),
                ..
            }) => variant,
            _ => fallback,
        }
    }

    /// Evaluate a toggle, returning the full [`Evaluation`] including diagnostics. Returns `None`
    /// if the toggle is unknown or no definitions were loaded yet.
    ///
    /// The application name and environment from the configuration are filled into `context`
    /// unless it sets them already.
    pub fn evaluate(&self, toggle_name: &str, context: &Context) -> Option<Evaluation> {
        let Some(snapshot) = self.repository.snapshot() else {
            log::warn!(target: "unleash", toggle_name; "evaluating a toggle before toggle definitions have been loaded");
            self.repository.emit(Event::Warning(format!(
                "toggle \"{toggle_name}\" evaluated before toggle definitions were loaded"
            )));
            return None;
        };
        self.evaluate_in(&snapshot, toggle_name, context)
    }

    fn evaluate_in(
        &self,
        snapshot: &Snapshot,
        toggle_name: &str,
        context: &Context,
    ) -> Option<Evaluation> {
        let Some(toggle) = snapshot.get(toggle_name) else {
            log::debug!(target: "unleash", toggle_name; "unknown toggle");
            return None;
        };

        let context = context.with_static_fields(&self.app_name, &self.environment);
        let evaluation = self.engine.evaluate(toggle, &context);

        for diagnostic in &evaluation.diagnostics {
            log::warn!(target: "unleash", toggle_name; "{}", diagnostic);
            self.repository
                .emit(Event::Warning(format!("toggle \"{toggle_name}\": {diagnostic}")));
        }

        log::trace!(target: "unleash",
                    toggle_name,
                    context:serde = context,
                    enabled = evaluation.enabled,
                    variant:serde = evaluation.variant;
                    "evaluated a toggle");

        Some(evaluation)
    }

    /// Definition of a single toggle, as last received.
    pub fn toggle_definition(&self, toggle_name: &str) -> Option<ToggleDefinition> {
        self.repository.get_toggle(toggle_name)
    }

    /// All toggle definitions, as last received.
    pub fn toggle_definitions(&self) -> Vec<ToggleDefinition> {
        self.repository.get_toggles()
    }

    /// The active snapshot, for reading several toggles from one consistent state.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.repository.snapshot()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("app_name", &self.app_name)
            .field("environment", &self.environment)
            .field("repository", &self.repository)
            .finish()
    }
}
