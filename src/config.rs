use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use rand::{thread_rng, Rng};
use url::Url;

use crate::{
    bootstrap::BootstrapSource,
    events::EventListener,
    fetcher::{HttpFetcher, HttpFetcherConfig, ToggleFetcher},
    poller::PollerConfig,
    repository::{Repository, RepositoryConfig, StartupPrecedence},
    storage::{FileStorage, StorageProvider},
    strategy::{self, Strategy},
    Client, Error, Result, StrategyEngine,
};

/// Configuration for [`Client`].
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) app_name: String,
    pub(crate) url: String,
    pub(crate) environment: String,
    pub(crate) instance_id: Option<String>,
    pub(crate) refresh_interval: Duration,
    pub(crate) refresh_jitter: Duration,
    pub(crate) timeout: Duration,
    pub(crate) project_name: Option<String>,
    pub(crate) name_prefix: Option<String>,
    pub(crate) tags: Vec<(String, String)>,
    pub(crate) custom_headers: HashMap<String, String>,
    pub(crate) backup_path: Option<PathBuf>,
    pub(crate) storage: Option<Arc<dyn StorageProvider>>,
    pub(crate) bootstrap: BootstrapSource,
    pub(crate) startup_precedence: StartupPrecedence,
    pub(crate) strategies: Vec<(String, Arc<dyn Strategy>)>,
    pub(crate) hostname: Option<String>,
    pub(crate) listeners: Vec<Arc<dyn EventListener>>,
}

impl ClientConfig {
    /// Default environment reported in evaluation contexts.
    pub const DEFAULT_ENVIRONMENT: &'static str = "default";

    /// Default timeout for requests to the server.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Create a configuration for application `app_name` talking to the server API at `url`.
    ///
    /// ```
    /// # use unleash_client::ClientConfig;
    /// ClientConfig::new("my-app", "https://unleash.example.com/api/");
    /// ```
    pub fn new(app_name: impl Into<String>, url: impl Into<String>) -> ClientConfig {
        ClientConfig {
            app_name: app_name.into(),
            url: url.into(),
            environment: ClientConfig::DEFAULT_ENVIRONMENT.to_owned(),
            instance_id: None,
            refresh_interval: PollerConfig::DEFAULT_INTERVAL,
            refresh_jitter: PollerConfig::DEFAULT_JITTER,
            timeout: ClientConfig::DEFAULT_TIMEOUT,
            project_name: None,
            name_prefix: None,
            tags: Vec::new(),
            custom_headers: HashMap::new(),
            backup_path: None,
            storage: None,
            bootstrap: BootstrapSource::default(),
            startup_precedence: StartupPrecedence::default(),
            strategies: Vec::new(),
            hostname: None,
            listeners: Vec::new(),
        }
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Identifies this client instance to the server. Defaults to the host name plus a random
    /// suffix.
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// How often to fetch toggle definitions. Zero disables polling after the first fetch.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Maximum random duration subtracted from each refresh interval.
    pub fn with_refresh_jitter(mut self, jitter: Duration) -> Self {
        self.refresh_jitter = jitter;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Only fetch toggles of this project.
    pub fn with_project_name(mut self, project_name: impl Into<String>) -> Self {
        self.project_name = Some(project_name.into());
        self
    }

    /// Only fetch toggles whose name starts with `prefix`.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Only fetch toggles tagged with `tag_type:value`. Can be called several times.
    pub fn with_tag(mut self, tag_type: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((tag_type.into(), value.into()));
        self
    }

    /// Header sent with every request to the server.
    pub fn with_custom_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    /// Shorthand for the `Authorization` header carrying the client API token.
    pub fn with_authorization(self, token: impl Into<String>) -> Self {
        self.with_custom_header("Authorization", token)
    }

    /// Directory for the backup file. Defaults to the OS temporary directory. Ignored if a
    /// custom storage is set.
    pub fn with_backup_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backup_path = Some(path.into());
        self
    }

    /// Replace the file backup with a custom storage.
    pub fn with_storage(mut self, storage: impl StorageProvider + 'static) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Toggle definitions to use until the first successful fetch.
    pub fn with_bootstrap(mut self, bootstrap: BootstrapSource) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_startup_precedence(mut self, precedence: StartupPrecedence) -> Self {
        self.startup_precedence = precedence;
        self
    }

    /// Register a custom strategy. It takes precedence over a built-in strategy with the same
    /// name.
    ///
    /// ```
    /// # use unleash_client::{ClientConfig, Context, strategy::Parameters};
    /// let config = ClientConfig::new("my-app", "https://unleash.example.com/api/")
    ///     .with_strategy("internalUsers", |_: &Parameters, context: &Context| {
    ///         context.user_id.as_deref().is_some_and(|id| id.ends_with("@example.com"))
    ///     });
    /// ```
    pub fn with_strategy(
        mut self,
        name: impl Into<String>,
        strategy: impl Strategy + 'static,
    ) -> Self {
        self.strategies.push((name.into(), Arc::new(strategy)));
        self
    }

    /// Host name for the `applicationHostname` strategy. Defaults to the `HOSTNAME` environment
    /// variable.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Subscribe to repository and client events.
    ///
    /// ```
    /// # use unleash_client::{ClientConfig, Event};
    /// let config = ClientConfig::new("my-app", "https://unleash.example.com/api/")
    ///     .with_listener(|event: &Event| {
    ///         if let Event::Changed(delta) = event {
    ///             println!("toggles changed: {:?}", delta.names());
    ///         }
    ///     });
    /// ```
    pub fn with_listener(mut self, listener: impl EventListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// The client is not started; call [`Client::start`] or [`Client::start_in_background`].
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] if the application name or url is missing.
    /// - [`Error::InvalidUrl`] if the url cannot be parsed.
    pub fn to_client(self) -> Result<Client> {
        self.validate()?;
        let url = normalize_url(&self.url)?;
        let fetcher = HttpFetcher::new(HttpFetcherConfig {
            url,
            app_name: self.app_name.clone(),
            instance_id: self.instance_id(),
            project_name: self.project_name.clone(),
            name_prefix: self.name_prefix.clone(),
            tags: self.tags.clone(),
            custom_headers: self.custom_headers.clone(),
            timeout: self.timeout,
        })?;
        self.to_client_with_fetcher(fetcher)
    }

    /// Like [`ClientConfig::to_client`], but fetches toggle definitions with `fetcher` instead of
    /// HTTP. Useful for tests and custom transports; url settings are not used.
    pub fn to_client_with_fetcher(self, fetcher: impl ToggleFetcher + 'static) -> Result<Client> {
        self.validate()?;

        let storage = match self.storage {
            Some(storage) => storage,
            None => Arc::new(FileStorage::new(
                self.backup_path.unwrap_or_else(std::env::temp_dir),
                &self.app_name,
            )),
        };

        let repository = Repository::new(
            fetcher,
            storage,
            RepositoryConfig {
                poller: PollerConfig {
                    interval: self.refresh_interval,
                    jitter: self.refresh_jitter,
                },
                bootstrap: self.bootstrap,
                startup_precedence: self.startup_precedence,
            },
        );
        for listener in self.listeners {
            repository.add_shared_listener(listener);
        }

        let mut engine = StrategyEngine::new();
        for (name, strategy) in self.strategies {
            engine = engine.with_strategy(name, strategy);
        }
        if let Some(hostname) = self.hostname {
            engine = engine.with_hostname(hostname);
        }

        Ok(Client::from_parts(
            repository,
            engine,
            self.app_name,
            self.environment,
        ))
    }

    fn validate(&self) -> Result<()> {
        if self.app_name.trim().is_empty() {
            return Err(Error::Configuration("app_name is required".to_owned()));
        }
        if self.url.trim().is_empty() {
            return Err(Error::Configuration("url is required".to_owned()));
        }
        Ok(())
    }

    fn instance_id(&self) -> String {
        self.instance_id.clone().unwrap_or_else(|| {
            format!(
                "{}-{:08x}",
                strategy::default_hostname(),
                thread_rng().gen::<u32>()
            )
        })
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // custom_headers are left out, they usually carry the API token.
        f.debug_struct("ClientConfig")
            .field("app_name", &self.app_name)
            .field("url", &self.url)
            .field("environment", &self.environment)
            .field("refresh_interval", &self.refresh_interval)
            .field("project_name", &self.project_name)
            .field("startup_precedence", &self.startup_precedence)
            .finish_non_exhaustive()
    }
}

/// Parse the server url, accepting urls that point at the features endpoint directly.
fn normalize_url(url: &str) -> Result<Url> {
    let mut url = url.trim().to_owned();
    if let Some(stripped) = url.strip_suffix("/features") {
        log::warn!(target: "unleash", url:display = url; "server url should not point at /features directly");
        url = stripped.to_owned();
    }
    if !url.ends_with('/') {
        url.push('/');
    }
    Ok(Url::parse(&url)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fetcher::FetchResponse, storage::InMemoryStorage, Context, ToggleDefinition};

    #[test]
    fn appends_trailing_slash() {
        assert_eq!(
            normalize_url("http://unleash.example/api").unwrap().as_str(),
            "http://unleash.example/api/"
        );
        assert_eq!(
            normalize_url("http://unleash.example/api/").unwrap().as_str(),
            "http://unleash.example/api/"
        );
    }

    #[test]
    fn trims_features_endpoint() {
        assert_eq!(
            normalize_url("http://unleash.example/api/features")
                .unwrap()
                .as_str(),
            "http://unleash.example/api/"
        );
    }

    #[test]
    fn rejects_missing_required_fields() {
        assert!(matches!(
            ClientConfig::new("", "http://unleash.example/api/").to_client(),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            ClientConfig::new("app", " ").to_client(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn rejects_unparseable_url() {
        assert!(matches!(
            ClientConfig::new("app", "not a url").to_client(),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn generates_instance_id() {
        let config = ClientConfig::new("app", "http://unleash.example/api/");
        assert!(!config.instance_id().is_empty());
        assert_eq!(
            config.with_instance_id("fixed").instance_id(),
            "fixed".to_owned()
        );
    }

    #[test]
    fn wires_custom_strategies_and_hostname() {
        let client = ClientConfig::new("app", "http://unleash.example/api/")
            .with_storage(InMemoryStorage::new())
            .with_refresh_interval(Duration::ZERO)
            .with_hostname("web-1")
            .with_strategy("always", |_: &strategy::Parameters, _: &Context| true)
            .with_bootstrap(BootstrapSource::new().with_data(vec![
                ToggleDefinition::new("custom", true)
                    .with_strategy(crate::StrategyConfig::new("always")),
                ToggleDefinition::new("host", true).with_strategy(
                    crate::StrategyConfig::new("applicationHostname")
                        .with_parameter("hostNames", "web-1,web-2"),
                ),
            ]))
            .to_client_with_fetcher(|_: Option<&str>| -> Result<FetchResponse> {
                Ok(FetchResponse::NotModified)
            })
            .unwrap();

        client.start().unwrap();

        assert!(client.is_enabled("custom", &Context::new(), false));
        assert!(client.is_enabled("host", &Context::new(), false));
    }
}
