//! Initial toggle definitions used before the first successful fetch.
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use url::Url;

use crate::{
    toggles::{ClientFeaturesResponse, Snapshot, ToggleDefinition},
    Result,
};

/// Where to read initial toggle definitions from.
///
/// Origins are tried in order: inline data, then file, then url. The first origin that yields a
/// parseable payload wins; failures fall through to the next origin.
#[derive(Debug, Clone, Default)]
pub struct BootstrapSource {
    data: Option<Vec<ToggleDefinition>>,
    file_path: Option<PathBuf>,
    url: Option<Url>,
    url_headers: HashMap<String, String>,
    timeout: Option<Duration>,
}

impl BootstrapSource {
    /// An empty source that never yields a snapshot.
    pub fn new() -> BootstrapSource {
        BootstrapSource::default()
    }

    pub fn with_data(mut self, toggles: Vec<ToggleDefinition>) -> BootstrapSource {
        self.data = Some(toggles);
        self
    }

    /// Read a `client/features` response body (or a saved backup) from a file.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> BootstrapSource {
        self.file_path = Some(path.into());
        self
    }

    /// Fetch a `client/features` response body from a url.
    pub fn with_url(mut self, url: Url) -> BootstrapSource {
        self.url = Some(url);
        self
    }

    /// Headers sent with the url request.
    pub fn with_url_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> BootstrapSource {
        self.url_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> BootstrapSource {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_none() && self.file_path.is_none() && self.url.is_none()
    }

    /// Resolve the bootstrap snapshot. Returns `None` if no origin yields toggles.
    ///
    /// Bootstrap snapshots carry no validation token, so the first fetch is unconditional.
    pub fn load(&self) -> Option<Snapshot> {
        if let Some(data) = &self.data {
            if !data.is_empty() {
                log::debug!(target: "unleash", toggles = data.len(); "bootstrapping from inline data");
                return Some(Snapshot::from_response(data.clone().into(), None, 0));
            }
        }

        if let Some(path) = &self.file_path {
            match read_file(path) {
                Ok(Some(response)) => {
                    log::debug!(target: "unleash", path:? = path; "bootstrapping from file");
                    return Some(Snapshot::from_response(response, None, 0));
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!(target: "unleash", path:? = path; "failed to read bootstrap file: {}", err);
                }
            }
        }

        if let Some(url) = &self.url {
            match self.fetch_url(url) {
                Ok(Some(response)) => {
                    log::debug!(target: "unleash", url:display = url; "bootstrapping from url");
                    return Some(Snapshot::from_response(response, None, 0));
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!(target: "unleash", url:display = url; "failed to fetch bootstrap url: {}", err);
                }
            }
        }

        None
    }

    fn fetch_url(&self, url: &Url) -> Result<Option<ClientFeaturesResponse>> {
        let mut builder = reqwest::blocking::Client::builder();
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;

        let mut request = client.get(url.clone());
        for (name, value) in &self.url_headers {
            request = request.header(name, value);
        }

        let response = request.send()?.error_for_status()?;
        let body = response.bytes()?;
        parse_payload(&body)
    }
}

fn read_file(path: &Path) -> Result<Option<ClientFeaturesResponse>> {
    let content = fs::read(path)?;
    parse_payload(&content)
}

/// Empty feature lists count as "nothing to bootstrap from".
fn parse_payload(content: &[u8]) -> Result<Option<ClientFeaturesResponse>> {
    let response: ClientFeaturesResponse = serde_json::from_slice(content)?;
    Ok(Some(response).filter(|r| !r.features.is_empty()))
}
