//! Fetching toggle definitions from the server.
//!
//! The repository only depends on the [`ToggleFetcher`] trait; [`HttpFetcher`] is the HTTP
//! implementation used by [`Client`](crate::Client).
use std::{collections::HashMap, time::Duration};

use reqwest::{
    header::{ETAG, IF_NONE_MATCH, USER_AGENT},
    StatusCode, Url,
};

use crate::{toggles::ClientFeaturesResponse, Error, Result};

/// Outcome of a conditional fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResponse {
    /// The server's definitions still match the validation token we sent.
    NotModified,
    /// New definitions, with the validation token to send next time.
    Modified {
        response: ClientFeaturesResponse,
        etag: Option<String>,
    },
}

/// Fetches toggle definitions, given the validation token of the last successful fetch.
pub trait ToggleFetcher: Send {
    fn fetch(&mut self, etag: Option<&str>) -> Result<FetchResponse>;
}

impl<F> ToggleFetcher for F
where
    F: FnMut(Option<&str>) -> Result<FetchResponse> + Send,
{
    fn fetch(&mut self, etag: Option<&str>) -> Result<FetchResponse> {
        self(etag)
    }
}

/// Configuration for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// Server API url, ending with `/`.
    pub url: Url,
    pub app_name: String,
    pub instance_id: String,
    pub project_name: Option<String>,
    pub name_prefix: Option<String>,
    /// Tag filters as `(type, value)` pairs.
    pub tags: Vec<(String, String)>,
    pub custom_headers: HashMap<String, String>,
    pub timeout: Duration,
}

const FEATURES_ENDPOINT: &str = "client/features";

/// Fetches toggle definitions over HTTP.
pub struct HttpFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    url: Url,
    config: HttpFetcherConfig,
}

impl HttpFetcher {
    pub fn new(config: HttpFetcherConfig) -> Result<HttpFetcher> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()?;
        let url = features_url(&config)?;

        Ok(HttpFetcher {
            client,
            url,
            config,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl ToggleFetcher for HttpFetcher {
    fn fetch(&mut self, etag: Option<&str>) -> Result<FetchResponse> {
        log::debug!(target: "unleash", url:display = self.url; "fetching toggles");

        let mut request = self
            .client
            .get(self.url.clone())
            .header(USER_AGENT, &self.config.app_name)
            .header("UNLEASH-APPNAME", &self.config.app_name)
            .header("UNLEASH-INSTANCEID", &self.config.instance_id)
            .header(
                "UNLEASH-SDK",
                concat!("unleash-client-rust:", env!("CARGO_PKG_VERSION")),
            );
        for (name, value) in &self.config.custom_headers {
            request = request.header(name, value);
        }
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send()?;

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                log::debug!(target: "unleash", "toggles not modified");
                Ok(FetchResponse::NotModified)
            }
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned);
                let body = response.bytes()?;
                let response: ClientFeaturesResponse = serde_json::from_slice(&body)?;
                log::debug!(target: "unleash", toggles = response.features.len(); "fetched toggles");
                Ok(FetchResponse::Modified { response, etag })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                log::warn!(target: "unleash", "client is not authorized. Check your Authorization header");
                Err(Error::Unauthorized)
            }
            status => {
                log::warn!(target: "unleash", "received {} response while fetching toggles", status);
                Err(Error::UnexpectedStatus(status.as_u16()))
            }
        }
    }
}

fn features_url(config: &HttpFetcherConfig) -> Result<Url> {
    let mut url = config.url.join(FEATURES_ENDPOINT)?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(project) = &config.project_name {
            query.append_pair("project", project);
        }
        if let Some(prefix) = &config.name_prefix {
            query.append_pair("namePrefix", prefix);
        }
        for (tag_type, value) in &config.tags {
            query.append_pair("tag", &format!("{tag_type}:{value}"));
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url)
}
