//! Single-shot GET client for the Aqqu and QAC backends.

use crate::data::URL_QUOTE;
use percent_encoding::utf8_percent_encode;
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

const LOG_PREVIEW_CHARS: usize = 69;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub host: String,
    pub port: u16,
}

impl BackendEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("http://[{}]:{}", self.host, self.port)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for BackendEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{backend} unreachable: {source}")]
    Unavailable {
        backend: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{backend} answered with HTTP {status}")]
    Status {
        backend: &'static str,
        status: reqwest::StatusCode,
    },
    #[error("{backend} sent an unexpected reply: {source}")]
    Decode {
        backend: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl ProxyError {
    /// True for failures where the backend could not be talked to at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            ProxyError::Unavailable { .. } | ProxyError::Status { .. }
        )
    }
}

/// Forwards one query per call to a fixed `host:port`.
///
/// Idle connections are never kept, so every call opens its own connection
/// and closes it once the body has been read, whether or not it succeeded.
#[derive(Debug, Clone)]
pub struct BackendClient {
    name: &'static str,
    endpoint: BackendEndpoint,
    http: reqwest::Client,
}

impl BackendClient {
    pub fn new(
        name: &'static str,
        endpoint: BackendEndpoint,
        timeout: Option<Duration>,
    ) -> Result<Self, ProxyError> {
        let mut builder = reqwest::Client::builder().pool_max_idle_per_host(0);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(ProxyError::Client)?;
        Ok(Self {
            name,
            endpoint,
            http,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn endpoint(&self) -> &BackendEndpoint {
        &self.endpoint
    }

    pub fn request_url(&self, query: &str) -> String {
        format!(
            "{}/?q={}",
            self.endpoint.base_url(),
            utf8_percent_encode(query, URL_QUOTE)
        )
    }

    pub async fn fetch<T: DeserializeOwned>(&self, query: &str) -> Result<T, ProxyError> {
        let url = self.request_url(query);
        let body = self.get_text(&url).await.inspect_err(|err| {
            error!(
                backend = self.name,
                endpoint = %self.endpoint,
                %err,
                "Connection to backend could not be established"
            );
        })?;
        let preview: String = body.chars().take(LOG_PREVIEW_CHARS).collect();
        info!(backend = self.name, "Response: '{preview}...'");
        serde_json::from_str(&body).map_err(|source| ProxyError::Decode {
            backend: self.name,
            source,
        })
    }

    async fn get_text(&self, url: &str) -> Result<String, ProxyError> {
        let unavailable = |source| ProxyError::Unavailable {
            backend: self.name,
            source,
        };
        let response = self.http.get(url).send().await.map_err(unavailable)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::Status {
                backend: self.name,
                status,
            });
        }
        response.text().await.map_err(unavailable)
    }
}
