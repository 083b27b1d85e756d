//! Conditional upstream client.
//!
//! Wraps outbound calls to the listings source with a hard per-request
//! timeout and ETag-conditional retrieval: a stored validator is attached as
//! `If-None-Match`, and `304 Not Modified` short-circuits without a body.
//! The ETag outlives the data it validates, so the conditional optimization
//! keeps paying off across data-TTL expiries. No internal retry — a timeout
//! or unexpected status is the caller's problem.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, ETAG, IF_NONE_MATCH};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::cache::keys;
use crate::config::{CacheSettings, UpstreamSettings};
use crate::domain::error::GatewayError;
use crate::infra::kv::KeyValueStore;

/// Resource key for the listings collection endpoint.
pub const LISTINGS_RESOURCE: &str = "properties";

const LISTINGS_PATH: &str = "propertyadvertising.php";
const MEDIA_PATH: &str = "propertymedia.php";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request for `{resource}` timed out after {budget_secs}s")]
    Timeout { resource: String, budget_secs: u64 },
    #[error("upstream transport failure for `{resource}`: {message}")]
    Transport { resource: String, message: String },
    #[error("upstream returned status {status} for `{resource}`")]
    Status { resource: String, status: u16 },
    #[error("failed to build upstream request: {message}")]
    Request { message: String },
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        GatewayError::upstream(err.to_string())
    }
}

/// Outcome of a conditional fetch. `NotModified` obliges the caller to use
/// its own cached copy — having none is an inconsistency the caller must
/// surface, not paper over.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fresh(Bytes),
    NotModified,
}

/// Reqwest-backed client for the listings source.
pub struct ConditionalFetchClient {
    http: reqwest::Client,
    store: Arc<dyn KeyValueStore>,
    upstream: UpstreamSettings,
    cache: CacheSettings,
}

impl ConditionalFetchClient {
    pub fn new(
        upstream: UpstreamSettings,
        cache: CacheSettings,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| UpstreamError::Request {
                message: err.to_string(),
            })?;
        Ok(Self {
            http,
            store,
            upstream,
            cache,
        })
    }

    /// Fetch the full listings collection (token as query parameter).
    pub async fn fetch_listings(&self) -> Result<FetchOutcome, UpstreamError> {
        let mut url = self.endpoint(LISTINGS_PATH)?;
        url.query_pairs_mut()
            .append_pair("token", &self.upstream.api_token);

        let request = self.http.get(url).header(ACCEPT, "application/json");
        self.fetch(LISTINGS_RESOURCE, request, self.upstream.listings_timeout())
            .await
    }

    /// Fetch the media list for one listing (token as header).
    pub async fn fetch_media_list(&self, id: &str) -> Result<FetchOutcome, UpstreamError> {
        let mut url = self.endpoint(MEDIA_PATH)?;
        url.query_pairs_mut().append_pair("propref", id);

        let request = self
            .http
            .get(url)
            .header("token", &self.upstream.api_token)
            .header(ACCEPT, "application/json");
        self.fetch(
            &format!("media-list:{id}"),
            request,
            self.upstream.listings_timeout(),
        )
        .await
    }

    /// Fetch one media file as a base64 body (larger timeout budget).
    pub async fn fetch_media_file(&self, filename: &str) -> Result<FetchOutcome, UpstreamError> {
        let mut url = self.endpoint(MEDIA_PATH)?;
        url.query_pairs_mut().append_pair("filename", filename);

        let request = self
            .http
            .get(url)
            .header("token", &self.upstream.api_token)
            .header(ACCEPT, "application/base64");
        self.fetch(
            &format!("media:{filename}"),
            request,
            self.upstream.media_timeout(),
        )
        .await
    }

    fn endpoint(&self, path: &str) -> Result<Url, UpstreamError> {
        let base = Url::parse(&self.upstream.base_url).map_err(|err| UpstreamError::Request {
            message: format!("invalid base url `{}`: {err}", self.upstream.base_url),
        })?;
        base.join(path).map_err(|err| UpstreamError::Request {
            message: err.to_string(),
        })
    }

    async fn fetch(
        &self,
        resource: &str,
        request: reqwest::RequestBuilder,
        budget: Duration,
    ) -> Result<FetchOutcome, UpstreamError> {
        let etag_key = keys::etag(resource);
        let mut request = request.timeout(budget);

        // Store failures around the validator are never fatal: a lost ETag
        // only costs one unconditional fetch.
        match self.store.get(&etag_key).await {
            Ok(Some(raw)) => match std::str::from_utf8(&raw) {
                Ok(validator) => {
                    request = request.header(IF_NONE_MATCH, validator.trim());
                }
                Err(_) => {
                    warn!(
                        target: "vetrina::upstream",
                        resource,
                        "stored etag is not valid utf-8; fetching unconditionally"
                    );
                }
            },
            Ok(None) => {}
            Err(err) => {
                warn!(
                    target: "vetrina::upstream",
                    resource,
                    error = %err,
                    "failed to read stored etag; fetching unconditionally"
                );
            }
        }

        counter!("vetrina_upstream_fetch_total").increment(1);

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                UpstreamError::Timeout {
                    resource: resource.to_string(),
                    budget_secs: budget.as_secs(),
                }
            } else {
                UpstreamError::Transport {
                    resource: resource.to_string(),
                    message: err.to_string(),
                }
            }
        })?;

        if response.status() == StatusCode::NOT_MODIFIED {
            counter!("vetrina_upstream_not_modified_total").increment(1);
            debug!(target: "vetrina::upstream", resource, "upstream confirmed cached copy");
            return Ok(FetchOutcome::NotModified);
        }

        if !response.status().is_success() {
            return Err(UpstreamError::Status {
                resource: resource.to_string(),
                status: response.status().as_u16(),
            });
        }

        let validator = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let body = response
            .bytes()
            .await
            .map_err(|err| UpstreamError::Transport {
                resource: resource.to_string(),
                message: err.to_string(),
            })?;

        if let Some(validator) = validator {
            if let Err(err) = self
                .store
                .put(
                    &etag_key,
                    Bytes::from(validator),
                    Some(self.cache.etag_ttl_secs),
                )
                .await
            {
                warn!(
                    target: "vetrina::upstream",
                    resource,
                    error = %err,
                    "failed to store etag; next fetch will be unconditional"
                );
            }
        }

        Ok(FetchOutcome::Fresh(body))
    }
}
