//! Boundary contracts the engine consumes, plus their HTTP implementation.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use std::fmt;
use tracing::{debug, warn};

use crate::model::OutboxRecord;
use crate::remote::model::{PullRequest, PullResponse, ServerUnitEntry, SharingUpdate};

pub mod model;

/// Fetches server-side changes since a cursor.
#[async_trait]
pub trait PullTransport: Send + Sync {
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse>;
}

/// Delivers one queued mutation. Any error keeps the record queued.
#[async_trait]
pub trait OutboxProcessor: Send + Sync {
    async fn process(&self, record: &OutboxRecord) -> Result<()>;
}

/// Resolves the acting user. `None` means an anonymous session.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn user_id(&self) -> Option<String>;
}

/// Direct (non-outboxed) content calls that need authoritative confirmation.
#[async_trait]
pub trait ContentRepo: Send + Sync {
    async fn fetch_unit_detail(&self, unit_id: &str) -> Result<ServerUnitEntry>;
    async fn add_to_my_units(&self, unit_id: &str) -> Result<()>;
    async fn remove_from_my_units(&self, unit_id: &str) -> Result<()>;
    async fn update_sharing(&self, unit_id: &str, update: &SharingUpdate) -> Result<()>;
}

/// Identity fixed at startup (from config or a login handshake).
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    user_id: Option<String>,
}

impl StaticIdentity {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            user_id: user_id.filter(|id| !id.trim().is_empty()),
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn user_id(&self) -> Option<String> {
        self.user_id.clone()
    }
}

#[derive(Clone)]
pub struct HttpRemote {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for HttpRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    pub fn new(base_url: &str, token: String) -> Result<Self> {
        let mut base_url = Url::parse(base_url).context("invalid server base URL")?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("server base URL {} cannot carry a path", base_url));
        }
        // Relative joins would otherwise replace the last path segment.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent(concat!("content-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    /// Base URL extended by `segments`, each percent-encoded as one path
    /// segment so ids can never introduce extra segments or a query.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("server base URL {} cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn build_unit_request(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&SharingUpdate>,
    ) -> Result<reqwest::Request> {
        let mut builder = self.authorized(method, self.endpoint(segments)?);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder.build().context("failed to build request")
    }

    fn authorized(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
    }

    pub fn build_pull_request(&self, request: &PullRequest) -> Result<reqwest::Request> {
        let mut url = self.endpoint(&["v1", "content", "sync"])?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(cursor) = request.cursor.as_deref().filter(|c| !c.is_empty()) {
                query.append_pair("cursor", cursor);
            }
            query.append_pair("payload", request.payload.as_str());
            query.append_pair("force", if request.force { "true" } else { "false" });
            if !request.unit_ids.is_empty() {
                query.append_pair("unit_ids", &request.unit_ids.join(","));
            }
        }
        self.authorized(Method::GET, url)
            .build()
            .context("failed to build pull request")
    }

    pub fn build_outbox_request(&self, record: &OutboxRecord) -> Result<reqwest::Request> {
        let method = Method::from_bytes(record.method.to_ascii_uppercase().as_bytes())
            .with_context(|| format!("invalid outbox method {}", record.method))?;
        let url = self
            .base_url
            .join(&record.endpoint)
            .with_context(|| format!("invalid outbox endpoint {}", record.endpoint))?;
        let mut builder = self
            .authorized(method, url)
            .header("Idempotency-Key", &record.idempotency_key);
        for (name, value) in &record.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !record.payload.is_null() {
            builder = builder.json(&record.payload);
        }
        builder.build().context("failed to build outbox request")
    }

    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        let method = request.method().clone();
        let url = request.url().clone();
        debug!(%method, %url, "sending request");
        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("failed to reach {}", url))?;
        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(%url, "rate limited by server");
            return Err(anyhow!("received 429 from {}: {}", url, body));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%method, %url, %status, "server returned error");
            return Err(anyhow!("server error {} for {} {}: {}", status, method, url, body));
        }
        Ok(res)
    }

    async fn send_unit_call(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&SharingUpdate>,
    ) -> Result<()> {
        let request = self.build_unit_request(method, segments, body)?;
        self.execute(request).await?;
        Ok(())
    }
}

#[async_trait]
impl PullTransport for HttpRemote {
    async fn pull(&self, request: &PullRequest) -> Result<PullResponse> {
        let req = self.build_pull_request(request)?;
        let res = self.execute(req).await?;
        res.json::<PullResponse>()
            .await
            .context("invalid pull response JSON")
    }
}

#[async_trait]
impl OutboxProcessor for HttpRemote {
    async fn process(&self, record: &OutboxRecord) -> Result<()> {
        let req = self.build_outbox_request(record)?;
        self.execute(req).await?;
        Ok(())
    }
}

#[async_trait]
impl ContentRepo for HttpRemote {
    async fn fetch_unit_detail(&self, unit_id: &str) -> Result<ServerUnitEntry> {
        let req = self.build_unit_request(Method::GET, &["v1", "units", unit_id], None)?;
        let res = self.execute(req).await?;
        res.json::<ServerUnitEntry>()
            .await
            .context("invalid unit detail JSON")
    }

    async fn add_to_my_units(&self, unit_id: &str) -> Result<()> {
        self.send_unit_call(Method::POST, &["v1", "my-units", unit_id], None)
            .await
    }

    async fn remove_from_my_units(&self, unit_id: &str) -> Result<()> {
        self.send_unit_call(Method::DELETE, &["v1", "my-units", unit_id], None)
            .await
    }

    async fn update_sharing(&self, unit_id: &str, update: &SharingUpdate) -> Result<()> {
        self.send_unit_call(
            Method::PATCH,
            &["v1", "units", unit_id, "sharing"],
            Some(update),
        )
        .await
    }
}
