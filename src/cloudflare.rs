//! Cloudflare API Publisher
//!
//! Publishes the DKIM TXT record through the Cloudflare v4 REST API instead
//! of the shell collaborator. Looks up the zone, then creates the record or
//! updates it in place when the content differs.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::DnsCredentials;
use crate::dns::{DnsPublisher, PublishResult, MISSING_CREDENTIALS};
use crate::types::DkimTxtRecord;

const TXT_TTL_AUTO: u32 = 1;

// ============================================================
// API Response Types
// ============================================================

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TxtRecord {
    id: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct TxtRecordRequest<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

/// What an upsert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Created,
    Updated,
    Unchanged,
}

// ============================================================
// Client Implementation
// ============================================================

/// DNS publisher backed by the Cloudflare API
pub struct CloudflareApiPublisher {
    client: Client,
    base_url: String,
    credentials: Option<DnsCredentials>,
}

impl CloudflareApiPublisher {
    pub fn new(base_url: impl Into<String>, credentials: Option<DnsCredentials>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("google-dkim/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let base_url: String = base_url.into();

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn authorize(&self, request: RequestBuilder, credentials: &DnsCredentials) -> RequestBuilder {
        match credentials {
            DnsCredentials::ApiToken(token) => request.bearer_auth(token),
            DnsCredentials::ApiKey { key, email } => request
                .header("X-Auth-Key", key)
                .header("X-Auth-Email", email),
        }
    }

    /// Send one API request and unwrap the Cloudflare envelope.
    async fn execute<T, B>(
        &self,
        credentials: &DnsCredentials,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&B>,
    ) -> Result<Option<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut request = self
            .authorize(self.client.request(method, url), credentials)
            .query(query);

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .context("Failed to send request to Cloudflare API")?;
        let status = response.status();

        let envelope: ApiResponse<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse Cloudflare response (status {})", status))?;

        if !envelope.success {
            let errors: Vec<String> = envelope
                .errors
                .iter()
                .map(|e| format!("{} (code {})", e.message, e.code))
                .collect();
            bail!("Cloudflare API error: {}", errors.join(", "));
        }

        Ok(envelope.result)
    }

    async fn zone_id(&self, credentials: &DnsCredentials, zone_name: &str) -> Result<String> {
        debug!("Looking up zone ID for: {}", zone_name);

        let url = format!("{}/zones", self.base_url);
        let zones: Vec<Zone> = self
            .execute(credentials, Method::GET, &url, &[("name", zone_name)], None::<&()>)
            .await?
            .unwrap_or_default();

        let zone = zones
            .into_iter()
            .next()
            .with_context(|| format!("Zone not found: {}", zone_name))?;

        debug!("Found zone ID: {}", zone.id);
        Ok(zone.id)
    }

    /// Create or update the TXT record at `name` so it holds `content`.
    pub async fn upsert_txt(
        &self,
        credentials: &DnsCredentials,
        zone_name: &str,
        name: &str,
        content: &str,
    ) -> Result<UpsertAction> {
        let zone_id = self.zone_id(credentials, zone_name).await?;
        let records_url = format!("{}/zones/{}/dns_records", self.base_url, zone_id);

        let existing: Vec<TxtRecord> = self
            .execute(
                credentials,
                Method::GET,
                &records_url,
                &[("type", "TXT"), ("name", name)],
                None::<&()>,
            )
            .await?
            .unwrap_or_default();

        let body = TxtRecordRequest {
            record_type: "TXT",
            name,
            content,
            ttl: TXT_TTL_AUTO,
        };

        match existing.first() {
            Some(record) if record.content.trim_matches('"') == content => {
                info!("DKIM record {} is already up to date", name);
                Ok(UpsertAction::Unchanged)
            }
            Some(record) => {
                info!("Updating existing DKIM record {}", name);
                let url = format!("{}/{}", records_url, record.id);
                self.execute::<serde_json::Value, _>(credentials, Method::PUT, &url, &[], Some(&body))
                    .await?;
                Ok(UpsertAction::Updated)
            }
            None => {
                info!("Creating DKIM record {}", name);
                self.execute::<serde_json::Value, _>(
                    credentials,
                    Method::POST,
                    &records_url,
                    &[],
                    Some(&body),
                )
                .await?;
                Ok(UpsertAction::Created)
            }
        }
    }
}

#[async_trait]
impl DnsPublisher for CloudflareApiPublisher {
    async fn publish(&self, domain: &str, selector: &str, value: &str) -> PublishResult {
        let Some(credentials) = &self.credentials else {
            warn!("{}", MISSING_CREDENTIALS);
            return PublishResult::Skipped(MISSING_CREDENTIALS.to_string());
        };

        let name = DkimTxtRecord::name(selector, domain);
        info!("Adding DKIM record to Cloudflare DNS via API...");

        match self.upsert_txt(credentials, domain, &name, value).await {
            Ok(action) => {
                info!(?action, "✓ DKIM record published to Cloudflare DNS");
                PublishResult::Published
            }
            Err(e) => {
                warn!("Error adding to Cloudflare: {:#}", e);
                PublishResult::Failed(format!("{:#}", e))
            }
        }
    }
}
