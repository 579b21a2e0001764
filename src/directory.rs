//! Admin SDK Directory Client
//!
//! Reads domain metadata and generates DKIM keys through the Google
//! Workspace Admin SDK Directory API, and implements the get-or-generate
//! idempotency rule on top of it.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::credentials::{AccessTokenSource, CredentialResolver};
use crate::types::{DirectoryError, DkimKeyRecord, DomainInfo};

/// Directory operations the key provider needs
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    /// `domains.get` for `domain` under `customer`.
    async fn get_domain(&self, customer: &str, domain: &str) -> Result<DomainInfo, DirectoryError>;

    /// `domains.generateDkimKey` for `(domain, selector)`.
    async fn generate_dkim_key(
        &self,
        customer: &str,
        domain: &str,
        selector: &str,
    ) -> Result<DkimKeyRecord, DirectoryError>;
}

/// Authenticates and yields a directory client
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    /// Credential failures surface as [`DirectoryError::Auth`].
    async fn connect(&self) -> Result<Box<dyn DirectoryApi>, DirectoryError>;
}

// ============================================================
// HTTP Client
// ============================================================

#[derive(Debug, Serialize)]
struct GenerateDkimKeyRequest<'a> {
    selector: &'a str,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorBody {
    error: GoogleError,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
    #[serde(default)]
    message: String,
}

/// Admin SDK Directory API over HTTPS
pub struct AdminDirectoryClient {
    client: Client,
    base_url: String,
    auth: Box<dyn AccessTokenSource>,
}

impl AdminDirectoryClient {
    pub fn new(
        base_url: impl Into<String>,
        auth: Box<dyn AccessTokenSource>,
    ) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .user_agent(concat!("google-dkim/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;

        let base_url: String = base_url.into();

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn domain_url(&self, customer: &str, domain: &str) -> String {
        format!("{}/customer/{}/domains/{}", self.base_url, customer, domain)
    }

    /// Map a non-success response to a typed error.
    async fn error_from(response: Response) -> DirectoryError {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return DirectoryError::NotFound;
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<GoogleErrorBody>(&body)
            .map(|b| b.error.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or(body);

        DirectoryError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl DirectoryApi for AdminDirectoryClient {
    async fn get_domain(&self, customer: &str, domain: &str) -> Result<DomainInfo, DirectoryError> {
        let url = self.domain_url(customer, domain);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth.authorization().await?)
            .send()
            .await
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| DirectoryError::Decode(e.to_string()))
    }

    async fn generate_dkim_key(
        &self,
        customer: &str,
        domain: &str,
        selector: &str,
    ) -> Result<DkimKeyRecord, DirectoryError> {
        let url = format!("{}/generateDkimKey", self.domain_url(customer, domain));
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth.authorization().await?)
            .json(&GenerateDkimKeyRequest { selector })
            .send()
            .await
            .map_err(|e| DirectoryError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| DirectoryError::Decode(e.to_string()))
    }
}

/// Resolves credentials, then builds an [`AdminDirectoryClient`]
pub struct AdminDirectoryConnector<'a> {
    config: &'a Config,
    resolver: CredentialResolver<'a>,
}

impl<'a> AdminDirectoryConnector<'a> {
    pub fn new(config: &'a Config, resolver: CredentialResolver<'a>) -> Self {
        Self { config, resolver }
    }
}

#[async_trait]
impl DirectoryConnector for AdminDirectoryConnector<'_> {
    async fn connect(&self) -> Result<Box<dyn DirectoryApi>, DirectoryError> {
        info!("Authenticating with Google Workspace Admin API...");
        let credential = self.resolver.resolve().await?;

        debug!(?credential, "Building Admin SDK directory client");
        let client = AdminDirectoryClient::new(&self.config.directory_url, Box::new(credential))?;

        Ok(Box::new(client))
    }
}

// ============================================================
// Key Provider
// ============================================================

/// Get-or-generate over a [`DirectoryApi`]
pub struct KeyProvider<'a> {
    directory: &'a dyn DirectoryApi,
    customer_id: &'a str,
}

impl<'a> KeyProvider<'a> {
    pub fn new(directory: &'a dyn DirectoryApi, customer_id: &'a str) -> Self {
        Self {
            directory,
            customer_id,
        }
    }

    /// Existing public key for `selector`, or a freshly generated one.
    ///
    /// Generation is attempted at most once and only when no usable key for
    /// the selector exists. `None` means neither path produced key material.
    pub async fn get_or_generate(&self, domain: &str, selector: &str) -> Option<String> {
        info!("Checking for existing DKIM keys for {}...", domain);

        match self.directory.get_domain(self.customer_id, domain).await {
            Ok(domain_info) => {
                let keys = domain_info.dkim_keys.as_deref().unwrap_or_default();
                info!("Found {} existing DKIM key(s)", keys.len());

                if let Some(public_key) = domain_info.public_key_for(selector) {
                    info!("✓ Found existing DKIM key for selector: {}", selector);
                    return Some(public_key.to_string());
                }

                if !keys.is_empty() {
                    info!("Selector '{}' not found in existing keys", selector);
                }
            }
            Err(DirectoryError::NotFound) => {
                info!("Domain {} not found or no DKIM keys", domain);
            }
            Err(e) => {
                warn!("Error getting DKIM keys: {}", e);
            }
        }

        info!("Generating new DKIM key for selector: {}...", selector);

        match self
            .directory
            .generate_dkim_key(self.customer_id, domain, selector)
            .await
        {
            Ok(record) => match record.public_key.filter(|k| !k.is_empty()) {
                Some(public_key) => {
                    info!("✓ DKIM key generated successfully");
                    Some(public_key)
                }
                None => {
                    error!("Generated DKIM key response carried no public key");
                    None
                }
            },
            Err(e) => {
                error!("Error generating DKIM key: {}", e);
                if e.is_conflict() {
                    warn!(
                        "Note: a DKIM key may already exist for selector '{}'; choose a new selector",
                        selector
                    );
                }
                None
            }
        }
    }
}
