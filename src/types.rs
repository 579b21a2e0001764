//! DKIM Provisioning Types
//!
//! Directory payloads, the derived TXT record, and the error types shared
//! by the credential resolver and the directory client.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// One DKIM key known to the directory for a domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DkimKeyRecord {
    #[serde(default)]
    pub selector: String,
    #[serde(default)]
    pub public_key: Option<String>,
}

/// Domain metadata returned by `domains.get`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainInfo {
    #[serde(default)]
    pub domain_name: String,
    #[serde(default)]
    pub dkim_keys: Option<Vec<DkimKeyRecord>>,
}

impl DomainInfo {
    /// Public key for `selector`, if present and non-empty.
    pub fn public_key_for(&self, selector: &str) -> Option<&str> {
        self.dkim_keys
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|key| key.selector == selector)
            .and_then(|key| key.public_key.as_deref())
            .filter(|key| !key.is_empty())
    }
}

/// The `v=DKIM1` TXT value for one public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkimTxtRecord {
    public_key: String,
}

impl DkimTxtRecord {
    pub fn new(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
        }
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Record name the TXT value lives under.
    pub fn name(selector: &str, domain: &str) -> String {
        format!("{}._domainkey.{}", selector, domain)
    }
}

impl std::fmt::Display for DkimTxtRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v=DKIM1; k=rsa; p={}", self.public_key)
    }
}

/// How to make Google credentials available
pub const CREDENTIALS_REMEDIATION: &str = "For OAuth (recommended):\n  \
    Run: gcloud auth application-default login\n\n\
    Or for service account:\n  \
    Set GOOGLE_APPLICATION_CREDENTIALS to service account JSON file";

/// Errors resolving credentials for the directory service
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Neither ADC nor a key file is available
    #[error("No Google credentials found ({})\n\n{}", .reason, CREDENTIALS_REMEDIATION)]
    NotConfigured { reason: String },

    /// The configured key file does not exist
    #[error("Credentials file not found: {}\n\n{}", .0.display(), CREDENTIALS_REMEDIATION)]
    KeyFileNotFound(PathBuf),

    /// The key file exists but is not a usable service-account key
    #[error("Invalid service account key: {0}")]
    InvalidKeyFile(String),

    /// Minting an access token failed
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),
}

/// Errors talking to the Admin SDK Directory API
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Domain not found")]
    NotFound,

    #[error("Directory API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("Authentication failed: {0}")]
    Auth(#[from] CredentialError),
}

impl DirectoryError {
    /// Failure flavored as "selector already exists".
    pub fn is_conflict(&self) -> bool {
        matches!(self, DirectoryError::Api { status: 400 | 409, .. })
    }
}
