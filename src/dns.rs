//! DNS Publishing
//!
//! A [`DnsPublisher`] creates or updates the `<selector>._domainkey.<domain>`
//! TXT record. The default backend shells out to the `cloudflare-dns.sh`
//! collaborator; [`crate::cloudflare::CloudflareApiPublisher`] talks to the
//! Cloudflare API directly.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::DnsCredentials;

pub const MISSING_CREDENTIALS: &str =
    "Cloudflare API credentials not set. Set CLOUDFLARE_API_TOKEN or CLOUDFLARE_API_KEY + CLOUDFLARE_EMAIL";

/// Outcome of one publish attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishResult {
    /// The record exists with the requested value
    Published,
    /// A precondition failed; nothing external was attempted
    Skipped(String),
    /// The backend ran and failed
    Failed(String),
}

impl PublishResult {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishResult::Published)
    }

    /// Guidance or captured error text, if any.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            PublishResult::Published => None,
            PublishResult::Skipped(msg) | PublishResult::Failed(msg) => Some(msg),
        }
    }
}

/// Backend that publishes a DKIM TXT value
#[async_trait]
pub trait DnsPublisher: Send + Sync {
    async fn publish(&self, domain: &str, selector: &str, value: &str) -> PublishResult;
}

/// Publishes through the external `cloudflare-dns.sh` collaborator
#[derive(Debug, Clone)]
pub struct ScriptPublisher {
    script: PathBuf,
    credentials: Option<DnsCredentials>,
}

impl ScriptPublisher {
    pub fn new(script: impl Into<PathBuf>, credentials: Option<DnsCredentials>) -> Self {
        Self {
            script: script.into(),
            credentials,
        }
    }

    fn command(&self, credentials: &DnsCredentials) -> Command {
        let mut cmd = Command::new(&self.script);
        match credentials {
            DnsCredentials::ApiToken(token) => {
                cmd.env("CLOUDFLARE_API_TOKEN", token);
            }
            DnsCredentials::ApiKey { key, email } => {
                cmd.env("CLOUDFLARE_API_KEY", key).env("CLOUDFLARE_EMAIL", email);
            }
        }
        cmd
    }
}

#[async_trait]
impl DnsPublisher for ScriptPublisher {
    async fn publish(&self, domain: &str, selector: &str, value: &str) -> PublishResult {
        if !self.script.exists() {
            warn!(script = %self.script.display(), "DNS script not found");
            return PublishResult::Skipped(format!(
                "{} not found",
                self.script.display()
            ));
        }

        let Some(credentials) = &self.credentials else {
            warn!("{}", MISSING_CREDENTIALS);
            return PublishResult::Skipped(MISSING_CREDENTIALS.to_string());
        };

        info!("Adding DKIM record to Cloudflare DNS...");
        debug!(
            script = %self.script.display(),
            credentials = credentials.kind(),
            "Running DNS script"
        );

        let output = match self
            .command(credentials)
            .args([domain, "add-dkim", selector, value])
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!("Failed to run {}: {}", self.script.display(), e);
                return PublishResult::Failed(format!(
                    "failed to run {}: {}",
                    self.script.display(),
                    e
                ));
            }
        };

        if output.status.success() {
            info!("✓ DKIM record added to Cloudflare DNS");
            return PublishResult::Published;
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(status = %output.status, "Error adding to Cloudflare: {}", stderr);

        PublishResult::Failed(if stderr.is_empty() {
            format!("{} exited with {}", self.script.display(), output.status)
        } else {
            stderr
        })
    }
}
