//! Run configuration
//!
//! Everything the run needs from the environment is captured once, at
//! process start, into an immutable [`Config`]. Components receive it by
//! reference and never read the environment themselves.

use std::path::PathBuf;

/// Project whose selection is left alone (no `gcloud config set project`).
pub const DEFAULT_GCP_PROJECT: &str = "fedlin";
pub const DEFAULT_DOMAIN: &str = "fedlin.com";
pub const DEFAULT_SELECTOR: &str = "google";
pub const DEFAULT_CUSTOMER_ID: &str = "my_customer";
pub const DIRECTORY_API: &str = "https://admin.googleapis.com/admin/directory/v1";
pub const CLOUDFLARE_API: &str = "https://api.cloudflare.com/client/v4";

/// Name of the DNS collaborator script, looked up next to the executable.
pub const DNS_SCRIPT_NAME: &str = "cloudflare-dns.sh";

/// OAuth scope for reading domains and generating DKIM keys.
pub const DIRECTORY_DOMAIN_SCOPE: &str = "https://www.googleapis.com/auth/admin.directory.domain";

/// Cloudflare credentials, presence-checked by the publishers.
#[derive(Clone, PartialEq, Eq)]
pub enum DnsCredentials {
    ApiToken(String),
    ApiKey { key: String, email: String },
}

impl DnsCredentials {
    /// Build from the raw environment values.
    ///
    /// A token wins over a key. A key without the account email is unusable.
    pub fn from_parts(
        token: Option<String>,
        key: Option<String>,
        email: Option<String>,
    ) -> Option<Self> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        if let Some(token) = non_empty(token) {
            return Some(Self::ApiToken(token));
        }

        match (non_empty(key), non_empty(email)) {
            (Some(key), Some(email)) => Some(Self::ApiKey { key, email }),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DnsCredentials::ApiToken(_) => "api-token",
            DnsCredentials::ApiKey { .. } => "api-key",
        }
    }
}

// Never print secrets.
impl std::fmt::Debug for DnsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsCredentials::ApiToken(_) => write!(f, "ApiToken(***)"),
            DnsCredentials::ApiKey { email, .. } => {
                write!(f, "ApiKey {{ key: ***, email: {} }}", email)
            }
        }
    }
}

/// Which DNS backend publishes the TXT record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DnsBackend {
    /// Shell out to the `cloudflare-dns.sh` collaborator
    #[default]
    Script,
    /// Call the Cloudflare v4 API directly
    Api,
}

/// Immutable configuration for one run.
#[derive(Debug, Clone)]
pub struct Config {
    pub domain: String,
    pub selector: String,
    pub customer_id: String,
    /// Subject to impersonate with service-account credentials
    pub admin_email: Option<String>,
    pub gcp_project: String,
    /// Service-account key file, only used when ADC is unavailable
    pub credentials_file: Option<PathBuf>,
    pub dns_credentials: Option<DnsCredentials>,
    pub dns_backend: DnsBackend,
    pub dns_script: PathBuf,
    pub directory_url: String,
    pub cloudflare_url: String,
    pub skip_dns: bool,
}

impl Config {
    /// Configuration with every default applied and no credentials.
    pub fn new(domain: impl Into<String>, selector: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            selector: selector.into(),
            customer_id: DEFAULT_CUSTOMER_ID.to_string(),
            admin_email: None,
            gcp_project: DEFAULT_GCP_PROJECT.to_string(),
            credentials_file: None,
            dns_credentials: None,
            dns_backend: DnsBackend::Script,
            dns_script: default_dns_script(),
            directory_url: DIRECTORY_API.to_string(),
            cloudflare_url: CLOUDFLARE_API.to_string(),
            skip_dns: false,
        }
    }

    /// Whether `gcloud config set project` should be attempted.
    pub fn overrides_project(&self) -> bool {
        !self.gcp_project.is_empty() && self.gcp_project != DEFAULT_GCP_PROJECT
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAIN, DEFAULT_SELECTOR)
    }
}

/// `cloudflare-dns.sh` in the directory holding the running executable,
/// or in the working directory if that cannot be determined.
pub fn default_dns_script() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(DNS_SCRIPT_NAME)))
        .unwrap_or_else(|| PathBuf::from(DNS_SCRIPT_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_wins_over_key() {
        let creds = DnsCredentials::from_parts(
            Some("tok".into()),
            Some("key".into()),
            Some("ops@fedlin.com".into()),
        );
        assert_eq!(creds, Some(DnsCredentials::ApiToken("tok".into())));
    }

    #[test]
    fn test_key_requires_email() {
        assert_eq!(DnsCredentials::from_parts(None, Some("key".into()), None), None);
        assert_eq!(
            DnsCredentials::from_parts(None, Some("key".into()), Some("a@b.c".into())),
            Some(DnsCredentials::ApiKey {
                key: "key".into(),
                email: "a@b.c".into()
            })
        );
    }

    #[test]
    fn test_blank_values_are_absent() {
        assert_eq!(DnsCredentials::from_parts(Some("  ".into()), None, None), None);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let creds = DnsCredentials::ApiToken("super-secret".into());
        assert!(!format!("{:?}", creds).contains("super-secret"));
    }

    #[test]
    fn test_project_override() {
        let mut config = Config::default();
        assert!(!config.overrides_project());

        config.gcp_project = "gcp-lornu-ai".into();
        assert!(config.overrides_project());
    }
}
