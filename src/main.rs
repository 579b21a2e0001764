//! Google Workspace DKIM Agent
//!
//! Gets (or generates) the Google Workspace DKIM key for a domain and
//! publishes it to Cloudflare DNS.
//!
//! # Usage
//! ```bash
//! # OAuth via ADC
//! gcloud auth application-default login
//! CLOUDFLARE_API_TOKEN=... google-dkim --domain fedlin.com --selector google
//!
//! # Service account with domain-wide delegation
//! GOOGLE_APPLICATION_CREDENTIALS=./sa.json GOOGLE_ADMIN_EMAIL=admin@fedlin.com google-dkim
//!
//! # Publish through the Cloudflare API instead of cloudflare-dns.sh
//! google-dkim --dns-backend api --output json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use google_dkim::config::{
    default_dns_script, CLOUDFLARE_API, DEFAULT_CUSTOMER_ID, DEFAULT_DOMAIN, DEFAULT_GCP_PROJECT,
    DEFAULT_SELECTOR, DIRECTORY_API,
};
use google_dkim::{
    AdminDirectoryConnector, CloudflareApiPublisher, Config, CredentialResolver, DnsBackend,
    DnsCredentials, DnsPublisher, OutputFormat, ScriptPublisher, Workflow,
};

// ============================================================
// CLI Definition
// ============================================================

#[derive(Parser, Debug)]
#[command(name = "google-dkim")]
#[command(about = "Provision a Google Workspace DKIM key and publish it to Cloudflare DNS", long_about = None)]
#[command(version)]
struct Cli {
    /// Mail domain to provision
    #[arg(long, env = "DOMAIN", default_value = DEFAULT_DOMAIN)]
    domain: String,

    /// DKIM selector
    #[arg(long, env = "DKIM_SELECTOR", default_value = DEFAULT_SELECTOR)]
    selector: String,

    /// Workspace customer ID
    #[arg(long, env = "GOOGLE_CUSTOMER_ID", default_value = DEFAULT_CUSTOMER_ID)]
    customer_id: String,

    /// Admin user to impersonate with service-account credentials
    #[arg(long, env = "GOOGLE_ADMIN_EMAIL")]
    admin_email: Option<String>,

    /// GCP project for ADC (falls back to GOOGLE_CLOUD_PROJECT)
    #[arg(long, env = "GCP_PROJECT")]
    project: Option<String>,

    /// Service-account JSON key, used when ADC is unavailable
    #[arg(long, env = "GOOGLE_APPLICATION_CREDENTIALS")]
    credentials_file: Option<PathBuf>,

    /// Cloudflare API token
    #[arg(long, env = "CLOUDFLARE_API_TOKEN", hide_env_values = true)]
    cloudflare_api_token: Option<String>,

    /// Cloudflare global API key (requires --cloudflare-email)
    #[arg(long, env = "CLOUDFLARE_API_KEY", hide_env_values = true)]
    cloudflare_api_key: Option<String>,

    /// Cloudflare account email
    #[arg(long, env = "CLOUDFLARE_EMAIL")]
    cloudflare_email: Option<String>,

    /// How to publish the TXT record
    #[arg(long, env = "DKIM_DNS_BACKEND", value_enum, default_value = "script")]
    dns_backend: BackendArg,

    /// DNS collaborator script (default: cloudflare-dns.sh next to this binary)
    #[arg(long, env = "DKIM_DNS_SCRIPT")]
    dns_script: Option<PathBuf>,

    /// Admin SDK Directory API base URL
    #[arg(long, env = "GOOGLE_DIRECTORY_URL", default_value = DIRECTORY_API)]
    directory_url: String,

    /// Cloudflare API base URL
    #[arg(long, env = "CLOUDFLARE_API_URL", default_value = CLOUDFLARE_API)]
    cloudflare_url: String,

    /// Stop after retrieving the key and print manual instructions
    #[arg(long)]
    skip_dns: bool,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    output: OutputArg,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    /// Run cloudflare-dns.sh
    Script,
    /// Call the Cloudflare API directly
    Api,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputArg {
    /// Human-readable banners
    Text,
    /// JSON summary
    Json,
}

impl Cli {
    fn into_config(self) -> Config {
        let gcp_project = self
            .project
            .or_else(|| std::env::var("GOOGLE_CLOUD_PROJECT").ok())
            .unwrap_or_else(|| DEFAULT_GCP_PROJECT.to_string());

        Config {
            domain: self.domain,
            selector: self.selector,
            customer_id: self.customer_id,
            admin_email: self.admin_email.filter(|s| !s.is_empty()),
            gcp_project,
            credentials_file: self.credentials_file,
            dns_credentials: DnsCredentials::from_parts(
                self.cloudflare_api_token,
                self.cloudflare_api_key,
                self.cloudflare_email,
            ),
            dns_backend: match self.dns_backend {
                BackendArg::Script => DnsBackend::Script,
                BackendArg::Api => DnsBackend::Api,
            },
            dns_script: self.dns_script.unwrap_or_else(default_dns_script),
            directory_url: self.directory_url,
            cloudflare_url: self.cloudflare_url,
            skip_dns: self.skip_dns,
        }
    }
}

/// `RUST_LOG` directives when set and valid, otherwise INFO (DEBUG with `--verbose`).
fn log_filter(rust_log: Option<&str>, verbose: bool) -> EnvFilter {
    let default_level = if verbose { "debug" } else { "info" };
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_level))
}

// ============================================================
// Main Entry Point
// ============================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Logs go to stderr; banners own stdout
    let rust_log = std::env::var("RUST_LOG").ok();
    let builder = FmtSubscriber::builder()
        .with_env_filter(log_filter(rust_log.as_deref(), cli.verbose))
        .with_target(false)
        .with_writer(std::io::stderr);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }

    let format = match cli.output {
        OutputArg::Text => OutputFormat::Text,
        OutputArg::Json => OutputFormat::Json,
    };
    let config = cli.into_config();

    info!(
        domain = %config.domain,
        selector = %config.selector,
        backend = ?config.dns_backend,
        "🚀 Google DKIM agent starting..."
    );

    let publisher: Box<dyn DnsPublisher> = match config.dns_backend {
        DnsBackend::Script => Box::new(ScriptPublisher::new(
            config.dns_script.clone(),
            config.dns_credentials.clone(),
        )),
        DnsBackend::Api => Box::new(CloudflareApiPublisher::new(
            config.cloudflare_url.clone(),
            config.dns_credentials.clone(),
        )?),
    };

    let connector = AdminDirectoryConnector::new(&config, CredentialResolver::new(&config));

    let outcome = Workflow::new(&config, &connector, publisher.as_ref())
        .output(format)
        .run(&mut std::io::stdout())
        .await;

    info!(?outcome, "Done");
    Ok(ExitCode::from(outcome.exit_code()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    // An empty token flag shadows any CLOUDFLARE_API_TOKEN in the environment
    #[test]
    fn test_flags_build_config() {
        let cli = Cli::try_parse_from([
            "google-dkim",
            "--domain",
            "example.org",
            "--selector",
            "s2026",
            "--project",
            "gcp-lornu-ai",
            "--cloudflare-api-token",
            "",
            "--cloudflare-api-key",
            "key",
            "--cloudflare-email",
            "ops@example.org",
            "--dns-backend",
            "api",
            "--dns-script",
            "/opt/dns/cloudflare-dns.sh",
        ])
        .unwrap();

        let config = cli.into_config();
        assert_eq!(config.domain, "example.org");
        assert_eq!(config.selector, "s2026");
        assert!(config.overrides_project());
        assert_eq!(config.dns_backend, DnsBackend::Api);
        assert_eq!(config.dns_script, PathBuf::from("/opt/dns/cloudflare-dns.sh"));
        assert_eq!(
            config.dns_credentials,
            Some(DnsCredentials::ApiKey {
                key: "key".into(),
                email: "ops@example.org".into()
            })
        );
    }

    #[test]
    fn test_log_filter() {
        assert_eq!(log_filter(None, false).to_string(), "info");
        assert_eq!(log_filter(None, true).to_string(), "debug");
        assert_eq!(log_filter(Some("  "), true).to_string(), "debug");
        assert_eq!(
            log_filter(Some("google_dkim=trace"), false).to_string(),
            "google_dkim=trace"
        );
    }
}
