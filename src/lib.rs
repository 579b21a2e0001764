//! Google Workspace DKIM Provisioning
//!
//! Obtains (or generates) a DKIM key for a domain through the Admin SDK
//! Directory API and publishes it as a TXT record on Cloudflare DNS.

pub mod cloudflare;
pub mod config;
pub mod credentials;
pub mod directory;
pub mod dns;
pub mod types;
pub mod workflow;

pub use cloudflare::CloudflareApiPublisher;
pub use config::{Config, DnsBackend, DnsCredentials};
pub use credentials::{Credential, CredentialResolver};
pub use directory::{AdminDirectoryClient, AdminDirectoryConnector, KeyProvider};
pub use dns::{DnsPublisher, PublishResult, ScriptPublisher};
pub use types::{CredentialError, DirectoryError, DkimTxtRecord};
pub use workflow::{Outcome, OutputFormat, Workflow};
