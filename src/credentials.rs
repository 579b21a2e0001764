//! Google Credential Resolution
//!
//! Picks the authentication mode for the Admin SDK Directory API:
//! - Application Default Credentials (ADC), e.g. from
//!   `gcloud auth application-default login`
//! - A service-account key file (`GOOGLE_APPLICATION_CREDENTIALS`), with
//!   optional domain-wide-delegation impersonation of an admin user
//!
//! The mode is resolved once per run. Downstream code only sees the
//! [`AccessTokenSource`] capability.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use gcloud_sdk::{GoogleAuthTokenGenerator, TokenSourceType};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, DIRECTORY_DOMAIN_SCOPE};
use crate::types::CredentialError;

const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(3600);
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Something that can authorize a directory request.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// Value for the `Authorization` header, e.g. `Bearer ya29...`
    async fn authorization(&self) -> Result<String, CredentialError>;
}

/// Loader for ambient (application-default) credentials.
#[async_trait]
pub trait AmbientCredentials: Send + Sync {
    async fn load(&self, scopes: &[String]) -> Result<Box<dyn AccessTokenSource>, CredentialError>;
}

/// The credential chosen for this run
pub enum Credential {
    /// ADC, already bound to an authenticated user; never impersonates
    Ambient(Box<dyn AccessTokenSource>),
    /// Static service-account key, optionally impersonating a subject
    ServiceAccount(ServiceAccountCredential),
}

impl Credential {
    pub fn mode(&self) -> &'static str {
        match self {
            Credential::Ambient(_) => "application-default",
            Credential::ServiceAccount(_) => "service-account",
        }
    }

    /// Impersonated subject, if any.
    pub fn subject(&self) -> Option<&str> {
        match self {
            Credential::Ambient(_) => None,
            Credential::ServiceAccount(sa) => sa.subject.as_deref(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("mode", &self.mode())
            .field("subject", &self.subject())
            .finish()
    }
}

#[async_trait]
impl AccessTokenSource for Credential {
    async fn authorization(&self) -> Result<String, CredentialError> {
        match self {
            Credential::Ambient(source) => source.authorization().await,
            Credential::ServiceAccount(sa) => sa.authorization().await,
        }
    }
}

// ============================================================
// Token Cache
// ============================================================

struct CachedToken {
    header: String,
    expires_at: Instant,
}

/// Holds the last minted `Authorization` value until shortly before it expires
#[derive(Default)]
struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    async fn get_or_mint<F, Fut>(&self, mint: F) -> Result<String, CredentialError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, Duration), CredentialError>>,
    {
        let mut slot = self.slot.lock().await;

        if let Some(cached) = slot.as_ref() {
            if Instant::now() + EXPIRY_MARGIN < cached.expires_at {
                return Ok(cached.header.clone());
            }
        }

        let (header, lifetime) = mint().await?;
        *slot = Some(CachedToken {
            header: header.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(header)
    }
}

// ============================================================
// Application Default Credentials
// ============================================================

/// ADC through the gcloud-sdk token generator
pub struct ApplicationDefault;

struct AdcTokenSource {
    generator: GoogleAuthTokenGenerator,
    cache: TokenCache,
}

impl AdcTokenSource {
    async fn mint(&self) -> Result<(String, Duration), CredentialError> {
        let token = self
            .generator
            .create_token()
            .await
            .map_err(|e| CredentialError::TokenExchange(e.to_string()))?;

        Ok((token.header_value(), DEFAULT_TOKEN_LIFETIME))
    }
}

#[async_trait]
impl AccessTokenSource for AdcTokenSource {
    async fn authorization(&self) -> Result<String, CredentialError> {
        self.cache.get_or_mint(|| self.mint()).await
    }
}

#[async_trait]
impl AmbientCredentials for ApplicationDefault {
    async fn load(&self, scopes: &[String]) -> Result<Box<dyn AccessTokenSource>, CredentialError> {
        debug!("Looking up application-default credentials");

        let generator = GoogleAuthTokenGenerator::new(TokenSourceType::Default, scopes.to_vec())
            .await
            .map_err(|e| CredentialError::TokenExchange(e.to_string()))?;

        // Mint one token now so a stale or missing ADC falls back immediately
        let source = AdcTokenSource {
            generator,
            cache: TokenCache::default(),
        };
        source.authorization().await?;

        Ok(Box::new(source))
    }
}

// ============================================================
// Service Account Credentials
// ============================================================

/// The fields of a service-account JSON key that matter here
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

/// JWT-bearer assertion claims
#[derive(Debug, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub iss: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub scope: String,
    pub aud: String,
    pub iat: u64,
    pub exp: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Service-account credential minting tokens with the JWT-bearer grant
pub struct ServiceAccountCredential {
    key: ServiceAccountKey,
    subject: Option<String>,
    scopes: Vec<String>,
    http: reqwest::Client,
    cache: TokenCache,
}

impl ServiceAccountCredential {
    pub fn new(key: ServiceAccountKey, scopes: Vec<String>) -> Self {
        Self {
            key,
            subject: None,
            scopes,
            http: reqwest::Client::new(),
            cache: TokenCache::default(),
        }
    }

    /// Load a JSON key file.
    pub fn from_file(path: &Path, scopes: Vec<String>) -> Result<Self, CredentialError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CredentialError::InvalidKeyFile(format!("{}: {}", path.display(), e))
        })?;

        let key: ServiceAccountKey = serde_json::from_str(&raw)
            .map_err(|e| CredentialError::InvalidKeyFile(format!("{}: {}", path.display(), e)))?;

        debug!(client_email = %key.client_email, "Loaded service account key");

        Ok(Self::new(key, scopes))
    }

    /// Impersonate `subject` through domain-wide delegation.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    /// Sign the assertion presented to the token endpoint.
    pub fn assertion(&self, now: u64) -> Result<String, CredentialError> {
        let claims = AssertionClaims {
            iss: self.key.client_email.clone(),
            sub: self.subject.clone(),
            scope: self.scopes.join(" "),
            aud: self.key.token_uri.clone(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        let encoding_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| CredentialError::InvalidKeyFile(format!("private_key: {}", e)))?;

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();

        encode(&header, &claims, &encoding_key)
            .map_err(|e| CredentialError::TokenExchange(format!("Failed to sign assertion: {}", e)))
    }

    /// Exchange a fresh assertion for an access token.
    async fn mint(&self) -> Result<(String, Duration), CredentialError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| CredentialError::TokenExchange(e.to_string()))?
            .as_secs();

        let assertion = self.assertion(now)?;

        debug!(
            client_email = %self.key.client_email,
            subject = ?self.subject,
            "Exchanging service account assertion"
        );

        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| CredentialError::TokenExchange(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::TokenExchange(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::TokenExchange(e.to_string()))?;

        let header = format!(
            "{} {}",
            token.token_type.as_deref().unwrap_or("Bearer"),
            token.access_token
        );
        let lifetime = token
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME);

        Ok((header, lifetime))
    }
}

#[async_trait]
impl AccessTokenSource for ServiceAccountCredential {
    async fn authorization(&self) -> Result<String, CredentialError> {
        self.cache.get_or_mint(|| self.mint()).await
    }
}

// ============================================================
// Resolver
// ============================================================

/// Resolves the one credential used for this run
pub struct CredentialResolver<'a> {
    config: &'a Config,
    ambient: Box<dyn AmbientCredentials>,
    gcloud: PathBuf,
}

impl<'a> CredentialResolver<'a> {
    /// Resolver backed by real application-default credentials.
    pub fn new(config: &'a Config) -> Self {
        Self::with_ambient(config, Box::new(ApplicationDefault))
    }

    pub fn with_ambient(config: &'a Config, ambient: Box<dyn AmbientCredentials>) -> Self {
        Self {
            config,
            ambient,
            gcloud: PathBuf::from("gcloud"),
        }
    }

    /// Use another `gcloud` executable for the project side effect.
    pub fn with_gcloud(mut self, gcloud: impl Into<PathBuf>) -> Self {
        self.gcloud = gcloud.into();
        self
    }

    pub fn scopes() -> Vec<String> {
        vec![DIRECTORY_DOMAIN_SCOPE.to_string()]
    }

    /// ADC first, then the service-account key file.
    pub async fn resolve(&self) -> Result<Credential, CredentialError> {
        if self.config.overrides_project() {
            set_active_project(&self.gcloud, &self.config.gcp_project).await;
        }

        let scopes = Self::scopes();

        let ambient_error = match self.ambient.load(&scopes).await {
            Ok(source) => {
                info!("✓ Using application-default credentials");
                return Ok(Credential::Ambient(source));
            }
            Err(e) => {
                warn!("Application-default credentials not available: {}", e);
                info!("Trying service account fallback...");
                e
            }
        };

        let Some(path) = self.config.credentials_file.as_deref() else {
            return Err(CredentialError::NotConfigured {
                reason: ambient_error.to_string(),
            });
        };

        if !path.exists() {
            return Err(CredentialError::KeyFileNotFound(path.to_path_buf()));
        }

        let mut credential = ServiceAccountCredential::from_file(path, scopes)?;

        if let Some(subject) = self.config.admin_email.as_deref().filter(|s| !s.is_empty()) {
            info!(subject = %subject, "Delegating service account to admin user");
            credential = credential.with_subject(subject);
        }

        info!(
            client_email = %credential.client_email(),
            "✓ Using service account credentials"
        );

        Ok(Credential::ServiceAccount(credential))
    }
}

/// Best-effort `gcloud config set project <project>`.
///
/// Only influences project inference for ADC; failures are ignored.
pub async fn set_active_project(gcloud: &Path, project: &str) {
    debug!(project = %project, "Setting active gcloud project");

    match Command::new(gcloud)
        .args(["config", "set", "project", project])
        .output()
        .await
    {
        Ok(output) if output.status.success() => debug!("Active gcloud project updated"),
        Ok(output) => debug!(status = %output.status, "gcloud config set project failed"),
        Err(e) => debug!("gcloud not available: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use jsonwebtoken::{decode, DecodingKey, Validation};
    use std::path::PathBuf;

    const PRIVATE_KEY: &str = include_str!("../tests/fixtures/service_account.pem");
    const PUBLIC_KEY: &str = include_str!("../tests/fixtures/service_account.pub.pem");

    struct StaticToken(&'static str);

    #[async_trait]
    impl AccessTokenSource for StaticToken {
        async fn authorization(&self) -> Result<String, CredentialError> {
            Ok(format!("Bearer {}", self.0))
        }
    }

    struct FakeAmbient {
        available: bool,
    }

    #[async_trait]
    impl AmbientCredentials for FakeAmbient {
        async fn load(
            &self,
            _scopes: &[String],
        ) -> Result<Box<dyn AccessTokenSource>, CredentialError> {
            if self.available {
                Ok(Box::new(StaticToken("adc-token")))
            } else {
                Err(CredentialError::TokenExchange("could not find default credentials".into()))
            }
        }
    }

    fn write_key_file(dir: &tempfile::TempDir, token_uri: &str) -> PathBuf {
        let path = dir.path().join("sa.json");
        let key = serde_json::json!({
            "type": "service_account",
            "client_email": "dkim@fedlin.iam.gserviceaccount.com",
            "private_key_id": "key-1",
            "private_key": PRIVATE_KEY,
            "token_uri": token_uri,
        });
        std::fs::write(&path, key.to_string()).unwrap();
        path
    }

    fn resolver(config: &Config, available: bool) -> CredentialResolver<'_> {
        CredentialResolver::with_ambient(config, Box::new(FakeAmbient { available }))
    }

    #[tokio::test]
    async fn test_ambient_credentials_are_preferred() {
        let mut config = Config::default();
        config.admin_email = Some("admin@fedlin.com".into());

        let credential = resolver(&config, true).resolve().await.unwrap();

        assert_eq!(credential.mode(), "application-default");
        assert_eq!(credential.subject(), None);
        assert_eq!(credential.authorization().await.unwrap(), "Bearer adc-token");
    }

    #[tokio::test]
    async fn test_no_ambient_and_no_key_file() {
        let config = Config::default();

        let err = resolver(&config, false).resolve().await.unwrap_err();

        assert!(matches!(err, CredentialError::NotConfigured { .. }));
        let msg = err.to_string();
        assert!(msg.contains("gcloud auth application-default login"));
        assert!(msg.contains("GOOGLE_APPLICATION_CREDENTIALS"));
    }

    #[tokio::test]
    async fn test_missing_key_file() {
        let mut config = Config::default();
        config.credentials_file = Some(PathBuf::from("/nonexistent/sa.json"));

        let err = resolver(&config, false).resolve().await.unwrap_err();
        assert!(matches!(err, CredentialError::KeyFileNotFound(_)));

        let msg = err.to_string();
        assert!(msg.contains("/nonexistent/sa.json"));
        assert!(msg.contains("gcloud auth application-default login"));
        assert!(msg.contains("GOOGLE_APPLICATION_CREDENTIALS"));
    }

    #[tokio::test]
    async fn test_project_override_without_gcloud() {
        let mut config = Config::default();
        config.gcp_project = "gcp-lornu-ai".into();
        assert!(config.overrides_project());

        let credential = resolver(&config, true)
            .with_gcloud("/nonexistent/bin/gcloud")
            .resolve()
            .await
            .unwrap();

        assert_eq!(credential.mode(), "application-default");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_project_override_runs_gcloud() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args");
        let gcloud = dir.path().join("gcloud");
        std::fs::write(
            &gcloud,
            format!("#!/bin/sh\necho \"$@\" > {}\nexit 1\n", args_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&gcloud, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = Config::default();
        config.gcp_project = "gcp-lornu-ai".into();

        // A failing gcloud does not stop resolution
        let credential = resolver(&config, true)
            .with_gcloud(&gcloud)
            .resolve()
            .await
            .unwrap();

        assert_eq!(credential.mode(), "application-default");
        assert_eq!(
            std::fs::read_to_string(&args_file).unwrap().trim(),
            "config set project gcp-lornu-ai"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_default_project_skips_gcloud() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("called");
        let gcloud = dir.path().join("gcloud");
        std::fs::write(&gcloud, format!("#!/bin/sh\ntouch {}\n", marker.display())).unwrap();
        std::fs::set_permissions(&gcloud, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = Config::default();
        resolver(&config, true)
            .with_gcloud(&gcloud)
            .resolve()
            .await
            .unwrap();

        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_malformed_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sa.json");
        std::fs::write(&path, "{ not json").unwrap();

        let mut config = Config::default();
        config.credentials_file = Some(path);

        let err = resolver(&config, false).resolve().await.unwrap_err();
        assert!(matches!(err, CredentialError::InvalidKeyFile(_)));
    }

    #[tokio::test]
    async fn test_service_account_with_impersonation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.credentials_file = Some(write_key_file(&dir, GOOGLE_TOKEN_URI));
        config.admin_email = Some("admin@fedlin.com".into());

        let credential = resolver(&config, false).resolve().await.unwrap();

        assert_eq!(credential.mode(), "service-account");
        assert_eq!(credential.subject(), Some("admin@fedlin.com"));
    }

    #[tokio::test]
    async fn test_empty_admin_email_is_not_a_subject() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.credentials_file = Some(write_key_file(&dir, GOOGLE_TOKEN_URI));
        config.admin_email = Some(String::new());

        let credential = resolver(&config, false).resolve().await.unwrap();
        assert_eq!(credential.subject(), None);
    }

    #[test]
    fn test_assertion_claims() {
        let key: ServiceAccountKey = serde_json::from_value(serde_json::json!({
            "client_email": "dkim@fedlin.iam.gserviceaccount.com",
            "private_key": PRIVATE_KEY,
        }))
        .unwrap();
        assert_eq!(key.token_uri, GOOGLE_TOKEN_URI);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();

        let credential = ServiceAccountCredential::new(key, CredentialResolver::scopes())
            .with_subject("admin@fedlin.com");
        let jwt = credential.assertion(now).unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[GOOGLE_TOKEN_URI]);
        let decoded = decode::<AssertionClaims>(
            &jwt,
            &DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap(),
            &validation,
        )
        .unwrap();

        assert_eq!(decoded.claims.iss, "dkim@fedlin.iam.gserviceaccount.com");
        assert_eq!(decoded.claims.sub.as_deref(), Some("admin@fedlin.com"));
        assert_eq!(decoded.claims.scope, DIRECTORY_DOMAIN_SCOPE);
        assert_eq!(decoded.claims.exp - decoded.claims.iat, ASSERTION_LIFETIME_SECS);
    }

    #[tokio::test]
    async fn test_token_exchange() {
        let server = MockServer::start_async().await;
        let token = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer");
                then.status(200).json_body(serde_json::json!({
                    "access_token": "ya29.service",
                    "token_type": "Bearer",
                    "expires_in": 3600
                }));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_key_file(&dir, &server.url("/token"));
        let credential =
            ServiceAccountCredential::from_file(&path, CredentialResolver::scopes()).unwrap();

        assert_eq!(credential.authorization().await.unwrap(), "Bearer ya29.service");
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_token_is_reused_until_expiry() {
        let server = MockServer::start_async().await;
        let token = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200).json_body(serde_json::json!({
                    "access_token": "ya29.service",
                    "token_type": "Bearer",
                    "expires_in": 3600
                }));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_key_file(&dir, &server.url("/token"));
        let credential =
            ServiceAccountCredential::from_file(&path, CredentialResolver::scopes()).unwrap();

        for _ in 0..3 {
            assert_eq!(credential.authorization().await.unwrap(), "Bearer ya29.service");
        }
        token.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_short_lived_token_is_refreshed() {
        let server = MockServer::start_async().await;
        let token = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200).json_body(serde_json::json!({
                    "access_token": "ya29.short",
                    "expires_in": 30
                }));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_key_file(&dir, &server.url("/token"));
        let credential =
            ServiceAccountCredential::from_file(&path, CredentialResolver::scopes()).unwrap();

        credential.authorization().await.unwrap();
        credential.authorization().await.unwrap();
        token.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn test_token_exchange_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(401)
                    .json_body(serde_json::json!({ "error": "unauthorized_client" }));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = write_key_file(&dir, &server.url("/token"));
        let credential = ServiceAccountCredential::from_file(&path, CredentialResolver::scopes())
            .unwrap()
            .with_subject("admin@fedlin.com");

        let err = credential.authorization().await.unwrap_err();
        assert!(err.to_string().contains("unauthorized_client"));
    }
}
