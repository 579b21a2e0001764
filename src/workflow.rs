//! DKIM Provisioning Workflow
//!
//! Sequences authentication, key acquisition and DNS publishing, prints
//! operator guidance, and decides the exit status. The run is linear:
//!
//! `Start → Authenticating → KeyResolved | FailedKey → Publishing →
//! Published | FailedPublish → Done`

use std::io::{self, Write};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DNS_SCRIPT_NAME};
use crate::directory::{DirectoryConnector, KeyProvider};
use crate::dns::{DnsPublisher, PublishResult};
use crate::types::{DirectoryError, DkimTxtRecord};

const RULE_WIDTH: usize = 50;
const KEY_PREVIEW: usize = 50;
const RECORD_PREVIEW: usize = 100;

/// Workflow state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Start,
    Authenticating,
    KeyResolved,
    FailedKey,
    Publishing,
    Published,
    FailedPublish,
    Done,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Key obtained and the TXT record published
    Published,
    /// Key obtained; the operator has to publish the record by hand
    ManualPublishRequired,
    /// No key could be read or generated
    KeyUnavailable,
    /// No usable Google credentials
    CredentialsUnavailable,
}

impl Outcome {
    pub fn exit_code(self) -> u8 {
        match self {
            Outcome::Published | Outcome::ManualPublishRequired => 0,
            Outcome::KeyUnavailable | Outcome::CredentialsUnavailable => 1,
        }
    }
}

/// Console rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Status banners
    #[default]
    Text,
    /// One JSON summary
    Json,
}

/// Machine-readable run summary for `--output json`
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub domain: String,
    pub selector: String,
    pub record_name: String,
    pub txt_record: Option<String>,
    pub published: bool,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One provisioning run
pub struct Workflow<'a> {
    config: &'a Config,
    connector: &'a dyn DirectoryConnector,
    publisher: &'a dyn DnsPublisher,
    format: OutputFormat,
}

impl<'a> Workflow<'a> {
    pub fn new(
        config: &'a Config,
        connector: &'a dyn DirectoryConnector,
        publisher: &'a dyn DnsPublisher,
    ) -> Self {
        Self {
            config,
            connector,
            publisher,
            format: OutputFormat::Text,
        }
    }

    pub fn output(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    fn text(&self) -> bool {
        self.format == OutputFormat::Text
    }

    fn summary(
        &self,
        txt: Option<&DkimTxtRecord>,
        outcome: Outcome,
        detail: Option<String>,
    ) -> RunSummary {
        RunSummary {
            domain: self.config.domain.clone(),
            selector: self.config.selector.clone(),
            record_name: DkimTxtRecord::name(&self.config.selector, &self.config.domain),
            txt_record: txt.map(ToString::to_string),
            published: outcome == Outcome::Published,
            outcome,
            detail,
        }
    }

    /// Run the workflow, writing operator output to `out`.
    ///
    /// Output failures (a closed stdout, say) are logged and never change
    /// the outcome.
    pub async fn run<W: Write>(&self, out: &mut W) -> Outcome {
        let summary = self.provision(out).await;

        transition(Stage::Done);
        if !self.text() {
            emit(write_summary(out, &summary));
        }
        summary.outcome
    }

    async fn provision<W: Write>(&self, out: &mut W) -> RunSummary {
        let domain = self.config.domain.as_str();
        let selector = self.config.selector.as_str();

        transition(Stage::Start);
        if self.text() {
            emit(write_header(out, domain));
        }

        transition(Stage::Authenticating);
        let directory = match self.connector.connect().await {
            Ok(directory) => directory,
            Err(e) => {
                let outcome = match e {
                    DirectoryError::Auth(_) => {
                        error!("Credential resolution failed: {}", e);
                        Outcome::CredentialsUnavailable
                    }
                    _ => {
                        error!("Could not reach the directory service: {}", e);
                        Outcome::KeyUnavailable
                    }
                };
                if self.text() {
                    emit(writeln!(out, "Error: {}", e));
                }
                return self.summary(None, outcome, Some(e.to_string()));
            }
        };

        let public_key = KeyProvider::new(directory.as_ref(), &self.config.customer_id)
            .get_or_generate(domain, selector)
            .await;

        let Some(public_key) = public_key else {
            transition(Stage::FailedKey);
            error!("Could not get or generate DKIM key");
            if self.text() {
                emit(writeln!(out, "Failed to get or generate DKIM key"));
            }
            return self.summary(
                None,
                Outcome::KeyUnavailable,
                Some("Failed to get or generate DKIM key".to_string()),
            );
        };

        transition(Stage::KeyResolved);
        let txt = DkimTxtRecord::new(public_key);
        if self.text() {
            emit(self.write_key_banner(out, &txt));
        }

        let result = if self.config.skip_dns {
            info!("Skipping DNS publishing");
            PublishResult::Skipped("DNS publishing disabled".to_string())
        } else {
            transition(Stage::Publishing);
            self.publisher
                .publish(domain, selector, &txt.to_string())
                .await
        };

        match result {
            PublishResult::Published => {
                transition(Stage::Published);
                if self.text() {
                    emit(self.write_success(out));
                }
                self.summary(Some(&txt), Outcome::Published, None)
            }
            other => {
                transition(Stage::FailedPublish);
                let detail = other.diagnostic().map(str::to_string);
                warn!("DKIM record not published: {}", detail.as_deref().unwrap_or("unknown"));
                if self.text() {
                    emit(self.write_manual(out, &txt, detail.as_deref()));
                }
                self.summary(Some(&txt), Outcome::ManualPublishRequired, detail)
            }
        }
    }

    fn write_key_banner<W: Write>(&self, out: &mut W, txt: &DkimTxtRecord) -> io::Result<()> {
        writeln!(out)?;
        write_rule(out)?;
        writeln!(out, "DKIM Key Retrieved")?;
        write_rule(out)?;
        writeln!(out, "Selector: {}", self.config.selector)?;
        writeln!(
            out,
            "Public Key (first {} chars): {}",
            KEY_PREVIEW,
            preview(txt.public_key(), KEY_PREVIEW)
        )?;
        writeln!(out)?;
        writeln!(out, "DKIM TXT Record:")?;
        writeln!(out, "{}", preview(&txt.to_string(), RECORD_PREVIEW))?;
        writeln!(out)?;
        Ok(())
    }

    fn write_success<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out)?;
        write_rule(out)?;
        writeln!(out, "Success!")?;
        write_rule(out)?;
        writeln!(out, "Next steps:")?;
        writeln!(out, "1. Wait 5-15 minutes for DNS propagation")?;
        writeln!(out, "2. Verify: ./verify-email-auth.sh {}", self.config.domain)?;
        writeln!(out, "3. In Google Admin Console, enable DKIM authentication")?;
        Ok(())
    }

    fn write_manual<W: Write>(
        &self,
        out: &mut W,
        txt: &DkimTxtRecord,
        detail: Option<&str>,
    ) -> io::Result<()> {
        let domain = &self.config.domain;
        let selector = &self.config.selector;

        writeln!(out)?;
        write_rule(out)?;
        writeln!(out, "DKIM Key Retrieved (not added to Cloudflare)")?;
        write_rule(out)?;
        if let Some(detail) = detail {
            writeln!(out, "Reason: {}", detail)?;
        }
        writeln!(out, "To add manually:")?;
        writeln!(out, "Selector: {}", selector)?;
        writeln!(out, "Record name: {}", DkimTxtRecord::name(selector, domain))?;
        writeln!(out, "TXT Record: {}", txt)?;
        writeln!(out)?;
        writeln!(out, "Or set Cloudflare credentials and run:")?;
        writeln!(out, "  {}", manual_command(domain, selector, txt))?;
        Ok(())
    }
}

/// The exact collaborator invocation an operator can run by hand.
pub fn manual_command(domain: &str, selector: &str, txt: &DkimTxtRecord) -> String {
    format!("./{} {} add-dkim {} '{}'", DNS_SCRIPT_NAME, domain, selector, txt)
}

fn transition(stage: Stage) {
    debug!(?stage, "Workflow stage");
}

fn emit(result: io::Result<()>) {
    if let Err(e) = result {
        warn!("Failed to write output: {}", e);
    }
}

fn write_rule<W: Write>(out: &mut W) -> io::Result<()> {
    writeln!(out, "{}", "=".repeat(RULE_WIDTH))
}

fn write_header<W: Write>(out: &mut W, domain: &str) -> io::Result<()> {
    write_rule(out)?;
    writeln!(out, "Google Workspace DKIM via Admin API")?;
    writeln!(out, "Domain: {}", domain)?;
    write_rule(out)?;
    writeln!(out)
}

fn write_summary<W: Write>(out: &mut W, summary: &RunSummary) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, summary)?;
    writeln!(out)
}

/// First `max` characters followed by an ellipsis.
fn preview(s: &str, max: usize) -> String {
    format!("{}...", s.chars().take(max).collect::<String>())
}
