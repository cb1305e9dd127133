use std::fmt::{Display, Formatter};
use std::sync::Arc;

use anyhow::Context;
use lettre::message::Mailbox;
use uuid::Uuid;

use crate::archive::ArchivePackager;
use crate::certificate::{CertificateTemplate, GeneratedDocument};
use crate::configuration::{CertificateSettings, EmailSettings, RosterSettings, Settings, SettingsError};
use crate::dispatch::{DispatchOutcome, DispatchSession, MailConnector, MailTransport};
use crate::domain::{read_roster, Delimiter, RecipientEmail, RecipientName, Roster};
use crate::email_message::{EmailTemplate, MessageComposer};
use crate::error::BatchError;
use crate::telemetry::spawn_blocking_with_tracing;

/// Everything the caller supplies for one run.
///
/// Inputs arrive as raw bytes: the roster and the template are only trusted
/// once [`BatchOrchestrator::run`] has parsed and checked them.
pub struct BatchRequest {
    pub roster: Vec<u8>,
    /// Overrides the configured delimiter; `None` defers to configuration, then sniffing
    pub delimiter: Option<Delimiter>,
    pub template: Vec<u8>,
    pub subject: String,
    pub html_body: String,
}

/// Emitted once per roster row, after the row's outcome is known.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Share of rows processed so far, in `[0, 1]`
    pub fraction: f64,
    pub message: String,
}

/// The per-row ledger entry. Every row the roster yields gets exactly one.
#[derive(Debug, Clone)]
pub struct RowReport {
    pub name: RecipientName,
    pub email: String,
    /// Archive entry and attachment name, for rows that reached generation
    pub filename: Option<String>,
    pub outcome: DispatchOutcome,
}

impl RowReport {
    fn status(&self) -> String {
        match &self.outcome {
            DispatchOutcome::Sent => format!("Sent to {}", self.email),
            DispatchOutcome::InvalidAddress(_) => format!("Invalid e-mail: {}", self.email),
            DispatchOutcome::SendFailed(reason) => format!("Failed ({}): {}", self.email, reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub sent: usize,
    pub failed: usize,
}

impl Display for Summary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "sent={} failed={}", self.sent, self.failed)
    }
}

/// Outcome of a batch that got past every precondition.
///
/// `sent() + send_failed() + invalid()` always equals `rows.len()`. The
/// archive holds one entry per row that reached generation, whether or not
/// its email was accepted.
#[derive(Debug)]
pub struct BatchResult {
    pub archive: Vec<u8>,
    pub archive_name: String,
    /// Delimiter the roster was parsed with
    pub delimiter: Delimiter,
    /// Archive entries, in row order
    pub entries: Vec<String>,
    pub rows: Vec<RowReport>,
}

impl BatchResult {
    fn count(&self, matches: impl Fn(&DispatchOutcome) -> bool) -> usize {
        self.rows.iter().filter(|row| matches(&row.outcome)).count()
    }

    pub fn sent(&self) -> usize {
        self.count(|outcome| matches!(outcome, DispatchOutcome::Sent))
    }

    pub fn invalid(&self) -> usize {
        self.count(|outcome| matches!(outcome, DispatchOutcome::InvalidAddress(_)))
    }

    pub fn send_failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, DispatchOutcome::SendFailed(_)))
    }

    /// Invalid addresses and failed sends together
    pub fn failed(&self) -> usize {
        self.invalid() + self.send_failed()
    }

    pub fn summary(&self) -> Summary {
        Summary {
            sent: self.sent(),
            failed: self.failed(),
        }
    }
}

/// The slice of [`Settings`] a batch needs, with the sender already resolved.
///
/// Kept apart from [`Settings`] so the SMTP credentials stay with the
/// connector and never travel through the orchestrator.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub roster: RosterSettings,
    pub certificate: CertificateSettings,
    pub email: EmailSettings,
    pub sender: Mailbox,
}

impl BatchSettings {
    pub fn from_settings(settings: &Settings) -> Result<Self, SettingsError> {
        Ok(Self {
            roster: settings.roster.clone(),
            certificate: settings.certificate.clone(),
            email: settings.email.clone(),
            sender: settings.smtp.sender()?,
        })
    }
}

/// Drives one roster through generation, packaging and dispatch.
pub struct BatchOrchestrator<C: MailConnector> {
    connector: C,
    settings: BatchSettings,
}

impl<C: MailConnector> BatchOrchestrator<C> {
    pub fn new(connector: C, settings: BatchSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    /// Runs the batch, reporting one [`ProgressEvent`] per row in roster order.
    ///
    /// # Implementation Notes
    ///
    /// The roster schema, the template field, a non-blank subject and body,
    /// and SMTP authentication are all checked before any row is processed;
    /// a failure there returns without generating or sending anything.
    ///
    /// Rows are then handled strictly one after another over a single session:
    /// address check, certificate generation, archiving, then the send. An
    /// invalid address or a refused send is recorded and the batch moves on.
    /// Anything else aborts the batch, and the session is closed on that path
    /// too.
    #[tracing::instrument(
        name = "Run certificate batch",
        skip(self, request, on_progress),
        fields(batch_id = %Uuid::new_v4())
    )]
    pub async fn run<F>(
        &self,
        request: BatchRequest,
        on_progress: F,
    ) -> Result<BatchResult, BatchError>
    where
        F: FnMut(ProgressEvent),
    {
        let roster = read_roster(
            &request.roster,
            request.delimiter.or(self.settings.roster.delimiter),
            &self.settings.roster.name_column,
            &self.settings.roster.email_column,
        )?;
        let template = CertificateTemplate::new(
            request.template,
            &self.settings.certificate.field_name,
        )?;
        let email = EmailTemplate {
            subject: request.subject,
            html_body: request.html_body,
            placeholder: self.settings.email.placeholder.clone(),
            text_fallback: self.settings.email.text_fallback.clone(),
        };
        if let Some(part) = email.blank_part() {
            return Err(BatchError::BlankMessage(part));
        }

        self.execute(roster, template, email, on_progress).await
    }

    /// Opens the session and processes every row of an already validated roster.
    async fn execute<F>(
        &self,
        roster: Roster,
        template: CertificateTemplate,
        email: EmailTemplate,
        mut on_progress: F,
    ) -> Result<BatchResult, BatchError>
    where
        F: FnMut(ProgressEvent),
    {
        let template = Arc::new(template);
        let composer = MessageComposer::new(email, self.settings.sender.clone());

        let mut session = DispatchSession::open(&self.connector).await?;
        let processed = self
            .process_rows(&roster, &template, &composer, &mut session, &mut on_progress)
            .await;
        // Released on every path, including a fatal row error
        session.close().await;
        let (packager, rows) = processed?;

        let entries = packager.entries().to_vec();
        let result = BatchResult {
            archive: packager.finish()?,
            archive_name: self.settings.certificate.archive_name.clone(),
            delimiter: roster.delimiter,
            entries,
            rows,
        };
        tracing::info!(
            sent = result.sent(),
            invalid = result.invalid(),
            send_failed = result.send_failed(),
            "Batch finished"
        );
        Ok(result)
    }

    async fn process_rows<T, F>(
        &self,
        roster: &Roster,
        template: &Arc<CertificateTemplate>,
        composer: &MessageComposer,
        session: &mut DispatchSession<T>,
        on_progress: &mut F,
    ) -> Result<(ArchivePackager, Vec<RowReport>), BatchError>
    where
        T: MailTransport,
        F: FnMut(ProgressEvent),
    {
        let total = roster.len();
        let mut packager = ArchivePackager::new();
        let mut reports = Vec::with_capacity(total);

        for (index, row) in roster.rows.iter().enumerate() {
            let report = match RecipientEmail::parse(&row.raw_email) {
                Err(reason) => {
                    tracing::warn!(
                        recipient = %row.name,
                        %reason,
                        "Skipping a recipient with an invalid address"
                    );
                    RowReport {
                        name: row.name.clone(),
                        email: row.raw_email.clone(),
                        filename: None,
                        outcome: DispatchOutcome::InvalidAddress(reason),
                    }
                }
                Ok(email) => {
                    let filename = packager.claim_filename(
                        &row.name.certificate_filename(&self.settings.certificate.filename_prefix),
                    );
                    let document = GeneratedDocument {
                        filename: filename.clone(),
                        bytes: generate(template, &row.name).await?,
                    };
                    packager.add(&document)?;

                    let message = composer.compose(&row.name, &email, document).to_message()?;
                    RowReport {
                        name: row.name.clone(),
                        email: email.to_string(),
                        filename: Some(filename),
                        outcome: session.send(&message).await,
                    }
                }
            };

            on_progress(ProgressEvent {
                fraction: (index + 1) as f64 / total as f64,
                message: report.status(),
            });
            reports.push(report);
        }

        Ok((packager, reports))
    }
}

/// Personalization is CPU-bound, so it runs on the blocking pool.
async fn generate(
    template: &Arc<CertificateTemplate>,
    name: &RecipientName,
) -> Result<Vec<u8>, BatchError> {
    let template = Arc::clone(template);
    let owned_name = name.clone();
    spawn_blocking_with_tracing(move || template.personalize(&owned_name))
        .await
        .context("Certificate generation task failed to complete")?
        .map_err(|source| BatchError::DocumentGeneration {
            recipient: name.to_string(),
            source,
        })
}
