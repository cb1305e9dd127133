use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;

use certificate_mailer::batch::{BatchOrchestrator, BatchRequest, BatchSettings};
use certificate_mailer::certificate::CertificateTemplate;
use certificate_mailer::configuration::{get_configuration, Settings};
use certificate_mailer::dispatch::SmtpConnector;
use certificate_mailer::domain::{parse_delimiter_hint, read_roster, Delimiter, RecipientEmail};
use certificate_mailer::email_message::{EmailTemplate, PREVIEW_NAME};
use certificate_mailer::telemetry::{get_subscriber, init_subscriber};

/// Rows shown by `--dry-run`
const ROSTER_PREVIEW_ROWS: usize = 5;

/// Generates one personalized PDF certificate per roster row, mails it to the
/// recipient and packages every generated certificate into a zip archive.
#[derive(Parser, Debug)]
#[command(name = "certificate-mailer", version, about)]
struct Cli {
    /// Roster file (CSV, TSV or any other delimited text)
    #[arg(long, value_name = "FILE", required_unless_present = "preview")]
    roster: Option<PathBuf>,

    /// PDF template carrying the name form field
    #[arg(long, value_name = "FILE", required_unless_present = "preview")]
    template: Option<PathBuf>,

    /// Email subject, defaults to the configured one
    #[arg(long)]
    subject: Option<String>,

    /// HTML email body
    #[arg(long, value_name = "FILE", required_unless_present = "dry_run")]
    body: Option<PathBuf>,

    /// Roster delimiter: , ; tab | or auto
    #[arg(long, default_value = "auto")]
    delimiter: String,

    /// Directory the archive is written to
    #[arg(long, value_name = "DIR", default_value = ".")]
    output: PathBuf,

    /// Configuration file, without extension
    #[arg(short, long, default_value = "configuration")]
    config: String,

    /// Print the subject and body for a sample recipient and exit
    #[arg(long, conflicts_with = "dry_run")]
    preview: bool,

    /// Validate the roster and the template without sending anything
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = get_subscriber("certificate-mailer".into(), "info".into(), std::io::stdout);
    init_subscriber(subscriber);

    let cli = Cli::parse();
    let configuration = get_configuration(&cli.config).context("Failed to read configuration")?;

    if cli.preview {
        preview(&cli, &configuration)
    } else if cli.dry_run {
        dry_run(&cli, &configuration)
    } else {
        send(&cli, &configuration).await
    }
}

fn preview(cli: &Cli, configuration: &Settings) -> anyhow::Result<()> {
    let template = EmailTemplate {
        subject: subject(cli, configuration),
        html_body: read_text(required(&cli.body, "--body")?)?,
        placeholder: configuration.email.placeholder.clone(),
        text_fallback: configuration.email.text_fallback.clone(),
    };
    let preview = template.preview(PREVIEW_NAME);
    println!("Subject: {}\n\n{}", preview.subject, preview.html_body);
    Ok(())
}

fn dry_run(cli: &Cli, configuration: &Settings) -> anyhow::Result<()> {
    let settings = &configuration.roster;
    let input = read_bytes(required(&cli.roster, "--roster")?)?;
    let roster = read_roster(
        &input,
        delimiter(cli)?.or(settings.delimiter),
        &settings.name_column,
        &settings.email_column,
    )?;
    let template = CertificateTemplate::new(
        read_bytes(required(&cli.template, "--template")?)?,
        &configuration.certificate.field_name,
    )?;

    println!("Delimiter: {}", roster.delimiter);
    println!("Columns: {}", roster.columns.join(", "));
    let fields: Vec<&str> = template.field_names().iter().map(String::as_str).collect();
    println!("Template fields: {}", fields.join(", "));
    for row in roster.preview(ROSTER_PREVIEW_ROWS) {
        println!("{} <{}>", row.name, row.raw_email);
    }
    let invalid = roster
        .rows
        .iter()
        .filter(|row| RecipientEmail::parse(&row.raw_email).is_err())
        .count();
    println!("rows={} invalid={}", roster.len(), invalid);
    Ok(())
}

async fn send(cli: &Cli, configuration: &Settings) -> anyhow::Result<()> {
    configuration.smtp.ensure_complete()?;
    let settings = BatchSettings::from_settings(configuration)?;
    let connector = SmtpConnector::new(configuration.smtp.clone());
    let orchestrator = BatchOrchestrator::new(connector, settings);

    let request = BatchRequest {
        roster: read_bytes(required(&cli.roster, "--roster")?)?,
        delimiter: delimiter(cli)?,
        template: read_bytes(required(&cli.template, "--template")?)?,
        subject: subject(cli, configuration),
        html_body: read_text(required(&cli.body, "--body")?)?,
    };

    let result = orchestrator
        .run(request, |event| {
            tracing::info!(progress = event.fraction, "{}", event.message);
        })
        .await?;

    let archive_path = cli.output.join(&result.archive_name);
    std::fs::create_dir_all(&cli.output)
        .with_context(|| format!("Failed to create {}", cli.output.display()))?;
    std::fs::write(&archive_path, &result.archive)
        .with_context(|| format!("Failed to write {}", archive_path.display()))?;
    tracing::info!(path = %archive_path.display(), "Archive written");

    println!("{}", result.summary());
    Ok(())
}

fn subject(cli: &Cli, configuration: &Settings) -> String {
    cli.subject
        .clone()
        .unwrap_or_else(|| configuration.email.subject.clone())
}

fn delimiter(cli: &Cli) -> anyhow::Result<Option<Delimiter>> {
    parse_delimiter_hint(&cli.delimiter).map_err(anyhow::Error::msg)
}

fn required<'a>(path: &'a Option<PathBuf>, flag: &str) -> anyhow::Result<&'a Path> {
    path.as_deref()
        .with_context(|| format!("{} is required", flag))
}

fn read_bytes(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn read_text(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}
