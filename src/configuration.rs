use std::time::Duration;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::Address;
use secrecy::{ExposeSecret, Secret};
use serde_aux::field_attributes::deserialize_number_from_string;

use crate::domain::Delimiter;

#[derive(serde::Deserialize, Clone, Debug)]
pub struct Settings {
    #[serde(default)]
    pub smtp: SmtpSettings,
    #[serde(default)]
    pub roster: RosterSettings,
    #[serde(default)]
    pub certificate: CertificateSettings,
    #[serde(default)]
    pub email: EmailSettings,
}

/// Connection parameters for the outgoing mail server.
///
/// The password is wrapped in [`Secret`] so it never ends up in a `Debug`
/// print or a tracing span by accident. Access goes through
/// [`ExposeSecret::expose_secret`].
#[derive(serde::Deserialize, Clone, Debug)]
pub struct SmtpSettings {
    #[serde(default)]
    pub host: String,
    // Environment variables are always strings, hence the custom deserializer
    #[serde(default, deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default = "empty_secret")]
    pub password: Secret<String>,
    #[serde(default)]
    pub from_name: String,
    #[serde(default)]
    pub from_address: String,
    #[serde(default = "default_require_tls")]
    pub require_tls: bool,
    #[serde(
        default = "default_timeout_milliseconds",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub timeout_milliseconds: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum SettingsError {
    #[error("SMTP settings are missing or incomplete: {}", .0.join(", "))]
    IncompleteSmtp(Vec<&'static str>),
    #[error("{0} is not a valid sender address")]
    InvalidSender(String),
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            username: String::new(),
            password: empty_secret(),
            from_name: String::new(),
            from_address: String::new(),
            require_tls: default_require_tls(),
            timeout_milliseconds: default_timeout_milliseconds(),
        }
    }
}

impl SmtpSettings {
    /// Fails with the list of every required field that is blank.
    pub fn ensure_complete(&self) -> Result<(), SettingsError> {
        let mut missing = Vec::new();
        if self.host.trim().is_empty() {
            missing.push("host");
        }
        if self.port == 0 {
            missing.push("port");
        }
        if self.username.trim().is_empty() {
            missing.push("username");
        }
        if self.password.expose_secret().is_empty() {
            missing.push("password");
        }
        if self.sender_address().is_empty() {
            missing.push("from_address");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::IncompleteSmtp(missing))
        }
    }

    /// The sender falls back to the login name when no explicit address is configured
    fn sender_address(&self) -> &str {
        match self.from_address.trim() {
            "" => self.username.trim(),
            address => address,
        }
    }

    pub fn sender(&self) -> Result<Mailbox, SettingsError> {
        let address = self.sender_address();
        let address: Address = address
            .parse()
            .map_err(|_| SettingsError::InvalidSender(address.to_owned()))?;
        let name = match self.from_name.trim() {
            "" => None,
            name => Some(name.to_owned()),
        };
        Ok(Mailbox::new(name, address))
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(
            self.username.clone(),
            self.password.expose_secret().to_owned(),
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_milliseconds)
    }
}

#[derive(serde::Deserialize, Clone, Debug)]
pub struct RosterSettings {
    #[serde(default = "default_name_column")]
    pub name_column: String,
    #[serde(default = "default_email_column")]
    pub email_column: String,
    /// `None` (or `"auto"`) means the delimiter is sniffed from the input
    #[serde(default, deserialize_with = "crate::domain::roster::deserialize_delimiter_hint")]
    pub delimiter: Option<Delimiter>,
}

impl Default for RosterSettings {
    fn default() -> Self {
        Self {
            name_column: default_name_column(),
            email_column: default_email_column(),
            delimiter: None,
        }
    }
}

#[derive(serde::Deserialize, Clone, Debug)]
pub struct CertificateSettings {
    #[serde(default = "default_field_name")]
    pub field_name: String,
    #[serde(default = "default_filename_prefix")]
    pub filename_prefix: String,
    #[serde(default = "default_archive_name")]
    pub archive_name: String,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            field_name: default_field_name(),
            filename_prefix: default_filename_prefix(),
            archive_name: default_archive_name(),
        }
    }
}

#[derive(serde::Deserialize, Clone, Debug)]
pub struct EmailSettings {
    #[serde(default = "default_placeholder")]
    pub placeholder: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_text_fallback")]
    pub text_fallback: String,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            placeholder: default_placeholder(),
            subject: default_subject(),
            text_fallback: default_text_fallback(),
        }
    }
}

fn empty_secret() -> Secret<String> {
    Secret::new(String::new())
}

fn default_require_tls() -> bool {
    true
}

fn default_timeout_milliseconds() -> u64 {
    10_000
}

fn default_name_column() -> String {
    "Nome completo".into()
}

fn default_email_column() -> String {
    "E-mail".into()
}

fn default_field_name() -> String {
    "{{ Nome do aluno }}".into()
}

fn default_filename_prefix() -> String {
    "certificado_".into()
}

fn default_archive_name() -> String {
    "certificados.zip".into()
}

fn default_placeholder() -> String {
    "{{Nome}}".into()
}

fn default_subject() -> String {
    "Seu certificado de conclusão – {{Nome}}".into()
}

fn default_text_fallback() -> String {
    "Seu leitor não suporta HTML.".into()
}

/// Reads the settings from an optional configuration file, then lets
/// `APP_<SECTION>__<KEY>` environment variables override it,
/// e.g. `APP_SMTP__PASSWORD`.
pub fn get_configuration(file_name: &str) -> Result<Settings, config::ConfigError> {
    let mut settings = config::Config::default();

    // Any extension `config` knows how to parse: yaml, toml, json, etc.
    settings.merge(config::File::with_name(file_name).required(false))?;
    settings.merge(config::Environment::with_prefix("app").separator("__"))?;

    settings.try_into()
}
