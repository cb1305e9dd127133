use std::fmt::{Debug, Formatter};

use crate::archive::ArchiveError;
use crate::certificate::{CertificateError, TemplateError};
use crate::dispatch::DispatchError;
use crate::domain::RosterError;
use crate::email_message::ComposeError;

/// Writes the error followed by every cause in its source chain.
pub fn error_chain_fmt(e: &impl std::error::Error, f: &mut Formatter<'_>) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}

/// Every way a batch can abort.
///
/// Schema, template, blank message, connection and authentication problems
/// are detected before the first row is touched, so they leave no archive and
/// send nothing. Invalid addresses and failed sends are not errors: they are
/// recorded as row outcomes.
#[derive(thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Schema(#[from] RosterError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("The email {0} is blank")]
    BlankMessage(&'static str),
    /// The mail server could not be reached or refused TLS.
    #[error(transparent)]
    Connection(DispatchError),
    /// The mail server rejected the credentials.
    #[error(transparent)]
    Authentication(DispatchError),
    #[error("Failed to generate the certificate for {recipient}")]
    DocumentGeneration {
        recipient: String,
        #[source]
        source: CertificateError,
    },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<DispatchError> for BatchError {
    fn from(e: DispatchError) -> Self {
        if matches!(e, DispatchError::Connection { .. }) {
            Self::Connection(e)
        } else {
            Self::Authentication(e)
        }
    }
}

impl Debug for BatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
