use std::fmt::{Debug, Formatter};

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Mechanism;
use lettre::transport::smtp::client::{AsyncSmtpConnection, TlsParameters};
use lettre::transport::smtp::extension::ClientId;
use lettre::Message;

use crate::configuration::SmtpSettings;
use crate::error::error_chain_fmt;

/// Failures that keep a batch from ever reaching the `Authenticated` state.
///
/// Both are fatal to the batch: nothing has been sent yet, so the caller can
/// fix the settings and start over. Failures after authentication are not
/// errors at all, see [`DispatchOutcome`].
#[derive(thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to connect to {host}:{port}")]
    Connection {
        host: String,
        port: u16,
        #[source]
        source: anyhow::Error,
    },
    #[error("SMTP authentication failed")]
    Authentication(#[source] anyhow::Error),
}

impl Debug for DispatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// What happened to one roster row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The server accepted the message for delivery.
    /// Nothing is known about the final delivery.
    Sent,
    /// The address was rejected before anything was generated or sent.
    InvalidAddress(String),
    /// The server (or the connection) refused this one message. The reason
    /// is the server's reply as lettre reports it, e.g. `permanent error (550)`.
    SendFailed(String),
}

/// One authenticated connection to a mail server.
#[async_trait]
pub trait MailTransport: Send {
    /// Per-message failures are returned as the reason text; the
    /// transport stays usable afterwards.
    async fn send(&mut self, message: &Message) -> Result<(), String>;

    async fn close(&mut self);
}

/// Opens and authenticates a [`MailTransport`].
#[async_trait]
pub trait MailConnector: Send + Sync {
    type Transport: MailTransport;

    async fn connect(&self) -> Result<Self::Transport, DispatchError>;
}

/// Connects to the configured SMTP server.
///
/// # Implementation Notes
///
/// Every connection goes through the same sequence: TCP connect, `STARTTLS`
/// when `require_tls` is set, then `AUTH` with PLAIN or LOGIN, whichever the
/// server advertises first. A connection that fails halfway is aborted before
/// the error is returned, so no half-open socket outlives the call.
pub struct SmtpConnector {
    settings: SmtpSettings,
}

impl SmtpConnector {
    pub fn new(settings: SmtpSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl MailConnector for SmtpConnector {
    type Transport = SmtpTransport;

    #[tracing::instrument(
        name = "Open SMTP session",
        skip(self),
        fields(host = %self.settings.host, port = self.settings.port)
    )]
    async fn connect(&self) -> Result<SmtpTransport, DispatchError> {
        let connection = open_connection(&self.settings).await?;
        tracing::info!("SMTP session authenticated");
        Ok(SmtpTransport {
            settings: self.settings.clone(),
            connection: Some(connection),
        })
    }
}

async fn open_connection(settings: &SmtpSettings) -> Result<AsyncSmtpConnection, DispatchError> {
    let hello_name = ClientId::default();
    let connection_error = |source: anyhow::Error| DispatchError::Connection {
        host: settings.host.clone(),
        port: settings.port,
        source,
    };

    let mut connection = AsyncSmtpConnection::connect_tokio1(
        (settings.host.as_str(), settings.port),
        Some(settings.timeout()),
        &hello_name,
        None,
        None,
    )
    .await
    .map_err(|e| connection_error(e.into()))?;

    if settings.require_tls {
        let negotiated = match TlsParameters::new(settings.host.clone()) {
            Ok(tls) => connection.starttls(tls, &hello_name).await,
            Err(e) => Err(e),
        };
        if let Err(e) = negotiated {
            connection.abort().await;
            return Err(connection_error(e.into()));
        }
    }

    let authenticated = connection
        .auth(&[Mechanism::Plain, Mechanism::Login], &settings.credentials())
        .await;
    if let Err(e) = authenticated {
        connection.abort().await;
        return Err(DispatchError::Authentication(e.into()));
    }

    Ok(connection)
}

/// An authenticated SMTP connection.
///
/// lettre gives up on a connection as soon as the server answers any command
/// with an error, even a per-recipient `550` on `RCPT TO`: it sends `QUIT` and
/// shuts the socket down. The transport therefore keeps the settings it was
/// opened with and reconnects (and re-authenticates) before the next message
/// whenever the previous one left the connection broken. A failed reconnect
/// only fails the message at hand; the following one tries again.
pub struct SmtpTransport {
    settings: SmtpSettings,
    connection: Option<AsyncSmtpConnection>,
}

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(&mut self, message: &Message) -> Result<(), String> {
        let mut connection = match self.connection.take() {
            Some(connection) if !connection.has_broken() => connection,
            _ => {
                tracing::info!("Reopening the SMTP session dropped by the previous failure");
                open_connection(&self.settings)
                    .await
                    .map_err(|e| format!("{:#}", anyhow::Error::from(e)))?
            }
        };

        let sent = connection
            .send(message.envelope(), &message.formatted())
            .await;
        self.connection = Some(connection);
        sent.map(|_| ()).map_err(|e| e.to_string())
    }

    async fn close(&mut self) {
        let mut connection = match self.connection.take() {
            Some(connection) if !connection.has_broken() => connection,
            // Already shut down by lettre, or never reopened
            _ => return,
        };
        if let Err(e) = connection.quit().await {
            tracing::warn!(error.message = %e, "QUIT failed, aborting the connection");
            connection.abort().await;
        }
    }
}

/// `Unauthenticated` is never observable from the outside: a session only
/// exists once its transport has authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authenticated,
    Closed,
}

/// Owns the batch's single transport connection.
///
/// Only an authenticated transport can become a session, so the
/// `Unauthenticated` stage lives in [`MailConnector::connect`]. Sending never
/// leaves `Authenticated`; [`close`] moves to `Closed` and releases the
/// transport exactly once, however often it is called.
///
/// [`close`]: DispatchSession::close
pub struct DispatchSession<T: MailTransport> {
    transport: Option<T>,
}

impl<T: MailTransport> DispatchSession<T> {
    /// Connects and authenticates through `connector`.
    ///
    /// Fails with [`DispatchError::Connection`] or
    /// [`DispatchError::Authentication`]; the batch must not process a single
    /// row in either case.
    pub async fn open<C>(connector: &C) -> Result<Self, DispatchError>
    where
        C: MailConnector<Transport = T>,
    {
        let transport = connector.connect().await?;
        Ok(Self {
            transport: Some(transport),
        })
    }

    pub fn state(&self) -> SessionState {
        match self.transport {
            Some(_) => SessionState::Authenticated,
            None => SessionState::Closed,
        }
    }

    /// Hands one message to the transport.
    ///
    /// Never fails: a rejected message becomes [`DispatchOutcome::SendFailed`]
    /// and the session stays `Authenticated` for the next row.
    #[tracing::instrument(name = "Dispatch email", skip(self, message))]
    pub async fn send(&mut self, message: &Message) -> DispatchOutcome {
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => return DispatchOutcome::SendFailed("session closed".into()),
        };
        match transport.send(message).await {
            Ok(()) => DispatchOutcome::Sent,
            Err(reason) => {
                tracing::warn!(%reason, "Failed to send email");
                DispatchOutcome::SendFailed(reason)
            }
        }
    }

    /// Closes the transport on the first call; later calls do nothing.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
            tracing::info!("SMTP session closed");
        }
    }
}

impl<T: MailTransport> Drop for DispatchSession<T> {
    fn drop(&mut self) {
        // Dropping the transport still releases the socket, only without QUIT
        if self.transport.is_some() {
            tracing::warn!("Dispatch session dropped without being closed");
        }
    }
}
