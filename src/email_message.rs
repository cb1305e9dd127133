use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart};
use lettre::Message;

use crate::certificate::GeneratedDocument;
use crate::domain::{RecipientEmail, RecipientName};

pub const ATTACHMENT_CONTENT_TYPE: &str = "application/pdf";

/// Name substituted into the templates by [`MessageComposer::preview`].
pub const PREVIEW_NAME: &str = "Nome Exemplo";

#[derive(thiserror::Error, Debug)]
pub enum ComposeError {
    #[error("'{0}' is not a valid attachment content type")]
    ContentType(String),
    #[error("Failed to build the email for {recipient}")]
    Build {
        recipient: String,
        #[source]
        source: lettre::error::Error,
    },
}

/// Subject and HTML body are opaque strings apart from the placeholder,
/// which is replaced everywhere it occurs.
#[derive(Debug, Clone)]
pub struct EmailTemplate {
    pub subject: String,
    pub html_body: String,
    pub placeholder: String,
    pub text_fallback: String,
}

impl EmailTemplate {
    fn render(&self, name: &str) -> (String, String) {
        (
            self.subject.replace(&self.placeholder, name),
            self.html_body.replace(&self.placeholder, name),
        )
    }

    /// Names the first of subject and body that is empty or only whitespace.
    pub fn blank_part(&self) -> Option<&'static str> {
        if self.subject.trim().is_empty() {
            Some("subject")
        } else if self.html_body.trim().is_empty() {
            Some("body")
        } else {
            None
        }
    }

    /// Renders subject and body for a sample recipient without building a message.
    pub fn preview(&self, sample_name: &str) -> Preview {
        let (subject, html_body) = self.render(sample_name);
        Preview { subject, html_body }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub subject: String,
    pub html_body: String,
}

/// One recipient's email, immutable once composed.
#[derive(Debug, Clone)]
pub struct CertificateEmail {
    pub subject: String,
    pub from: Mailbox,
    pub to: RecipientEmail,
    pub text_fallback: String,
    pub html_body: String,
    pub attachment: GeneratedDocument,
}

impl CertificateEmail {
    /// `multipart/mixed` of a text/html alternative and the PDF attachment.
    pub fn to_message(&self) -> Result<Message, ComposeError> {
        let content_type = ContentType::parse(ATTACHMENT_CONTENT_TYPE)
            .map_err(|_| ComposeError::ContentType(ATTACHMENT_CONTENT_TYPE.to_owned()))?;

        Message::builder()
            .from(self.from.clone())
            .to(Mailbox::new(None, self.to.address().clone()))
            .subject(self.subject.as_str())
            .multipart(
                MultiPart::mixed()
                    .multipart(MultiPart::alternative_plain_html(
                        self.text_fallback.clone(),
                        self.html_body.clone(),
                    ))
                    .singlepart(
                        Attachment::new(self.attachment.filename.clone())
                            .body(self.attachment.bytes.clone(), content_type),
                    ),
            )
            .map_err(|source| ComposeError::Build {
                recipient: self.to.to_string(),
                source,
            })
    }
}

pub struct MessageComposer {
    template: EmailTemplate,
    sender: Mailbox,
}

impl MessageComposer {
    pub fn new(template: EmailTemplate, sender: Mailbox) -> Self {
        Self { template, sender }
    }

    pub fn compose(
        &self,
        name: &RecipientName,
        to: &RecipientEmail,
        attachment: GeneratedDocument,
    ) -> CertificateEmail {
        let (subject, html_body) = self.template.render(name.as_ref());
        CertificateEmail {
            subject,
            from: self.sender.clone(),
            to: to.clone(),
            text_fallback: self.template.text_fallback.clone(),
            html_body,
            attachment,
        }
    }

    pub fn preview(&self, sample_name: &str) -> Preview {
        self.template.preview(sample_name)
    }
}
