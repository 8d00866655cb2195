use crate::config::{Attachment, SecurityMode, SmtpConfig};
pub mod filename;
pub mod message;
pub mod template;
use message::{RenderedMessage, DEFAULT_CHARSET};
use template::TemplateError;

use async_trait::async_trait;
use lettre::{
    address::{AddressError, Envelope},
    error::Error as LettreError,
    message::Mailbox,
    transport::smtp::{
        authentication::{Credentials, Mechanism},
        client::{Tls, TlsParameters},
    },
    Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor,
};
use thiserror::Error;

// --- Error Handling ---
#[derive(Error, Debug)]
pub enum EmailError {
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Failed to parse email address '{address}': {source}")]
    Address {
        address: String,
        source: AddressError,
    },

    #[error("Failed to build SMTP envelope: {0}")]
    Envelope(#[from] LettreError),

    #[error("There must be at least one recipient in To, Cc, or Bcc")]
    NoRecipients,

    #[error("Failed to read attachment '{path}': {source}")]
    Attachment {
        path: String,
        source: std::io::Error,
    },

    #[error("Configuration error for TLS: {0}")]
    TlsConfig(lettre::transport::smtp::Error),

    #[error("Failed to send email to {recipients}: {source}")]
    Send {
        recipients: String,
        source: lettre::transport::smtp::Error,
    },

    #[error("General configuration error: {0}")]
    ConfigError(String),
}

/// One fully resolved message, built fresh per recipient.
#[derive(Debug, Clone, Default)]
pub struct Mail {
    pub sender: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: String,
    pub subject: String,
    pub text: String,
    /// Empty means `utf-8`.
    pub charset: String,
    pub attachments: Vec<Attachment>,
}

impl Mail {
    pub fn charset(&self) -> &str {
        if self.charset.is_empty() {
            DEFAULT_CHARSET
        } else {
            &self.charset
        }
    }

    /// `RCPT TO` set: To, then Cc, then Bcc. Headers only ever show To and Cc.
    pub fn envelope_recipients(&self) -> Result<Vec<&str>, EmailError> {
        let all: Vec<&str> = self
            .to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(String::as_str)
            .collect();
        if all.is_empty() {
            return Err(EmailError::NoRecipients);
        }
        Ok(all)
    }
}

/// Delivery seam between the batch and the wire.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(
        &self,
        message: &RenderedMessage,
        from: &str,
        recipients: &[&str],
    ) -> Result<(), EmailError>;
}

/// Sends over SMTP with one fresh connection per message.
pub struct SmtpDeliverer {
    config: SmtpConfig,
    mode: SecurityMode,
}

impl SmtpDeliverer {
    pub fn new(config: SmtpConfig) -> Result<Self, EmailError> {
        let mode = config
            .security_mode()
            .map_err(|e| EmailError::ConfigError(e.to_string()))?;
        if mode == SecurityMode::Plain {
            log::warn!(
                "connection to {}:{} is not encrypted, credentials travel in clear text",
                config.host,
                config.port
            );
        }
        Ok(SmtpDeliverer { config, mode })
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, EmailError> {
        // --- SMTP Transport ---
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.get_password().to_string(),
        );

        let tls = match self.mode {
            SecurityMode::Tls => Tls::Wrapper(self.tls_parameters()?),
            SecurityMode::StartTls => Tls::Required(self.tls_parameters()?),
            SecurityMode::Plain => Tls::None,
        };

        Ok(
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.host)
                .port(self.config.port)
                .tls(tls)
                .credentials(creds)
                .authentication(vec![Mechanism::Plain])
                .timeout(Some(self.config.timeout()))
                .build(),
        )
    }

    fn tls_parameters(&self) -> Result<TlsParameters, EmailError> {
        TlsParameters::new(self.config.host.clone()).map_err(EmailError::TlsConfig)
    }
}

#[async_trait]
impl Deliver for SmtpDeliverer {
    async fn deliver(
        &self,
        message: &RenderedMessage,
        from: &str,
        recipients: &[&str],
    ) -> Result<(), EmailError> {
        let envelope = envelope(from, recipients)?;
        let transport = self.transport()?;

        transport
            .send_raw(&envelope, message.as_bytes())
            .await
            .map_err(|source| EmailError::Send {
                recipients: recipients.join(","),
                source,
            })?;

        log::debug!("Sent mail to {}", recipients.join(","));
        Ok(())
    }
}

/// Parses `Name <addr>` or bare addresses; only the address goes on the wire.
pub fn parse_address(raw: &str) -> Result<Address, EmailError> {
    raw.trim()
        .parse::<Mailbox>()
        .map(|mailbox| mailbox.email)
        .map_err(|source| EmailError::Address {
            address: raw.to_string(),
            source,
        })
}

pub fn envelope(from: &str, recipients: &[&str]) -> Result<Envelope, EmailError> {
    if recipients.is_empty() {
        return Err(EmailError::NoRecipients);
    }
    let to = recipients
        .iter()
        .map(|r| parse_address(r))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Envelope::new(Some(parse_address(from)?), to)?)
}
