// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Completion notices for the addresses listed in a job descriptor.
//!
//! [`SmtpNotifier`] sends plain-text mail through `lettre`. When no relay is
//! configured, [`LogNotifier`] records the notice in the log instead.

use async_trait::async_trait;
use tracing::info;

use crate::resource::{Resource, ResourceKind};

/// Default SMTP port (STARTTLS).
const DEFAULT_SMTP_PORT: u16 = 587;

/// Default sender address when `SMTP_FROM` is not set.
const DEFAULT_FROM_ADDRESS: &str = "extractor@localhost";

/// Notification delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// SMTP transport-level failure.
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    /// An address could not be parsed.
    #[error("Email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    /// The message could not be assembled.
    #[error("Email build error: {0}")]
    Build(String),
}

/// A completion notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Recipient addresses
    pub recipients: Vec<String>,
    /// Subject line
    pub subject: String,
    /// Plain-text body
    pub body: String,
}

impl Notice {
    /// Notice announcing that `resource` was processed by `extractor`.
    pub fn processed(
        extractor: &str,
        resource: &Resource,
        host: &str,
        recipients: Vec<String>,
    ) -> Self {
        let section = match resource.kind {
            ResourceKind::Dataset => "datasets",
            ResourceKind::File | ResourceKind::Metadata => "files",
        };
        let label = if resource.name.is_empty() {
            resource.id.as_str()
        } else {
            resource.name.as_str()
        };
        Self {
            recipients,
            subject: format!("[{}] {} processed", extractor, label),
            body: format!(
                "Extractor {} finished processing {} {} ({}).\n\n{}/{}/{}\n",
                extractor,
                resource.kind,
                label,
                resource.id,
                host.trim_end_matches('/'),
                section,
                resource.id
            ),
        }
    }
}

/// Delivers completion notices.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `notice` to each of its recipients.
    async fn notify(&self, notice: &Notice) -> Result<(), NotifyError>;
}

/// Writes notices to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notice: &Notice) -> Result<(), NotifyError> {
        info!(
            recipients = ?notice.recipients,
            subject = %notice.subject,
            "Notification (no SMTP relay configured)"
        );
        Ok(())
    }
}

/// SMTP relay settings.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Relay host
    pub smtp_host: String,
    /// Relay port
    pub smtp_port: u16,
    /// Sender address
    pub from_address: String,
    /// Optional user name
    pub smtp_user: Option<String>,
    /// Optional password
    pub smtp_password: Option<String>,
}

impl EmailConfig {
    /// Load from environment variables; `None` when `SMTP_HOST` is unset.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let smtp_host = lookup("SMTP_HOST").filter(|h| !h.is_empty())?;
        Some(Self {
            smtp_host,
            smtp_port: lookup("SMTP_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_SMTP_PORT),
            from_address: lookup("SMTP_FROM").unwrap_or_else(|| DEFAULT_FROM_ADDRESS.to_string()),
            smtp_user: lookup("SMTP_USER"),
            smtp_password: lookup("SMTP_PASSWORD"),
        })
    }
}

/// Sends notices as plain-text mail.
pub struct SmtpNotifier {
    config: EmailConfig,
}

impl SmtpNotifier {
    /// Create a notifier for the given relay.
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, notice: &Notice) -> Result<(), NotifyError> {
        use lettre::{
            AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
            message::header::ContentType, transport::smtp::authentication::Credentials,
        };

        let mut transport_builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.smtp_host)?
                .port(self.config.smtp_port);
        if let (Some(user), Some(pass)) = (&self.config.smtp_user, &self.config.smtp_password) {
            transport_builder =
                transport_builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        let mailer = transport_builder.build();

        for recipient in &notice.recipients {
            let email = Message::builder()
                .from(self.config.from_address.parse()?)
                .to(recipient.parse()?)
                .subject(notice.subject.clone())
                .header(ContentType::TEXT_PLAIN)
                .body(notice.body.clone())
                .map_err(|e| NotifyError::Build(e.to_string()))?;
            mailer.send(email).await?;
            info!(to = %recipient, subject = %notice.subject, "Notification email sent");
        }
        Ok(())
    }
}
