//! Mail transports.
//!
//! The processor hands each claimed job to a [`MailTransport`] as an
//! [`OutboundMessage`]. A transport reports failures through
//! [`DeliveryError`] so the processor can tell a retryable failure from one
//! that should dead-letter the job straight away.

pub mod log;
pub mod smtp;
pub mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use trickle_store::QueueJob;

pub use self::{log::LogTransport, smtp::SmtpConfig, smtp::SmtpTransport};
use crate::error::DeliveryError;

/// What the transport needs to put one email on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl From<&QueueJob> for OutboundMessage {
    fn from(job: &QueueJob) -> Self {
        Self {
            recipient: job.recipient.clone(),
            subject: job.subject.clone(),
            body: job.body.clone(),
        }
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync + std::fmt::Debug {
    /// Short name used in log lines
    fn name(&self) -> &'static str;

    /// Deliver one message.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Temporary`] for anything worth retrying,
    /// [`DeliveryError::Permanent`] when the message can never be delivered.
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError>;
}

/// Which transport the processor sends through.
///
/// # Examples
///
/// ```ron
/// transport: Smtp(
///     host: "smtp.example.com",
///     username: "mailer",
///     password: "hunter2",
///     from: "Trickle <letters@example.com>",
/// )
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub enum TransportConfig {
    /// Log every message and report success
    #[default]
    Log,
    Smtp(SmtpConfig),
}

impl TransportConfig {
    /// Build the configured transport.
    ///
    /// # Errors
    ///
    /// [`SystemError::Configuration`](crate::SystemError::Configuration) if the
    /// SMTP settings cannot be turned into a relay.
    pub fn build(&self) -> Result<Arc<dyn MailTransport>, DeliveryError> {
        Ok(match self {
            Self::Log => Arc::new(LogTransport),
            Self::Smtp(config) => Arc::new(SmtpTransport::new(config)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use ron::extensions::Extensions;

    use super::*;

    #[test]
    fn test_parse_transport_config() {
        let options = ron::Options::default()
            .with_default_extension(Extensions::IMPLICIT_SOME)
            .with_default_extension(Extensions::UNWRAP_VARIANT_NEWTYPES);

        let config: TransportConfig = options.from_str("Log").expect("Failed to parse log");
        assert!(matches!(config, TransportConfig::Log));

        let config: TransportConfig = options
            .from_str(r#"Smtp(host: "smtp.example.com", from: "letters@example.com", port: 2525)"#)
            .expect("Failed to parse smtp");
        let TransportConfig::Smtp(smtp) = config else {
            panic!("Expected smtp transport");
        };
        assert_eq!(smtp.host, "smtp.example.com");
        assert_eq!(smtp.port, 2525);
        assert!(smtp.starttls);
        assert_eq!(smtp.username, None);
    }

    #[test]
    fn test_default_transport_logs() {
        let transport = TransportConfig::default()
            .build()
            .expect("Failed to build transport");
        assert_eq!(transport.name(), "log");
    }
}
