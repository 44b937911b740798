//! SMTP relay transport built on `lettre`.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::{Error as SmtpError, authentication::Credentials},
};
use serde::Deserialize;
use tracing::debug;

use super::{MailTransport, OutboundMessage};
use crate::error::{DeliveryError, PermanentError, SystemError, TemporaryError};

mod defaults {
    pub const fn port() -> u16 {
        587
    }

    pub const fn starttls() -> bool {
        true
    }

    pub const fn timeout_secs() -> u64 {
        60
    }
}

/// Relay settings.
#[derive(Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,

    #[serde(default = "defaults::port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Sender mailbox, e.g. `Trickle <letters@example.com>`
    pub from: String,

    /// Upgrade the connection with STARTTLS. Disable only for local relays.
    #[serde(default = "defaults::starttls")]
    pub starttls: bool,

    /// Socket timeout for each SMTP command
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("from", &self.from)
            .field("starttls", &self.starttls)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Sends through a single authenticated relay.
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    timeout: Duration,
}

impl SmtpTransport {
    /// Build the relay connection pool. No connection is opened until the
    /// first send.
    ///
    /// # Errors
    ///
    /// [`SystemError::Configuration`] if the sender address or relay host is unusable.
    pub fn new(config: &SmtpConfig) -> Result<Self, DeliveryError> {
        let from: Mailbox = config.from.parse().map_err(|e| {
            SystemError::Configuration(format!("Invalid sender {:?}: {e}", config.from))
        })?;

        let builder = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host).map_err(|e| {
                SystemError::Configuration(format!("Invalid SMTP relay {}: {e}", config.host))
            })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        let timeout = Duration::from_secs(config.timeout_secs);
        let mut builder = builder.port(config.port).timeout(Some(timeout));
        if let Some(username) = &config.username {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                config.password.clone().unwrap_or_default(),
            ));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
            timeout,
        })
    }

    fn build_message(&self, message: &OutboundMessage) -> Result<Message, DeliveryError> {
        let to: Mailbox = message
            .recipient
            .parse()
            .map_err(|e| PermanentError::InvalidRecipient(format!("{}: {e}", message.recipient)))?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(message.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(message.body.clone())
            .map_err(|e| PermanentError::InvalidMessage(e.to_string()).into())
    }

    fn classify(&self, error: &SmtpError) -> DeliveryError {
        let code = error.status().map(|code| code.to_string());

        if error.is_permanent() {
            return match code.as_deref() {
                Some("535" | "530") => PermanentError::AuthenticationFailed(error.to_string()),
                Some("550" | "551" | "553") => PermanentError::InvalidRecipient(error.to_string()),
                _ => PermanentError::MessageRejected(error.to_string()),
            }
            .into();
        }

        if error.is_timeout() {
            return TemporaryError::Timeout(self.timeout).into();
        }

        if error.is_transient() {
            return TemporaryError::SmtpTemporary(error.to_string()).into();
        }

        TemporaryError::ConnectionFailed(error.to_string()).into()
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let email = self.build_message(message)?;

        let response = self
            .mailer
            .send(email)
            .await
            .map_err(|e| self.classify(&e))?;

        if response.is_positive() {
            debug!(recipient = %message.recipient, code = %response.code(), "Relay accepted message");
            Ok(())
        } else {
            Err(TemporaryError::SmtpTemporary(format!(
                "Unexpected relay response {}",
                response.code()
            ))
            .into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SmtpConfig {
        SmtpConfig {
            host: "localhost".to_string(),
            port: 2525,
            username: Some("mailer".to_string()),
            password: Some("hunter2".to_string()),
            from: "Trickle <letters@example.com>".to_string(),
            starttls: false,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_password_is_redacted() {
        let debug = format!("{:?}", config());
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_invalid_sender_is_configuration_error() {
        let mut config = config();
        config.from = "not an address".to_string();
        let err = SmtpTransport::new(&config).expect_err("Sender should be rejected");
        assert!(err.is_system());
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_permanent() {
        let transport = SmtpTransport::new(&config()).expect("Failed to build transport");
        let err = transport
            .build_message(&OutboundMessage {
                recipient: "nobody".to_string(),
                subject: "Hello".to_string(),
                body: "Hi".to_string(),
            })
            .expect_err("Recipient should be rejected");
        assert!(err.is_permanent());
    }
}
