use async_trait::async_trait;
use trickle_common::outgoing;

use super::{MailTransport, OutboundMessage};
use crate::error::DeliveryError;

/// Writes each message to the log and reports success.
///
/// Useful for staging environments where nothing should leave the machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        outgoing!(
            level = INFO,
            "To: {} Subject: {:?} ({} bytes)",
            message.recipient,
            message.subject,
            message.body.len()
        );
        Ok(())
    }
}
