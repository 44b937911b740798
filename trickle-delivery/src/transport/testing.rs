//! Transport doubles for tests.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{MailTransport, OutboundMessage};
use crate::error::{DeliveryError, PermanentError, TemporaryError};

/// Accepts everything and remembers what it was given.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
}

impl RecordingTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages delivered so far, oldest first
    #[must_use]
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Temporary,
    Permanent,
}

/// Fails every send with the same error.
#[derive(Debug, Clone)]
pub struct FailingTransport {
    kind: FailureKind,
    reason: String,
    calls: Arc<AtomicUsize>,
}

impl FailingTransport {
    #[must_use]
    pub fn temporary(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Temporary,
            reason: reason.into(),
            calls: Arc::default(),
        }
    }

    #[must_use]
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            reason: reason.into(),
            calls: Arc::default(),
        }
    }

    /// Number of sends attempted
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for FailingTransport {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn send(&self, _message: &OutboundMessage) -> Result<(), DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(match self.kind {
            FailureKind::Temporary => TemporaryError::SmtpTemporary(self.reason.clone()).into(),
            FailureKind::Permanent => PermanentError::MessageRejected(self.reason.clone()).into(),
        })
    }
}

/// Sleeps before succeeding; pair with a short processor timeout.
#[derive(Debug, Clone, Copy)]
pub struct StalledTransport {
    pub delay: Duration,
}

impl StalledTransport {
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl MailTransport for StalledTransport {
    fn name(&self) -> &'static str {
        "stalled"
    }

    async fn send(&self, _message: &OutboundMessage) -> Result<(), DeliveryError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}
