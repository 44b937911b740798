//! Queue processor orchestration

pub mod cleanup;
pub mod process;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use trickle_common::{SendingConfig, Signal, internal};
use trickle_store::BackingStore;

pub use self::{cleanup::MaintenanceReport, process::ProcessReport};
use crate::{
    analytics::AnalyticsRecorder,
    error::{DeliveryError, SystemError},
    policy::BackoffStrategy,
    transport::MailTransport,
};

const fn default_process_interval() -> u64 {
    300 // 5 minutes
}

const fn default_transport_timeout() -> u64 {
    30
}

/// Claims due jobs and hands them to the mail transport.
///
/// Each tick takes a fresh [`SendingConfig`] snapshot, so pausing, demo mode
/// and the retry budget can change between ticks without a restart.
///
/// # Example
///
/// ```ron
/// processor: (
///     process_interval_secs: 300,
///     transport_timeout_secs: 30,
///     backoff: Exponential(base_delay_secs: 300),
/// )
/// ```
#[derive(Debug, Deserialize)]
pub struct QueueProcessor {
    /// How often to process the queue (in seconds)
    #[serde(default = "default_process_interval")]
    pub process_interval_secs: u64,

    /// Upper bound on a single transport send (in seconds)
    ///
    /// A send that takes longer counts as a temporary failure.
    #[serde(default = "default_transport_timeout")]
    pub transport_timeout_secs: u64,

    /// Delay between attempts of a failing job
    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// The backing store (initialized in `init()`)
    #[serde(skip)]
    pub(crate) store: Option<Arc<dyn BackingStore>>,

    /// The transport used for every send (initialized in `init()`)
    #[serde(skip)]
    pub(crate) transport: Option<Arc<dyn MailTransport>>,

    #[serde(skip)]
    pub(crate) analytics: Option<AnalyticsRecorder>,
}

impl Default for QueueProcessor {
    fn default() -> Self {
        Self {
            process_interval_secs: default_process_interval(),
            transport_timeout_secs: default_transport_timeout(),
            backoff: BackoffStrategy::default(),
            store: None,
            transport: None,
            analytics: None,
        }
    }
}

impl QueueProcessor {
    /// Initialize the queue processor
    pub fn init(&mut self, store: Arc<dyn BackingStore>, transport: Arc<dyn MailTransport>) {
        internal!(
            "Initialising Queue Processor with {} transport, timeout={}s, backoff={:?}",
            transport.name(),
            self.transport_timeout_secs,
            self.backoff
        );
        self.analytics = Some(AnalyticsRecorder::new(Arc::clone(&store)));
        self.store = Some(store);
        self.transport = Some(transport);
    }

    /// Bound applied to each transport send
    #[must_use]
    pub const fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }

    pub(crate) fn store(&self) -> Result<&Arc<dyn BackingStore>, DeliveryError> {
        self.store.as_ref().ok_or_else(not_initialized)
    }

    /// Run the queue processor
    ///
    /// Every `process_interval_secs` a tick delivers due jobs and then runs
    /// the maintenance pass. A shutdown signal is only observed between
    /// ticks, so the tick in flight always completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the processor was never initialised
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(
        &self,
        config: watch::Receiver<SendingConfig>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        internal!("Queue processor starting");
        self.store()?;

        let mut process_timer =
            tokio::time::interval(Duration::from_secs(self.process_interval_secs.max(1)));
        process_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = process_timer.tick() => {
                    let snapshot = config.borrow().clone();
                    let now = Utc::now();

                    match self.tick(&snapshot, now).await {
                        Ok(report) if report.claimed > 0 => {
                            tracing::info!(?report, "Processed delivery queue");
                        }
                        Ok(_) => {
                            tracing::debug!("Processed delivery queue, nothing due");
                        }
                        Err(e) => {
                            tracing::error!("Error processing delivery queue: {e}");
                        }
                    }

                    if let Err(e) = self.maintain(&snapshot, now).await {
                        tracing::error!("Error during queue maintenance: {e}");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown) => {
                            internal!("Queue processor received shutdown signal");
                            break;
                        }
                        Ok(Signal::Reload) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(e) => {
                            tracing::error!("Queue processor shutdown channel error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        internal!("Queue processor shutdown complete");
        Ok(())
    }
}

fn not_initialized() -> DeliveryError {
    SystemError::NotInitialized("Queue processor not initialized. Call init() first.".to_string())
        .into()
}

#[cfg(test)]
mod tests {
    use ron::extensions::Extensions;

    use super::*;

    #[test]
    fn test_parse_processor_config() {
        let processor: QueueProcessor = ron::Options::default()
            .with_default_extension(Extensions::IMPLICIT_SOME)
            .from_str("(transport_timeout_secs: 5, backoff: Fixed(delay_secs: 60))")
            .expect("Failed to parse processor config");

        assert_eq!(processor.process_interval_secs, 300);
        assert_eq!(processor.transport_timeout(), Duration::from_secs(5));
        assert_eq!(processor.backoff, BackoffStrategy::Fixed { delay_secs: 60 });
        assert!(processor.store.is_none());
    }

    #[tokio::test]
    async fn test_serve_requires_init() {
        let processor = QueueProcessor::default();
        let (_config_tx, config_rx) = watch::channel(SendingConfig::default());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let err = processor
            .serve(config_rx, shutdown_rx)
            .await
            .expect_err("Serving without init should fail");
        assert!(err.is_system());
    }
}
