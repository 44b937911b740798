use std::{
    path::{Path, PathBuf},
    sync::{Arc, LazyLock},
};

use anyhow::Context;
use serde::Deserialize;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::{broadcast, watch},
};
use trickle_common::{SendingConfig, Signal, internal, logging};
use trickle_delivery::{
    AnalyticsRecorder, DeadLetterService, QueueProcessor, RateLimitConfig,
    SubscriptionRateLimiter, TransportConfig,
};
use trickle_scheduler::DripScheduler;
use trickle_store::{BackingStore, StoreConfig};

/// The whole daemon, as written in `trickle.config.ron`
///
/// # Example
///
/// ```ron
/// Trickle (
///     store: Sqlite(path: "/var/lib/trickle/trickle.db"),
///     transport: Log,
///     sending: (max_attempts: 3, pause_all_sending: false),
///     processor: (process_interval_secs: 300),
///     scheduler: (schedule_interval_secs: 3600),
///     rate_limit: (max_attempts: 5, window_secs: 3600),
/// )
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Trickle {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    /// Initial sending flags; re-read on `SIGHUP`
    #[serde(default)]
    pub sending: SendingConfig,

    #[serde(default)]
    pub processor: QueueProcessor,

    #[serde(default)]
    pub scheduler: DripScheduler,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(skip)]
    backing: Option<Arc<dyn BackingStore>>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

/// Wait for a terminating signal, reloading the sending flags on `SIGHUP`.
///
/// Once shutdown is broadcast the loops finish their current tick; a second
/// CTRL+C returns immediately and abandons them.
#[tracing::instrument(level = "trace", skip_all)]
async fn signals(
    config_path: Option<PathBuf>,
    sending: watch::Sender<SendingConfig>,
) -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                internal!(level = INFO, "CTRL+C entered, enter it again to force shutdown");
                break;
            }
            _ = terminate.recv() => {
                internal!(level = INFO, "Terminate Signal received, shutting down");
                break;
            }
            _ = hangup.recv() => {
                reload(config_path.as_deref(), &sending);
            }
        }
    }

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    tokio::signal::ctrl_c().await?;
    internal!(level = WARN, "Forcing shutdown");

    Ok(())
}

/// Re-read the sending flags from `path` and publish them to the loops.
fn reload(path: Option<&Path>, sending: &watch::Sender<SendingConfig>) {
    let Some(path) = path else {
        internal!(level = WARN, "Reload requested but no configuration file is in use");
        return;
    };

    match crate::config::load(path) {
        Ok(reloaded) => {
            sending.send_replace(reloaded.sending);
            if let Err(e) = SHUTDOWN_BROADCAST.send(Signal::Reload) {
                tracing::debug!("No receivers for reload signal: {e}");
            }
            internal!(level = INFO, "Reloaded sending configuration from {}", path.display());
        }
        Err(e) => {
            tracing::error!("Failed to reload configuration, keeping current flags: {e:#}");
        }
    }
}

impl Trickle {
    /// Open the store and transport, and hand them to the scheduler and processor
    ///
    /// # Errors
    ///
    /// If the backing store cannot be opened or the transport cannot be built.
    pub async fn init(&mut self) -> anyhow::Result<Arc<dyn BackingStore>> {
        let opened = self
            .store
            .clone()
            .open()
            .await
            .context("Failed to open the backing store")?;
        let transport = self
            .transport
            .build()
            .context("Failed to build the mail transport")?;

        internal!(level = INFO, "Using the {} transport", transport.name());

        self.processor.init(Arc::clone(&opened.store), transport);
        self.scheduler
            .init(Arc::clone(&opened.store), opened.subscribers, opened.content);
        self.backing = Some(Arc::clone(&opened.store));

        Ok(opened.store)
    }

    fn backing(&self) -> anyhow::Result<Arc<dyn BackingStore>> {
        self.backing
            .clone()
            .context("Controller not initialised. Call init() first.")
    }

    /// # Errors
    ///
    /// If [`init`](Self::init) has not run.
    pub fn rate_limiter(&self) -> anyhow::Result<SubscriptionRateLimiter> {
        Ok(SubscriptionRateLimiter::new(
            self.rate_limit.clone(),
            self.backing()?,
        ))
    }

    /// # Errors
    ///
    /// If [`init`](Self::init) has not run.
    pub fn dead_letters(&self) -> anyhow::Result<DeadLetterService> {
        Ok(DeadLetterService::new(self.backing()?))
    }

    /// # Errors
    ///
    /// If [`init`](Self::init) has not run.
    pub fn analytics(&self) -> anyhow::Result<AnalyticsRecorder> {
        Ok(AnalyticsRecorder::new(self.backing()?))
    }

    /// Run this controller, and everything it controls
    ///
    /// The scheduler and processor loops run until a shutdown signal, each
    /// finishing the tick it is in. `config_path` is re-read on `SIGHUP`.
    ///
    /// # Errors
    ///
    /// This function will return an error if the store or transport fail to
    /// initialise, or a loop exits with an error.
    #[tracing::instrument(level = "trace", skip_all, err)]
    pub async fn run(mut self, config_path: Option<PathBuf>) -> anyhow::Result<()> {
        logging::init();
        self.init().await?;

        internal!(level = INFO, "Controller running");

        let (sending_tx, sending_rx) = watch::channel(self.sending.clone());
        let processor_shutdown = SHUTDOWN_BROADCAST.subscribe();
        let scheduler_shutdown = SHUTDOWN_BROADCAST.subscribe();

        let loops = async {
            let (processed, scheduled) = tokio::join!(
                self.processor.serve(sending_rx.clone(), processor_shutdown),
                self.scheduler.serve(sending_rx, scheduler_shutdown),
            );
            processed?;
            scheduled?;
            Ok::<(), anyhow::Error>(())
        };

        let ret = tokio::select! {
            r = loops => r,
            r = signals(config_path, sending_tx) => r,
        };

        internal!(level = INFO, "Shutting down...");

        ret
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use trickle_common::{ContentId, EventType, SubscriberId};
    use trickle_delivery::{NewEvent, Recorded};
    use trickle_store::{MemoryConfig, QueueStore};

    use super::*;
    use crate::config::parse;

    #[test]
    fn test_sample_config_parses() {
        let trickle = parse(include_str!("../trickle.config.ron")).expect("sample config");
        assert_eq!(
            trickle.store.path(),
            Some(Path::new("/var/lib/trickle/trickle.db"))
        );
        assert!(matches!(trickle.transport, TransportConfig::Log));
        assert_eq!(trickle.processor.process_interval_secs, 300);
        assert_eq!(trickle.scheduler.schedule_interval_secs, 3600);
        assert_eq!(trickle.sending.max_attempts, 3);
        assert_eq!(trickle.rate_limit.max_attempts, 5);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let trickle = parse("()").expect("empty config");
        assert_eq!(trickle.sending, SendingConfig::default());
        assert!(matches!(trickle.transport, TransportConfig::Log));
        assert!(trickle.backing().is_err());
    }

    #[tokio::test]
    async fn test_init_wires_every_service() {
        let mut trickle = Trickle {
            store: StoreConfig::Memory(MemoryConfig::default()),
            ..Trickle::default()
        };
        let store = trickle.init().await.expect("init");
        let now = Utc::now();

        let report = trickle
            .scheduler
            .tick(&trickle.sending, now)
            .await
            .expect("scheduler tick");
        assert_eq!(report.scanned, 0);

        let report = trickle
            .processor
            .tick(&trickle.sending, now)
            .await
            .expect("processor tick");
        assert_eq!(report.claimed, 0);

        let decision = trickle
            .rate_limiter()
            .expect("limiter")
            .check("reader@example.com", now)
            .await
            .expect("check");
        assert!(decision.is_allowed());

        let dead_letters = trickle
            .dead_letters()
            .expect("dead letters")
            .list(10)
            .await
            .expect("list");
        assert!(dead_letters.is_empty());
        assert_eq!(store.stats().await.expect("stats").pending, 0);

        // No mirror row for this subscriber; the event is still stored
        let event = NewEvent::new(EventType::Unsubscribed, ContentId(1), SubscriberId(404));
        let recorded = trickle
            .analytics()
            .expect("analytics")
            .record(event, now)
            .await
            .expect("record");
        assert_eq!(recorded, Recorded::Inserted);
    }
}
