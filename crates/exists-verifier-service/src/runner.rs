use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use exists_verifier_core::timestamp::from_datetime;
use exists_verifier_core::{RecordStore, VerificationOutcome};
use exists_verifier_notify::{
    send_verified_notification, Exchange, HttpTransport, ProducerPool, Transport,
};
use parking_lot::{Condvar, Mutex};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::config::VerifierConfig;
use crate::pool::{PoolStats, TaskPool, VerifiedCallback};
use crate::scheduler::BatchScheduler;

/// Cooperative stop signal for the runner loop. Clones share state.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ShutdownToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (cancelled, wakeup) = &*self.inner;
        *cancelled.lock() = true;
        wakeup.notify_all();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Sleep for up to `timeout`; returns `true` once cancelled.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (cancelled, wakeup) = &*self.inner;
        let mut guard = cancelled.lock();
        if !*guard {
            let _ = wakeup.wait_while_for(&mut guard, |cancelled| !*cancelled, timeout);
        }
        *guard
    }
}

/// Summary of one scheduling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub claimed: usize,
    pub stats: PoolStats,
}

/// Publishes a verified notification for every verified outcome. Publish
/// failures are logged and leave the persisted outcome untouched.
pub fn notification_callback<T>(
    producers: Arc<ProducerPool<T>>,
    exchange: Exchange,
    routing_keys: Option<Vec<String>>,
) -> VerifiedCallback
where
    T: Transport + 'static,
{
    Arc::new(move |outcome: &VerificationOutcome| {
        if !outcome.verified {
            return;
        }
        match send_verified_notification(
            &outcome.exist,
            &exchange,
            &producers,
            routing_keys.as_deref(),
        ) {
            Ok(sent) => debug!(exists_id = outcome.exist.id, sent, "sent verified notifications"),
            Err(err) => {
                warn!(exists_id = outcome.exist.id, error = %err, "verified notification failed");
            }
        }
    })
}

/// Ties the scheduler, worker pool, and notifier into a service loop.
pub struct Verifier<P: TaskPool> {
    config: VerifierConfig,
    scheduler: BatchScheduler<P>,
    shutdown: ShutdownToken,
}

impl<P: TaskPool> Verifier<P> {
    #[must_use]
    pub fn new(config: VerifierConfig, store: Arc<dyn RecordStore>, pool: P) -> Self {
        Self { config, scheduler: BatchScheduler::new(store, pool), shutdown: ShutdownToken::new() }
    }

    #[must_use]
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    /// Latest audit period end eligible at `now`, in decimal seconds.
    ///
    /// # Errors
    /// Returns an error when the settle period overflows the clock.
    pub fn when_max(&self, now: OffsetDateTime) -> Result<Decimal> {
        let settle = self.config.settle_duration()?;
        let cutoff = now.checked_sub(settle).context("settle period reaches before the epoch range")?;
        Ok(from_datetime(cutoff))
    }

    /// Tick until the shutdown token is cancelled, publishing notifications
    /// over HTTP when enabled.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid.
    pub fn run(&self) -> Result<()> {
        match self.config.notifications() {
            Some(rabbit) => {
                let transport = HttpTransport::new(&rabbit.broker_settings())?;
                self.run_with_transport(transport)
            }
            None => self.run_loop(None),
        }
    }

    /// [`Verifier::run`] with notifications published through `transport`.
    ///
    /// # Errors
    /// Returns an error when the configured settle period is invalid.
    pub fn run_with_transport<T: Transport + 'static>(&self, transport: T) -> Result<()> {
        let callback = self.callback_for(transport);
        self.run_loop(callback)
    }

    /// One scheduling pass, then drain the pool until nothing is pending.
    ///
    /// # Errors
    /// Returns an error when the broker address or settle period is invalid,
    /// or the pass fails.
    pub fn run_once(&self) -> Result<PoolStats> {
        match self.config.notifications() {
            Some(rabbit) => {
                let transport = HttpTransport::new(&rabbit.broker_settings())?;
                self.run_once_with_transport(transport)
            }
            None => self.drain_once(None),
        }
    }

    /// [`Verifier::run_once`] with notifications published through `transport`.
    ///
    /// # Errors
    /// Returns an error when the settle period is invalid or the pass fails.
    pub fn run_once_with_transport<T: Transport + 'static>(&self, transport: T) -> Result<PoolStats> {
        let callback = self.callback_for(transport);
        self.drain_once(callback)
    }

    fn callback_for<T: Transport + 'static>(&self, transport: T) -> Option<VerifiedCallback> {
        let rabbit = self.config.notifications()?;
        Some(notification_callback(
            Arc::new(ProducerPool::new(transport)),
            rabbit.exchange(),
            rabbit.routing_keys.clone(),
        ))
    }

    fn exchange_name(&self) -> &str {
        self.config.notifications().map_or("none", |rabbit| rabbit.exchange_name.as_str())
    }

    /// Claim and dispatch one batch, then drain whatever already finished.
    ///
    /// # Errors
    /// Returns an error when the cutoff cannot be computed or the batch
    /// cannot be claimed.
    pub fn tick(&self, callback: Option<VerifiedCallback>) -> Result<TickSummary> {
        let when_max = self.when_max(OffsetDateTime::now_utc())?;
        let claimed = self
            .scheduler
            .verify_for_range(when_max, callback)
            .context("failed to schedule exists verification")?;
        let stats = self.scheduler.pool().clean_results();
        info!(
            exchange = self.exchange_name(),
            new = claimed,
            pending = stats.pending,
            successful = stats.successful,
            errored = stats.errored,
            "N: {claimed}, P: {}, S: {}, E: {}",
            stats.pending,
            stats.successful,
            stats.errored
        );
        Ok(TickSummary { claimed, stats })
    }

    fn run_loop(&self, callback: Option<VerifiedCallback>) -> Result<()> {
        self.config.validate()?;
        info!(
            tick_time = self.config.tick_time,
            notifications = self.config.enable_notifications,
            "exists verifier started"
        );
        while !self.shutdown.is_cancelled() {
            if let Err(err) = self.tick(callback.clone()) {
                error!(error = %format!("{err:#}"), "verification tick failed");
            }
            if self.shutdown.wait_timeout(self.config.tick_interval()) {
                break;
            }
        }
        info!("exists verifier stopped");
        Ok(())
    }

    /// Records dispatched before a failed pass still finish and run their
    /// callbacks before the failure is returned.
    fn drain_once(&self, callback: Option<VerifiedCallback>) -> Result<PoolStats> {
        match self.tick(callback) {
            Ok(first) => Ok(self.drain(first.stats)),
            Err(err) => {
                let stats = self.drain(self.scheduler.pool().clean_results());
                warn!(
                    successful = stats.successful,
                    errored = stats.errored,
                    "drained dispatched records after a failed pass"
                );
                Err(err)
            }
        }
    }

    fn drain(&self, mut total: PoolStats) -> PoolStats {
        while total.pending > 0 {
            if self.shutdown.wait_timeout(self.config.tick_interval()) {
                break;
            }
            let stats = self.scheduler.pool().clean_results();
            info!(
                exchange = self.exchange_name(),
                pending = stats.pending,
                successful = stats.successful,
                errored = stats.errored,
                "P: {}, S: {}, E: {}",
                stats.pending,
                stats.successful,
                stats.errored
            );
            total.successful += stats.successful;
            total.errored += stats.errored;
            total.pending = stats.pending;
        }
        total
    }
}
