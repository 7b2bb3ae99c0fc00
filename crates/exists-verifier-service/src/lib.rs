//! Scheduling service for the exists verifier: configuration, the worker
//! pool, the batch scheduler, and the tick loop that ties them to the
//! notifier.

pub mod config;
pub mod pool;
pub mod runner;
pub mod scheduler;

pub use config::{RabbitConfig, SettleUnits, VerifierConfig};
pub use pool::{PoolStats, TaskPool, VerificationJob, VerifiedCallback, WorkerError, WorkerPool};
pub use runner::{notification_callback, ShutdownToken, TickSummary, Verifier};
pub use scheduler::{BatchScheduler, ScheduleError, BATCH_LIMIT};
