use std::sync::Arc;

use exists_verifier_core::{
    fetch_typed, verify, ExistsRecord, ExistsStatus, Filter, NumericField, Order, RecordStore,
    StoreError,
};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::pool::{TaskPool, VerifiedCallback, WorkerError};

/// Most exists records claimed by one tick.
pub const BATCH_LIMIT: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pool(#[from] WorkerError),
}

/// Claims settled PENDING exists records and hands them to a [`TaskPool`].
pub struct BatchScheduler<P> {
    store: Arc<dyn RecordStore>,
    pool: P,
}

impl<P: TaskPool> BatchScheduler<P> {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, pool: P) -> Self {
        Self { store, pool }
    }

    #[must_use]
    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Claim up to [`BATCH_LIMIT`] PENDING records whose audit period ended at
    /// or before `when_max`, lowest id first, and dispatch each one.
    ///
    /// Every record is saved as VERIFYING before it reaches the pool, so a
    /// later tick can never claim it again. Returns the number dispatched.
    ///
    /// # Errors
    /// Returns [`ScheduleError::Store`] when the page cannot be read or a claim
    /// cannot be saved, and [`ScheduleError::Pool`] when the pool refuses work.
    /// Records dispatched before the failure stay dispatched.
    pub fn verify_for_range(
        &self,
        when_max: Decimal,
        callback: Option<VerifiedCallback>,
    ) -> Result<usize, ScheduleError> {
        let filter = Filter::new()
            .status(ExistsStatus::Pending)
            .lte(NumericField::AuditPeriodEnding, when_max);
        let page = fetch_typed::<ExistsRecord>(
            self.store.as_ref(),
            &filter,
            Order::IdAscending,
            Some(BATCH_LIMIT),
        )?;

        let mut added = 0;
        for mut exist in page {
            exist.status = ExistsStatus::Verifying;
            self.store.save(&exist)?;
            debug!(exists_id = exist.id, instance = %exist.instance, "claimed exists record");

            let store = Arc::clone(&self.store);
            let job = Box::new(move || verify(store.as_ref(), exist));
            self.pool.apply_async(job, callback.clone())?;
            added += 1;
        }

        if added > 0 {
            info!(added, when_max = %when_max, "dispatched exists records");
        }
        Ok(added)
    }
}
