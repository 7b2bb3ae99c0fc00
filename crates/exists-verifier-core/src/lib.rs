//! Verification engine for instance exists records.
//!
//! An exists record claims an instance was running during an audit period.
//! The verifiers corroborate that claim against independently recorded
//! usage and delete records, fall back to operator reconcile records, and
//! persist a VERIFIED or FAILED outcome through a [`RecordStore`].

pub mod compare;
pub mod error;
pub mod memory;
pub mod model;
pub mod orchestrator;
pub mod reconcile;
pub mod store;
pub mod timestamp;
pub mod verify;
pub mod window;

pub use error::{FieldValue, SearchParams, StoreError, VerificationFault, VerifyError};
pub use memory::MemoryStore;
pub use model::{
    DeleteRecord, ExistsRecord, ExistsStatus, RawMessage, ReconcileRecord, UsageRecord,
};
pub use orchestrator::{mark_failed, mark_verified, verify, VerificationOutcome};
pub use reconcile::verify_with_reconciled_data;
pub use store::{
    fetch_typed, Condition, Filter, NumericField, Order, Record, RecordKind, RecordStore,
    StoredRecord,
};
pub use verify::{
    verify_for_delete, verify_for_launch, DeleteFacts, LaunchFacts, NO_LAUNCHED_AT_REASON,
};
pub use window::find_in_window;
