//! # twinstore Core
//!
//! Keeps two relational stores with mirrored schemas eventually consistent by
//! replaying every application write from one onto the other.
//!
//! ## Architecture
//!
//! ```text
//! twinstore-core/src/
//! ├── store/            # Store trait + PostgreSQL (sqlx), SQLite (rusqlite), memory
//! ├── sync/
//! │   ├── interceptor.rs   # host hooks → ReplicationTask
//! │   ├── dispatcher.rs    # bounded queue + worker pool
//! │   ├── coordinator.rs   # route, guard, transact, retry
//! │   ├── routing.rs       # namespace + source → target
//! │   ├── guard.rs         # in-flight SyncKey set
//! │   ├── retry.rs         # backoff for transient failures
//! │   ├── dead_letter.rs   # durable log of lost replications
//! │   └── metrics.rs       # metrics facade + SyncStats
//! ├── modules/config.rs # JSON config + env overrides
//! └── runtime.rs        # SyncRuntime wiring
//! ```
//!
//! Replication is a side effect of the host's write path: hooks never return
//! errors the host must handle, and the host never waits on the remote store.

#![allow(
    clippy::significant_drop_tightening,
    reason = "Mutex guards in store transactions are held for the statement lifetime"
)]
#![allow(
    clippy::derive_partial_eq_without_eq,
    reason = "Some types carry floats and intentionally don't implement Eq"
)]
// Test-only lints: allow panic!, println!, etc. in test code
#![cfg_attr(
    test,
    allow(
        clippy::panic,
        clippy::unwrap_used,
        clippy::float_cmp,
        clippy::assertions_on_result_states
    )
)]

pub mod error;
pub mod modules;
pub mod runtime;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use error::{CoreError, CoreResult};
pub use runtime::SyncRuntime;
pub use store::{connect, MemoryStore, PostgresStore, SqliteStore, Store, StoreTransaction};
pub use sync::{
    ChangeInterceptor, DeadLetter, DeadLetterLog, EntityRegistry, Interception, SyncCoordinator,
    SyncEntity, SyncGuardSet, WriteIntent,
};
