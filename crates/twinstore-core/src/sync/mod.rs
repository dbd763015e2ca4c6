//! Replication pipeline: interceptor → dispatcher → coordinator → target store.

mod coordinator;
mod dead_letter;
mod dispatcher;
mod guard;
mod interceptor;
pub mod metrics;
mod retry;
mod routing;

pub use coordinator::SyncCoordinator;
pub use dead_letter::{DeadLetter, DeadLetterLog, DeadLetterReason, ReplayReport};
pub use dispatcher::Dispatcher;
pub use guard::{SyncGuard, SyncGuardSet};
pub use interceptor::{
    ChangeInterceptor, EntityRegistry, IgnoreReason, Interception, SyncEntity, WriteIntent,
};
pub use metrics::{StatsSnapshot, SyncStats};
pub use retry::RetryPolicy;
pub use routing::RoutingTable;
