//! Work-order control plane.
//!
//! A transactional scheduler coordinating the proposal, distribution,
//! execution, review, and application of externally performed units of work.
//! Agents check out exclusive time-bounded leases on items, submit results
//! (whole or in parts), and reviewed orders apply as one atomic change to
//! the downstream domain.
//!
//! ```text
//! caller ─► WorkService ─► IdempotencyGuard
//!                        ─► Allocator / Executor / LeaseEngine
//!                              └─► StateMachine ─► store (+ event journal)
//! maintainer tick ─► LeaseEngine.reclaim / dead-letter / stale scan
//! ```

pub mod allocator;
pub mod common;
pub mod config;
pub mod error;
pub mod executor;
pub mod guard;
pub mod idempotency;
pub mod kernel;
pub mod lease;
pub mod machine;
pub mod maintainer;
pub mod metrics;
pub mod model;
pub mod order_type;
pub mod query;
pub mod registry;
pub mod schema;
pub mod service;

pub use allocator::{Allocator, ProposeRequest};
pub use config::{Config, LeaseBackend};
pub use error::{FieldError, WorkError};
pub use executor::{Executor, FinalizeMode};
pub use guard::MutationGuard;
pub use idempotency::IdempotencyGuard;
pub use kernel::{Clock, EventBus, ManualClock, SystemClock, WorkKernel};
pub use lease::{CheckoutFilters, LeaseEngine, ReclaimOutcome};
pub use machine::{StateMachine, TransitionGraph, TransitionOpts};
pub use maintainer::{MaintenanceFlags, MaintenanceReport, Maintainer};
pub use metrics::{Counter, Metrics};
pub use model::{
    Actor, ActorKind, Diff, DiffChange, EventKind, ItemState, OrderState, PartStatus, WorkEvent,
    WorkItem, WorkItemPart, WorkOrder, WorkProvenance,
};
pub use order_type::{
    AcceptancePolicy, AcceptanceRule, ApplyContext, ItemSpec, OrderType, RulePolicy,
};
pub use query::{Cmp, OrderFilter, OrderSort, QuerySurface, SortDir, SortField};
pub use registry::{EchoOrderType, TypeRegistry};
pub use service::{
    ApproveResponse, Caller, CheckoutResponse, Discovery, DiscoveryStrategy, HeartbeatResponse,
    OrderDetail, PartsList, ProposeResponse, SubmitPartResponse, SubmitResponse, WorkService,
};
