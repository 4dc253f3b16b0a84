//! Data-plane selection and transfer lifecycle core
//!
//! Chooses which registered data-plane instance executes a transfer and
//! tracks each transfer from creation to a terminal state.
//!
//! - [`registry::InstanceRegistry`] keeps instances and their heartbeats;
//!   only instances heard from within the liveness window are candidates
//! - [`strategy`] holds the pluggable selection policies (random,
//!   round-robin) behind [`strategy::SelectionStrategy`]
//! - [`selector::SelectorService`] answers "which instance?" and drives
//!   re-selection after failures
//! - [`tracker::TransferTracker`] enforces the lifecycle
//!   `Created → Selected → InProgress → Completed | Failed | Cancelled`
//!
//! # Example
//!
//! ```
//! use dpf_core_selector::prelude::*;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(InstanceRegistry::new(RegistryConfig::default()));
//! let tracker = Arc::new(TransferTracker::new(TrackerConfig::default()));
//! let strategies = StrategyRegistry::with_builtin(ROUND_ROBIN, None).unwrap();
//! let service = SelectorService::new(registry, tracker, strategies);
//!
//! service
//!     .register(
//!         DataPlaneInstance::new("dp-a")
//!             .with_source_type("HttpData")
//!             .with_destination_type("AmazonS3")
//!             .with_transfer_type("push"),
//!     )
//!     .unwrap();
//!
//! let record = service
//!     .initiate(TransferRequest::new("HttpData", "AmazonS3", "push"))
//!     .unwrap();
//! assert_eq!(record.state, TransferState::Selected);
//! assert_eq!(record.instance_id.unwrap().as_str(), "dp-a");
//! ```

pub mod clock;
pub mod error;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod selector;
pub mod strategy;
pub mod tracker;

pub use error::{Result, SelectorError};
pub use model::{DataPlaneInstance, InstanceId, SelectionKey, TransferId, TransferRequest, TypeTag};
pub use selector::{FailureResolution, SelectionResult, SelectorService};
pub use tracker::{TransferRecord, TransferState};

/// Commonly used types
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::error::{Result, SelectorError};
    pub use crate::metrics::{Metric, MetricKind, MetricsSink, NoopMetrics};
    pub use crate::model::{
        DataPlaneInstance, InstanceId, SelectionKey, TransferId, TransferRequest, TypeTag,
    };
    pub use crate::registry::{InstanceRegistry, RegistryConfig};
    pub use crate::selector::{FailureResolution, SelectionResult, SelectorService};
    pub use crate::strategy::{
        RandomStrategy, RoundRobinStrategy, SelectionStrategy, StrategyRegistry, RANDOM,
        ROUND_ROBIN,
    };
    pub use crate::tracker::{
        FailureOutcome, TrackerConfig, TransferListener, TransferRecord, TransferState,
        TransferTracker, TransitionEvent,
    };
}
