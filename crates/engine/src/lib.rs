//! Engine layer: the checkpoint coordinator, the reclaimer, cold-start
//! recovery, and the durable runtime that wires the whole persistence core
//! together.

pub mod coordinator;
pub mod policy;
pub mod reclaimer;
pub mod recovery;
pub mod runtime;

pub use coordinator::{CheckpointCoordinator, CoordinatorStats, DirtyRange};
pub use policy::CheckpointPolicy;
pub use reclaimer::Reclaimer;
pub use recovery::{cold_start, RecoveryReport};
pub use runtime::{DurableRuntime, Paths};
