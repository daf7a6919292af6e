pub mod error;
pub mod id;
pub mod ledger;
pub mod metrics;
pub mod process;
pub mod rpc;
pub mod state;
pub mod task;
pub mod worker;

pub use error::{NodeError, NodeResult};
pub use id::{ActorId, BundleId, JobId, PlacementGroupId, StartupToken, TaskId, WorkerId};
pub use ledger::{Allocation, Quantity, ResourceInstanceLedger, ResourceRequest};
pub use state::{NodeState, WorkerRegistration};
pub use task::{BundleBinding, OwnerAddress, TaskSpec};
pub use worker::{ActorCapable, KillFlag, RpcCapable, WorkerHandle, WorkerKind};
