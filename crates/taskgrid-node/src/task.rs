use crate::id::{ActorId, BundleId, JobId, PlacementGroupId, TaskId};
use crate::ledger::ResourceRequest;

/// The address of the caller that owns a task.
/// The owner must be notified when the worker running the task fails,
/// so that lineage-based task retry can take place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerAddress {
    pub host: String,
    pub port: u16,
}

/// A placement-group bundle reservation recorded on a worker once the
/// scheduling decision has bound it locally. Negotiating the bundle across
/// the cluster is not this crate's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleBinding {
    pub bundle_id: BundleId,
    pub placement_group_id: PlacementGroupId,
}

/// The specification of a task handed to a worker, as supplied by the
/// cluster-wide scheduler.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub task_id: TaskId,
    pub job_id: JobId,
    /// Set when the task creates or runs on an actor.
    pub actor_id: Option<ActorId>,
    pub owner: OwnerAddress,
    pub bundle: Option<BundleBinding>,
    /// Non-empty only if the task ultimately belongs to a detached actor.
    /// Garbage collection of transient actors must not reclaim workers
    /// rooted at a detached actor.
    pub root_detached_actor_id: Option<ActorId>,
    /// Resources held for the duration of this task only.
    pub resources: ResourceRequest,
    /// Resources held for the lifetime of the worker. Only an actor
    /// creation task carries a non-empty lifetime request.
    pub lifetime_resources: ResourceRequest,
}

impl TaskSpec {
    pub fn is_actor_task(&self) -> bool {
        self.actor_id.is_some()
    }

    pub fn is_detached_actor(&self) -> bool {
        self.root_detached_actor_id.is_some()
    }
}
