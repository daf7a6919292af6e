use crate::error::NodeResult;
use crate::id::ActorId;
use crate::ledger::Allocation;
use crate::rpc::WorkerConnection;

/// Capability of a worker reachable through the communication layer.
///
/// A single polymorphic worker interface serving every deployment mode
/// would have to make unsupported operations fatal at runtime. Instead, a
/// call site that needs to talk to the worker process bounds on this
/// trait, so "not supported" is the absence of a bound rather than a
/// runtime check.
pub trait RpcCapable {
    /// Stores the opaque client capability obtained from the communication
    /// layer once the worker is assigned.
    fn connect(&mut self, connection: Box<dyn WorkerConnection>);

    fn connection(&self) -> Option<&dyn WorkerConnection>;
}

/// Capability of a worker hosting an actor.
///
/// The lifetime allocation slot lives here rather than on the core handle
/// API: resources scoped to the worker's whole existence are an actor
/// concern, and keeping them behind this trait makes the ownership scope
/// visible at the call site.
pub trait ActorCapable {
    /// Binds the worker to an actor. Valid at most once; rebinding a worker
    /// to a different actor is a scheduling bug.
    fn assign_actor(&mut self, actor_id: ActorId) -> NodeResult<()>;

    fn actor_id(&self) -> Option<ActorId>;

    fn set_lifetime_allocated_instances(&mut self, allocation: Allocation);

    fn lifetime_allocated_instances(&self) -> Option<&Allocation>;

    /// Drops the handle's reference to the lifetime allocation.
    /// The ledger must have released the allocation already; clearing the
    /// reference is the separate, later step.
    fn clear_lifetime_allocated_instances(&mut self);
}
