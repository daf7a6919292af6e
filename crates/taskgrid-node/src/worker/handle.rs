use tokio::time::Instant;

use crate::error::{NodeError, NodeResult};
use crate::id::{ActorId, JobId, StartupToken, TaskId, WorkerId};
use crate::ledger::{Allocation, ResourceRequest};
use crate::process::ProcessHandle;
use crate::rpc::WorkerConnection;
use crate::task::{BundleBinding, OwnerAddress, TaskSpec};
use crate::worker::capability::{ActorCapable, RpcCapable};
use crate::worker::kill::{KillFlag, KillMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// The driver process of a job.
    Driver,
    /// A generic execution worker.
    Worker,
}

/// One leased execution-worker process and everything the node agent
/// knows about it: identity, current task assignment, resource holdings,
/// and lifecycle state.
///
/// A handle is owned by the scheduling loop and mutated only there, with
/// one exception: the kill flag, which may be written from any execution
/// context (see [`KillFlag`]). Identity fields are fixed at registration
/// and never change for the process lifetime.
#[derive(Debug)]
pub struct WorkerHandle {
    worker_id: WorkerId,
    kind: WorkerKind,
    process: Box<dyn ProcessHandle>,
    port: u16,
    startup_token: StartupToken,
    /// Hash of the runtime environment the process was started with.
    /// The scheduler only hands a worker tasks built for the same
    /// environment.
    runtime_env_hash: u64,
    connection: Option<Box<dyn WorkerConnection>>,

    task: Option<TaskSpec>,
    task_id: Option<TaskId>,
    job_id: Option<JobId>,
    owner: Option<OwnerAddress>,
    bundle: Option<BundleBinding>,
    root_detached_actor_id: Option<ActorId>,
    task_assign_time: Option<Instant>,
    actor_id: Option<ActorId>,

    /// Resources committed to the current task only.
    allocated_instances: Option<Allocation>,
    /// Resources committed for the worker's entire existence (actor scope).
    lifetime_allocated_instances: Option<Allocation>,

    blocked: bool,
    kill: KillFlag,
    dead: bool,

    is_gpu: Option<bool>,
    is_actor_worker: Option<bool>,
}

impl WorkerHandle {
    pub fn new(
        worker_id: WorkerId,
        kind: WorkerKind,
        process: Box<dyn ProcessHandle>,
        port: u16,
        startup_token: StartupToken,
        runtime_env_hash: u64,
    ) -> Self {
        Self {
            worker_id,
            kind,
            process,
            port,
            startup_token,
            runtime_env_hash,
            connection: None,
            task: None,
            task_id: None,
            job_id: None,
            owner: None,
            bundle: None,
            root_detached_actor_id: None,
            task_assign_time: None,
            actor_id: None,
            allocated_instances: None,
            lifetime_allocated_instances: None,
            blocked: false,
            kill: KillFlag::new(),
            dead: false,
            is_gpu: None,
            is_actor_worker: None,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn startup_token(&self) -> StartupToken {
        self.startup_token
    }

    pub fn runtime_env_hash(&self) -> u64 {
        self.runtime_env_hash
    }

    pub fn process(&self) -> &dyn ProcessHandle {
        self.process.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.task.is_none()
    }

    /// Hands a task to the worker.
    ///
    /// Valid only from the idle state. The assignment metadata (task id,
    /// job id, owner address, bundle binding, root detached actor id,
    /// timestamp) is copied from the task specification as one logical
    /// step, so no observer on the scheduling loop can see a partially
    /// applied assignment.
    pub fn assign_task(&mut self, task: TaskSpec) -> NodeResult<()> {
        if self.dead {
            return Err(NodeError::InvalidWorkerState(format!(
                "cannot assign a task to dead worker {}",
                self.worker_id
            )));
        }
        if let Some(current) = &self.task {
            return Err(NodeError::AlreadyAssigned {
                worker_id: self.worker_id,
                task_id: current.task_id,
            });
        }
        if self.is_gpu.is_none() {
            let gpu = |request: &ResourceRequest| {
                request
                    .get("GPU")
                    .is_some_and(|quantities| quantities.iter().any(|q| !q.is_zero()))
            };
            self.is_gpu = Some(gpu(&task.resources) || gpu(&task.lifetime_resources));
        }
        if self.is_actor_worker.is_none() {
            self.is_actor_worker = Some(task.is_actor_task());
        }
        self.task_id = Some(task.task_id);
        self.job_id = Some(task.job_id);
        self.owner = Some(task.owner.clone());
        self.bundle = task.bundle;
        self.root_detached_actor_id = task.root_detached_actor_id;
        self.task_assign_time = Some(Instant::now());
        self.task = Some(task);
        Ok(())
    }

    /// Returns the finished task and resets the handle to idle.
    /// The job id is retained so the worker stays attributable to its job
    /// while it sits in the idle pool. The lifetime allocation slot is not
    /// touched.
    pub fn complete_task(&mut self) -> NodeResult<TaskSpec> {
        let Some(task) = self.task.take() else {
            return Err(NodeError::InvalidWorkerState(format!(
                "worker {} has no task to complete",
                self.worker_id
            )));
        };
        self.task_id = None;
        self.owner = None;
        self.bundle = None;
        self.root_detached_actor_id = None;
        self.task_assign_time = None;
        self.blocked = false;
        Ok(task)
    }

    /// Records that the current task is waiting on a dependency and has
    /// voluntarily given up its execution slot. The worker keeps all of
    /// its resources so it can resume instantly once unblocked.
    pub fn mark_blocked(&mut self) -> NodeResult<()> {
        self.ensure_assigned("mark a worker without a task as blocked")?;
        self.blocked = true;
        Ok(())
    }

    pub fn mark_unblocked(&mut self) -> NodeResult<()> {
        self.ensure_assigned("unblock a worker without a task")?;
        self.blocked = false;
        Ok(())
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    fn ensure_assigned(&self, operation: &str) -> NodeResult<()> {
        if self.task.is_none() {
            return Err(NodeError::InvalidWorkerState(format!(
                "cannot {operation} (worker {})",
                self.worker_id
            )));
        }
        Ok(())
    }

    pub fn set_allocated_instances(&mut self, allocation: Allocation) {
        self.allocated_instances = Some(allocation);
    }

    pub fn allocated_instances(&self) -> Option<&Allocation> {
        self.allocated_instances.as_ref()
    }

    /// Drops the handle's reference to the per-task allocation.
    /// The ledger must have released the allocation already; clearing the
    /// reference is the separate, later step, so that there is no window
    /// where the resources appear both allocated and free.
    pub fn clear_allocated_instances(&mut self) {
        self.allocated_instances = None;
    }

    /// The combined per-task and lifetime holdings, for reporting.
    pub fn reported_allocation(&self) -> Option<Allocation> {
        match (&self.allocated_instances, &self.lifetime_allocated_instances) {
            (Some(task), Some(lifetime)) => Some(task.merge(lifetime)),
            (Some(task), None) => Some(task.clone()),
            (None, Some(lifetime)) => Some(lifetime.clone()),
            (None, None) => None,
        }
    }

    /// Requests asynchronous termination of the worker.
    ///
    /// Callable from any execution context and never fails; concurrent and
    /// repeated requests after the first are no-ops. This only flips the
    /// flag that the scheduling loop polls to initiate teardown; it does
    /// not stop the process.
    pub fn kill_async(&self, force: bool) {
        if self.kill.request(force) {
            log::debug!("kill requested for worker {} (force={force})", self.worker_id);
        }
    }

    /// Whether termination has been requested. The read may be one step
    /// stale; `false` does not imply the worker will remain alive.
    pub fn is_killed(&self) -> bool {
        self.kill.is_killed()
    }

    pub fn kill_mode(&self) -> Option<KillMode> {
        self.kill.mode()
    }

    /// Returns the shared kill flag for delivery to another execution
    /// context.
    pub fn kill_flag(&self) -> KillFlag {
        self.kill.clone()
    }

    /// Records that the worker process has confirmably exited.
    ///
    /// This is a trusted internal signal, not a user-facing operation:
    /// calling it while the process is alive, or calling it twice, is a
    /// programming error and aborts.
    pub fn mark_dead(&mut self) {
        assert!(
            !self.dead,
            "worker {} has already been marked dead",
            self.worker_id
        );
        assert!(
            !self.process.is_alive(),
            "worker {} cannot be marked dead while its process is alive",
            self.worker_id
        );
        self.dead = true;
    }

    /// Whether the process exit has been confirmed. This is distinct from
    /// `is_killed`: a kill request is advisory until the process actually
    /// exits.
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn task(&self) -> Option<&TaskSpec> {
        self.task.as_ref()
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    pub fn job_id(&self) -> Option<JobId> {
        self.job_id
    }

    pub fn owner(&self) -> Option<&OwnerAddress> {
        self.owner.as_ref()
    }

    pub fn bundle(&self) -> Option<BundleBinding> {
        self.bundle
    }

    pub fn root_detached_actor_id(&self) -> Option<ActorId> {
        self.root_detached_actor_id
    }

    pub fn task_assign_time(&self) -> Option<Instant> {
        self.task_assign_time
    }

    pub fn is_gpu(&self) -> Option<bool> {
        self.is_gpu
    }

    pub fn is_actor_worker(&self) -> Option<bool> {
        self.is_actor_worker
    }
}

impl RpcCapable for WorkerHandle {
    fn connect(&mut self, connection: Box<dyn WorkerConnection>) {
        self.connection = Some(connection);
    }

    fn connection(&self) -> Option<&dyn WorkerConnection> {
        self.connection.as_deref()
    }
}

impl ActorCapable for WorkerHandle {
    fn assign_actor(&mut self, actor_id: ActorId) -> NodeResult<()> {
        match self.actor_id {
            None => {
                self.actor_id = Some(actor_id);
                self.is_actor_worker = Some(true);
                Ok(())
            }
            Some(existing) if existing == actor_id => Ok(()),
            Some(existing) => Err(NodeError::InvalidWorkerState(format!(
                "worker {} is already bound to actor {existing}",
                self.worker_id
            ))),
        }
    }

    fn actor_id(&self) -> Option<ActorId> {
        self.actor_id
    }

    fn set_lifetime_allocated_instances(&mut self, allocation: Allocation) {
        self.lifetime_allocated_instances = Some(allocation);
    }

    fn lifetime_allocated_instances(&self) -> Option<&Allocation> {
        self.lifetime_allocated_instances.as_ref()
    }

    fn clear_lifetime_allocated_instances(&mut self) {
        self.lifetime_allocated_instances = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use rust_decimal_macros::dec;

    use super::*;
    use crate::process::testing::StubProcess;
    use crate::rpc::testing::StubConnection;
    use crate::task::testing::{actor_task, task};

    fn worker(id: u64) -> WorkerHandle {
        WorkerHandle::new(
            WorkerId::from(id),
            WorkerKind::Worker,
            Box::new(StubProcess::new(4000 + id as u32)),
            1234,
            StartupToken::from(id),
            42,
        )
    }

    #[test]
    fn test_identity_is_fixed_at_construction() {
        let worker = worker(1);
        assert_eq!(worker.worker_id(), WorkerId::from(1));
        assert_eq!(worker.kind(), WorkerKind::Worker);
        assert_eq!(worker.port(), 1234);
        assert_eq!(worker.startup_token(), StartupToken::from(1));
        assert_eq!(worker.runtime_env_hash(), 42);
    }

    #[test]
    fn test_assign_task_records_metadata_in_one_step() {
        let mut worker = worker(1);
        assert!(worker.is_idle());
        worker.assign_task(task(10, 20, dec!(1))).unwrap();
        assert!(!worker.is_idle());
        assert_eq!(worker.task_id(), Some(TaskId::from(10)));
        assert_eq!(worker.job_id(), Some(JobId::from(20)));
        assert_eq!(worker.owner().unwrap().host, "10.0.0.1");
        assert!(worker.task_assign_time().is_some());
    }

    #[test]
    fn test_assign_task_rejects_busy_worker() {
        let mut worker = worker(1);
        worker.assign_task(task(10, 20, dec!(1))).unwrap();
        let result = worker.assign_task(task(11, 20, dec!(1)));
        assert!(matches!(
            result,
            Err(NodeError::AlreadyAssigned { task_id, .. }) if task_id == TaskId::from(10)
        ));
    }

    #[test]
    fn test_complete_task_resets_to_idle_but_keeps_job_id() {
        let mut worker = worker(1);
        worker.assign_task(task(10, 20, dec!(1))).unwrap();
        let finished = worker.complete_task().unwrap();
        assert_eq!(finished.task_id, TaskId::from(10));
        assert!(worker.is_idle());
        assert_eq!(worker.task_id(), None);
        assert_eq!(worker.owner(), None);
        assert_eq!(worker.job_id(), Some(JobId::from(20)));
        // The worker is immediately reusable.
        worker.assign_task(task(11, 21, dec!(1))).unwrap();
        assert_eq!(worker.job_id(), Some(JobId::from(21)));
    }

    #[test]
    fn test_complete_task_when_idle_is_an_error() {
        let mut worker = worker(1);
        assert!(matches!(
            worker.complete_task(),
            Err(NodeError::InvalidWorkerState(_))
        ));
    }

    #[test]
    fn test_blocking_requires_an_assignment() {
        let mut worker = worker(1);
        assert!(worker.mark_blocked().is_err());
        worker.assign_task(task(10, 20, dec!(1))).unwrap();
        worker.mark_blocked().unwrap();
        assert!(worker.is_blocked());
        worker.mark_unblocked().unwrap();
        assert!(!worker.is_blocked());
    }

    #[test]
    fn test_classification_hints_cached_at_first_assignment() {
        let mut worker = worker(1);
        assert_eq!(worker.is_gpu(), None);
        assert_eq!(worker.is_actor_worker(), None);
        worker.assign_task(actor_task(10, 20, 7, dec!(0.5))).unwrap();
        assert_eq!(worker.is_gpu(), Some(true));
        assert_eq!(worker.is_actor_worker(), Some(true));
        worker.complete_task().unwrap();
        // A later CPU-only task does not recompute the hints.
        worker.assign_task(task(11, 20, dec!(1))).unwrap();
        assert_eq!(worker.is_gpu(), Some(true));
        assert_eq!(worker.is_actor_worker(), Some(true));
    }

    #[test]
    fn test_kill_async_is_idempotent() {
        let worker = worker(1);
        assert!(!worker.is_killed());
        worker.kill_async(false);
        worker.kill_async(true);
        assert!(worker.is_killed());
        assert_eq!(worker.kill_mode(), Some(KillMode::Graceful));
    }

    #[test]
    fn test_mark_dead_after_process_exit() {
        let process = StubProcess::new(4001);
        let exited = process.exit_switch();
        let mut worker = WorkerHandle::new(
            WorkerId::from(1),
            WorkerKind::Worker,
            Box::new(process),
            1234,
            StartupToken::from(1),
            42,
        );
        exited.store(false, Ordering::SeqCst);
        worker.mark_dead();
        assert!(worker.is_dead());
    }

    #[test]
    #[should_panic(expected = "process is alive")]
    fn test_mark_dead_with_live_process_panics() {
        let mut worker = worker(1);
        worker.mark_dead();
    }

    #[test]
    #[should_panic(expected = "already been marked dead")]
    fn test_mark_dead_twice_panics() {
        let process = StubProcess::new(4001);
        let exited = process.exit_switch();
        let mut worker = WorkerHandle::new(
            WorkerId::from(1),
            WorkerKind::Worker,
            Box::new(process),
            1234,
            StartupToken::from(1),
            42,
        );
        exited.store(false, Ordering::SeqCst);
        worker.mark_dead();
        worker.mark_dead();
    }

    #[test]
    fn test_kill_request_is_distinct_from_dead() {
        let worker = worker(1);
        worker.kill_async(false);
        assert!(worker.is_killed());
        assert!(!worker.is_dead());
    }

    #[test]
    fn test_actor_binding_is_one_shot() {
        let mut worker = worker(1);
        worker.assign_actor(ActorId::from(5)).unwrap();
        assert_eq!(ActorCapable::actor_id(&worker), Some(ActorId::from(5)));
        worker.assign_actor(ActorId::from(5)).unwrap();
        assert!(worker.assign_actor(ActorId::from(6)).is_err());
    }

    #[test]
    fn test_connection_capability() {
        let mut worker = worker(1);
        assert!(worker.connection().is_none());
        worker.connect(Box::new(StubConnection::new(1234)));
        let connection = worker.connection().unwrap();
        assert_eq!(connection.options().port, 1234);
    }
}
