use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{NodeError, NodeResult};
use crate::id::{StartupToken, WorkerId};
use crate::ledger::{Quantity, ResourceInstanceLedger};
use crate::metrics::MetricsSink;
use crate::process::ProcessHandle;
use crate::task::{OwnerAddress, TaskSpec};
use crate::worker::capability::ActorCapable;
use crate::worker::handle::{WorkerHandle, WorkerKind};

/// The registration data supplied by the external process supervisor when
/// a worker process starts up.
pub struct WorkerRegistration {
    pub worker_id: WorkerId,
    pub process: Box<dyn ProcessHandle>,
    pub port: u16,
    pub startup_token: StartupToken,
    pub runtime_env_hash: u64,
    pub kind: WorkerKind,
}

/// The node-local live-worker table.
///
/// Owned by the scheduling loop; all mutation happens single-threaded
/// here, except for kill flags handed out to other execution contexts.
/// The table delegates all resource math to the ledger and emits named
/// events to the metrics sink.
pub struct NodeState {
    workers: HashMap<WorkerId, WorkerHandle>,
    /// Worker ids that have ever been registered. An id is never issued
    /// to a second live handle.
    retired: HashSet<WorkerId>,
    ledger: ResourceInstanceLedger,
    metrics: Arc<dyn MetricsSink>,
}

impl NodeState {
    pub fn new(capacity: BTreeMap<String, Vec<Quantity>>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            workers: HashMap::new(),
            retired: HashSet::new(),
            ledger: ResourceInstanceLedger::new(capacity),
            metrics,
        }
    }

    pub fn ledger(&self) -> &ResourceInstanceLedger {
        &self.ledger
    }

    /// Adds a newly started worker process to the live table.
    /// The identity fields (id, process handle, port, startup token) are
    /// fixed here for the lifetime of the process.
    pub fn register_worker(&mut self, registration: WorkerRegistration) -> NodeResult<WorkerId> {
        let WorkerRegistration {
            worker_id,
            process,
            port,
            startup_token,
            runtime_env_hash,
            kind,
        } = registration;
        if self.workers.contains_key(&worker_id) || self.retired.contains(&worker_id) {
            return Err(NodeError::InvalidWorkerState(format!(
                "worker id {worker_id} has already been issued"
            )));
        }
        let handle = WorkerHandle::new(
            worker_id,
            kind,
            process,
            port,
            startup_token,
            runtime_env_hash,
        );
        self.workers.insert(worker_id, handle);
        self.metrics.counter("node_worker_registrations", 1, &[]);
        debug!("registered worker {worker_id} on port {port}");
        Ok(worker_id)
    }

    pub fn get_worker(&self, worker_id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(&worker_id)
    }

    pub fn get_worker_mut(&mut self, worker_id: WorkerId) -> Option<&mut WorkerHandle> {
        self.workers.get_mut(&worker_id)
    }

    pub fn list_workers(&self) -> Vec<(WorkerId, &WorkerHandle)> {
        self.workers
            .iter()
            .map(|(&worker_id, worker)| (worker_id, worker))
            .collect()
    }

    /// Workers eligible for a new assignment: idle, not being killed,
    /// and not dead.
    pub fn idle_workers(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|(_, worker)| worker.is_idle() && !worker.is_killed() && !worker.is_dead())
            .map(|(&worker_id, _)| worker_id)
            .collect()
    }

    pub fn count_active_workers(&self) -> usize {
        self.workers
            .values()
            .filter(|worker| !worker.is_dead())
            .count()
    }

    /// Binds a task to a worker: reserves its resources in the ledger,
    /// then applies the handle mutation. For the first assignment of an
    /// actor worker, the lifetime resource request is reserved as well.
    /// If any step fails, every reservation made here is rolled back, so
    /// no partial assignment is ever visible.
    pub fn assign_task(&mut self, worker_id: WorkerId, task: TaskSpec) -> NodeResult<()> {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return Err(NodeError::InvalidWorkerState(format!(
                "worker {worker_id} is not registered"
            )));
        };
        let lifetime = if !task.lifetime_resources.is_empty()
            && worker.lifetime_allocated_instances().is_none()
        {
            Some(self.ledger.allocate(&task.lifetime_resources)?)
        } else {
            None
        };
        let allocation = match self.ledger.allocate(&task.resources) {
            Ok(allocation) => allocation,
            Err(e) => {
                if let Some(lifetime) = &lifetime {
                    let _ = self.ledger.release(lifetime);
                }
                return Err(e);
            }
        };
        let job_id = task.job_id;
        if let Err(e) = worker.assign_task(task) {
            let _ = self.ledger.release(&allocation);
            if let Some(lifetime) = &lifetime {
                let _ = self.ledger.release(lifetime);
            }
            return Err(e);
        }
        worker.set_allocated_instances(allocation);
        if let Some(lifetime) = lifetime {
            worker.set_lifetime_allocated_instances(lifetime);
        }
        self.metrics
            .counter("node_tasks_assigned", 1, &[("job_id", &job_id.to_string())]);
        Ok(())
    }

    /// Completes the current task of a worker: the ledger reclaims the
    /// per-task allocation first, then the handle's reference is cleared,
    /// then the assignment is reset. The lifetime allocation is untouched.
    pub fn finish_task(&mut self, worker_id: WorkerId) -> NodeResult<TaskSpec> {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return Err(NodeError::InvalidWorkerState(format!(
                "worker {worker_id} is not registered"
            )));
        };
        if worker.is_idle() {
            return Err(NodeError::InvalidWorkerState(format!(
                "worker {worker_id} has no task to finish"
            )));
        }
        if let Some(allocation) = worker.allocated_instances() {
            self.ledger.release(allocation)?;
        }
        worker.clear_allocated_instances();
        worker.complete_task()
    }

    /// Handles the supervisor's notification that a worker process has
    /// exited. The handle is marked dead, every resource it held is
    /// returned to the ledger, and the owner address is handed back so the
    /// caller can notify the task owner for lineage-based retry.
    pub fn handle_process_exit(&mut self, worker_id: WorkerId) -> NodeResult<Option<OwnerAddress>> {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return Err(NodeError::InvalidWorkerState(format!(
                "worker {worker_id} is not registered"
            )));
        };
        worker.mark_dead();
        let owner = worker.owner().cloned();
        // Even if a release fails, the dead handle must end up holding
        // nothing; the first error is propagated after the cleanup.
        let mut failure = None;
        if let Some(allocation) = worker.allocated_instances() {
            if let Err(e) = self.ledger.release(allocation) {
                warn!("failed to release task allocation of worker {worker_id}: {e}");
                failure = Some(e);
            }
        }
        worker.clear_allocated_instances();
        if let Some(allocation) = worker.lifetime_allocated_instances() {
            if let Err(e) = self.ledger.release(allocation) {
                warn!("failed to release lifetime allocation of worker {worker_id}: {e}");
                failure.get_or_insert(e);
            }
        }
        worker.clear_lifetime_allocated_instances();
        warn!("worker {worker_id} process exited");
        match failure {
            Some(e) => Err(e),
            None => Ok(owner),
        }
    }

    /// Removes a worker from the live table. Valid only once the process
    /// exit has been confirmed and all resources have been released; the
    /// id is retired and never reissued.
    pub fn remove_worker(&mut self, worker_id: WorkerId) -> NodeResult<WorkerHandle> {
        let Some(worker) = self.workers.get(&worker_id) else {
            return Err(NodeError::InvalidWorkerState(format!(
                "worker {worker_id} is not registered"
            )));
        };
        if !worker.is_dead() {
            return Err(NodeError::InvalidWorkerState(format!(
                "worker {worker_id} cannot be removed before its process has exited"
            )));
        }
        if worker.allocated_instances().is_some() || worker.lifetime_allocated_instances().is_some()
        {
            return Err(NodeError::InvalidWorkerState(format!(
                "worker {worker_id} still holds resources"
            )));
        }
        self.retired.insert(worker_id);
        self.workers
            .remove(&worker_id)
            .ok_or_else(|| NodeError::InternalError(format!("worker {worker_id} disappeared")))
    }

    /// Emits the active-worker gauge and a utilization gauge per resource.
    pub fn emit_metrics(&self) {
        self.metrics.gauge(
            "node_active_workers",
            self.count_active_workers() as f64,
            &[],
        );
        for name in self.ledger.resource_names() {
            if let Some(utilization) = self.ledger.utilization(name) {
                self.metrics
                    .gauge("node_resource_utilization", utilization, &[("resource", name)]);
            }
        }
    }
}
