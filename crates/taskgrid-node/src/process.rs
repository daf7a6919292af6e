use std::fmt::Debug;

/// An opaque handle to a worker process, supplied by the external process
/// supervisor at registration time. Process creation and signaling are not
/// this crate's concern; the core only needs to observe liveness when
/// confirming a dead worker.
pub trait ProcessHandle: Debug + Send + 'static {
    /// The operating-system process id.
    fn id(&self) -> u32;

    /// Whether the process is still running.
    fn is_alive(&self) -> bool;
}
