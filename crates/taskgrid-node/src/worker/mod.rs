pub mod capability;
pub mod handle;
pub mod kill;

pub use capability::{ActorCapable, RpcCapable};
pub use handle::{WorkerHandle, WorkerKind};
pub use kill::{KillFlag, KillMode};
