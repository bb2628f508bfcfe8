//! anadama-grid: dispatching tasks to batch compute systems.
//!
//! The engine talks to every backend through the [`GridQueue`] contract;
//! the submit/poll/reap/retry state machine in [`worker`] is shared, and
//! the [`transport`] module carries tasks into the remote process and
//! results back. SLURM is the reference driver; SGE is the second.

pub mod queue;
pub mod resources;
pub mod sge;
pub mod slurm;
pub mod transport;
pub mod worker;

pub use queue::{GridError, GridMonitor, GridQueue, GridScript, QueueStatus, ScriptRequest};
pub use resources::{scale_memory, scale_time, GridResources, GRID_RETRY_LIMIT};
pub use sge::SgeQueue;
pub use slurm::SlurmQueue;
pub use transport::{
    maybe_run_work_unit, FunctionRegistry, TransportError, WireAction, WorkResult, WorkUnit,
    WORK_UNIT_FLAG,
};
pub use worker::{execute_on_grid, StatusSink};
