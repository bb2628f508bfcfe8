//! anadama: an incremental task-graph execution engine.
//!
//! Declare units of work with tracked inputs, outputs, and actions; the
//! engine builds a DAG, skips whatever is already up to date against the
//! persisted fingerprint store, and dispatches the rest over local
//! workers and (optionally) a compute grid.
//!
//! ```no_run
//! use anadama::{GoOptions, Workflow};
//!
//! let mut wf = Workflow::new();
//! wf.already_exists(["input.fastq"]).unwrap();
//! let clean = wf
//!     .task()
//!     .sh("clean_reads [depends[0]] > [targets[0]]")
//!     .depend("input.fastq")
//!     .target("clean.fastq")
//!     .name("clean")
//!     .register()
//!     .unwrap();
//! wf.task()
//!     .sh("assemble [depends[0]] > [targets[0]]")
//!     .depend(&clean)
//!     .depend("clean.fastq")
//!     .target("contigs.fasta")
//!     .name("assemble")
//!     .register()
//!     .unwrap();
//! wf.go(GoOptions::default()).unwrap();
//! ```

mod container;
pub mod config;
pub mod helpers;
pub mod pattern;
pub mod reporters;
mod runner;
mod task;
mod workflow;

pub use config::{init_logging, init_logging_to_file, Configuration};
pub use container::TaskContainer;
pub use reporters::{Reporter, ReporterGroup, TracingReporter};
pub use task::{Action, Dependency, Task, TaskNo, TaskResult};
pub use workflow::{GoOptions, Input, RunSummary, TaskBuilder, Workflow, WorkflowError};

pub use anadama_backend::{Backend, BackendError};
pub use anadama_grid::{
    FunctionRegistry, GridQueue, GridResources, SgeQueue, SlurmQueue, GRID_RETRY_LIMIT,
};
pub use anadama_tracked::{Fingerprint, Tracked, TrackedInterner};
