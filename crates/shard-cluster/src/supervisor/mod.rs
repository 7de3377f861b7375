//! Worker process supervision (parent side)

mod launcher;
mod process_supervisor;

pub use launcher::{CommandLauncher, WorkerControl, WorkerLauncher, WorkerProcess};
pub use process_supervisor::{Inbound, ProcessStatus, ProcessSupervisor, SupervisorConfig};
