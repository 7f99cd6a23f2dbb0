// Drift repair between persisted session state and live infrastructure.
// Runs at startup and on demand; every mutation goes through the same
// guarded paths as normal traffic.

pub mod containers;
pub mod running;

pub use containers::{reconcile_containers, ContainerReconcileReport};
pub use running::{reconcile_running, AgentStatusProbe, HttpAgentProbe, RunningReconcileReport};
