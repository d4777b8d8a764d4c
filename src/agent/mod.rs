//! Coordination agents: run execution, scheduling, and the execution-mode gate.

pub mod eta;
pub mod gate;
pub mod model;
pub mod runner;
pub mod scheduler;

pub use eta::EtaMailer;
pub use gate::{Gate, gate};
pub use model::{
    Agent, AgentRun, DecisionSummary, ExecutionMode, Outcome, RunCounts, RunStatus, TriggerKind,
};
pub use runner::{AgentRunner, RunHandle};
pub use scheduler::{Scheduler, SchedulerHandle};
