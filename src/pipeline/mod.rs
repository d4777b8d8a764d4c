//! Two-tier decision pipeline.
//!
//! Every site checked by a run flows through:
//! 1. `RuleEngine::evaluate()`: deterministic rules, no model
//! 2. `Advisor::propose()`: ambiguous proposals only
//! 3. `advisor::settle()`: fold the decision into a `Plan`
//!
//! Plans are then gated by the agent's execution mode in `agent::gate`.

pub mod advisor;
pub mod rules;
pub mod types;

pub use advisor::{Advice, Advisor, AdvisorContext, Decision, HeuristicAdvisor, LlmAdvisor, settle};
pub use rules::{RuleContext, RuleEngine};
pub use types::{ActionKind, Confidence, Plan, PlannedAction, ProposedAction, Tier};
