//! Execution-mode gate: what an agent may do with a settled plan.

use crate::agent::model::ExecutionMode;
use crate::pipeline::{Plan, PlannedAction, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Apply,
    /// Logged as a draft for a coordinator to act on.
    Draft,
    /// Logged only. Dismissals and observations never have side effects.
    Record,
}

pub fn gate(mode: ExecutionMode, plan: &Plan) -> Gate {
    match (&plan.action, mode) {
        (PlannedAction::Dismiss { .. } | PlannedAction::Observe { .. }, _) => Gate::Record,
        (_, ExecutionMode::DraftOnly) => Gate::Draft,
        (PlannedAction::RequestEta { .. }, ExecutionMode::AutoEmail) => Gate::Apply,
        (PlannedAction::Escalate { .. }, ExecutionMode::AutoEmail) => match plan.tier {
            Tier::Rule => Gate::Apply,
            Tier::Advisor => Gate::Draft,
        },
        (_, ExecutionMode::FullAuto) => Gate::Apply,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logistics::{IssueType, Priority};

    fn plan(action: PlannedAction, tier: Tier) -> Plan {
        Plan {
            action,
            tier,
            site_id: "s1".into(),
            load_id: None,
            carrier_id: None,
            rule: "test",
        }
    }

    fn escalate() -> PlannedAction {
        PlannedAction::Escalate {
            issue_type: IssueType::InventoryRisk,
            priority: Priority::Critical,
            description: "runs out in 6h".into(),
        }
    }

    fn request() -> PlannedAction {
        PlannedAction::RequestEta {
            po_number: "PO-2026-001".into(),
        }
    }

    #[test]
    fn draft_only_applies_nothing() {
        for action in [escalate(), request()] {
            for tier in [Tier::Rule, Tier::Advisor] {
                assert_eq!(gate(ExecutionMode::DraftOnly, &plan(action.clone(), tier)), Gate::Draft);
            }
        }
    }

    #[test]
    fn auto_email_drafts_advisor_escalations() {
        let mode = ExecutionMode::AutoEmail;
        assert_eq!(gate(mode, &plan(request(), Tier::Rule)), Gate::Apply);
        assert_eq!(gate(mode, &plan(escalate(), Tier::Rule)), Gate::Apply);
        assert_eq!(gate(mode, &plan(escalate(), Tier::Advisor)), Gate::Draft);
    }

    #[test]
    fn full_auto_applies_everything() {
        assert_eq!(gate(ExecutionMode::FullAuto, &plan(escalate(), Tier::Advisor)), Gate::Apply);
        assert_eq!(gate(ExecutionMode::FullAuto, &plan(request(), Tier::Rule)), Gate::Apply);
    }

    #[test]
    fn dismissals_and_observations_are_recorded() {
        let dismiss = PlannedAction::Dismiss {
            reason: "no risk".into(),
        };
        let observe = PlannedAction::Observe {
            note: "carrier flagged".into(),
        };
        for mode in [
            ExecutionMode::DraftOnly,
            ExecutionMode::AutoEmail,
            ExecutionMode::FullAuto,
        ] {
            assert_eq!(gate(mode, &plan(dismiss.clone(), Tier::Advisor)), Gate::Record);
            assert_eq!(gate(mode, &plan(observe.clone(), Tier::Rule)), Gate::Record);
        }
    }
}
