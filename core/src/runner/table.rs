use crate::episode::RunnerState;
use crate::events::EventKind;

use EventKind::*;

const FROM_IDLE: &[EventKind] = &[Start];
const FROM_INITIALIZING: &[EventKind] = &[Perceive, Plan, Act, Fail];
const FROM_RUNNING: &[EventKind] = &[
    Perceive,
    Plan,
    Act,
    Observe,
    Suspend,
    Complete,
    Fail,
    BudgetWarning,
    BudgetExceeded,
    VerifyComplete,
];
const FROM_PERCEIVING: &[EventKind] = &[PerceiveComplete, Suspend, Fail, BudgetWarning, BudgetExceeded];
const FROM_PLANNING: &[EventKind] = &[PlanComplete, Suspend, Fail, BudgetWarning, BudgetExceeded];
const FROM_ACTING: &[EventKind] = &[ActComplete, Suspend, Fail, BudgetWarning, BudgetExceeded];
const FROM_OBSERVING: &[EventKind] = &[ObserveComplete, Suspend, Fail, BudgetWarning, BudgetExceeded];
const FROM_SUSPENDED: &[EventKind] = &[Resume, Fail];
const TERMINAL: &[EventKind] = &[];

/// Every event accepted in `state`. Anything else is an illegal transition.
pub fn legal_events(state: RunnerState) -> &'static [EventKind] {
    match state {
        RunnerState::Idle => FROM_IDLE,
        RunnerState::Initializing => FROM_INITIALIZING,
        RunnerState::Running => FROM_RUNNING,
        RunnerState::Perceiving => FROM_PERCEIVING,
        RunnerState::Planning => FROM_PLANNING,
        RunnerState::Acting => FROM_ACTING,
        RunnerState::Observing => FROM_OBSERVING,
        RunnerState::Suspended => FROM_SUSPENDED,
        RunnerState::Completed | RunnerState::Failed => TERMINAL,
    }
}

pub fn is_legal(state: RunnerState, event: EventKind) -> bool {
    legal_events(state).contains(&event)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [RunnerState; 10] = [
        RunnerState::Idle,
        RunnerState::Initializing,
        RunnerState::Running,
        RunnerState::Perceiving,
        RunnerState::Planning,
        RunnerState::Acting,
        RunnerState::Observing,
        RunnerState::Suspended,
        RunnerState::Completed,
        RunnerState::Failed,
    ];

    #[test]
    fn terminal_states_accept_nothing() {
        for state in [RunnerState::Completed, RunnerState::Failed] {
            assert!(legal_events(state).is_empty());
        }
    }

    #[test]
    fn only_running_and_phase_states_take_budget_signals() {
        for state in ALL_STATES {
            let expected = matches!(
                state,
                RunnerState::Running
                    | RunnerState::Perceiving
                    | RunnerState::Planning
                    | RunnerState::Acting
                    | RunnerState::Observing
            );
            assert_eq!(is_legal(state, BudgetExceeded), expected, "{state}");
            assert_eq!(is_legal(state, BudgetWarning), expected, "{state}");
        }
    }

    #[test]
    fn fail_is_legal_everywhere_but_idle_and_terminal() {
        for state in ALL_STATES {
            let expected = !matches!(
                state,
                RunnerState::Idle | RunnerState::Completed | RunnerState::Failed
            );
            assert_eq!(is_legal(state, Fail), expected, "{state}");
        }
    }

    #[test]
    fn each_phase_state_only_completes_itself() {
        let pairs = [
            (RunnerState::Perceiving, PerceiveComplete),
            (RunnerState::Planning, PlanComplete),
            (RunnerState::Acting, ActComplete),
            (RunnerState::Observing, ObserveComplete),
        ];
        let completions = [PerceiveComplete, PlanComplete, ActComplete, ObserveComplete];
        for (state, own) in pairs {
            for completion in completions {
                assert_eq!(is_legal(state, completion), completion == own, "{state} {completion}");
            }
        }
    }

    #[test]
    fn suspended_only_resumes_or_fails() {
        assert_eq!(legal_events(RunnerState::Suspended), &[Resume, Fail]);
        assert!(!is_legal(RunnerState::Suspended, Perceive));
        assert!(!is_legal(RunnerState::Initializing, Observe));
        assert!(!is_legal(RunnerState::Initializing, Suspend));
    }
}
