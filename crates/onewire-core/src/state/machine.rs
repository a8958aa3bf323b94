//! Adapter-presence retry ladder.
//!
//! The ladder only decides which recovery step comes next; the adapter
//! performs the step and reports whether the verify round trip passed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Recovery action the adapter must perform before the next verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderStep {
    /// Break plus timing byte at the default baud.
    MasterReset,
    /// Master reset followed by a DTR/RTS power cycle.
    PowerReset,
}

impl fmt::Display for LadderStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LadderStep::MasterReset => write!(f, "MASTER_RESET"),
            LadderStep::PowerReset => write!(f, "POWER_RESET"),
        }
    }
}

/// Where the ladder currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceState {
    /// Nothing attempted yet.
    #[default]
    Unknown,
    /// Step `rung` is being performed.
    Resetting { rung: usize, step: LadderStep },
    /// Waiting on the verify result for `rung`.
    Verifying { rung: usize },
    Present,
    Absent,
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceState::Unknown => write!(f, "UNKNOWN"),
            PresenceState::Resetting { rung, step } => write!(f, "{step}[{rung}]"),
            PresenceState::Verifying { rung } => write!(f, "VERIFY[{rung}]"),
            PresenceState::Present => write!(f, "PRESENT"),
            PresenceState::Absent => write!(f, "ABSENT"),
        }
    }
}

impl PresenceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PresenceState::Present | PresenceState::Absent)
    }
}

/// How many recovery steps to try before declaring the adapter absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LadderPolicy {
    pub master_reset_attempts: usize,
    /// Finish with a DTR/RTS power cycle.
    pub power_reset: bool,
}

impl Default for LadderPolicy {
    fn default() -> Self {
        Self {
            master_reset_attempts: 2,
            power_reset: true,
        }
    }
}

impl LadderPolicy {
    fn steps(&self) -> Vec<LadderStep> {
        let mut steps = vec![LadderStep::MasterReset; self.master_reset_attempts];
        if self.power_reset {
            steps.push(LadderStep::PowerReset);
        }
        steps
    }
}

/// One run of the ladder, from `Unknown` to `Present` or `Absent`.
#[derive(Debug)]
pub struct PresenceLadder {
    state: PresenceState,
    steps: Vec<LadderStep>,
    rung: usize,
}

impl PresenceLadder {
    pub fn new(policy: LadderPolicy) -> Self {
        Self {
            state: PresenceState::Unknown,
            steps: policy.steps(),
            rung: 0,
        }
    }

    pub fn state(&self) -> PresenceState {
        self.state
    }

    fn goto_state(&mut self, new_state: PresenceState) {
        tracing::debug!(from = %self.state, to = %new_state, "Presence ladder transition");
        self.state = new_state;
    }

    /// Next step to perform, or `None` once the ladder is terminal.
    pub fn advance(&mut self) -> Option<LadderStep> {
        if self.state.is_terminal() {
            return None;
        }
        match self.steps.get(self.rung).copied() {
            Some(step) => {
                self.goto_state(PresenceState::Resetting {
                    rung: self.rung,
                    step,
                });
                Some(step)
            }
            None => {
                self.goto_state(PresenceState::Absent);
                None
            }
        }
    }

    /// Report the verify result for the step just performed.
    ///
    /// Returns true once the ladder has reached a terminal state.
    pub fn verified(&mut self, ok: bool) -> bool {
        self.goto_state(PresenceState::Verifying { rung: self.rung });
        if ok {
            self.goto_state(PresenceState::Present);
            return true;
        }
        self.rung += 1;
        if self.rung >= self.steps.len() {
            self.goto_state(PresenceState::Absent);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(policy: LadderPolicy, outcomes: &[bool]) -> (Vec<LadderStep>, PresenceState) {
        let mut ladder = PresenceLadder::new(policy);
        let mut performed = Vec::new();
        let mut outcomes = outcomes.iter();
        while let Some(step) = ladder.advance() {
            performed.push(step);
            if ladder.verified(*outcomes.next().unwrap_or(&false)) {
                break;
            }
        }
        (performed, ladder.state())
    }

    #[test]
    fn test_first_verify_succeeds() {
        let (steps, state) = run(LadderPolicy::default(), &[true]);
        assert_eq!(steps, vec![LadderStep::MasterReset]);
        assert_eq!(state, PresenceState::Present);
    }

    #[test]
    fn test_power_reset_is_last_resort() {
        let (steps, state) = run(LadderPolicy::default(), &[false, false, true]);
        assert_eq!(steps, vec![
            LadderStep::MasterReset,
            LadderStep::MasterReset,
            LadderStep::PowerReset
        ]);
        assert_eq!(state, PresenceState::Present);
    }

    #[test]
    fn test_exhausted_ladder_is_absent() {
        let (steps, state) = run(LadderPolicy::default(), &[false, false, false]);
        assert_eq!(steps.len(), 3);
        assert_eq!(state, PresenceState::Absent);
    }

    #[test]
    fn test_terminal_ladder_does_not_advance() {
        let mut ladder = PresenceLadder::new(LadderPolicy::default());
        ladder.advance();
        assert!(ladder.verified(true));
        assert_eq!(ladder.advance(), None);
        assert_eq!(ladder.state(), PresenceState::Present);
    }

    #[test]
    fn test_empty_policy_is_immediately_absent() {
        let policy = LadderPolicy {
            master_reset_attempts: 0,
            power_reset: false,
        };
        let (steps, state) = run(policy, &[]);
        assert!(steps.is_empty());
        assert_eq!(state, PresenceState::Absent);
    }
}
