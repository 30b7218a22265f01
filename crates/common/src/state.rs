use monad::{Error, Result};
use std::cell::Cell;

/// Directed-graph state guard.
///
/// States are small integers; the transition table is compiled into one
/// bitmask per source state. The initial state is 0. Transitions not in
/// the graph yield a value error naming both states.
pub struct StateMachine {
    graph: Vec<u64>,
    names: &'static [&'static str],
    state: Cell<usize>,
}

impl StateMachine {
    /// Compile a transition table of (source, allowed destinations).
    /// States must be below 64.
    pub fn new(transitions: &[(usize, &[usize])], names: &'static [&'static str]) -> Self {
        let max_state = transitions
            .iter()
            .flat_map(|(src, dsts)| std::iter::once(*src).chain(dsts.iter().copied()))
            .max()
            .unwrap_or(0);
        assert!(max_state < 64, "state out of range");

        let mut graph = vec![0u64; max_state + 1];
        for (src, dsts) in transitions {
            for dst in *dsts {
                graph[*src] |= 1 << dst;
            }
        }
        StateMachine {
            graph,
            names,
            state: Cell::new(0),
        }
    }

    pub fn state(&self) -> usize {
        self.state.get()
    }

    pub fn is(&self, state: usize) -> bool {
        self.state.get() == state
    }

    pub fn name(&self) -> &'static str {
        self.name_of(self.state.get())
    }

    pub fn name_of(&self, state: usize) -> &'static str {
        self.names.get(state).copied().unwrap_or("invalid")
    }

    /// Move to `state`. Returns whether the state actually changed
    /// (moving to the current state is allowed when the graph has a
    /// self-edge, and reports `false`).
    pub fn transition(&self, state: usize) -> Result<bool> {
        let current = self.state.get();
        if self.graph[current] & (1 << state) == 0 {
            return Err(Error::value(format!(
                "invalid state transition {} -> {}",
                self.name_of(current),
                self.name_of(state),
            )));
        }
        if current == state {
            return Ok(false);
        }
        self.state.set(state);
        Ok(true)
    }
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StateMachine(state:{})", self.name())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const IDLE: usize = 0;
    const BUSY: usize = 1;
    const DEAD: usize = 2;

    fn machine() -> StateMachine {
        StateMachine::new(
            &[
                (IDLE, &[IDLE, BUSY, DEAD]),
                (BUSY, &[IDLE, DEAD]),
                (DEAD, &[DEAD]),
            ],
            &["idle", "busy", "dead"],
        )
    }

    #[test]
    fn test_transitions() {
        let sm = machine();
        assert!(sm.transition(BUSY).unwrap());
        assert!(sm.transition(IDLE).unwrap());
        // Self-edge reports an unchanged state.
        assert!(!sm.transition(IDLE).unwrap());
        assert!(sm.transition(DEAD).unwrap());
        assert!(!sm.transition(DEAD).unwrap());
    }

    #[test]
    fn test_invalid_transition_names_both_states() {
        let sm = machine();
        sm.transition(DEAD).unwrap();
        let err = sm.transition(BUSY).unwrap_err();
        assert!(err.message().contains("dead -> busy"), "{}", err);
        assert!(sm.is(DEAD));
    }
}
