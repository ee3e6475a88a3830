//! Per-device idle timer state.
//!
//! The timer is always in exactly one of three states: stopped, armed (a
//! sleep task is pending for the current generation) or fired. Generations
//! make stale sleep tasks harmless: stopping or re-arming bumps the counter,
//! so an old task's `fire` is refused.

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Stopped,
    Armed { generation: u64 },
    Fired,
}

pub(crate) struct IdleTimer {
    state: Mutex<(State, u64)>,
}

impl IdleTimer {
    pub(crate) fn new() -> IdleTimer {
        IdleTimer {
            state: Mutex::new((State::Stopped, 0)),
        }
    }

    /// Move to armed, returning the generation the sleep task must present
    /// when it fires.
    pub(crate) fn arm(&self) -> u64 {
        let mut state = self.state.lock().expect("idle timer lock");
        state.1 += 1;
        state.0 = State::Armed {
            generation: state.1,
        };
        state.1
    }

    /// Stop a pending timer (feeder attached or device removed).
    pub(crate) fn stop(&self) {
        let mut state = self.state.lock().expect("idle timer lock");
        state.1 += 1;
        state.0 = State::Stopped;
    }

    /// A sleep task for `generation` elapsed; returns true when the timer
    /// actually fires (i.e. it was still armed for that generation).
    pub(crate) fn fire(&self, generation: u64) -> bool {
        let mut state = self.state.lock().expect("idle timer lock");
        if state.0 == (State::Armed { generation }) {
            state.0 = State::Fired;
            true
        } else {
            false
        }
    }
}
