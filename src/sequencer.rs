//! Registration sequencer.
//!
//! A fixed number of steps, each remembering which stops and tremulants are
//! on in every division. Moving to another step first saves the current
//! registration into the step being left.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::division::Division;

/// Stops and tremulant of one division within a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDivision {
    pub stops: Vec<bool>,
    #[serde(default)]
    pub tremulant: bool,
}

/// One registration: every division's stops and tremulant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub divisions: Vec<StepDivision>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerState {
    pub steps: Vec<Step>,
    #[serde(default)]
    pub current_step: usize,
}

#[derive(Debug, Clone)]
pub struct Sequencer {
    steps: Vec<Step>,
    current: usize,
    dirty: bool,
}

impl Sequencer {
    /// `layout` holds the stop count of each division, in order.
    pub fn new(steps: usize, layout: &[usize]) -> Self {
        let step = Step {
            divisions: layout
                .iter()
                .map(|&n| StepDivision {
                    stops: vec![false; n],
                    tremulant: false,
                })
                .collect(),
        };
        Self {
            steps: vec![step; steps.max(1)],
            current: 0,
            dirty: false,
        }
    }

    pub fn steps_count(&self) -> usize {
        self.steps.len()
    }

    pub fn current_step(&self) -> usize {
        self.current
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// The registration was changed since the current step was recalled.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Save the divisions' registration into the current step.
    pub fn capture(&mut self, divisions: &[Division]) {
        let index = self.current;
        self.capture_to_step(index, divisions);
    }

    pub fn capture_to_step(&mut self, index: usize, divisions: &[Division]) {
        let Some(step) = self.steps.get_mut(index) else {
            return;
        };
        for (state, division) in step.divisions.iter_mut().zip(divisions) {
            for (i, on) in state.stops.iter_mut().enumerate() {
                *on = division.is_stop_enabled(i);
            }
            state.tremulant = division.is_tremulant_enabled();
        }
        if index == self.current {
            self.dirty = false;
        }
    }

    fn recall(&self, divisions: &mut [Division]) {
        let step = &self.steps[self.current];
        for (state, division) in step.divisions.iter().zip(divisions.iter_mut()) {
            for (i, &on) in state.stops.iter().enumerate() {
                division.enable_stop(i, on);
            }
            division.set_tremulant_enabled(state.tremulant);
        }
    }

    /// Move to step `index` and recall it. When `capture` is set the
    /// registration is first saved into the step being left. Returns whether
    /// the step changed.
    pub fn set_step(&mut self, index: usize, capture: bool, divisions: &mut [Division]) -> bool {
        if index >= self.steps.len() || index == self.current {
            return false;
        }
        if capture {
            self.capture(divisions);
        }
        self.current = index;
        self.recall(divisions);
        self.dirty = false;
        debug!("Sequencer step {index}");
        true
    }

    pub fn step_forward(&mut self, divisions: &mut [Division]) -> bool {
        if self.current + 1 < self.steps.len() {
            self.set_step(self.current + 1, true, divisions)
        } else {
            false
        }
    }

    pub fn step_backward(&mut self, divisions: &mut [Division]) -> bool {
        if self.current > 0 {
            self.set_step(self.current - 1, true, divisions)
        } else {
            false
        }
    }

    pub fn capture_state(&self) -> SequencerState {
        SequencerState {
            steps: self.steps.clone(),
            current_step: self.current,
        }
    }

    /// Restore saved steps. Steps are only taken when their count matches;
    /// within a step, divisions and stops are matched up to the shorter
    /// length. Moving to the saved current step recalls it without
    /// capturing; staying on the same step leaves the divisions as they are.
    pub fn restore_state(&mut self, state: &SequencerState, divisions: &mut [Division]) {
        if state.steps.len() == self.steps.len() {
            for (dst, src) in self.steps.iter_mut().zip(&state.steps) {
                for (d, s) in dst.divisions.iter_mut().zip(&src.divisions) {
                    for (on, &saved) in d.stops.iter_mut().zip(&s.stops) {
                        *on = saved;
                    }
                    d.tremulant = s.tremulant;
                }
            }
        } else {
            warn!(
                "Sequencer state has {} steps, expected {}; steps ignored",
                state.steps.len(),
                self.steps.len()
            );
        }

        self.set_step(state.current_step, false, divisions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::division::DivisionOptions;
    use crate::stop::{Stop, StopType};

    fn divisions() -> Vec<Division> {
        let stops = |n: usize| (0..n).map(|i| Stop::new(format!("s{i}"), StopType::Unknown)).collect();
        let trem = DivisionOptions {
            tremulant: Some(1.0),
            ..DivisionOptions::default()
        };
        vec![
            Division::new("Great", stops(3), DivisionOptions::default()),
            Division::new("Swell", stops(2), trem),
        ]
    }

    fn layout(divs: &[Division]) -> Vec<usize> {
        divs.iter().map(Division::stop_count).collect()
    }

    #[test]
    fn stepping_captures_and_recalls() {
        let mut divs = divisions();
        let mut seq = Sequencer::new(4, &layout(&divs));

        divs[0].enable_stop(1, true);
        divs[1].set_tremulant_enabled(true);
        assert!(seq.step_forward(&mut divs));
        assert_eq!(seq.current_step(), 1);
        // Step 1 was empty.
        assert!(!divs[0].is_stop_enabled(1));
        assert!(!divs[1].is_tremulant_enabled());

        divs[0].enable_stop(2, true);
        assert!(seq.step_backward(&mut divs));
        assert!(divs[0].is_stop_enabled(1));
        assert!(!divs[0].is_stop_enabled(2));
        assert!(divs[1].is_tremulant_enabled());

        assert!(seq.step_forward(&mut divs));
        assert!(divs[0].is_stop_enabled(2), "step 1 kept its registration");
    }

    #[test]
    fn stepping_stops_at_the_ends() {
        let mut divs = divisions();
        let mut seq = Sequencer::new(2, &layout(&divs));
        assert!(!seq.step_backward(&mut divs));
        assert!(seq.step_forward(&mut divs));
        assert!(!seq.step_forward(&mut divs));
        assert!(!seq.set_step(7, true, &mut divs));
    }

    #[test]
    fn set_step_without_capture_discards_changes() {
        let mut divs = divisions();
        let mut seq = Sequencer::new(3, &layout(&divs));
        divs[0].enable_stop(0, true);
        seq.set_dirty(true);
        seq.set_step(2, false, &mut divs);
        assert!(!seq.is_dirty());
        seq.set_step(0, false, &mut divs);
        assert!(!divs[0].is_stop_enabled(0));
    }

    #[test]
    fn state_round_trip() {
        let mut divs = divisions();
        let mut seq = Sequencer::new(3, &layout(&divs));
        divs[1].enable_stop(1, true);
        seq.capture_to_step(2, &divs);
        seq.set_step(2, false, &mut divs);
        let saved = seq.capture_state();

        let json = serde_json::to_string(&saved).expect("serialize");
        let back: SequencerState = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, saved);

        let mut fresh_divs = divisions();
        let mut fresh = Sequencer::new(3, &layout(&fresh_divs));
        fresh.restore_state(&back, &mut fresh_divs);
        assert_eq!(fresh.current_step(), 2);
        assert!(fresh_divs[1].is_stop_enabled(1));
    }

    #[test]
    fn mismatched_state_keeps_steps() {
        let mut divs = divisions();
        let mut seq = Sequencer::new(3, &layout(&divs));
        let state = SequencerState {
            steps: vec![Step::default()],
            current_step: 1,
        };
        seq.restore_state(&state, &mut divs);
        assert_eq!(seq.current_step(), 1);
        assert_eq!(seq.step(0).map(|s| s.divisions.len()), Some(2));
    }
}
