//! Flip/flop cycle state
//!
//! Pure bookkeeping for the scheduler: which sub-tick comes next, which
//! period it belongs to, and which latency profile is intended. No timers
//! and no I/O, so every ordering rule is testable without a clock.

use std::fmt;

/// Which latency profile the scheduler intends to have applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CyclePhase {
    /// The "flip" profile (first to be applied)
    Flip,
    /// The "flop" profile
    Flop,
}

impl CyclePhase {
    /// The other phase
    #[must_use]
    pub const fn toggled(self) -> Self {
        match self {
            Self::Flip => Self::Flop,
            Self::Flop => Self::Flip,
        }
    }

    /// Lowercase label used in logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Flip => "flip",
            Self::Flop => "flop",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the scheduler has to do on a given sub-tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    /// Progress signalling only
    Observe,
    /// Start of a period: switch profiles
    Transition {
        /// Tear down the previous profile (and settle) first
        teardown: bool,
    },
}

/// One sub-tick, as produced by [`CycleState::advance`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Period this sub-tick belongs to (0-based)
    pub cycle_index: u64,
    /// Position within the period, `0..subdivisions`
    pub sub_tick_index: u32,
    /// Sub-ticks per period
    pub subdivisions: u32,
    /// Work to perform
    pub action: TickAction,
}

impl Tick {
    /// Fraction of the period already behind this sub-tick
    #[must_use]
    pub fn progress(&self) -> f64 {
        f64::from(self.sub_tick_index) / f64::from(self.subdivisions)
    }

    /// Whether this sub-tick starts a period
    #[must_use]
    pub const fn is_transition(&self) -> bool {
        matches!(self.action, TickAction::Transition { .. })
    }
}

/// Scheduler position and intended phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleState {
    cycle_index: u64,
    sub_tick_index: u32,
    subdivisions: u32,
    phase: CyclePhase,
}

impl CycleState {
    /// Fresh state positioned at the first sub-tick of period 0, in the
    /// `Flop` phase so the first transition lands on `Flip`.
    ///
    /// `subdivisions` of zero is treated as one.
    #[must_use]
    pub fn new(subdivisions: u32) -> Self {
        Self {
            cycle_index: 0,
            sub_tick_index: 0,
            subdivisions: subdivisions.max(1),
            phase: CyclePhase::Flop,
        }
    }

    /// Number of periods fully completed
    #[must_use]
    pub const fn cycle_index(&self) -> u64 {
        self.cycle_index
    }

    /// Index of the next sub-tick within the current period
    #[must_use]
    pub const fn sub_tick_index(&self) -> u32 {
        self.sub_tick_index
    }

    /// Intended phase
    #[must_use]
    pub const fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Consume the next sub-tick and describe it.
    pub fn advance(&mut self) -> Tick {
        let tick = Tick {
            cycle_index: self.cycle_index,
            sub_tick_index: self.sub_tick_index,
            subdivisions: self.subdivisions,
            action: if self.sub_tick_index == 0 {
                TickAction::Transition {
                    teardown: self.cycle_index > 0,
                }
            } else {
                TickAction::Observe
            },
        };

        self.sub_tick_index += 1;
        if self.sub_tick_index == self.subdivisions {
            self.sub_tick_index = 0;
            self.cycle_index += 1;
        }
        tick
    }

    /// Switch to the other phase and return it.
    ///
    /// Called once per transition whether or not the apply script succeeds;
    /// the state tracks intent, not what the interface actually has.
    pub fn toggle_phase(&mut self) -> CyclePhase {
        self.phase = self.phase.toggled();
        self.phase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_starts_in_flop() {
        let state = CycleState::new(6);
        assert_eq!(state.phase(), CyclePhase::Flop);
        assert_eq!(state.cycle_index(), 0);
        assert_eq!(state.sub_tick_index(), 0);
    }

    #[test]
    fn test_first_toggle_yields_flip() {
        let mut state = CycleState::new(6);
        assert_eq!(state.toggle_phase(), CyclePhase::Flip);
    }

    #[test]
    fn test_toggle_strictly_alternates() {
        let mut state = CycleState::new(1);
        let phases: Vec<CyclePhase> = (0..6).map(|_| state.toggle_phase()).collect();
        assert_eq!(
            phases,
            vec![
                CyclePhase::Flip,
                CyclePhase::Flop,
                CyclePhase::Flip,
                CyclePhase::Flop,
                CyclePhase::Flip,
                CyclePhase::Flop,
            ]
        );
        assert!(phases.windows(2).all(|w| w[0] != w[1]));
    }

    #[test]
    fn test_each_period_has_one_transition_and_n_sub_ticks() {
        for subdivisions in 1..=12 {
            let mut state = CycleState::new(subdivisions);
            for period in 0..3u64 {
                let ticks: Vec<Tick> = (0..subdivisions).map(|_| state.advance()).collect();
                assert_eq!(ticks.len(), subdivisions as usize);
                assert_eq!(ticks.iter().filter(|t| t.is_transition()).count(), 1);
                assert!(ticks[0].is_transition());
                assert!(ticks.iter().all(|t| t.cycle_index == period));
                assert_eq!(state.cycle_index(), period + 1);
            }
        }
    }

    #[test]
    fn test_first_transition_skips_teardown() {
        let mut state = CycleState::new(3);
        assert_eq!(
            state.advance().action,
            TickAction::Transition { teardown: false }
        );
    }

    #[test]
    fn test_later_transitions_tear_down() {
        let mut state = CycleState::new(3);
        let transitions: Vec<TickAction> = (0..12)
            .map(|_| state.advance())
            .filter(Tick::is_transition)
            .map(|t| t.action)
            .collect();
        assert_eq!(transitions.len(), 4);
        assert_eq!(transitions[0], TickAction::Transition { teardown: false });
        assert!(transitions[1..]
            .iter()
            .all(|a| *a == TickAction::Transition { teardown: true }));
    }

    #[test]
    fn test_sub_tick_indices_are_sequential() {
        let mut state = CycleState::new(4);
        let indices: Vec<u32> = (0..10).map(|_| state.advance().sub_tick_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 0, 1, 2, 3, 0, 1]);
    }

    #[test]
    fn test_single_subdivision_transitions_every_tick() {
        let mut state = CycleState::new(1);
        for i in 0..5u64 {
            let tick = state.advance();
            assert_eq!(tick.cycle_index, i);
            assert_eq!(tick.action, TickAction::Transition { teardown: i > 0 });
        }
    }

    #[test]
    fn test_zero_subdivisions_behaves_like_one() {
        let mut state = CycleState::new(0);
        assert!(state.advance().is_transition());
        assert!(state.advance().is_transition());
    }

    #[test]
    fn test_progress_fraction() {
        let mut state = CycleState::new(6);
        let progress: Vec<f64> = (0..6).map(|_| state.advance().progress()).collect();
        assert!((progress[0] - 0.0).abs() < f64::EPSILON);
        assert!((progress[3] - 0.5).abs() < f64::EPSILON);
        assert!((progress[5] - 5.0 / 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(CyclePhase::Flip.to_string(), "flip");
        assert_eq!(CyclePhase::Flop.to_string(), "flop");
    }
}
