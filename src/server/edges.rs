//! Producer-side transition tracking.

use crate::protocol::PirState;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    MotionStarted,
    MotionEnded,
}

/// Counts rising edges and remembers when the level last changed.
///
/// The previous level starts out idle, so a sensor that already reads
/// motion on the first tick counts as one rising edge.
#[derive(Debug, Default)]
pub struct EdgeTracker {
    previous: PirState,
    motion_count: u64,
    last_change: Option<Instant>,
}

impl EdgeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, state: PirState, now: Instant) -> Transition {
        if state == self.previous {
            return Transition::None;
        }
        self.previous = state;
        self.last_change = Some(now);
        match state {
            PirState::Motion => {
                self.motion_count += 1;
                Transition::MotionStarted
            }
            PirState::Idle => Transition::MotionEnded,
        }
    }

    pub fn motion_count(&self) -> u64 {
        self.motion_count
    }

    /// Zero until the first transition.
    pub fn time_since_change(&self, now: Instant) -> Duration {
        self.last_change
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PirState::{Idle, Motion};

    fn run(sequence: &[PirState]) -> (EdgeTracker, Vec<Transition>) {
        let mut tracker = EdgeTracker::new();
        let start = Instant::now();
        let transitions = sequence
            .iter()
            .enumerate()
            .map(|(i, &s)| tracker.observe(s, start + Duration::from_millis(100 * i as u64)))
            .collect();
        (tracker, transitions)
    }

    #[test]
    fn test_counts_only_rising_edges() {
        let (tracker, transitions) = run(&[Idle, Idle, Motion, Motion, Idle, Motion, Idle, Idle]);
        assert_eq!(tracker.motion_count(), 2);
        assert_eq!(
            transitions,
            vec![
                Transition::None,
                Transition::None,
                Transition::MotionStarted,
                Transition::None,
                Transition::MotionEnded,
                Transition::MotionStarted,
                Transition::MotionEnded,
                Transition::None,
            ]
        );
    }

    #[test]
    fn test_count_never_decreases() {
        let mut tracker = EdgeTracker::new();
        let now = Instant::now();
        let mut last = 0;
        for i in 0..50u64 {
            let state = if i % 3 == 1 { Motion } else { Idle };
            tracker.observe(state, now);
            assert!(tracker.motion_count() >= last);
            last = tracker.motion_count();
        }
        assert_eq!(tracker.motion_count(), 17);
    }

    #[test]
    fn test_motion_on_first_tick_counts() {
        let (tracker, transitions) = run(&[Motion, Motion]);
        assert_eq!(tracker.motion_count(), 1);
        assert_eq!(transitions[0], Transition::MotionStarted);
    }

    #[test]
    fn test_time_since_change() {
        let mut tracker = EdgeTracker::new();
        let start = Instant::now();
        assert_eq!(tracker.time_since_change(start), Duration::ZERO);

        tracker.observe(Idle, start);
        assert_eq!(tracker.time_since_change(start + Duration::from_secs(1)), Duration::ZERO);

        tracker.observe(Motion, start + Duration::from_secs(1));
        assert_eq!(
            tracker.time_since_change(start + Duration::from_millis(1500)),
            Duration::from_millis(500)
        );

        // 1 -> 0 resets the clock without counting.
        tracker.observe(Idle, start + Duration::from_secs(2));
        assert_eq!(tracker.motion_count(), 1);
        assert_eq!(tracker.time_since_change(start + Duration::from_secs(2)), Duration::ZERO);
    }
}
