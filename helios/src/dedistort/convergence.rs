//! Stopping rule shared by the single-reference and consensus loops.

use crate::config::CONVERGENCE_THRESHOLD;

/// Mean displacement, in pixels, below which a round counts as aligned.
const NEGLIGIBLE_DISTORTION: f64 = 1e-4;

/// Outcome of one round's convergence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Keep the round and run another.
    Continue,
    /// Keep the round and stop.
    Converged,
    /// Discard the round and stop.
    Diverged,
}

/// Tracks the residual distortion across rounds.
///
/// A round whose distortion is larger than the previous round's diverged.
/// A round that improves by less than [`CONVERGENCE_THRESHOLD`] relative to
/// the previous one converged. The first round always continues unless it
/// measured a negligible distortion.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceTracker {
    previous: Option<f64>,
    history: Vec<f64>,
}

impl ConvergenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&mut self, distortion: f64) -> RoundOutcome {
        let outcome = match self.previous {
            None if distortion < NEGLIGIBLE_DISTORTION => RoundOutcome::Converged,
            None => RoundOutcome::Continue,
            Some(previous) if distortion > previous => RoundOutcome::Diverged,
            Some(previous) if previous < NEGLIGIBLE_DISTORTION => RoundOutcome::Converged,
            Some(previous) => {
                if (previous - distortion) / previous < CONVERGENCE_THRESHOLD {
                    RoundOutcome::Converged
                } else {
                    RoundOutcome::Continue
                }
            }
        };
        if outcome != RoundOutcome::Diverged {
            self.previous = Some(distortion);
            self.history.push(distortion);
        }
        outcome
    }

    /// Distortion of every retained round, in order.
    pub fn history(&self) -> &[f64] {
        &self.history
    }

    pub fn last(&self) -> Option<f64> {
        self.previous
    }
}
