//! Before an idle watermark is propagated downstream, the same head idle WMB has to be observed
//! `required_matches` times in a row. A single stale read of the OT store could otherwise make
//! us declare idleness while another processor has already moved on.
//!
//! The checker is driven by a single caller (the loop that owns it) and does no locking.

use tracing::debug;

use crate::wmb::WMB;

/// WMBChecker counts consecutive, value-identical idle head WMBs.
#[derive(Debug, Clone)]
pub struct WMBChecker {
    required_matches: usize,
    counter: usize,
    reference: Option<WMB>,
}

impl WMBChecker {
    /// Creates a checker that converges after `required_matches` identical idle observations.
    /// The first observation only opens a streak, so below 2 the checker never converges.
    pub fn new(required_matches: usize) -> Self {
        WMBChecker {
            required_matches,
            counter: 0,
            reference: None,
        }
    }

    /// Feeds one observation of the head WMB and returns true when the idle streak converged.
    /// Convergence resets the checker so the next observation opens a fresh streak.
    pub fn validate_head_wmb(&mut self, observed: WMB) -> bool {
        if !observed.idle {
            self.reset();
            return false;
        }

        let Some(reference) = self.reference else {
            self.reference = Some(observed);
            self.counter = 1;
            return false;
        };

        if reference.offset != observed.offset || reference.watermark != observed.watermark {
            debug!(?reference, ?observed, "Head idle WMB moved, resetting streak");
            self.reset();
            return false;
        }

        self.counter += 1;
        if self.counter == self.required_matches {
            self.reset();
            return true;
        }
        false
    }

    /// Number of matches in the current streak.
    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn required_matches(&self) -> usize {
        self.required_matches
    }

    fn reset(&mut self) {
        self.counter = 0;
        self.reference = None;
    }
}
