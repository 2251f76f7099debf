//! Adaptive poll frequency control.
//!
//! Pure state-transition logic, transport-agnostic. The controller owns the
//! interval and its escalation rules; the active transport merely reads the
//! result to schedule its next attempt.

use std::time::Duration;

/// Snapshot of the controller's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyState {
    pub current_interval: Duration,
    pub baseline_interval: Duration,
    pub max_interval: Duration,
    pub consecutive_errors: u32,
    pub max_errors: u32,
}

/// Outcome of a controller input, telling the owner what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrequencyUpdate {
    /// New interval to push to the active transport, if it changed.
    pub new_interval: Option<Duration>,
    /// An out-of-band check should fire now (visibility returned).
    pub immediate_check: bool,
}

/// Owns the current poll interval and the rules that change it.
///
/// Error escalation and visibility escalation are tracked independently and
/// the larger of the two applies, so a success during a hidden tab does not
/// accidentally restore the foreground rate.
#[derive(Debug)]
pub struct AdaptiveFrequencyController {
    baseline_interval: Duration,
    background_interval: Duration,
    max_interval: Duration,
    max_errors: u32,
    consecutive_errors: u32,
    /// Interval demanded by error bursts; `None` while healthy.
    error_interval: Option<Duration>,
    hidden: bool,
}

impl AdaptiveFrequencyController {
    pub fn new(
        baseline_interval: Duration,
        background_interval: Duration,
        max_interval: Duration,
        max_errors: u32,
    ) -> Self {
        Self {
            baseline_interval,
            background_interval,
            max_interval,
            max_errors: max_errors.max(1),
            consecutive_errors: 0,
            error_interval: None,
            hidden: false,
        }
    }

    fn visibility_interval(&self) -> Duration {
        if self.hidden {
            self.background_interval
        } else {
            self.baseline_interval
        }
    }

    /// The interval the transport should currently use.
    pub fn current_interval(&self) -> Duration {
        match self.error_interval {
            Some(escalated) => escalated.max(self.visibility_interval()),
            None => self.visibility_interval(),
        }
    }

    pub fn state(&self) -> FrequencyState {
        FrequencyState {
            current_interval: self.current_interval(),
            baseline_interval: self.visibility_interval(),
            max_interval: self.max_interval,
            consecutive_errors: self.consecutive_errors,
            max_errors: self.max_errors,
        }
    }

    /// A check succeeded: clear the error burst and drop any error-driven
    /// escalation back to the visibility-appropriate baseline.
    pub fn report_success(&mut self) -> FrequencyUpdate {
        let before = self.current_interval();
        self.consecutive_errors = 0;
        self.error_interval = None;
        Self::diff(before, self.current_interval())
    }

    /// A check failed. Every `max_errors`-sized burst doubles the interval,
    /// capped at `max_interval`; the counter resets after each doubling so
    /// escalation happens per burst, not per error.
    pub fn report_error(&mut self) -> FrequencyUpdate {
        let before = self.current_interval();
        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.max_errors {
            self.consecutive_errors = 0;
            let base = self.error_interval.unwrap_or_else(|| self.visibility_interval());
            let doubled = base.checked_mul(2).unwrap_or(self.max_interval);
            self.error_interval = Some(doubled.min(self.max_interval));
        }
        Self::diff(before, self.current_interval())
    }

    /// Visibility changed. Becoming visible also requests an immediate
    /// out-of-band check.
    pub fn report_visibility(&mut self, hidden: bool) -> FrequencyUpdate {
        let before = self.current_interval();
        self.hidden = hidden;
        let mut update = Self::diff(before, self.current_interval());
        update.immediate_check = !hidden;
        update
    }

    fn diff(before: Duration, after: Duration) -> FrequencyUpdate {
        FrequencyUpdate {
            new_interval: (before != after).then_some(after),
            immediate_check: false,
        }
    }
}
