//! Randomized failure injection for demos.

use event_relay_core::event::Event;
use event_relay_core::handler::FailurePolicy;
use rand::Rng;

/// Fails each event independently with probability `rate`.
///
/// Used to watch messages land in the dead-letter queue without touching the
/// handler code. A rate of `0.0` never fails.
#[derive(Clone, Copy, Debug)]
pub struct RandomFailure {
    rate: f64,
}

impl RandomFailure {
    /// Policy failing with probability `rate`, clamped to `0.0..=1.0`.
    #[must_use]
    pub fn new(rate: f64) -> Self {
        let rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
        Self { rate }
    }

    /// Effective failure probability.
    #[must_use]
    pub const fn rate(&self) -> f64 {
        self.rate
    }
}

impl FailurePolicy for RandomFailure {
    fn should_fail(&self, event: &Event) -> Option<String> {
        rand::thread_rng()
            .gen_bool(self.rate)
            .then(|| format!("simulated failure for {} (rate {})", event.event_type, self.rate))
    }
}
