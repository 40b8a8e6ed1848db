//! A source is idling when it has not read anything for `threshold`. While idling, an idle
//! watermark is published once every `step_interval`, each time `increment_by` ahead of the
//! current watermark but never ahead of `now - max_delay`.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::IdleConfig;

/// Detects the idle state of the source and computes the idle watermarks.
#[derive(Debug, Clone)]
pub struct SourceIdleDetector {
    config: IdleConfig,
    /// idle watermarks never cross `now - max_delay`
    max_delay: Duration,
    /// last time the source read data
    updated_at: Instant,
    /// last time an idle watermark was handed out, None until the first one
    last_idle_wm_published_at: Option<Instant>,
}

impl SourceIdleDetector {
    pub fn new(config: IdleConfig, max_delay: Duration) -> Self {
        info!(
            threshold_ms = config.threshold.as_millis(),
            step_interval_ms = config.step_interval.as_millis(),
            increment_by_ms = config.increment_by.as_millis(),
            max_delay_ms = max_delay.as_millis(),
            "Created source idle detector"
        );
        SourceIdleDetector {
            config,
            max_delay,
            updated_at: Instant::now(),
            last_idle_wm_published_at: None,
        }
    }

    /// Returns true if the source has been idling for the threshold and the step interval has
    /// passed since the last idle watermark.
    pub fn is_source_idling(&self) -> bool {
        let idling = self.updated_at.elapsed() >= self.config.threshold;
        let step_interval_passed = self
            .last_idle_wm_published_at
            .is_none_or(|at| at.elapsed() > self.config.step_interval);
        idling && step_interval_passed
    }

    /// Marks the source as active again.
    pub fn reset(&mut self) {
        self.updated_at = Instant::now();
        if self.last_idle_wm_published_at.take().is_some() {
            debug!("Source is active again");
        }
    }

    /// Returns the idle watermark to publish for the currently computed watermark and records the
    /// publish. -1 stays -1, there is no watermark to move forward yet.
    pub fn update_and_fetch_idle_wm(&mut self, computed_wm: i64) -> i64 {
        if computed_wm == -1 {
            return -1;
        }

        let mut idle_wm = computed_wm + self.config.increment_by.as_millis() as i64;
        let limit = Utc::now().timestamp_millis() - self.max_delay.as_millis() as i64;
        // do not assign future timestamps for WM, nor ones the delayed data watermark can't reach.
        if idle_wm > limit {
            warn!(
                idle_wm,
                limit,
                "idle config is aggressive (reduce step/increment-by), wm > now() - max_delay, resetting"
            );
            idle_wm = limit;
        }

        self.last_idle_wm_published_at = Some(Instant::now());
        idle_wm
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config() -> IdleConfig {
        IdleConfig {
            threshold: Duration::from_millis(100),
            step_interval: Duration::from_millis(50),
            increment_by: Duration::from_millis(10),
        }
    }

    fn ago(ms: u64) -> Instant {
        Instant::now()
            .checked_sub(Duration::from_millis(ms))
            .unwrap()
    }

    #[test]
    fn test_is_source_idling() {
        let mut detector = SourceIdleDetector::new(config(), Duration::ZERO);
        assert!(!detector.is_source_idling());

        detector.updated_at = ago(200);
        assert!(detector.is_source_idling());
    }

    #[test]
    fn test_step_interval() {
        let mut detector = SourceIdleDetector::new(config(), Duration::ZERO);
        detector.updated_at = ago(200);

        assert_eq!(detector.update_and_fetch_idle_wm(1000), 1010);
        // just published, the step interval has not passed
        assert!(!detector.is_source_idling());

        detector.last_idle_wm_published_at = Some(ago(60));
        assert!(detector.is_source_idling());
    }

    #[test]
    fn test_reset() {
        let mut detector = SourceIdleDetector::new(config(), Duration::ZERO);
        detector.updated_at = ago(200);
        detector.update_and_fetch_idle_wm(1000);

        detector.reset();
        assert!(!detector.is_source_idling());
        assert!(detector.last_idle_wm_published_at.is_none());
    }

    #[test]
    fn test_update_and_fetch_idle_wm() {
        let mut detector = SourceIdleDetector::new(config(), Duration::ZERO);
        assert_eq!(detector.update_and_fetch_idle_wm(-1), -1);
        assert!(detector.last_idle_wm_published_at.is_none());

        assert_eq!(detector.update_and_fetch_idle_wm(1000), 1010);

        // never ahead of now
        let now = Utc::now().timestamp_millis();
        let idle_wm = detector.update_and_fetch_idle_wm(now + 60_000);
        assert!(idle_wm <= Utc::now().timestamp_millis());
        assert!(idle_wm >= now);
    }

    #[test]
    fn test_idle_wm_stays_behind_max_delay() {
        let mut detector = SourceIdleDetector::new(config(), Duration::from_secs(60));

        let now = Utc::now().timestamp_millis();
        let idle_wm = detector.update_and_fetch_idle_wm(now);
        assert!(idle_wm <= Utc::now().timestamp_millis() - 60_000);
        assert!(idle_wm >= now - 60_000);

        // far enough in the past, not clamped
        assert_eq!(detector.update_and_fetch_idle_wm(1000), 1010);
    }
}
