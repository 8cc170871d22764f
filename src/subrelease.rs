//! Demand history and the skip-subrelease decision
//!
//! Subrelease returns free small pages inside occupied huge pages to the
//! OS. Doing so right before demand comes back wastes two advice calls and
//! a page fault per page, so the filler keeps a sliding window of demand
//! statistics and withholds release when a recent peak predicts reuse.
//!
//! The window is a ring of fixed-length epochs. Every filler mutation
//! samples the current used/free page counts into the current epoch; the
//! policy queries aggregate over whole epochs. All decisions are pure
//! functions of the recorded history and the configured intervals.

use std::time::Duration;

use crate::clock::Clock;
use crate::pages::Length;

/// Number of epochs in the demand window
pub const SUBRELEASE_EPOCHS: usize = 600;

/// Span of the demand window
pub const SUBRELEASE_WINDOW: Duration = Duration::from_secs(600);

/// Intervals steering the skip-subrelease heuristic
///
/// Either `peak_interval` alone or the `short_interval`/`long_interval`
/// pair is set; zero means unset. With everything zero the heuristic is
/// disabled and release requests pass through unchanged.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SkipSubreleaseIntervals {
    /// Window for the single-peak policy
    pub peak_interval: Duration,
    /// Window for recent demand fluctuation
    pub short_interval: Duration,
    /// Window for the demand baseline
    pub long_interval: Duration,
}

impl SkipSubreleaseIntervals {
    /// Whether any interval is configured
    pub fn skip_subrelease_enabled(&self) -> bool {
        !self.peak_interval.is_zero()
            || !self.short_interval.is_zero()
            || !self.long_interval.is_zero()
    }

    /// Whether the single-peak policy is selected
    pub fn peak_interval_set(&self) -> bool {
        !self.peak_interval.is_zero()
    }
}

/// Why a release pass was initiated
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PageReleaseReason {
    /// Ordinary background or explicit release
    ReleaseMemoryToSystem,
    /// The process hit its memory limit; release everything possible
    ProcessMemoryLimit,
    /// A soft usage limit was exceeded
    SoftLimitExceeded,
    /// A hard usage limit was exceeded
    HardLimitExceeded,
}

impl PageReleaseReason {
    const ALL: [PageReleaseReason; 4] = [
        PageReleaseReason::ReleaseMemoryToSystem,
        PageReleaseReason::ProcessMemoryLimit,
        PageReleaseReason::SoftLimitExceeded,
        PageReleaseReason::HardLimitExceeded,
    ];

    fn index(self) -> usize {
        match self {
            PageReleaseReason::ReleaseMemoryToSystem => 0,
            PageReleaseReason::ProcessMemoryLimit => 1,
            PageReleaseReason::SoftLimitExceeded => 2,
            PageReleaseReason::HardLimitExceeded => 3,
        }
    }

    /// Human-readable label for stats output
    pub fn label(self) -> &'static str {
        match self {
            PageReleaseReason::ReleaseMemoryToSystem => "release_memory_to_system",
            PageReleaseReason::ProcessMemoryLimit => "process_memory_limit",
            PageReleaseReason::SoftLimitExceeded => "soft_limit_exceeded",
            PageReleaseReason::HardLimitExceeded => "hard_limit_exceeded",
        }
    }
}

/// Cumulative pages released, broken down by reason
#[derive(Clone, Debug, Default)]
pub struct PageReleaseStats {
    per_reason: [usize; 4],
}

impl PageReleaseStats {
    /// Record `pages` released for `reason`
    pub fn record(&mut self, reason: PageReleaseReason, pages: Length) {
        self.per_reason[reason.index()] += pages.raw();
    }

    /// Pages released for one reason
    pub fn for_reason(&self, reason: PageReleaseReason) -> Length {
        Length::new(self.per_reason[reason.index()])
    }

    /// Pages released across all reasons
    pub fn total(&self) -> Length {
        Length::new(self.per_reason.iter().sum())
    }

    /// Iterate `(reason, pages)` pairs in a stable order
    pub fn iter(&self) -> impl Iterator<Item = (PageReleaseReason, Length)> + '_ {
        PageReleaseReason::ALL
            .iter()
            .map(|&r| (r, self.for_reason(r)))
    }
}

#[derive(Copy, Clone)]
struct EpochStats {
    epoch: i64,
    max_used: Length,
    min_used: Length,
    min_free: Length,
}

/// Sliding-window demand history feeding the skip-subrelease decision
pub struct DemandHistory {
    clock: Clock,
    epoch_ticks: i64,
    epochs: Vec<Option<EpochStats>>,
    skipped_pages: usize,
    skipped_calls: usize,
}

impl DemandHistory {
    /// Create an empty history over the standard window
    pub fn new(clock: Clock) -> Self {
        let window_ticks = clock.ticks_for(SUBRELEASE_WINDOW).max(1);
        DemandHistory {
            clock,
            epoch_ticks: (window_ticks / SUBRELEASE_EPOCHS as i64).max(1),
            epochs: vec![None; SUBRELEASE_EPOCHS],
            skipped_pages: 0,
            skipped_calls: 0,
        }
    }

    /// Sample the current demand into the current epoch
    pub fn report(&mut self, used: Length, free: Length) {
        let epoch = self.current_epoch();
        let slot = &mut self.epochs[(epoch % SUBRELEASE_EPOCHS as i64) as usize];
        match slot {
            Some(s) if s.epoch == epoch => {
                s.max_used = s.max_used.max(used);
                s.min_used = s.min_used.min(used);
                s.min_free = s.min_free.min(free);
            }
            _ => {
                *slot = Some(EpochStats {
                    epoch,
                    max_used: used,
                    min_used: used,
                    min_free: free,
                });
            }
        }
    }

    /// Peak used-pages over the trailing `interval`
    pub fn recent_peak(&self, interval: Duration) -> Length {
        let mut peak = Length::ZERO;
        self.for_recent_epochs(interval, |s| peak = peak.max(s.max_used));
        peak
    }

    /// Predicted near-future demand from fluctuation and baseline
    ///
    /// Short-interval demand fluctuation (largest in-epoch swing) on top of
    /// the long-interval baseline (largest epoch floor), capped by the
    /// window-wide peak so the prediction never exceeds observed demand.
    pub fn recent_demand(&self, short: Duration, long: Duration) -> Length {
        let mut fluctuation = Length::ZERO;
        self.for_recent_epochs(short, |s| {
            fluctuation = fluctuation.max(s.max_used - s.min_used)
        });

        let mut baseline = Length::ZERO;
        self.for_recent_epochs(long, |s| baseline = baseline.max(s.min_used));

        let cap = self.recent_peak(SUBRELEASE_WINDOW);
        (baseline + fluctuation).min(cap)
    }

    /// Smallest free-page count observed anywhere in the window
    pub fn window_min_free(&self) -> Length {
        let mut min_free: Option<Length> = None;
        self.for_recent_epochs(SUBRELEASE_WINDOW, |s| {
            min_free = Some(match min_free {
                Some(m) => m.min(s.min_free),
                None => s.min_free,
            });
        });
        min_free.unwrap_or(Length::ZERO)
    }

    /// Account pages withheld from a release pass by the heuristic
    pub fn report_skipped(&mut self, pages: Length) {
        self.skipped_pages += pages.raw();
        self.skipped_calls += 1;
    }

    /// Total pages withheld so far
    pub fn skipped_pages(&self) -> Length {
        Length::new(self.skipped_pages)
    }

    /// Number of release passes that were limited
    pub fn skipped_calls(&self) -> usize {
        self.skipped_calls
    }

    fn current_epoch(&self) -> i64 {
        self.clock.now() / self.epoch_ticks
    }

    /// Visit valid epochs within the trailing `interval`, newest included
    fn for_recent_epochs<F: FnMut(&EpochStats)>(&self, interval: Duration, mut f: F) {
        if interval.is_zero() {
            return;
        }
        let ticks = (interval.as_secs_f64() * self.clock.freq()) as i64;
        let n = (((ticks + self.epoch_ticks - 1) / self.epoch_ticks) as usize)
            .clamp(1, SUBRELEASE_EPOCHS);
        let current = self.current_epoch();
        for e in (current + 1 - n as i64)..=current {
            if e < 0 {
                continue;
            }
            if let Some(s) = &self.epochs[(e % SUBRELEASE_EPOCHS as i64) as usize] {
                if s.epoch == e {
                    f(s);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::mock::MockTime;
    use std::sync::Arc;

    fn history() -> (Arc<MockTime>, DemandHistory) {
        let time = Arc::new(MockTime::new());
        let clock = Clock::new(time.clone());
        (time, DemandHistory::new(clock))
    }

    #[test]
    fn test_intervals_enabled() {
        assert!(!SkipSubreleaseIntervals::default().skip_subrelease_enabled());

        let peak = SkipSubreleaseIntervals {
            peak_interval: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(peak.skip_subrelease_enabled());
        assert!(peak.peak_interval_set());

        let pair = SkipSubreleaseIntervals {
            short_interval: Duration::from_secs(10),
            long_interval: Duration::from_secs(300),
            ..Default::default()
        };
        assert!(pair.skip_subrelease_enabled());
        assert!(!pair.peak_interval_set());
    }

    #[test]
    fn test_recent_peak_tracks_window() {
        let (time, mut h) = history();
        h.report(Length::new(400), Length::new(100));
        time.advance_secs(2);
        h.report(Length::new(50), Length::new(450));

        assert_eq!(h.recent_peak(Duration::from_secs(60)), Length::new(400));
        // Interval too short to reach the peak epoch.
        assert_eq!(h.recent_peak(Duration::from_secs(1)), Length::new(50));
    }

    #[test]
    fn test_peak_expires_outside_window() {
        let (time, mut h) = history();
        h.report(Length::new(400), Length::new(100));
        time.advance_secs(700);
        h.report(Length::new(10), Length::new(490));
        assert_eq!(h.recent_peak(Duration::from_secs(60)), Length::new(10));
        assert_eq!(h.recent_peak(SUBRELEASE_WINDOW), Length::new(10));
    }

    #[test]
    fn test_recent_demand_combines_and_caps() {
        let (time, mut h) = history();
        // Baseline epoch: used never drops below 200.
        h.report(Length::new(200), Length::new(300));
        h.report(Length::new(250), Length::new(250));
        time.advance_secs(2);
        // Fluctuating epoch: swing of 100.
        h.report(Length::new(100), Length::new(400));
        h.report(Length::new(200), Length::new(300));
        h.report(Length::new(150), Length::new(350));

        let demand = h.recent_demand(Duration::from_secs(1), Duration::from_secs(60));
        // Baseline max(min_used) = 200, fluctuation = 100, cap = 250.
        assert_eq!(demand, Length::new(250));
    }

    #[test]
    fn test_demand_without_history_is_zero() {
        let (_time, h) = history();
        assert_eq!(h.recent_peak(Duration::from_secs(60)), Length::ZERO);
        assert_eq!(
            h.recent_demand(Duration::from_secs(10), Duration::from_secs(60)),
            Length::ZERO
        );
        assert_eq!(h.window_min_free(), Length::ZERO);
    }

    #[test]
    fn test_window_min_free() {
        let (time, mut h) = history();
        h.report(Length::new(100), Length::new(80));
        time.advance_secs(1);
        h.report(Length::new(100), Length::new(30));
        time.advance_secs(1);
        h.report(Length::new(100), Length::new(60));
        assert_eq!(h.window_min_free(), Length::new(30));
    }

    #[test]
    fn test_skipped_accounting() {
        let (_time, mut h) = history();
        h.report_skipped(Length::new(128));
        h.report_skipped(Length::new(64));
        assert_eq!(h.skipped_pages(), Length::new(192));
        assert_eq!(h.skipped_calls(), 2);
    }

    #[test]
    fn test_release_stats_by_reason() {
        let mut stats = PageReleaseStats::default();
        stats.record(PageReleaseReason::ReleaseMemoryToSystem, Length::new(100));
        stats.record(PageReleaseReason::ProcessMemoryLimit, Length::new(50));
        stats.record(PageReleaseReason::ReleaseMemoryToSystem, Length::new(10));

        assert_eq!(
            stats.for_reason(PageReleaseReason::ReleaseMemoryToSystem),
            Length::new(110)
        );
        assert_eq!(stats.total(), Length::new(160));
        assert_eq!(stats.iter().count(), 4);
    }
}
