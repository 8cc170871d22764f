//! Filler configuration and environment overrides
//!
//! Construction-time knobs for the filler and the allocator built on top of
//! it. Environment variables override the defaults; malformed values are
//! configuration errors rather than silent fallbacks.

use crate::error::{FillerError, Result};

/// How the sparse regular population indexes its trackers
///
/// Affects only the order `try_get` considers candidates in, never
/// correctness.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SparseTrackerType {
    /// Bucket trackers by the log2 chunk of their longest free range
    #[default]
    CoarseLongestFreeRange,
    /// Key trackers on their exact longest free range
    ExactLongestFreeRange,
}

/// When the allocator above the filler routes large allocations to huge
/// regions instead
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HugeRegionUsageOption {
    /// Slack-based decision
    #[default]
    Default,
    /// Use huge regions for all large allocations once abandonment grows
    UseForAllLargeAllocs,
}

/// Construction-time configuration for the filler and its caller
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FillerConfig {
    /// Whether subrelease is enabled at all
    pub subrelease: bool,
    /// Sparse tracker indexing scheme
    pub sparse_tracker_type: SparseTrackerType,
    /// Huge-region routing reported to the caller
    pub huge_region_option: HugeRegionUsageOption,
}

impl Default for FillerConfig {
    fn default() -> Self {
        FillerConfig {
            subrelease: true,
            sparse_tracker_type: SparseTrackerType::default(),
            huge_region_option: HugeRegionUsageOption::default(),
        }
    }
}

impl FillerConfig {
    /// Build a configuration from the environment
    ///
    /// - `HUGEFILL_HPAA_CONTROL`: `0` default, `1` disable subrelease,
    ///   `2` enable subrelease.
    /// - `HUGEFILL_HUGE_REGION_MORE_OFTEN_DISABLE`: `0` keep the
    ///   more-often policy, `1` fall back to the slack-based default.
    /// - `HUGEFILL_SPARSE_TRACKER`: `coarse` or `exact`.
    pub fn from_env() -> Result<Self> {
        let mut config = FillerConfig::default();

        if let Ok(v) = std::env::var("HUGEFILL_HPAA_CONTROL") {
            config.subrelease = match v.as_str() {
                "0" => config.subrelease,
                "1" => false,
                "2" => true,
                _ => {
                    return Err(FillerError::configuration(format!(
                        "bad HUGEFILL_HPAA_CONTROL value '{v}'"
                    )))
                }
            };
        }

        if let Ok(v) = std::env::var("HUGEFILL_HUGE_REGION_MORE_OFTEN_DISABLE") {
            config.huge_region_option = match v.as_str() {
                "0" => HugeRegionUsageOption::UseForAllLargeAllocs,
                "1" => HugeRegionUsageOption::Default,
                _ => {
                    return Err(FillerError::configuration(format!(
                        "bad HUGEFILL_HUGE_REGION_MORE_OFTEN_DISABLE value '{v}'"
                    )))
                }
            };
        } else {
            config.huge_region_option = HugeRegionUsageOption::UseForAllLargeAllocs;
        }

        if let Ok(v) = std::env::var("HUGEFILL_SPARSE_TRACKER") {
            config.sparse_tracker_type = match v.as_str() {
                "coarse" => SparseTrackerType::CoarseLongestFreeRange,
                "exact" => SparseTrackerType::ExactLongestFreeRange,
                _ => {
                    return Err(FillerError::configuration(format!(
                        "bad HUGEFILL_SPARSE_TRACKER value '{v}'"
                    )))
                }
            };
        }

        log::debug!("filler config: {config:?}");
        Ok(config)
    }
}
