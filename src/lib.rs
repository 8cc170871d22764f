//! # HugeFill: Huge-Page-Aware Page Filler
//!
//! This crate implements the core population manager of a huge-page-aware
//! page allocator: it carves small-page spans out of 2 MiB huge pages,
//! tracks per-huge-page occupancy, returns idle small pages to the
//! operating system, and re-promotes demoted huge pages.
//!
//! ## Key Features
//!
//! - **Dense occupancy tracking**: fixed-size allocation bitmaps with
//!   cached longest-free-range and first-fit queries
//! - **Population buckets**: donated, regular, and released huge pages,
//!   partitioned by density and keyed on free-range size for fast placement
//! - **Subrelease**: free pages inside occupied huge pages are returned to
//!   the OS, with a demand-history heuristic that skips release when a
//!   recent peak predicts reuse
//! - **Huge-page treatment**: collapse of demoted huge pages and eager
//!   release of swapped-out free pages, driven by injected OS callbacks
//! - **Bounded statistics**: human-readable and pbtxt renderings that
//!   report required space for safe truncation
//!
//! ## Quick Start
//!
//! ```rust
//! use hugefill::{
//!     AccessDensity, Clock, HugePage, HugePageFiller, Length, MemoryTag,
//!     PageTracker, SpanAllocInfo, SparseTrackerType,
//! };
//! use hugefill::sys::mock::{MockCollapse, MockUnback, MockVmaNamer};
//!
//! let unback = MockUnback::new();
//! let mut filler = HugePageFiller::new(
//!     Clock::default(),
//!     SparseTrackerType::CoarseLongestFreeRange,
//!     MemoryTag::Normal,
//!     Box::new(unback.clone()),
//!     Box::new(unback.clone()),
//!     Box::new(MockCollapse::new()),
//!     Box::new(MockVmaNamer::new()),
//! );
//!
//! let info = SpanAllocInfo { objects_per_span: 1, density: AccessDensity::Sparse };
//! let n = Length::new(8);
//!
//! // Nothing owned yet: the first request misses and the caller carves
//! // from a freshly acquired huge page, then contributes the tracker.
//! assert!(filler.try_get(n, info).is_none());
//! let mut tracker = Box::new(PageTracker::new(HugePage::new(1), false, 0));
//! let range = tracker.get(n, info);
//! let id = filler.contribute(tracker, false, info);
//!
//! // Later requests fill the same huge page.
//! let (id2, _page) = filler.try_get(n, info).expect("space available");
//! assert_eq!(id, id2);
//!
//! // The final put hands the empty tracker back.
//! assert!(filler.put(id, range, info).is_none());
//! # let (_, page2) = (id2, _page);
//! # let r2 = hugefill::Range::new(page2, n);
//! # assert!(filler.put(id2, r2, info).is_some());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod bitmap;
pub mod clock;
pub mod config;
pub mod error;
pub mod filler;
pub mod pages;
pub mod range_tracker;
pub mod stats;
pub mod subrelease;
pub mod sys;
pub mod tracker;

// Re-export core types
pub use bitmap::Bitmap;
pub use clock::{Clock, MonotonicTime, TimeSource};
pub use config::{FillerConfig, HugeRegionUsageOption, SparseTrackerType};
pub use error::{FillerError, Result};
pub use filler::{HugePageFiller, TrackerId, TreatmentStats};
pub use pages::{
    AccessDensity, HugeLength, HugePage, Length, MemoryTag, PageId, Range, SpanAllocInfo,
    HUGE_PAGE_SIZE, PAGES_PER_HUGE_PAGE, SMALL_PAGE_SIZE,
};
pub use range_tracker::RangeTracker;
pub use stats::{LargeSpanStats, PbtxtRegion, Printer, SmallSpanStats, SMALL_SPAN_MAX};
pub use subrelease::{
    DemandHistory, PageReleaseReason, PageReleaseStats, SkipSubreleaseIntervals,
};
pub use sys::{
    MemoryModifyFunction, MemoryTagFunction, PageFlags, Residency, SinglePageBitmaps,
};
pub use tracker::{CollapseOutcome, PageTracker};

#[cfg(target_os = "linux")]
pub use sys::{MadviseCollapse, MadviseUnback, VmaNamer};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the library (currently no-op, for future use)
pub fn init() {
    log::debug!("Initializing hugefill v{}", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_functionality() {
        init();
        assert!(VERSION.len() > 0);
    }

    #[test]
    fn test_version_info() {
        assert!(VERSION.contains('.'));
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2);
    }

    #[test]
    fn test_re_exports() {
        let _tracker = PageTracker::new(HugePage::new(0), false, 0);
        let _bitmap = Bitmap::new(PAGES_PER_HUGE_PAGE);
        let _range_tracker = RangeTracker::new();
        let _intervals = SkipSubreleaseIntervals::default();

        let err = FillerError::bad_range(0, 1024, 512);
        assert_eq!(err.category(), "range");
        assert!(std::any::type_name::<Result<()>>().contains("FillerError"));
    }

    #[test]
    fn test_multiple_init_calls() {
        init();
        init();
        init();
    }
}
