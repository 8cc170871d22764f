//! Per-huge-page occupancy tracking
//!
//! A [`PageTracker`] wraps one huge page: which small pages are carved out,
//! which free pages have been returned to the OS, whether the huge page
//! entered the filler as the tail of a larger allocation, and when it was
//! created. The tracker exposes the raw classification inputs; the filler
//! decides which population bucket they imply.
//!
//! Trackers are constructed by the page allocator, handed to the filler via
//! `contribute`, and handed back by the final `put`. The filler never
//! constructs or destroys one.

use crate::bitmap::Bitmap;
use crate::pages::{
    AccessDensity, HugePage, Length, Range, SpanAllocInfo, PAGES_PER_HUGE_PAGE,
};
use crate::range_tracker::RangeTracker;
use crate::sys::{MemoryModifyFunction, PageFlags, Residency};

/// Collapse is skipped when more than this many small pages lack backing;
/// re-faulting a mostly-unbacked huge page costs more than it saves.
const COLLAPSE_MAX_UNBACKED: usize = PAGES_PER_HUGE_PAGE / 8;

/// Result of a collapse attempt on one huge page
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CollapseOutcome {
    /// The huge page did not qualify (already backed, broken, or residency
    /// forbids)
    NotEligible,
    /// The collapse advice call was made and declined
    Failed,
    /// The huge page was re-promoted to huge-page backing
    Collapsed,
}

/// Occupancy state of one huge page
pub struct PageTracker {
    location: HugePage,
    tracker: RangeTracker,
    released: Bitmap,
    was_donated: bool,
    density: AccessDensity,
    alloc_time: i64,
    nallocs: usize,
}

impl PageTracker {
    /// Create a tracker for `location` with every page free and backed
    pub fn new(location: HugePage, was_donated: bool, now: i64) -> Self {
        PageTracker {
            location,
            tracker: RangeTracker::new(),
            released: Bitmap::new(PAGES_PER_HUGE_PAGE),
            was_donated,
            density: AccessDensity::Sparse,
            alloc_time: now,
            nallocs: 0,
        }
    }

    /// The huge page this tracker owns
    #[inline]
    pub fn location(&self) -> HugePage {
        self.location
    }

    /// Whether the huge page arrived as the tail of a larger allocation
    #[inline]
    pub fn was_donated(&self) -> bool {
        self.was_donated
    }

    /// Density class of the spans this tracker serves
    #[inline]
    pub fn density(&self) -> AccessDensity {
        self.density
    }

    pub(crate) fn set_density(&mut self, density: AccessDensity) {
        self.density = density;
    }

    /// Creation timestamp in clock ticks
    #[inline]
    pub fn alloc_time(&self) -> i64 {
        self.alloc_time
    }

    /// Number of live spans carved from this huge page
    #[inline]
    pub fn nallocs(&self) -> usize {
        self.nallocs
    }

    /// Number of allocated small pages
    #[inline]
    pub fn used_pages(&self) -> Length {
        Length::new(self.tracker.used())
    }

    /// Number of free small pages still backed by the OS
    #[inline]
    pub fn free_pages(&self) -> Length {
        Length::new(self.tracker.total_free() - self.released.count_ones())
    }

    /// Number of small pages returned to the OS
    #[inline]
    pub fn released_pages(&self) -> Length {
        Length::new(self.released.count_ones())
    }

    /// Whether no small page has been returned to the OS
    #[inline]
    pub fn unbroken(&self) -> bool {
        self.released.count_ones() == 0
    }

    /// Longest contiguous allocatable run (backed or released)
    #[inline]
    pub fn longest_free_range(&self) -> Length {
        Length::new(self.tracker.longest_free_range())
    }

    /// Whether the tracker has no live spans
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nallocs == 0
    }

    /// Whether every small page is allocated
    #[inline]
    pub fn is_full(&self) -> bool {
        self.tracker.used() == PAGES_PER_HUGE_PAGE
    }

    /// Carve a span of `n` pages out of this huge page
    ///
    /// The caller must have checked `longest_free_range() >= n`; violating
    /// that contract aborts. Released pages overlapped by the carve become
    /// backed again (the caller re-backs the returned range before use).
    pub fn get(&mut self, n: Length, _info: SpanAllocInfo) -> Range {
        assert!(
            n <= self.longest_free_range(),
            "get({n}) on {} with longest free range {}",
            self.location,
            self.longest_free_range()
        );
        let start = self
            .tracker
            .find_and_mark(n.raw())
            .expect("a fitting run exists under the longest-free-range contract");

        let overlap = self
            .released
            .count_range(start, n.raw())
            .expect("carved run lies inside the huge page");
        if overlap > 0 {
            self.released
                .clear_range(start, n.raw())
                .expect("carved run lies inside the huge page");
        }

        self.nallocs += 1;
        Range::new(self.location.first_page() + Length::new(start), n)
    }

    /// Return a span previously carved with [`get`](Self::get)
    ///
    /// Returns true iff the tracker became empty. Double frees and ranges
    /// outside this huge page abort.
    pub fn put(&mut self, r: Range, _info: SpanAllocInfo) -> bool {
        assert!(
            r.within_hugepage(self.location),
            "put of {r} on tracker {}",
            self.location
        );
        assert!(self.nallocs > 0, "put on empty tracker {}", self.location);

        let start = (r.start - self.location.first_page()).raw();
        self.tracker
            .unmark(start, r.len.raw())
            .expect("range verified inside the huge page");

        self.nallocs -= 1;
        self.nallocs == 0
    }

    /// Return every backed free run to the OS
    ///
    /// Invokes `unback` once per maximal free, non-released run. Runs whose
    /// advice call fails stay backed; the tracker remains consistent either
    /// way. Returns the number of pages newly released.
    pub fn release_free(&mut self, unback: &mut dyn MemoryModifyFunction) -> Length {
        self.release_free_up_to(Length::new(PAGES_PER_HUGE_PAGE), unback)
    }

    /// Return backed free runs to the OS, stopping after `limit` pages
    ///
    /// The final run is clipped so the release never exceeds the limit.
    pub fn release_free_up_to(
        &mut self,
        limit: Length,
        unback: &mut dyn MemoryModifyFunction,
    ) -> Length {
        let mut total = 0usize;
        let mut cursor = 0usize;
        while total < limit.raw() {
            let Some((start, len)) = self.tracker.next_free_range(cursor) else {
                break;
            };
            let end = start + len;
            total += self.release_backed_subruns(start, end, None, limit.raw() - total, unback);
            cursor = end;
        }
        Length::new(total)
    }

    /// Return free runs whose pages are swapped out
    ///
    /// Like [`release_free`](Self::release_free) but only touches pages the
    /// residency query reported as swapped; backing them again from swap
    /// would fault anyway, so unbacking is free.
    pub fn release_free_swapped(
        &mut self,
        swapped: &Bitmap,
        unback: &mut dyn MemoryModifyFunction,
    ) -> Length {
        let mut total = 0usize;
        let mut cursor = 0usize;
        while let Some((start, len)) = self.tracker.next_free_range(cursor) {
            let end = start + len;
            total += self.release_backed_subruns(
                start,
                end,
                Some(swapped),
                PAGES_PER_HUGE_PAGE,
                unback,
            );
            cursor = end;
        }
        Length::new(total)
    }

    /// Try to re-promote this huge page to huge-page backing
    pub fn maybe_collapse(
        &mut self,
        pageflags: &mut dyn PageFlags,
        residency: &mut dyn Residency,
        collapse: &mut dyn MemoryModifyFunction,
    ) -> CollapseOutcome {
        if pageflags.is_hugepage_backed(self.location) || !self.unbroken() {
            return CollapseOutcome::NotEligible;
        }
        let Some(maps) = residency.unbacked_and_swapped(self.location) else {
            return CollapseOutcome::NotEligible;
        };
        if maps.swapped.count_ones() > 0 || maps.unbacked.count_ones() > COLLAPSE_MAX_UNBACKED {
            return CollapseOutcome::NotEligible;
        }

        if collapse.modify(self.location.page_range()) {
            CollapseOutcome::Collapsed
        } else {
            log::debug!("collapse declined for {}", self.location);
            CollapseOutcome::Failed
        }
    }

    /// Visit each maximal free run; used for span statistics
    pub(crate) fn for_each_free_run<F: FnMut(usize, usize)>(&self, mut f: F) {
        let mut cursor = 0usize;
        while let Some((start, len)) = self.tracker.next_free_range(cursor) {
            f(start, len);
            cursor = start + len;
        }
    }

    /// Whether the released bit is set for page `index` of this huge page
    pub(crate) fn is_released_page(&self, index: usize) -> bool {
        self.released.get(index) == Some(true)
    }

    /// Unback the not-yet-released sub-runs of the free run `[start, end)`,
    /// optionally restricted to pages set in `filter` and clipped to
    /// `budget` pages. Returns pages newly released.
    fn release_backed_subruns(
        &mut self,
        start: usize,
        end: usize,
        filter: Option<&Bitmap>,
        budget: usize,
        unback: &mut dyn MemoryModifyFunction,
    ) -> usize {
        let eligible = |released: &Bitmap, i: usize| {
            released.get(i) != Some(true)
                && filter.map_or(true, |f| f.get(i) == Some(true))
        };

        let mut total = 0usize;
        let mut i = start;
        while i < end && total < budget {
            if !eligible(&self.released, i) {
                i += 1;
                continue;
            }
            let run_start = i;
            while i < end && eligible(&self.released, i) {
                i += 1;
            }
            let n = (i - run_start).min(budget - total);
            let r = Range::new(
                self.location.first_page() + Length::new(run_start),
                Length::new(n),
            );
            if unback.modify(r) {
                self.released
                    .set_range(run_start, n)
                    .expect("free run lies inside the huge page");
                total += n;
            } else {
                log::debug!("unback declined for {r}");
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::mock::{MockCollapse, MockPageFlags, MockResidency, MockUnback};

    const SPARSE: SpanAllocInfo = SpanAllocInfo {
        objects_per_span: 1,
        density: AccessDensity::Sparse,
    };

    fn tracker() -> PageTracker {
        PageTracker::new(HugePage::new(1), false, 0)
    }

    #[test]
    fn test_get_put_roundtrip() {
        let mut t = tracker();
        let r = t.get(Length::new(128), SPARSE);
        assert_eq!(r.start, t.location().first_page());
        assert_eq!(t.used_pages(), Length::new(128));
        assert_eq!(t.free_pages(), Length::new(384));
        assert_eq!(t.nallocs(), 1);
        assert!(!t.is_empty());

        assert!(t.put(r, SPARSE));
        assert!(t.is_empty());
        assert_eq!(t.used_pages(), Length::ZERO);
    }

    #[test]
    fn test_two_spans_empty_only_after_last() {
        let mut t = tracker();
        let a = t.get(Length::new(256), SPARSE);
        let b = t.get(Length::new(256), SPARSE);
        assert!(t.is_full());
        assert_eq!(t.longest_free_range(), Length::ZERO);

        assert!(!t.put(a, SPARSE));
        assert_eq!(t.free_pages(), Length::new(256));
        assert!(t.put(b, SPARSE));
    }

    #[test]
    fn test_release_free_marks_released() {
        let mut t = tracker();
        let a = t.get(Length::new(256), SPARSE);
        let _b = t.get(Length::new(256), SPARSE);
        t.put(a, SPARSE);

        let unback = MockUnback::new();
        let released = t.release_free(&mut unback.clone());
        assert_eq!(released, Length::new(256));
        assert_eq!(t.released_pages(), Length::new(256));
        assert_eq!(t.free_pages(), Length::ZERO);
        assert!(!t.unbroken());
        assert_eq!(unback.released_count(), 256);

        // Nothing left to release.
        assert_eq!(t.release_free(&mut unback.clone()), Length::ZERO);
    }

    #[test]
    fn test_release_free_failure_leaves_backed() {
        let mut t = tracker();
        let a = t.get(Length::new(100), SPARSE);
        let _b = t.get(Length::new(412), SPARSE);
        t.put(a, SPARSE);

        let unback = MockUnback::new();
        unback.set_success(false);
        assert_eq!(t.release_free(&mut unback.clone()), Length::ZERO);
        assert!(t.unbroken());
        assert_eq!(t.free_pages(), Length::new(100));
        assert_eq!(unback.released_count(), 0);
    }

    #[test]
    fn test_release_free_up_to_clips_the_last_run() {
        let mut t = tracker();
        let a = t.get(Length::new(200), SPARSE);
        let b = t.get(Length::new(200), SPARSE);
        let _c = t.get(Length::new(112), SPARSE);
        t.put(a, SPARSE);
        t.put(b, SPARSE);

        // 400 free pages in one run; release only 150 of them.
        let unback = MockUnback::new();
        let released = t.release_free_up_to(Length::new(150), &mut unback.clone());
        assert_eq!(released, Length::new(150));
        assert_eq!(t.released_pages(), Length::new(150));
        assert_eq!(t.free_pages(), Length::new(250));

        // The remainder is still releasable.
        let released = t.release_free(&mut unback.clone());
        assert_eq!(released, Length::new(250));
        assert_eq!(t.free_pages(), Length::ZERO);
    }

    #[test]
    fn test_get_rebacks_released_pages() {
        let mut t = tracker();
        let a = t.get(Length::new(256), SPARSE);
        let _b = t.get(Length::new(256), SPARSE);
        t.put(a, SPARSE);
        t.release_free(&mut MockUnback::new());
        assert_eq!(t.released_pages(), Length::new(256));

        // Carving over released pages clears their released bits.
        let c = t.get(Length::new(128), SPARSE);
        assert_eq!(c.start, t.location().first_page());
        assert_eq!(t.released_pages(), Length::new(128));
        assert_eq!(t.free_pages(), Length::ZERO);
    }

    #[test]
    fn test_release_free_swapped_respects_filter() {
        let mut t = tracker();
        let a = t.get(Length::new(64), SPARSE);
        let _b = t.get(Length::new(448), SPARSE);
        t.put(a, SPARSE);

        // Only the first 16 pages are swapped out.
        let mut swapped = Bitmap::new(PAGES_PER_HUGE_PAGE);
        swapped.set_range(0, 16).unwrap();

        let unback = MockUnback::new();
        let released = t.release_free_swapped(&swapped, &mut unback.clone());
        assert_eq!(released, Length::new(16));
        assert_eq!(t.released_pages(), Length::new(16));
        assert_eq!(t.free_pages(), Length::new(48));
    }

    #[test]
    fn test_maybe_collapse_paths() {
        let mut t = tracker();
        let _a = t.get(Length::new(10), SPARSE);
        let collapse = MockCollapse::new();
        let mut residency = MockResidency::new();

        // Already hugepage backed: nothing to do.
        let mut backed = MockPageFlags::new(true);
        assert_eq!(
            t.maybe_collapse(&mut backed, &mut residency, &mut collapse.clone()),
            CollapseOutcome::NotEligible
        );

        // Not backed, unbroken, residency clean: collapses.
        let mut unbacked_flags = MockPageFlags::new(false);
        assert_eq!(
            t.maybe_collapse(&mut unbacked_flags, &mut residency, &mut collapse.clone()),
            CollapseOutcome::Collapsed
        );
        assert_eq!(collapse.collapsed(), vec![t.location()]);

        // Advice failure is reported, not fatal.
        collapse.set_success(false);
        assert_eq!(
            t.maybe_collapse(&mut unbacked_flags, &mut residency, &mut collapse.clone()),
            CollapseOutcome::Failed
        );

        // Swapped pages forbid collapsing.
        let mut swapped = Bitmap::new(PAGES_PER_HUGE_PAGE);
        swapped.set_range(0, 1).unwrap();
        let mut swapped_residency =
            MockResidency::with_bitmaps(Bitmap::new(PAGES_PER_HUGE_PAGE), swapped);
        collapse.set_success(true);
        assert_eq!(
            t.maybe_collapse(&mut unbacked_flags, &mut swapped_residency, &mut collapse.clone()),
            CollapseOutcome::NotEligible
        );
    }

    #[test]
    fn test_broken_tracker_never_collapses() {
        let mut t = tracker();
        let a = t.get(Length::new(256), SPARSE);
        let _b = t.get(Length::new(128), SPARSE);
        t.put(a, SPARSE);
        t.release_free(&mut MockUnback::new());
        assert!(!t.unbroken());

        let mut flags = MockPageFlags::new(false);
        let mut residency = MockResidency::new();
        assert_eq!(
            t.maybe_collapse(&mut flags, &mut residency, &mut MockCollapse::new()),
            CollapseOutcome::NotEligible
        );
    }

    #[test]
    #[should_panic(expected = "longest free range")]
    fn test_oversized_get_aborts() {
        let mut t = tracker();
        t.get(Length::new(500), SPARSE);
        t.get(Length::new(13), SPARSE);
    }

    #[test]
    #[should_panic(expected = "put of")]
    fn test_foreign_range_put_aborts() {
        let mut t = tracker();
        let _r = t.get(Length::new(8), SPARSE);
        t.put(
            Range::new(HugePage::new(9).first_page(), Length::new(8)),
            SPARSE,
        );
    }

    #[test]
    fn test_donation_flag_is_sticky() {
        let t = PageTracker::new(HugePage::new(2), true, 7);
        assert!(t.was_donated());
        assert_eq!(t.alloc_time(), 7);
    }
}
