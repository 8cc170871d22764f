//! The huge-page filler: population manager for partially-filled huge pages
//!
//! The filler owns a population of [`PageTracker`]s and decides which huge
//! page serves each span request, aiming to keep as few huge pages as
//! possible partially filled. Trackers move between population buckets as
//! their occupancy, release state, and density change; bucket order is what
//! turns the placement policy into cheap list operations.
//!
//! Every entry point assumes the caller holds the process-wide page-heap
//! lock; the filler itself takes no locks and is not thread-safe.

use std::collections::HashMap;

use crate::bitmap::Bitmap;
use crate::clock::Clock;
use crate::config::SparseTrackerType;
use crate::pages::{
    AccessDensity, HugeLength, HugePage, Length, MemoryTag, PageId, Range, SpanAllocInfo,
    PAGES_PER_HUGE_PAGE,
};
use crate::stats::{LargeSpanStats, PbtxtRegion, Printer, SmallSpanStats, SMALL_SPAN_MAX};
use crate::subrelease::{
    DemandHistory, PageReleaseReason, PageReleaseStats, SkipSubreleaseIntervals,
};
use crate::sys::{MemoryModifyFunction, MemoryTagFunction, PageFlags, Residency};
use crate::tracker::{CollapseOutcome, PageTracker};

/// Opaque handle to a tracker owned by the filler
///
/// Handed out by [`HugePageFiller::contribute`] and
/// [`HugePageFiller::try_get`]; dies when the final put returns the tracker.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrackerId(usize);

/// Counters for `treat_hugepage_trackers` outcomes
#[derive(Clone, Debug, Default)]
pub struct TreatmentStats {
    /// Trackers that qualified for collapse
    pub collapse_eligible: usize,
    /// Collapse advice calls issued
    pub collapse_attempted: usize,
    /// Collapse advice calls that succeeded
    pub collapse_succeeded: usize,
    /// Pages released because they were free and swapped out
    pub released_swapped_pages: usize,
    /// Residency queries that failed
    pub residency_failures: usize,
}

/// Number of coarse longest-free-range chunks: bit widths 0 through 10
const LFR_CHUNKS: usize = 11;

/// Number of exact longest-free-range keys: 0 through 512
const LFR_EXACT: usize = PAGES_PER_HUGE_PAGE + 1;

#[inline]
fn chunk_for(lfr: usize) -> usize {
    (usize::BITS - lfr.leading_zeros()) as usize
}

#[inline]
fn density_index(d: AccessDensity) -> usize {
    match d {
        AccessDensity::Sparse => 0,
        AccessDensity::Dense => 1,
    }
}

/// Which population bucket a tracker currently lives in
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Bucket {
    Donated,
    Regular(AccessDensity),
    PartialReleased(AccessDensity),
    FullyReleased(AccessDensity),
}

/// An array of tracker lists keyed on a small integer, with a bitmap hint
/// of which keys are populated
///
/// Entries are `(huge-page index, slot handle)` kept in ascending address
/// order so ties always resolve to the lowest virtual address.
struct HintedLists {
    lists: Vec<Vec<(usize, usize)>>,
    nonempty: Bitmap,
}

impl HintedLists {
    fn new(keys: usize) -> Self {
        HintedLists {
            lists: (0..keys).map(|_| Vec::new()).collect(),
            nonempty: Bitmap::new(keys),
        }
    }

    fn insert(&mut self, key: usize, addr: usize, handle: usize) {
        let list = &mut self.lists[key];
        let pos = list.partition_point(|&(a, _)| a < addr);
        list.insert(pos, (addr, handle));
        self.nonempty
            .set_range(key, 1)
            .expect("key inside the hint bitmap");
    }

    fn remove(&mut self, key: usize, addr: usize, handle: usize) {
        let list = &mut self.lists[key];
        let pos = list.partition_point(|&(a, _)| a < addr);
        assert!(
            pos < list.len() && list[pos] == (addr, handle),
            "tracker hp{addr:#x} missing from its bucket list"
        );
        list.remove(pos);
        if list.is_empty() {
            self.nonempty
                .clear_range(key, 1)
                .expect("key inside the hint bitmap");
        }
    }

    fn first_key_at_or_above(&self, from: usize) -> Option<usize> {
        self.nonempty.next_set_bit(from)
    }

    fn list(&self, key: usize) -> &[(usize, usize)] {
        &self.lists[key]
    }

    fn iter_all(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.lists.iter().flatten().copied()
    }
}

struct Slot {
    tracker: Box<PageTracker>,
    bucket: Bucket,
}

/// Manager for the population of partially-filled huge pages
///
/// Callers contribute trackers they construct, carve spans with `try_get`,
/// return them with `put`, and periodically drive subrelease and huge-page
/// treatment. All calls require the page-heap lock to be held.
pub struct HugePageFiller {
    clock: Clock,
    sparse_tracker_type: SparseTrackerType,
    tag: MemoryTag,

    unback: Box<dyn MemoryModifyFunction>,
    hugepage_unback: Box<dyn MemoryModifyFunction>,
    collapse: Box<dyn MemoryModifyFunction>,
    vma_name: Box<dyn MemoryTagFunction>,

    slots: Vec<Option<Slot>>,
    free_slots: Vec<usize>,
    by_location: HashMap<HugePage, usize>,

    donated: Vec<(usize, usize)>,
    regular: [HintedLists; 2],
    partial_released: [HintedLists; 2],
    fully_released: [HintedLists; 2],

    used: Length,
    free: Length,
    unmapped: Length,

    fully_freed: Vec<Box<PageTracker>>,
    history: DemandHistory,
    release_stats: PageReleaseStats,
    treatment: TreatmentStats,
}

impl HugePageFiller {
    /// Multiplier applied to `free_pages_in_partial_allocs` when computing
    /// the partial-alloc release target
    pub const PARTIAL_ALLOC_PAGES_RELEASE: usize = 1;

    /// Create an empty filler
    ///
    /// `unback` serves ordinary subrelease; `hugepage_unback` serves the
    /// hugepage-aware treatment path. They may share an implementation but
    /// are injected separately because production wires them differently.
    pub fn new(
        clock: Clock,
        sparse_tracker_type: SparseTrackerType,
        tag: MemoryTag,
        unback: Box<dyn MemoryModifyFunction>,
        hugepage_unback: Box<dyn MemoryModifyFunction>,
        collapse: Box<dyn MemoryModifyFunction>,
        vma_name: Box<dyn MemoryTagFunction>,
    ) -> Self {
        let sparse_keys = match sparse_tracker_type {
            SparseTrackerType::CoarseLongestFreeRange => LFR_CHUNKS,
            SparseTrackerType::ExactLongestFreeRange => LFR_EXACT,
        };
        let history = DemandHistory::new(clock.clone());
        HugePageFiller {
            clock,
            sparse_tracker_type,
            tag,
            unback,
            hugepage_unback,
            collapse,
            vma_name,
            slots: Vec::new(),
            free_slots: Vec::new(),
            by_location: HashMap::new(),
            donated: Vec::new(),
            regular: [HintedLists::new(sparse_keys), HintedLists::new(LFR_EXACT)],
            partial_released: [HintedLists::new(LFR_EXACT), HintedLists::new(LFR_EXACT)],
            fully_released: [HintedLists::new(LFR_EXACT), HintedLists::new(LFR_EXACT)],
            used: Length::ZERO,
            free: Length::ZERO,
            unmapped: Length::ZERO,
            fully_freed: Vec::new(),
            history,
            release_stats: PageReleaseStats::default(),
            treatment: TreatmentStats::default(),
        }
    }

    /// Number of trackers owned by the filler
    pub fn size(&self) -> HugeLength {
        HugeLength::new(self.by_location.len())
    }

    /// Allocated small pages across all trackers
    pub fn used_pages(&self) -> Length {
        self.used
    }

    /// Backed free small pages across all trackers
    pub fn free_pages(&self) -> Length {
        self.free
    }

    /// Small pages returned to the OS across all trackers
    pub fn unmapped_pages(&self) -> Length {
        self.unmapped
    }

    /// Backed free pages inside partially-released trackers
    pub fn free_pages_in_partial_allocs(&self) -> Length {
        let mut total = Length::ZERO;
        for lists in &self.partial_released {
            for (_, handle) in lists.iter_all() {
                total += self.tracker(handle).free_pages();
            }
        }
        total
    }

    /// Cumulative released pages broken down by reason
    pub fn release_stats(&self) -> &PageReleaseStats {
        &self.release_stats
    }

    /// Cumulative treatment outcomes
    pub fn treatment_stats(&self) -> &TreatmentStats {
        &self.treatment
    }

    /// Find a tracker with room for `n` pages and carve a span out of it
    ///
    /// Returns `None` when no owned tracker fits; the caller then acquires
    /// a fresh huge page, carves from the new tracker directly, and hands
    /// it over with [`contribute`](Self::contribute).
    pub fn try_get(&mut self, n: Length, info: SpanAllocInfo) -> Option<(TrackerId, PageId)> {
        assert!(n > Length::ZERO, "try_get of an empty span");

        let handle = match info.density {
            AccessDensity::Dense => self
                .pick_released(AccessDensity::Dense, n)
                .or_else(|| self.pick_regular(AccessDensity::Dense, n)),
            AccessDensity::Sparse if n.raw() > PAGES_PER_HUGE_PAGE / 2 => self
                .pick_donated(n)
                .or_else(|| self.pick_released(AccessDensity::Sparse, n))
                .or_else(|| self.pick_regular(AccessDensity::Sparse, n)),
            AccessDensity::Sparse => self
                .pick_released(AccessDensity::Sparse, n)
                .or_else(|| self.pick_regular(AccessDensity::Sparse, n))
                .or_else(|| self.pick_donated(n)),
        }?;

        self.unfile(handle);
        let (page, rebacked) = {
            let tracker = self.tracker_mut(handle);
            let released_before = tracker.released_pages();
            let range = tracker.get(n, info);
            (range.start, released_before - tracker.released_pages())
        };
        self.used += n;
        self.free -= n - rebacked;
        self.unmapped -= rebacked;
        self.file(handle);

        self.sample_demand();
        Some((TrackerId(handle), page))
    }

    /// Transfer ownership of a tracker into the filler
    ///
    /// `donated` must match the tracker's construction-time flag. The
    /// contributing allocation's density fixes the tracker's density class.
    pub fn contribute(
        &mut self,
        mut tracker: Box<PageTracker>,
        donated: bool,
        info: SpanAllocInfo,
    ) -> TrackerId {
        assert_eq!(
            tracker.was_donated(),
            donated,
            "contribute flag disagrees with tracker {}",
            tracker.location()
        );
        assert!(
            !self.by_location.contains_key(&tracker.location()),
            "filler already owns {}",
            tracker.location()
        );
        tracker.set_density(if donated {
            AccessDensity::Sparse
        } else {
            info.density
        });

        self.used += tracker.used_pages();
        self.free += tracker.free_pages();
        self.unmapped += tracker.released_pages();

        let handle = match self.free_slots.pop() {
            Some(h) => {
                self.slots[h] = Some(Slot {
                    tracker,
                    bucket: Bucket::Donated,
                });
                h
            }
            None => {
                self.slots.push(Some(Slot {
                    tracker,
                    bucket: Bucket::Donated,
                }));
                self.slots.len() - 1
            }
        };
        let location = self.tracker(handle).location();
        self.by_location.insert(location, handle);
        self.file(handle);

        self.sample_demand();
        TrackerId(handle)
    }

    /// Return a span to its tracker
    ///
    /// When the huge page becomes entirely unused the tracker leaves the
    /// filler and is returned; the caller destroys it or recycles the huge
    /// page. Otherwise returns `None`.
    pub fn put(&mut self, id: TrackerId, r: Range, info: SpanAllocInfo) -> Option<Box<PageTracker>> {
        let handle = id.0;
        let slot_exists = self
            .slots
            .get(handle)
            .map_or(false, |s| s.is_some());
        assert!(slot_exists, "put on a tracker the filler does not own");

        self.unfile(handle);
        let empty = self.tracker_mut(handle).put(r, info);
        self.used -= r.len;
        self.free += r.len;

        let result = if empty {
            Some(self.evict(handle))
        } else {
            self.file(handle);
            None
        };
        self.sample_demand();
        result
    }

    /// Release up to `desired` free pages back to the OS
    ///
    /// Respects the skip-subrelease heuristic unless `hit_limit` bypasses
    /// it. With `release_partial_allocs` the target is raised so every
    /// backed free page inside partially-released trackers is drained.
    /// Returns the pages actually released; unback failures simply shrink
    /// the count.
    pub fn release_pages(
        &mut self,
        desired: Length,
        intervals: SkipSubreleaseIntervals,
        release_partial_allocs: bool,
        hit_limit: bool,
    ) -> Length {
        let mut target = desired;
        let reason = if hit_limit {
            PageReleaseReason::ProcessMemoryLimit
        } else {
            PageReleaseReason::ReleaseMemoryToSystem
        };

        if release_partial_allocs && !hit_limit {
            let partial = Length::new(
                Self::PARTIAL_ALLOC_PAGES_RELEASE * self.free_pages_in_partial_allocs().raw(),
            );
            target = target.max(partial);
        }

        if !hit_limit && intervals.skip_subrelease_enabled() {
            let required = if intervals.peak_interval_set() {
                self.history.recent_peak(intervals.peak_interval)
            } else {
                self.history
                    .recent_demand(intervals.short_interval, intervals.long_interval)
            };
            if required > Length::ZERO {
                let backed = self.used + self.free;
                let allowed = backed.saturating_sub(required);
                if allowed < target {
                    self.history.report_skipped(target - allowed);
                    log::debug!(
                        "skip-subrelease kept {} pages (demand {})",
                        (target - allowed),
                        required
                    );
                    target = allowed;
                }
            }
        }

        let mut released = Length::ZERO;
        if target > Length::ZERO {
            for handle in self.release_candidates() {
                if released >= target {
                    break;
                }
                self.unfile(handle);
                let remaining = target - released;
                let newly = {
                    let Self {
                        slots, unback, ..
                    } = self;
                    let slot = slots[handle].as_mut().expect("candidate slot is live");
                    slot.tracker.release_free_up_to(remaining, unback.as_mut())
                };
                self.free -= newly;
                self.unmapped += newly;
                released += newly;
                self.file(handle);
            }
        }

        self.release_stats.record(reason, released);
        self.sample_demand();
        released
    }

    /// Walk every tracker applying collapse and swapped-free release
    ///
    /// Both treatments are best-effort; failures become counters. Trackers
    /// that end the walk empty are parked for
    /// [`fetch_fully_freed_tracker`](Self::fetch_fully_freed_tracker).
    pub fn treat_hugepage_trackers(
        &mut self,
        enable_collapse: bool,
        enable_release_free_swapped: bool,
        pageflags: &mut dyn PageFlags,
        residency: &mut dyn Residency,
    ) {
        let mut handles: Vec<usize> = self.by_location.values().copied().collect();
        handles.sort_by_key(|&h| self.tracker(h).location().index());
        for handle in handles {
            let location = self.tracker(handle).location();

            if enable_release_free_swapped {
                match residency.unbacked_and_swapped(location) {
                    Some(maps) => {
                        self.unfile(handle);
                        let newly = {
                            let Self {
                                slots,
                                hugepage_unback,
                                ..
                            } = self;
                            let slot = slots[handle].as_mut().expect("treated slot is live");
                            slot.tracker
                                .release_free_swapped(&maps.swapped, hugepage_unback.as_mut())
                        };
                        self.free -= newly;
                        self.unmapped += newly;
                        self.treatment.released_swapped_pages += newly.raw();
                        self.file(handle);
                    }
                    None => self.treatment.residency_failures += 1,
                }
            }

            if enable_collapse {
                let outcome = {
                    let Self {
                        slots, collapse, ..
                    } = self;
                    let slot = slots[handle].as_mut().expect("treated slot is live");
                    slot.tracker.maybe_collapse(pageflags, residency, collapse.as_mut())
                };
                match outcome {
                    CollapseOutcome::Collapsed => {
                        self.treatment.collapse_eligible += 1;
                        self.treatment.collapse_attempted += 1;
                        self.treatment.collapse_succeeded += 1;
                        let name = format!("hugefill_{}", self.tag.label());
                        self.vma_name
                            .set_name(location.page_range(), Some(&name));
                    }
                    CollapseOutcome::Failed => {
                        self.treatment.collapse_eligible += 1;
                        self.treatment.collapse_attempted += 1;
                    }
                    CollapseOutcome::NotEligible => {}
                }
            }

            if self.tracker(handle).is_empty() {
                self.unfile(handle);
                let tracker = self.evict(handle);
                self.fully_freed.push(tracker);
            }
        }
        self.sample_demand();
    }

    /// Retrieve a tracker that became empty during treatment, if any
    pub fn fetch_fully_freed_tracker(&mut self) -> Option<Box<PageTracker>> {
        self.fully_freed.pop()
    }

    /// Classify every free run into the span statistics
    pub fn add_span_stats(&self, small: &mut SmallSpanStats, large: &mut LargeSpanStats) {
        for slot in self.slots.iter().flatten() {
            let tracker = &slot.tracker;
            tracker.for_each_free_run(|start, len| {
                // Split the run where the released state flips.
                let mut seg_start = start;
                while seg_start < start + len {
                    let released = tracker.is_released_page(seg_start);
                    let mut seg_end = seg_start + 1;
                    while seg_end < start + len && tracker.is_released_page(seg_end) == released {
                        seg_end += 1;
                    }
                    let seg_len = seg_end - seg_start;
                    if seg_len < SMALL_SPAN_MAX {
                        small.record(seg_len, released);
                    } else {
                        large.record(seg_len, released);
                    }
                    seg_start = seg_end;
                }
            });
        }
    }

    /// Render human-oriented statistics
    pub fn print(&self, out: &mut Printer, everything: bool, pageflags: &mut dyn PageFlags) {
        let mut full = 0usize;
        let mut partial = 0usize;
        let mut released_trackers = 0usize;
        let mut partially_released = 0usize;
        let mut donated = 0usize;
        let mut hugepage_backed = 0usize;
        for slot in self.slots.iter().flatten() {
            let t = &slot.tracker;
            if t.is_full() {
                full += 1;
            } else {
                partial += 1;
            }
            if !t.unbroken() {
                released_trackers += 1;
                if t.free_pages() > Length::ZERO {
                    partially_released += 1;
                }
            }
            if t.was_donated() {
                donated += 1;
            }
            if pageflags.is_hugepage_backed(t.location()) {
                hugepage_backed += 1;
            }
        }

        let total = self.size().raw();
        out.print(format_args!(
            "HugePageFiller: {total} total, {full} full, {partial} partial, \
             {released_trackers} released ({partially_released} partially), {donated} donated\n"
        ));
        out.print(format_args!(
            "HugePageFiller: {} pages used, {} free, {} unmapped ({} backed by real hugepages)\n",
            self.used, self.free, self.unmapped, hugepage_backed
        ));
        out.print(format_args!(
            "HugePageFiller: {} of free pages sit in partially-released hugepages\n",
            self.free_pages_in_partial_allocs()
        ));

        if !everything {
            return;
        }

        out.print(format_args!(
            "HugePageFiller: since start, {} pages subreleased ({} from memory limits), \
             {} release calls limited, {} pages withheld\n",
            self.release_stats.total(),
            self.release_stats
                .for_reason(PageReleaseReason::ProcessMemoryLimit),
            self.history.skipped_calls(),
            self.history.skipped_pages()
        ));
        out.print(format_args!(
            "HugePageFiller: treatment: {}/{}/{} collapse eligible/attempted/succeeded, \
             {} swapped pages released, {} residency failures\n",
            self.treatment.collapse_eligible,
            self.treatment.collapse_attempted,
            self.treatment.collapse_succeeded,
            self.treatment.released_swapped_pages,
            self.treatment.residency_failures
        ));
        out.print(format_args!(
            "HugePageFiller: minimum free pages over window: {}\n",
            self.history.window_min_free()
        ));

        self.print_histograms(out);
    }

    /// Render statistics into a pbtxt region
    pub fn print_in_pbtxt(&self, region: &mut PbtxtRegion<'_>, pageflags: &mut dyn PageFlags) {
        let mut filler = region.child("filler");
        filler.print_i64("full_huge_pages", self.count_trackers(|t| t.is_full()) as i64);
        filler.print_i64(
            "partial_huge_pages",
            self.count_trackers(|t| !t.is_full()) as i64,
        );
        filler.print_i64(
            "released_huge_pages",
            self.count_trackers(|t| !t.unbroken()) as i64,
        );
        filler.print_i64(
            "donated_huge_pages",
            self.count_trackers(|t| t.was_donated()) as i64,
        );
        let backed = self
            .slots
            .iter()
            .flatten()
            .filter(|s| pageflags.is_hugepage_backed(s.tracker.location()))
            .count();
        filler.print_i64("hugepage_backed", backed as i64);
        filler.print_i64("used_pages", self.used.raw() as i64);
        filler.print_i64("free_pages", self.free.raw() as i64);
        filler.print_i64("unmapped_pages", self.unmapped.raw() as i64);
        filler.print_i64(
            "free_pages_in_partial_allocs",
            self.free_pages_in_partial_allocs().raw() as i64,
        );

        {
            let mut release = filler.child("release_stats");
            for (reason, pages) in self.release_stats.iter() {
                release.print_i64(reason.label(), pages.raw() as i64);
            }
            release.print_i64(
                "skipped_release_calls",
                self.history.skipped_calls() as i64,
            );
            release.print_i64(
                "skipped_release_pages",
                self.history.skipped_pages().raw() as i64,
            );
        }
        {
            let mut treatment = filler.child("treatment_stats");
            treatment.print_i64("collapse_eligible", self.treatment.collapse_eligible as i64);
            treatment.print_i64(
                "collapse_attempted",
                self.treatment.collapse_attempted as i64,
            );
            treatment.print_i64(
                "collapse_succeeded",
                self.treatment.collapse_succeeded as i64,
            );
            treatment.print_i64(
                "released_swapped_pages",
                self.treatment.released_swapped_pages as i64,
            );
            treatment.print_i64(
                "residency_failures",
                self.treatment.residency_failures as i64,
            );
        }

        let mut lfr = [0usize; LFR_CHUNKS];
        for slot in self.slots.iter().flatten() {
            lfr[chunk_for(slot.tracker.longest_free_range().raw())] += 1;
        }
        for (chunk, count) in lfr.iter().enumerate() {
            if *count > 0 {
                let mut bucket = filler.child("longest_free_range_histogram");
                bucket.print_i64("chunk", chunk as i64);
                bucket.print_i64("count", *count as i64);
            }
        }
    }

    fn count_trackers<F: Fn(&PageTracker) -> bool>(&self, f: F) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|s| f(&s.tracker))
            .count()
    }

    fn print_histograms(&self, out: &mut Printer) {
        let mut lfr = [0usize; LFR_CHUNKS];
        let mut occupancy = [0usize; 5];
        let mut age = [0usize; 5];
        for slot in self.slots.iter().flatten() {
            let t = &slot.tracker;
            lfr[chunk_for(t.longest_free_range().raw())] += 1;

            let used = t.used_pages().raw();
            let quartile = if used == 0 {
                0
            } else {
                1 + ((used - 1) * 4 / PAGES_PER_HUGE_PAGE).min(3)
            };
            occupancy[quartile] += 1;

            let secs = self.clock.seconds_since(t.alloc_time());
            let bucket = if secs < 1.0 {
                0
            } else if secs < 30.0 {
                1
            } else if secs < 300.0 {
                2
            } else if secs < 3600.0 {
                3
            } else {
                4
            };
            age[bucket] += 1;
        }

        out.print(format_args!("HugePageFiller: trackers by longest free range chunk:"));
        for (chunk, count) in lfr.iter().enumerate() {
            if *count > 0 {
                out.print(format_args!(" [{chunk}]={count}"));
            }
        }
        out.print(format_args!("\n"));

        const OCCUPANCY_LABELS: [&str; 5] = ["empty", "<=25%", "<=50%", "<=75%", "<=100%"];
        out.print(format_args!("HugePageFiller: trackers by occupancy:"));
        for (label, count) in OCCUPANCY_LABELS.iter().zip(occupancy.iter()) {
            if *count > 0 {
                out.print(format_args!(" {label}={count}"));
            }
        }
        out.print(format_args!("\n"));

        const AGE_LABELS: [&str; 5] = ["<1s", "<30s", "<5m", "<1h", ">=1h"];
        out.print(format_args!("HugePageFiller: trackers by age:"));
        for (label, count) in AGE_LABELS.iter().zip(age.iter()) {
            if *count > 0 {
                out.print(format_args!(" {label}={count}"));
            }
        }
        out.print(format_args!("\n"));
    }

    fn tracker(&self, handle: usize) -> &PageTracker {
        &self.slots[handle]
            .as_ref()
            .expect("live tracker handle")
            .tracker
    }

    fn tracker_mut(&mut self, handle: usize) -> &mut PageTracker {
        &mut self.slots[handle]
            .as_mut()
            .expect("live tracker handle")
            .tracker
    }

    fn classify(tracker: &PageTracker) -> Bucket {
        if tracker.was_donated() {
            Bucket::Donated
        } else if tracker.released_pages() > Length::ZERO {
            if tracker.free_pages() > Length::ZERO {
                Bucket::PartialReleased(tracker.density())
            } else {
                Bucket::FullyReleased(tracker.density())
            }
        } else {
            Bucket::Regular(tracker.density())
        }
    }

    fn regular_key(&self, density: AccessDensity, lfr: usize) -> usize {
        match (density, self.sparse_tracker_type) {
            (AccessDensity::Sparse, SparseTrackerType::CoarseLongestFreeRange) => chunk_for(lfr),
            _ => lfr,
        }
    }

    /// File the tracker into the bucket its current state implies
    fn file(&mut self, handle: usize) {
        let (bucket, lfr, addr) = {
            let t = self.tracker(handle);
            (
                Self::classify(t),
                t.longest_free_range().raw(),
                t.location().index(),
            )
        };
        match bucket {
            Bucket::Donated => {
                let pos = self.donated.partition_point(|&(a, _)| a < addr);
                self.donated.insert(pos, (addr, handle));
            }
            Bucket::Regular(d) => {
                let key = self.regular_key(d, lfr);
                self.regular[density_index(d)].insert(key, addr, handle);
            }
            Bucket::PartialReleased(d) => {
                self.partial_released[density_index(d)].insert(lfr, addr, handle);
            }
            Bucket::FullyReleased(d) => {
                self.fully_released[density_index(d)].insert(lfr, addr, handle);
            }
        }
        self.slots[handle].as_mut().expect("live tracker handle").bucket = bucket;
    }

    /// Remove the tracker from the bucket it was last filed into
    fn unfile(&mut self, handle: usize) {
        let (bucket, lfr, addr) = {
            let slot = self.slots[handle].as_ref().expect("live tracker handle");
            (
                slot.bucket,
                slot.tracker.longest_free_range().raw(),
                slot.tracker.location().index(),
            )
        };
        match bucket {
            Bucket::Donated => {
                let pos = self.donated.partition_point(|&(a, _)| a < addr);
                assert!(
                    pos < self.donated.len() && self.donated[pos] == (addr, handle),
                    "tracker hp{addr:#x} missing from the donated list"
                );
                self.donated.remove(pos);
            }
            Bucket::Regular(d) => {
                let key = self.regular_key(d, lfr);
                self.regular[density_index(d)].remove(key, addr, handle);
            }
            Bucket::PartialReleased(d) => {
                self.partial_released[density_index(d)].remove(lfr, addr, handle);
            }
            Bucket::FullyReleased(d) => {
                self.fully_released[density_index(d)].remove(lfr, addr, handle);
            }
        }
    }

    /// Remove an empty tracker from the filler and adjust the aggregates
    fn evict(&mut self, handle: usize) -> Box<PageTracker> {
        let slot = self.slots[handle].take().expect("live tracker handle");
        debug_assert!(slot.tracker.is_empty());
        self.by_location.remove(&slot.tracker.location());
        self.free_slots.push(handle);
        self.free -= slot.tracker.free_pages();
        self.unmapped -= slot.tracker.released_pages();
        slot.tracker
    }

    /// Best released candidate: smallest adequate longest free range,
    /// partially-released before fully-released
    fn pick_released(&self, density: AccessDensity, n: Length) -> Option<usize> {
        let di = density_index(density);
        for family in [&self.partial_released[di], &self.fully_released[di]] {
            if let Some(key) = family.first_key_at_or_above(n.raw()) {
                if let Some(&(_, handle)) = family.list(key).first() {
                    return Some(handle);
                }
            }
        }
        None
    }

    /// Best regular candidate: smallest adequate longest free range,
    /// lowest address on ties
    fn pick_regular(&self, density: AccessDensity, n: Length) -> Option<usize> {
        let di = density_index(density);
        let lists = &self.regular[di];
        let exact = !matches!(
            (density, self.sparse_tracker_type),
            (AccessDensity::Sparse, SparseTrackerType::CoarseLongestFreeRange)
        );
        if exact {
            let key = lists.first_key_at_or_above(n.raw())?;
            return lists.list(key).first().map(|&(_, handle)| handle);
        }

        // Coarse: the starting chunk mixes fitting and non-fitting
        // trackers, so scan it for the best fit before falling through to
        // higher chunks.
        let mut key = lists.first_key_at_or_above(chunk_for(n.raw()))?;
        loop {
            let mut best: Option<(usize, usize)> = None;
            for &(_, handle) in lists.list(key) {
                let lfr = self.tracker(handle).longest_free_range().raw();
                if lfr < n.raw() {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((best_lfr, _)) => lfr < best_lfr,
                };
                if better {
                    best = Some((lfr, handle));
                }
            }
            if let Some((_, handle)) = best {
                return Some(handle);
            }
            key = lists.first_key_at_or_above(key + 1)?;
        }
    }

    /// Most-full donated tracker that fits: smallest adequate longest free
    /// range, lowest address on ties
    fn pick_donated(&self, n: Length) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for &(_, handle) in &self.donated {
            let lfr = self.tracker(handle).longest_free_range().raw();
            if lfr < n.raw() {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_lfr, _)) => lfr < best_lfr,
            };
            if better {
                best = Some((lfr, handle));
            }
        }
        best.map(|(_, handle)| handle)
    }

    /// Handles in release priority order: least useful huge pages first
    fn release_candidates(&self) -> Vec<usize> {
        let mut candidates = Vec::new();
        let push_sorted = |handles: Vec<usize>, out: &mut Vec<usize>| {
            let mut keyed: Vec<(usize, i64, usize, usize)> = handles
                .into_iter()
                .map(|h| {
                    let t = self.tracker(h);
                    (
                        t.used_pages().raw(),
                        t.alloc_time(),
                        t.location().index(),
                        h,
                    )
                })
                .collect();
            keyed.sort();
            out.extend(keyed.into_iter().map(|(_, _, _, h)| h));
        };

        // Released trackers before unreleased, dense before sparse,
        // emptier before fuller, older before newer. Fully-released
        // trackers hold no backed free pages and are skipped.
        for di in [density_index(AccessDensity::Dense), density_index(AccessDensity::Sparse)] {
            push_sorted(
                self.partial_released[di]
                    .iter_all()
                    .map(|(_, h)| h)
                    .collect(),
                &mut candidates,
            );
        }
        for di in [density_index(AccessDensity::Dense), density_index(AccessDensity::Sparse)] {
            push_sorted(
                self.regular[di].iter_all().map(|(_, h)| h).collect(),
                &mut candidates,
            );
        }
        push_sorted(
            self.donated.iter().map(|&(_, h)| h).collect(),
            &mut candidates,
        );
        candidates
    }

    fn sample_demand(&mut self) {
        let (used, free) = (self.used, self.free);
        self.history.report(used, free);
    }

    #[cfg(test)]
    fn assert_aggregates(&self) {
        let mut used = Length::ZERO;
        let mut free = Length::ZERO;
        let mut unmapped = Length::ZERO;
        for slot in self.slots.iter().flatten() {
            used += slot.tracker.used_pages();
            free += slot.tracker.free_pages();
            unmapped += slot.tracker.released_pages();
        }
        assert_eq!(used, self.used);
        assert_eq!(free, self.free);
        assert_eq!(unmapped, self.unmapped);
        assert_eq!(self.by_location.len(), self.size().raw());
    }
}
