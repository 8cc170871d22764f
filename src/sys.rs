//! Operating-system memory-advice capabilities
//!
//! The filler never issues syscalls itself; the four capabilities it needs
//! (unback, collapse, VMA naming, and page residency/flag queries) are
//! injected at construction or passed per call. Advice calls may fail or
//! race with the kernel; every implementation reports failure through its
//! return value and the filler accounts for it without unwinding.
//!
//! Linux implementations based on `madvise` and `prctl` are provided under
//! `cfg(target_os = "linux")`; other platforms get stubs that decline. Test
//! doubles live in [`mock`].

use crate::bitmap::Bitmap;
use crate::pages::{HugePage, Range, PAGES_PER_HUGE_PAGE};

/// A callback that changes the backing state of a page range
///
/// Returns false when the underlying advice call failed; the caller leaves
/// the corresponding pages untouched and stays consistent.
pub trait MemoryModifyFunction {
    /// Apply the modification to `r`
    fn modify(&mut self, r: Range) -> bool;
}

/// A callback that attaches a name to the VMA covering a page range
pub trait MemoryTagFunction {
    /// Name the VMA covering `r`; `None` clears the name
    fn set_name(&mut self, r: Range, name: Option<&str>);
}

/// Kernel page-flag queries at huge-page granularity
pub trait PageFlags {
    /// Whether the huge page is currently backed by a real huge page
    fn is_hugepage_backed(&mut self, hp: HugePage) -> bool;
}

/// Per-small-page residency bitmaps for one huge page
pub struct SinglePageBitmaps {
    /// Small pages with no physical backing
    pub unbacked: Bitmap,
    /// Small pages swapped out to disk
    pub swapped: Bitmap,
}

/// Kernel residency queries at huge-page granularity
pub trait Residency {
    /// Residency bitmaps for `hp`, or `None` when the query failed
    fn unbacked_and_swapped(&mut self, hp: HugePage) -> Option<SinglePageBitmaps>;

    /// Number of native (small) pages per huge page on this system
    fn native_pages_in_hugepage(&self) -> usize {
        PAGES_PER_HUGE_PAGE
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    // MADV_COLLAPSE appeared in Linux 6.1; older libc crates may not carry
    // the constant yet.
    const MADV_COLLAPSE: libc::c_int = 25;

    const PR_SET_VMA: libc::c_int = 0x53564d41;
    const PR_SET_VMA_ANON_NAME: libc::c_ulong = 0;

    /// Unback a range with `madvise(MADV_DONTNEED)`
    pub struct MadviseUnback;

    impl MemoryModifyFunction for MadviseUnback {
        fn modify(&mut self, r: Range) -> bool {
            let ret = unsafe {
                libc::madvise(
                    r.start_address() as *mut libc::c_void,
                    r.in_bytes(),
                    libc::MADV_DONTNEED,
                )
            };
            if ret != 0 {
                log::warn!("madvise(MADV_DONTNEED) failed for {r}");
            }
            ret == 0
        }
    }

    /// Re-promote a range to huge-page backing with `madvise(MADV_COLLAPSE)`
    pub struct MadviseCollapse;

    impl MemoryModifyFunction for MadviseCollapse {
        fn modify(&mut self, r: Range) -> bool {
            let ret = unsafe {
                libc::madvise(
                    r.start_address() as *mut libc::c_void,
                    r.in_bytes(),
                    MADV_COLLAPSE,
                )
            };
            if ret != 0 {
                log::debug!("madvise(MADV_COLLAPSE) declined for {r}");
            }
            ret == 0
        }
    }

    /// Name anonymous VMAs with `prctl(PR_SET_VMA_ANON_NAME)`
    ///
    /// Requires CONFIG_ANON_VMA_NAME; failure is silent since the name is
    /// purely diagnostic.
    pub struct VmaNamer;

    impl MemoryTagFunction for VmaNamer {
        fn set_name(&mut self, r: Range, name: Option<&str>) {
            let cstring;
            let name_ptr = match name {
                Some(n) => match std::ffi::CString::new(n) {
                    Ok(c) => {
                        cstring = c;
                        cstring.as_ptr() as libc::c_ulong
                    }
                    Err(_) => return,
                },
                None => 0,
            };
            unsafe {
                libc::prctl(
                    PR_SET_VMA,
                    PR_SET_VMA_ANON_NAME,
                    r.start_address() as libc::c_ulong,
                    r.in_bytes() as libc::c_ulong,
                    name_ptr,
                );
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::{MadviseCollapse, MadviseUnback, VmaNamer};

/// Test doubles for the OS capabilities
///
/// The doubles share their observable state through `Arc` so a test can keep
/// a handle while the filler owns the callback, the same split the memory
/// pools use for their statistics.
pub mod mock {
    use super::*;
    use crate::clock::TimeSource;
    use crate::pages::PageId;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::sync::{Arc, Mutex};

    /// Unback double: records released pages, toggled success
    #[derive(Clone)]
    pub struct MockUnback {
        success: Arc<AtomicBool>,
        released: Arc<Mutex<HashSet<PageId>>>,
    }

    impl MockUnback {
        /// Create a succeeding unback double
        pub fn new() -> Self {
            MockUnback {
                success: Arc::new(AtomicBool::new(true)),
                released: Arc::new(Mutex::new(HashSet::new())),
            }
        }

        /// Make subsequent calls succeed or fail
        pub fn set_success(&self, success: bool) {
            self.success.store(success, Ordering::Relaxed);
        }

        /// Number of pages currently recorded as released
        pub fn released_count(&self) -> usize {
            self.released.lock().unwrap().len()
        }

        /// Whether `p` is recorded as released
        pub fn is_released(&self, p: PageId) -> bool {
            self.released.lock().unwrap().contains(&p)
        }

        /// Forget `r`, modelling pages being re-backed by the caller
        pub fn forget(&self, r: Range) {
            let mut set = self.released.lock().unwrap();
            let mut p = r.start;
            while p != r.end() {
                set.remove(&p);
                p = p + crate::pages::Length::new(1);
            }
        }
    }

    impl Default for MockUnback {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryModifyFunction for MockUnback {
        fn modify(&mut self, r: Range) -> bool {
            if !self.success.load(Ordering::Relaxed) {
                return false;
            }
            let mut set = self.released.lock().unwrap();
            let mut p = r.start;
            while p != r.end() {
                set.insert(p);
                p = p + crate::pages::Length::new(1);
            }
            true
        }
    }

    /// Collapse double: records collapsed huge pages, toggled success
    #[derive(Clone)]
    pub struct MockCollapse {
        success: Arc<AtomicBool>,
        collapsed: Arc<Mutex<Vec<HugePage>>>,
    }

    impl MockCollapse {
        /// Create a succeeding collapse double
        pub fn new() -> Self {
            MockCollapse {
                success: Arc::new(AtomicBool::new(true)),
                collapsed: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Make subsequent calls succeed or fail
        pub fn set_success(&self, success: bool) {
            self.success.store(success, Ordering::Relaxed);
        }

        /// Huge pages collapse was invoked on, in order
        pub fn collapsed(&self) -> Vec<HugePage> {
            self.collapsed.lock().unwrap().clone()
        }
    }

    impl Default for MockCollapse {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryModifyFunction for MockCollapse {
        fn modify(&mut self, r: Range) -> bool {
            if !self.success.load(Ordering::Relaxed) {
                return false;
            }
            self.collapsed.lock().unwrap().push(r.start.hugepage());
            true
        }
    }

    /// VMA-naming double: records the last name per range start
    #[derive(Clone, Default)]
    pub struct MockVmaNamer {
        names: Arc<Mutex<Vec<(Range, Option<String>)>>>,
    }

    impl MockVmaNamer {
        /// Create a recording namer
        pub fn new() -> Self {
            Self::default()
        }

        /// All recorded namings, in order
        pub fn names(&self) -> Vec<(Range, Option<String>)> {
            self.names.lock().unwrap().clone()
        }
    }

    impl MemoryTagFunction for MockVmaNamer {
        fn set_name(&mut self, r: Range, name: Option<&str>) {
            self.names
                .lock()
                .unwrap()
                .push((r, name.map(str::to_owned)));
        }
    }

    /// Page-flag double with a single switchable answer
    #[derive(Clone)]
    pub struct MockPageFlags {
        backed: Arc<AtomicBool>,
    }

    impl MockPageFlags {
        /// Create a double answering `backed` for every huge page
        pub fn new(backed: bool) -> Self {
            MockPageFlags {
                backed: Arc::new(AtomicBool::new(backed)),
            }
        }

        /// Change the answer
        pub fn set_backed(&self, backed: bool) {
            self.backed.store(backed, Ordering::Relaxed);
        }
    }

    impl PageFlags for MockPageFlags {
        fn is_hugepage_backed(&mut self, _hp: HugePage) -> bool {
            self.backed.load(Ordering::Relaxed)
        }
    }

    /// Residency double returning fixed bitmaps for every huge page
    pub struct MockResidency {
        unbacked: Bitmap,
        swapped: Bitmap,
        fail: bool,
    }

    impl MockResidency {
        /// Create a double with nothing unbacked or swapped
        pub fn new() -> Self {
            MockResidency {
                unbacked: Bitmap::new(PAGES_PER_HUGE_PAGE),
                swapped: Bitmap::new(PAGES_PER_HUGE_PAGE),
                fail: false,
            }
        }

        /// Use the given bitmaps for every query
        pub fn with_bitmaps(unbacked: Bitmap, swapped: Bitmap) -> Self {
            MockResidency {
                unbacked,
                swapped,
                fail: false,
            }
        }

        /// Make every query fail
        pub fn failing() -> Self {
            let mut r = Self::new();
            r.fail = true;
            r
        }
    }

    impl Default for MockResidency {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Residency for MockResidency {
        fn unbacked_and_swapped(&mut self, _hp: HugePage) -> Option<SinglePageBitmaps> {
            if self.fail {
                return None;
            }
            Some(SinglePageBitmaps {
                unbacked: self.unbacked.clone(),
                swapped: self.swapped.clone(),
            })
        }
    }

    /// Manually advanced time source, in 1024 ticks per second
    pub struct MockTime {
        ticks: AtomicI64,
    }

    impl MockTime {
        /// Ticks per second of the mock clock
        pub const FREQ: f64 = 1024.0;

        /// Create a source at tick zero
        pub fn new() -> Self {
            MockTime {
                ticks: AtomicI64::new(0),
            }
        }

        /// Advance by raw ticks
        pub fn advance(&self, ticks: i64) {
            self.ticks.fetch_add(ticks, Ordering::Relaxed);
        }

        /// Advance by whole seconds
        pub fn advance_secs(&self, secs: u64) {
            self.advance(secs as i64 * Self::FREQ as i64);
        }
    }

    impl Default for MockTime {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TimeSource for MockTime {
        fn now(&self) -> i64 {
            self.ticks.load(Ordering::Relaxed)
        }

        fn freq(&self) -> f64 {
            Self::FREQ
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::*;
    use super::*;
    use crate::clock::TimeSource;
    use crate::pages::{Length, PageId};

    #[test]
    fn test_mock_unback_records_and_toggles() {
        let unback = MockUnback::new();
        let mut cb = unback.clone();
        let r = Range::new(PageId::new(512), Length::new(4));

        assert!(cb.modify(r));
        assert_eq!(unback.released_count(), 4);
        assert!(unback.is_released(PageId::new(514)));

        unback.set_success(false);
        assert!(!cb.modify(Range::new(PageId::new(600), Length::new(2))));
        assert_eq!(unback.released_count(), 4);

        unback.forget(r);
        assert_eq!(unback.released_count(), 0);
    }

    #[test]
    fn test_mock_collapse_records_hugepages() {
        let collapse = MockCollapse::new();
        let mut cb = collapse.clone();
        assert!(cb.modify(HugePage::new(7).page_range()));
        assert_eq!(collapse.collapsed(), vec![HugePage::new(7)]);

        collapse.set_success(false);
        assert!(!cb.modify(HugePage::new(8).page_range()));
        assert_eq!(collapse.collapsed().len(), 1);
    }

    #[test]
    fn test_mock_residency_bitmaps() {
        let mut swapped = Bitmap::new(PAGES_PER_HUGE_PAGE);
        swapped.set_range(0, 9).unwrap();
        let mut residency =
            MockResidency::with_bitmaps(Bitmap::new(PAGES_PER_HUGE_PAGE), swapped);

        let maps = residency.unbacked_and_swapped(HugePage::new(0)).unwrap();
        assert_eq!(maps.swapped.count_ones(), 9);
        assert_eq!(maps.unbacked.count_ones(), 0);
        assert_eq!(residency.native_pages_in_hugepage(), PAGES_PER_HUGE_PAGE);

        let mut failing = MockResidency::failing();
        assert!(failing.unbacked_and_swapped(HugePage::new(0)).is_none());
    }

    #[test]
    fn test_mock_time() {
        let time = MockTime::new();
        assert_eq!(time.now(), 0);
        time.advance_secs(3);
        assert_eq!(time.now(), 3 * 1024);
        assert_eq!(time.freq(), 1024.0);
    }
}
