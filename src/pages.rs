//! Page units and address arithmetic
//!
//! All sizes in the filler are exact integer counts of pages. [`Length`]
//! counts small (OS base) pages, [`HugeLength`] counts huge pages,
//! [`PageId`] indexes a small page within the process address space and
//! [`HugePage`] indexes a huge page. Mixed arithmetic is provided only where
//! it cannot lose precision.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// log2 of the small (OS base) page size: 4 KiB
pub const SMALL_PAGE_SHIFT: usize = 12;

/// Small page size in bytes
pub const SMALL_PAGE_SIZE: usize = 1 << SMALL_PAGE_SHIFT;

/// log2 of the huge page size: 2 MiB
pub const HUGE_PAGE_SHIFT: usize = 21;

/// Huge page size in bytes
pub const HUGE_PAGE_SIZE: usize = 1 << HUGE_PAGE_SHIFT;

/// Number of small pages carved out of one huge page
pub const PAGES_PER_HUGE_PAGE: usize = HUGE_PAGE_SIZE / SMALL_PAGE_SIZE;

/// A count of small pages
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Length(usize);

impl Length {
    /// A zero-page length
    pub const ZERO: Length = Length(0);

    /// Create a length of `n` small pages
    #[inline]
    pub const fn new(n: usize) -> Self {
        Length(n)
    }

    /// The raw page count
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Size of this many small pages in bytes
    #[inline]
    pub const fn in_bytes(self) -> usize {
        self.0 << SMALL_PAGE_SHIFT
    }

    /// Subtraction clamped at zero
    #[inline]
    pub const fn saturating_sub(self, rhs: Length) -> Length {
        Length(self.0.saturating_sub(rhs.0))
    }

    /// The smaller of two lengths
    #[inline]
    pub fn min(self, rhs: Length) -> Length {
        Length(self.0.min(rhs.0))
    }

    /// The larger of two lengths
    #[inline]
    pub fn max(self, rhs: Length) -> Length {
        Length(self.0.max(rhs.0))
    }
}

impl Add for Length {
    type Output = Length;
    #[inline]
    fn add(self, rhs: Length) -> Length {
        Length(self.0 + rhs.0)
    }
}

impl AddAssign for Length {
    #[inline]
    fn add_assign(&mut self, rhs: Length) {
        self.0 += rhs.0;
    }
}

impl Sub for Length {
    type Output = Length;
    #[inline]
    fn sub(self, rhs: Length) -> Length {
        Length(self.0 - rhs.0)
    }
}

impl SubAssign for Length {
    #[inline]
    fn sub_assign(&mut self, rhs: Length) {
        self.0 -= rhs.0;
    }
}

impl fmt::Display for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A count of huge pages
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HugeLength(usize);

impl HugeLength {
    /// Create a length of `n` huge pages
    #[inline]
    pub const fn new(n: usize) -> Self {
        HugeLength(n)
    }

    /// The raw huge-page count
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// This many huge pages expressed in small pages
    #[inline]
    pub const fn in_pages(self) -> Length {
        Length(self.0 * PAGES_PER_HUGE_PAGE)
    }
}

impl Add for HugeLength {
    type Output = HugeLength;
    #[inline]
    fn add(self, rhs: HugeLength) -> HugeLength {
        HugeLength(self.0 + rhs.0)
    }
}

impl AddAssign for HugeLength {
    #[inline]
    fn add_assign(&mut self, rhs: HugeLength) {
        self.0 += rhs.0;
    }
}

impl Sub for HugeLength {
    type Output = HugeLength;
    #[inline]
    fn sub(self, rhs: HugeLength) -> HugeLength {
        HugeLength(self.0 - rhs.0)
    }
}

impl SubAssign for HugeLength {
    #[inline]
    fn sub_assign(&mut self, rhs: HugeLength) {
        self.0 -= rhs.0;
    }
}

impl fmt::Display for HugeLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a small page within the process address space
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageId(usize);

impl PageId {
    /// Create a page id from a raw small-page index
    #[inline]
    pub const fn new(index: usize) -> Self {
        PageId(index)
    }

    /// The raw small-page index
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }

    /// Start address of this page
    #[inline]
    pub const fn address(self) -> usize {
        self.0 << SMALL_PAGE_SHIFT
    }

    /// The huge page containing this small page
    #[inline]
    pub const fn hugepage(self) -> HugePage {
        HugePage::new(self.0 / PAGES_PER_HUGE_PAGE)
    }
}

impl Add<Length> for PageId {
    type Output = PageId;
    #[inline]
    fn add(self, rhs: Length) -> PageId {
        PageId(self.0 + rhs.raw())
    }
}

impl Sub<PageId> for PageId {
    type Output = Length;
    #[inline]
    fn sub(self, rhs: PageId) -> Length {
        Length(self.0 - rhs.0)
    }
}

impl Sub<Length> for PageId {
    type Output = PageId;
    #[inline]
    fn sub(self, rhs: Length) -> PageId {
        PageId(self.0 - rhs.raw())
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{:#x}", self.0)
    }
}

/// Index of a huge page within the process address space
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HugePage(usize);

impl HugePage {
    /// Create a huge page from a raw huge-page index
    #[inline]
    pub const fn new(index: usize) -> Self {
        HugePage(index)
    }

    /// The raw huge-page index
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }

    /// The first small page of this huge page
    #[inline]
    pub const fn first_page(self) -> PageId {
        PageId(self.0 * PAGES_PER_HUGE_PAGE)
    }

    /// Start address of this huge page
    #[inline]
    pub const fn start_address(self) -> usize {
        self.first_page().address()
    }

    /// The full small-page range covered by this huge page
    #[inline]
    pub fn page_range(self) -> Range {
        Range::new(self.first_page(), Length::new(PAGES_PER_HUGE_PAGE))
    }
}

impl fmt::Display for HugePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hp{:#x}", self.0)
    }
}

/// A contiguous run of small pages allocated or freed as one unit
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Range {
    /// First page of the run
    pub start: PageId,
    /// Number of pages in the run
    pub len: Length,
}

impl Range {
    /// Create a range; ranges are never empty
    #[inline]
    pub fn new(start: PageId, len: Length) -> Self {
        assert!(len > Length::ZERO, "empty page range at {start}");
        Range { start, len }
    }

    /// One past the last page of the run
    #[inline]
    pub fn end(self) -> PageId {
        self.start + self.len
    }

    /// Start address of the run
    #[inline]
    pub fn start_address(self) -> usize {
        self.start.address()
    }

    /// Size of the run in bytes
    #[inline]
    pub fn in_bytes(self) -> usize {
        self.len.in_bytes()
    }

    /// Whether the run lies entirely within one huge page
    #[inline]
    pub fn within_hugepage(self, hp: HugePage) -> bool {
        self.start.hugepage() == hp && (self.end() - Length::new(1)).hugepage() == hp
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, +{})", self.start, self.len)
    }
}

/// Predicted access density of the objects a span will hold
///
/// Dense spans hold many small objects and are always a single page; sparse
/// spans hold few, larger objects.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AccessDensity {
    /// Few large objects per span
    #[default]
    Sparse,
    /// Many small objects per span; single-page spans only
    Dense,
}

/// Allocation hints attached to every span request
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SpanAllocInfo {
    /// How many objects the span is expected to hold
    pub objects_per_span: usize,
    /// Predicted access density
    pub density: AccessDensity,
}

/// Kind of tagged memory a filler instance manages
///
/// Recorded at construction and used to derive VMA names for collapsed
/// regions; the filler itself does no NUMA or tag-based placement.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MemoryTag {
    /// Ordinary heap memory
    #[default]
    Normal,
    /// Sampled allocations
    Sampled,
    /// Cold, infrequently accessed memory
    Cold,
}

impl MemoryTag {
    /// Short label used when naming VMAs
    pub fn label(self) -> &'static str {
        match self {
            MemoryTag::Normal => "normal",
            MemoryTag::Sampled => "sampled",
            MemoryTag::Cold => "cold",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(SMALL_PAGE_SIZE, 4096);
        assert_eq!(HUGE_PAGE_SIZE, 2 * 1024 * 1024);
        assert_eq!(PAGES_PER_HUGE_PAGE, 512);
    }

    #[test]
    fn test_length_arithmetic() {
        let a = Length::new(100);
        let b = Length::new(28);
        assert_eq!((a + b).raw(), 128);
        assert_eq!((a - b).raw(), 72);
        assert_eq!(b.saturating_sub(a), Length::ZERO);
        assert_eq!(a.min(b), b);
        assert_eq!(a.max(b), a);
        assert_eq!(Length::new(2).in_bytes(), 8192);
    }

    #[test]
    fn test_page_id_arithmetic() {
        let p = PageId::new(1024);
        assert_eq!((p + Length::new(8)).index(), 1032);
        assert_eq!((p + Length::new(8)) - p, Length::new(8));
        assert_eq!(p.address(), 1024 * 4096);
        assert_eq!(p.hugepage(), HugePage::new(2));
    }

    #[test]
    fn test_hugepage_geometry() {
        let hp = HugePage::new(3);
        assert_eq!(hp.first_page().index(), 3 * 512);
        assert_eq!(hp.start_address(), 3 * HUGE_PAGE_SIZE);
        assert_eq!(hp.page_range().len.raw(), 512);
        assert_eq!(HugeLength::new(2).in_pages().raw(), 1024);
    }

    #[test]
    fn test_range_bounds() {
        let hp = HugePage::new(1);
        let r = Range::new(hp.first_page(), Length::new(512));
        assert!(r.within_hugepage(hp));
        assert_eq!(r.end(), HugePage::new(2).first_page());

        let tail = Range::new(hp.first_page() + Length::new(511), Length::new(1));
        assert!(tail.within_hugepage(hp));

        let crossing = Range::new(hp.first_page() + Length::new(511), Length::new(2));
        assert!(!crossing.within_hugepage(hp));
    }

    #[test]
    #[should_panic]
    fn test_empty_range_panics() {
        let _ = Range::new(PageId::new(0), Length::ZERO);
    }

    #[test]
    fn test_memory_tag_labels() {
        assert_eq!(MemoryTag::Normal.label(), "normal");
        assert_eq!(MemoryTag::Cold.label(), "cold");
    }
}
