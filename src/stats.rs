//! Statistics sinks: bounded text printer, pbtxt regions, span stats
//!
//! Stats are rendered under the page-heap lock, so sinks never allocate
//! per-item and never block: the [`Printer`] appends into a pre-sized
//! buffer and keeps counting bytes after the buffer fills, letting callers
//! size a second pass or truncate safely.

use std::fmt;

use crate::pages::Length;

/// Free runs up to this many pages are reported per-length; longer runs go
/// to [`LargeSpanStats`].
pub const SMALL_SPAN_MAX: usize = 64;

/// Per-length counts of small free spans
#[derive(Clone, Debug)]
pub struct SmallSpanStats {
    /// Backed free runs, indexed by run length in pages
    pub normal_length: [usize; SMALL_SPAN_MAX],
    /// Released (unmapped) free runs, indexed by run length in pages
    pub returned_length: [usize; SMALL_SPAN_MAX],
}

impl Default for SmallSpanStats {
    fn default() -> Self {
        SmallSpanStats {
            normal_length: [0; SMALL_SPAN_MAX],
            returned_length: [0; SMALL_SPAN_MAX],
        }
    }
}

impl SmallSpanStats {
    /// Record a free run of `len` pages; runs outside `[1, SMALL_SPAN_MAX)`
    /// belong in [`LargeSpanStats`] and are ignored here
    pub fn record(&mut self, len: usize, released: bool) {
        if len == 0 || len >= SMALL_SPAN_MAX {
            return;
        }
        if released {
            self.returned_length[len] += 1;
        } else {
            self.normal_length[len] += 1;
        }
    }

    /// Total recorded runs
    pub fn total(&self) -> usize {
        self.normal_length.iter().sum::<usize>() + self.returned_length.iter().sum::<usize>()
    }
}

/// Aggregate stats for free spans of [`SMALL_SPAN_MAX`] pages or more
#[derive(Clone, Debug, Default)]
pub struct LargeSpanStats {
    /// Number of large free runs
    pub spans: usize,
    /// Backed pages across large runs
    pub normal_pages: Length,
    /// Released pages across large runs
    pub returned_pages: Length,
}

impl LargeSpanStats {
    /// Record a large free run
    pub fn record(&mut self, len: usize, released: bool) {
        debug_assert!(len >= SMALL_SPAN_MAX);
        self.spans += 1;
        if released {
            self.returned_pages += Length::new(len);
        } else {
            self.normal_pages += Length::new(len);
        }
    }
}

/// Bounded text sink
///
/// Appends formatted text until `limit` bytes, then keeps counting.
/// [`space_required`](Self::space_required) reports the bytes a complete
/// render needs, whether or not they fit.
pub struct Printer {
    buf: String,
    limit: usize,
    required: usize,
}

impl Printer {
    /// Create a printer that keeps at most `limit` bytes
    pub fn new(limit: usize) -> Self {
        Printer {
            buf: String::new(),
            limit,
            required: 0,
        }
    }

    /// Append formatted text, truncating at the limit
    pub fn print(&mut self, args: fmt::Arguments<'_>) {
        let text = match args.as_str() {
            Some(s) => s.to_owned(),
            None => args.to_string(),
        };
        self.required += text.len();
        let room = self.limit.saturating_sub(self.buf.len());
        if room >= text.len() {
            self.buf.push_str(&text);
        } else {
            // Truncate on a char boundary.
            let mut cut = room;
            while cut > 0 && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            self.buf.push_str(&text[..cut]);
        }
    }

    /// Bytes a complete render requires, including anything truncated
    pub fn space_required(&self) -> usize {
        self.required
    }

    /// Whether output was truncated at the limit
    pub fn truncated(&self) -> bool {
        self.required > self.buf.len()
    }

    /// The rendered text
    pub fn as_str(&self) -> &str {
        &self.buf
    }

    /// Consume the printer and return the rendered text
    pub fn into_string(self) -> String {
        self.buf
    }
}

impl fmt::Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.print(format_args!("{s}"));
        Ok(())
    }
}

/// A nested region in a pbtxt-style key-value tree
///
/// The root region has no name and prints no braces; children open with
/// `name {` and close when dropped.
pub struct PbtxtRegion<'a> {
    out: &'a mut Printer,
    depth: usize,
    named: bool,
}

impl<'a> PbtxtRegion<'a> {
    /// Create the root region over `out`
    pub fn new(out: &'a mut Printer) -> Self {
        PbtxtRegion {
            out,
            depth: 0,
            named: false,
        }
    }

    /// Open a nested region; closes when the returned value drops
    pub fn child<'b>(&'b mut self, name: &str) -> PbtxtRegion<'b> {
        self.indent();
        self.out.print(format_args!("{name} {{\n"));
        PbtxtRegion {
            out: &mut *self.out,
            depth: self.depth + 1,
            named: true,
        }
    }

    /// Emit an integer field
    pub fn print_i64(&mut self, name: &str, value: i64) {
        self.indent();
        self.out.print(format_args!("{name}: {value}\n"));
    }

    /// Emit a floating-point field
    pub fn print_f64(&mut self, name: &str, value: f64) {
        self.indent();
        self.out.print(format_args!("{name}: {value}\n"));
    }

    /// Emit a boolean field
    pub fn print_bool(&mut self, name: &str, value: bool) {
        self.indent();
        self.out.print(format_args!("{name}: {value}\n"));
    }

    /// Emit a string field
    pub fn print_str(&mut self, name: &str, value: &str) {
        self.indent();
        self.out.print(format_args!("{name}: \"{value}\"\n"));
    }

    fn indent(&mut self) {
        for _ in 0..self.depth {
            self.out.print(format_args!("  "));
        }
    }
}

impl Drop for PbtxtRegion<'_> {
    fn drop(&mut self) {
        if self.named {
            for _ in 0..self.depth - 1 {
                self.out.print(format_args!("  "));
            }
            self.out.print(format_args!("}}\n"));
        }
    }
}
