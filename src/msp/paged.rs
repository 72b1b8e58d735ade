//! Multi-page response assembly (Betaflight box names / box ids)

use bytes::{Bytes, BytesMut};

/// Result of feeding one page into a [`PagedAssembly`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// More pages are expected; request [`PagedAssembly::next_page`]
    Pending,
    /// All pages are in; the concatenation in page order
    Complete(Bytes),
}

/// Ordered page store for one paged request
///
/// A page that repeats an already-seen page, or an empty page after at least
/// one page arrived, ends the assembly. Reaching `max_pages` ends it as well.
#[derive(Debug, Clone)]
pub struct PagedAssembly {
    pages: Vec<Bytes>,
    max_pages: usize,
}

impl PagedAssembly {
    pub fn new(max_pages: usize) -> Self {
        Self {
            pages: Vec::with_capacity(max_pages),
            max_pages: max_pages.max(1),
        }
    }

    /// Index of the page to request next
    pub fn next_page(&self) -> u8 {
        u8::try_from(self.pages.len()).unwrap_or(u8::MAX)
    }

    pub fn reset(&mut self) {
        self.pages.clear();
    }

    /// Store a received page and report whether the assembly is done
    pub fn push(&mut self, page: &[u8]) -> PageOutcome {
        let seen = self
            .pages
            .iter()
            .any(|stored| !stored.is_empty() && stored.as_ref() == page);
        if !self.pages.is_empty() && (page.is_empty() || seen) {
            return self.finish();
        }

        self.pages.push(Bytes::copy_from_slice(page));
        if self.pages.len() >= self.max_pages {
            return self.finish();
        }
        PageOutcome::Pending
    }

    fn finish(&mut self) -> PageOutcome {
        let total = self.pages.iter().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for page in self.pages.drain(..) {
            out.extend_from_slice(&page);
        }
        PageOutcome::Complete(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_pages_concatenate_in_order() {
        let mut pages = PagedAssembly::new(2);
        assert_eq!(pages.next_page(), 0);
        assert_eq!(pages.push(b"ARM;"), PageOutcome::Pending);
        assert_eq!(pages.next_page(), 1);
        assert_eq!(
            pages.push(b"ANGLE;"),
            PageOutcome::Complete(Bytes::from_static(b"ARM;ANGLE;"))
        );
        assert_eq!(pages.next_page(), 0);
    }

    #[test]
    fn test_duplicate_page_completes_without_duplicating_bytes() {
        let mut pages = PagedAssembly::new(4);
        assert_eq!(pages.push(b"ARM;"), PageOutcome::Pending);
        assert_eq!(
            pages.push(b"ARM;"),
            PageOutcome::Complete(Bytes::from_static(b"ARM;"))
        );
    }

    #[test]
    fn test_empty_page_after_data_completes() {
        let mut pages = PagedAssembly::new(4);
        assert_eq!(pages.push(b"ARM;"), PageOutcome::Pending);
        assert_eq!(
            pages.push(&[]),
            PageOutcome::Complete(Bytes::from_static(b"ARM;"))
        );
    }

    #[test]
    fn test_empty_first_page_keeps_waiting() {
        let mut pages = PagedAssembly::new(3);
        assert_eq!(pages.push(&[]), PageOutcome::Pending);
        assert_eq!(pages.next_page(), 1);
        assert_eq!(pages.push(&[]), PageOutcome::Complete(Bytes::new()));
    }

    #[test]
    fn test_max_pages_forces_completion() {
        let mut pages = PagedAssembly::new(1);
        assert_eq!(
            pages.push(b"ARM;"),
            PageOutcome::Complete(Bytes::from_static(b"ARM;"))
        );
    }
}
