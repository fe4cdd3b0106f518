//! Offset pagination

use serde::{Deserialize, Serialize};

/// Page size used when the requested one is out of range
pub const DEFAULT_PAGE_SIZE: u32 = 20;
/// Largest page a caller may request
pub const MAX_PAGE_SIZE: u32 = 100;

/// Requested page, 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    /// Create new page request (normalized)
    #[must_use]
    pub fn new(page: u32, page_size: u32) -> Self {
        Self { page, page_size }.normalized()
    }

    /// Clamp page to at least 1 and reset an out-of-range size to the default
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            page_size: if (1..=MAX_PAGE_SIZE).contains(&self.page_size) {
                self.page_size
            } else {
                DEFAULT_PAGE_SIZE
            },
        }
    }

    /// Number of items skipped before this page
    #[must_use]
    pub fn offset(self) -> usize {
        let n = self.normalized();
        (n.page as usize - 1) * n.page_size as usize
    }
}

/// One page of results plus the unpaged total
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    /// Cut a page out of an already ordered result set
    #[must_use]
    pub fn from_ordered(all: Vec<T>, request: PageRequest) -> Self {
        let request = request.normalized();
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(request.offset())
            .take(request.page_size as usize)
            .collect();
        Self {
            items,
            total,
            page: request.page,
            page_size: request.page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_out_of_range_values() {
        assert_eq!(PageRequest::new(0, 0), PageRequest { page: 1, page_size: 20 });
        assert_eq!(PageRequest::new(3, 101), PageRequest { page: 3, page_size: 20 });
        assert_eq!(PageRequest::new(2, 100), PageRequest { page: 2, page_size: 100 });
    }

    #[test]
    fn slices_ordered_results() {
        let page = Page::from_ordered((0..45).collect::<Vec<_>>(), PageRequest::new(3, 20));
        assert_eq!(page.total, 45);
        assert_eq!(page.items, (40..45).collect::<Vec<_>>());

        let beyond = Page::from_ordered((0..5).collect::<Vec<_>>(), PageRequest::new(9, 20));
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total, 5);
    }
}
