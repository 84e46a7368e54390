//! Page-aligned erase planning for image segments.

use crate::image::MemorySegment;

/// Ordered page-start addresses to erase before writing one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErasePlan {
    page_size: u32,
    pages: Vec<u32>,
}

impl ErasePlan {
    /// Plans the pages covering `[start, end)` at `page_size` granularity.
    ///
    /// The last page index is `end / page_size`, inclusive. When `end` is
    /// page-aligned this plans one page past the data, which is the behavior
    /// existing provisioning scripts rely on.
    ///
    /// Pages past the 32-bit address space are dropped.
    pub fn for_range(start: u32, end: u64, page_size: u32) -> Self {
        assert!(page_size > 0, "page size must be non-zero");

        let page_size_wide = page_size as u64;
        let start_page = start as u64 / page_size_wide;
        let end_page = end / page_size_wide;
        let pages = (start_page..=end_page)
            .filter_map(|page| u32::try_from(page * page_size_wide).ok())
            .collect();

        Self { page_size, pages }
    }

    pub fn for_segment(segment: &MemorySegment, page_size: u32) -> Self {
        Self::for_range(segment.start(), segment.end(), page_size)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn pages(&self) -> &[u32] {
        &self.pages
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl<'a> IntoIterator for &'a ErasePlan {
    type Item = &'a u32;
    type IntoIter = std::slice::Iter<'a, u32>;

    fn into_iter(self) -> Self::IntoIter {
        self.pages.iter()
    }
}
