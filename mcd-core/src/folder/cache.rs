//! Copy-on-write page cache.
//!
//! Writes never go straight to the host. A page is loaded on its first
//! write, a pristine copy is kept beside it, and the flush engine later
//! decides what actually has to reach the host.

use std::collections::BTreeMap;

use crate::card::PAGE_SIZE;

pub type Page = [u8; PAGE_SIZE];

#[derive(Default)]
pub struct PageCache {
    pages: BTreeMap<u32, Page>,
    /// Page contents as of the first write since the last flush.
    old: BTreeMap<u32, Page>,
}

impl PageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn contains(&self, page: u32) -> bool {
        self.pages.contains_key(&page)
    }

    pub fn get(&self, page: u32) -> Option<&Page> {
        self.pages.get(&page)
    }

    /// Start caching `page` with `data` as both current and pristine contents.
    pub fn insert_loaded(&mut self, page: u32, data: Page) {
        self.old.insert(page, data);
        self.pages.insert(page, data);
    }

    /// Copy `src` into a cached page at `offset`. Returns false if the page is not cached.
    pub fn write(&mut self, page: u32, offset: usize, src: &[u8]) -> bool {
        match self.pages.get_mut(&page) {
            Some(data) => {
                data[offset..offset + src.len()].copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// Remove a page for flushing.
    pub fn take(&mut self, page: u32) -> Option<Page> {
        self.pages.remove(&page)
    }

    /// Drop a cached page whose bytes equal its pristine copy. Returns whether it was dropped.
    pub fn discard_if_unchanged(&mut self, page: u32) -> bool {
        let unchanged = match (self.pages.get(&page), self.old.get(&page)) {
            (Some(new), Some(old)) => new == old,
            _ => false,
        };
        if unchanged {
            self.pages.remove(&page);
        }
        unchanged
    }

    /// Cached page numbers below `limit`, ascending.
    pub fn pages_below(&self, limit: u32) -> Vec<u32> {
        self.pages.range(..limit).map(|(&page, _)| page).collect()
    }

    /// Drop every cached page at or above `limit`; returns how many went.
    pub fn discard_from(&mut self, limit: u32) -> usize {
        let dropped = self.pages.split_off(&limit);
        dropped.len()
    }

    pub fn clear_old(&mut self) {
        self.old.clear();
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.old.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_requires_load() {
        let mut cache = PageCache::new();
        assert!(!cache.write(3, 0, &[1, 2]));
        cache.insert_loaded(3, [0xFF; PAGE_SIZE]);
        assert!(cache.write(3, 10, &[1, 2]));
        assert_eq!(&cache.get(3).unwrap()[9..13], &[0xFF, 1, 2, 0xFF]);
    }

    #[test]
    fn test_discard_if_unchanged() {
        let mut cache = PageCache::new();
        cache.insert_loaded(1, [0; PAGE_SIZE]);
        cache.insert_loaded(2, [0; PAGE_SIZE]);
        cache.write(2, 0, &[9]);
        // Rewriting identical bytes still counts as unchanged.
        cache.write(1, 0, &[0]);

        assert!(cache.discard_if_unchanged(1));
        assert!(!cache.discard_if_unchanged(2));
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
    }

    #[test]
    fn test_page_ranges() {
        let mut cache = PageCache::new();
        for page in [0, 5, 100, 200] {
            cache.insert_loaded(page, [0; PAGE_SIZE]);
        }
        assert_eq!(cache.pages_below(101), vec![0, 5, 100]);
        assert_eq!(cache.discard_from(101), 1);
        assert_eq!(cache.len(), 3);
        assert!(cache.take(5).is_some());
        assert!(cache.take(5).is_none());
    }
}
