//! Fixed-size slotted pages.
//!
//! ## Layout
//!
//! ```text
//! [lower: u16][upper: u16][flags: u16][reserved: u16]      header
//! [offset: u16][len: u16] * item_count                      line pointers, growing up
//! ...free space...
//! item bytes                                                growing down from the trailer
//! [next_page: u32][reserved: u16][kind_tag: u16]            trailer
//! ```
//!
//! All integers are little-endian. A page whose `lower` is zero has never
//! been initialized.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::{PageId, INVALID_PAGE};

pub const HEADER_SIZE: usize = 8;
pub const TRAILER_SIZE: usize = 8;
pub const LINE_POINTER_SIZE: usize = 4;

/// Largest page the u16 offsets can address.
pub const MAX_PAGE_SIZE: usize = 32_768;

#[derive(Clone, PartialEq, Eq)]
pub struct Page {
    data: BytesMut,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("size", &self.data.len())
            .field("items", &self.item_count())
            .field("free", &self.free_space())
            .field("next", &self.next_page())
            .field("kind", &self.kind_tag())
            .finish()
    }
}

impl Page {
    /// A zeroed, uninitialized page.
    pub fn new(size: usize) -> Self {
        Self {
            data: BytesMut::zeroed(size),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: BytesMut::from(bytes),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    fn read_u16(&self, at: usize) -> u16 {
        (&self.data[at..at + 2]).get_u16_le()
    }

    fn write_u16(&mut self, at: usize, v: u16) {
        (&mut self.data[at..at + 2]).put_u16_le(v);
    }

    fn lower(&self) -> usize {
        self.read_u16(0) as usize
    }

    fn upper(&self) -> usize {
        self.read_u16(2) as usize
    }

    fn trailer_start(&self) -> usize {
        self.data.len() - TRAILER_SIZE
    }

    pub fn is_new(&self) -> bool {
        self.lower() == 0
    }

    /// Format as an empty page of the given kind with no successor.
    pub fn init(&mut self, kind_tag: u16) {
        self.data.fill(0);
        let size = self.data.len();
        self.write_u16(0, HEADER_SIZE as u16);
        self.write_u16(2, (size - TRAILER_SIZE) as u16);
        self.set_next_page(INVALID_PAGE);
        let at = self.trailer_start() + 6;
        self.write_u16(at, kind_tag);
    }

    fn flags(&self) -> u16 {
        self.read_u16(4)
    }

    fn set_flags(&mut self, flags: u16) {
        self.write_u16(4, flags);
    }

    pub fn kind_tag(&self) -> u16 {
        self.read_u16(self.trailer_start() + 6)
    }

    pub fn next_page(&self) -> PageId {
        if self.is_new() {
            return INVALID_PAGE;
        }
        let at = self.trailer_start();
        (&self.data[at..at + 4]).get_u32_le()
    }

    pub fn set_next_page(&mut self, next: PageId) {
        let at = self.trailer_start();
        (&mut self.data[at..at + 4]).put_u32_le(next);
    }

    pub fn item_count(&self) -> usize {
        self.lower().saturating_sub(HEADER_SIZE) / LINE_POINTER_SIZE
    }

    /// Bytes available for one more item, after paying for its line pointer.
    pub fn free_space(&self) -> usize {
        if self.is_new() {
            return 0;
        }
        self.upper()
            .saturating_sub(self.lower())
            .saturating_sub(LINE_POINTER_SIZE)
    }

    /// Usable item bytes on an empty page of `page_size`.
    pub fn max_item_size(page_size: usize) -> usize {
        page_size - HEADER_SIZE - TRAILER_SIZE - LINE_POINTER_SIZE
    }

    /// Append an item, returning its slot, or `None` when it does not fit.
    pub fn add_item(&mut self, item: &[u8]) -> Option<usize> {
        if item.is_empty() || self.free_space() < item.len() {
            return None;
        }
        let slot = self.item_count();
        let lower = self.lower();
        let upper = self.upper() - item.len();
        self.data[upper..upper + item.len()].copy_from_slice(item);
        self.write_u16(lower, upper as u16);
        self.write_u16(lower + 2, item.len() as u16);
        self.write_u16(0, (lower + LINE_POINTER_SIZE) as u16);
        self.write_u16(2, upper as u16);
        Some(slot)
    }

    fn item_range(&self, slot: usize) -> Option<std::ops::Range<usize>> {
        if slot >= self.item_count() {
            return None;
        }
        let lp = HEADER_SIZE + slot * LINE_POINTER_SIZE;
        let offset = self.read_u16(lp) as usize;
        let len = self.read_u16(lp + 2) as usize;
        if offset < self.lower() || offset + len > self.trailer_start() {
            return None;
        }
        Some(offset..offset + len)
    }

    /// Item bytes at `slot`; `None` when the slot or its line pointer is invalid.
    pub fn item(&self, slot: usize) -> Option<&[u8]> {
        let range = self.item_range(slot)?;
        Some(&self.data[range])
    }

    pub fn item_mut(&mut self, slot: usize) -> Option<&mut [u8]> {
        let range = self.item_range(slot)?;
        Some(&mut self.data[range])
    }

    /// Remove the given slots and compact the survivors, preserving their order.
    ///
    /// Returns the number of items removed. Out-of-range slots are ignored.
    pub fn multi_delete(&mut self, slots: &[usize]) -> usize {
        let count = self.item_count();
        let mut dead = vec![false; count];
        for &s in slots {
            if s < count {
                dead[s] = true;
            }
        }
        let removed = dead.iter().filter(|d| **d).count();
        if removed == 0 {
            return 0;
        }

        let survivors: Vec<Vec<u8>> = (0..count)
            .filter(|&s| !dead[s])
            .filter_map(|s| self.item(s).map(<[u8]>::to_vec))
            .collect();
        let next = self.next_page();
        let kind = self.kind_tag();
        let flags = self.flags();

        self.init(kind);
        self.set_next_page(next);
        self.set_flags(flags);
        for item in &survivors {
            // Survivors fit: they occupied this page before compaction.
            let _ = self.add_item(item);
        }
        removed
    }

    /// Structural sanity check for pages read back from a backend.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.is_new() {
            return Ok(());
        }
        let (lower, upper) = (self.lower(), self.upper());
        if lower < HEADER_SIZE || upper > self.trailer_start() || lower > upper {
            return Err(format!("bad header bounds lower={lower} upper={upper}"));
        }
        if (lower - HEADER_SIZE) % LINE_POINTER_SIZE != 0 {
            return Err(format!("misaligned line pointer array end {lower}"));
        }
        for slot in 0..self.item_count() {
            if self.item_range(slot).is_none() {
                return Err(format!("line pointer {slot} out of bounds"));
            }
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    const KIND: u16 = 0xF3;

    fn fresh(size: usize) -> Page {
        let mut page = Page::new(size);
        page.init(KIND);
        page
    }

    #[test]
    fn test_new_page_is_uninitialized() {
        let page = Page::new(1024);
        assert!(page.is_new());
        assert_eq!(page.item_count(), 0);
        assert_eq!(page.free_space(), 0);
        assert_eq!(page.next_page(), INVALID_PAGE);
    }

    #[test]
    fn test_init_sets_trailer() {
        let page = fresh(1024);
        assert!(!page.is_new());
        assert_eq!(page.kind_tag(), KIND);
        assert_eq!(page.next_page(), INVALID_PAGE);
        assert_eq!(page.free_space(), Page::max_item_size(1024));
        page.validate().unwrap();
    }

    #[test]
    fn test_items_keep_insertion_order() {
        let mut page = fresh(1024);
        assert_eq!(page.add_item(b"alpha"), Some(0));
        assert_eq!(page.add_item(b"beta"), Some(1));
        assert_eq!(page.item(0).unwrap(), b"alpha");
        assert_eq!(page.item(1).unwrap(), b"beta");
        assert!(page.item(2).is_none());
        page.validate().unwrap();
    }

    #[test]
    fn test_page_fills_exactly() {
        let mut page = fresh(1024);
        let item = vec![7u8; 100];
        let mut added = 0;
        while page.add_item(&item).is_some() {
            added += 1;
        }
        // Each item costs 100 bytes plus a 4 byte line pointer.
        assert_eq!(added, (1024 - HEADER_SIZE - TRAILER_SIZE) / 104);
        assert!(page.free_space() < 100);
    }

    #[test]
    fn test_multi_delete_compacts_and_frees_space() {
        let mut page = fresh(1024);
        for i in 0..6u8 {
            page.add_item(&[i; 50]).unwrap();
        }
        page.set_next_page(99);
        let before = page.free_space();

        assert_eq!(page.multi_delete(&[0, 2, 4, 17]), 3);
        assert_eq!(page.item_count(), 3);
        assert_eq!(page.item(0).unwrap(), &[1u8; 50]);
        assert_eq!(page.item(1).unwrap(), &[3u8; 50]);
        assert_eq!(page.item(2).unwrap(), &[5u8; 50]);
        assert_eq!(page.free_space(), before + 3 * (50 + LINE_POINTER_SIZE));
        assert_eq!(page.next_page(), 99);
        assert_eq!(page.kind_tag(), KIND);
    }

    #[test]
    fn test_item_mut_writes_in_place() {
        let mut page = fresh(512);
        page.add_item(&[0u8; 8]).unwrap();
        page.item_mut(0).unwrap()[0..4].copy_from_slice(&42u32.to_le_bytes());
        let again = Page::from_bytes(page.as_bytes());
        assert_eq!(&again.item(0).unwrap()[0..4], &42u32.to_le_bytes());
    }

    #[test]
    fn test_validate_rejects_garbage_header() {
        let mut bytes = fresh(512).as_bytes().to_vec();
        bytes[0..2].copy_from_slice(&600u16.to_le_bytes());
        assert!(Page::from_bytes(&bytes).validate().is_err());
    }
}
