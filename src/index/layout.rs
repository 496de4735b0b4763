//! On-page encodings of the meta page, the list directory and list entries.
//!
//! ```text
//! page 0        meta      [version: u32][dimensions: u16][lists: u16]
//! page 1..      directory [start_page: u32][insert_page: u32][center]   per list
//! entry pages             [vector][row_ref: u64]                       per row
//! ```
//!
//! All integers are little-endian. Vector bytes use the opclass's
//! [`VectorType`] encoding, so every item of a kind has the same size within
//! one index.

use bytes::{Buf, BufMut};

use crate::error::{IvfError, Result};
use crate::metric::VectorType;
use crate::storage::{LockMode, Page, PageStore};
use crate::types::{PageId, RowRef, INVALID_PAGE};

pub const FORMAT_VERSION: u32 = 1;

pub const META_PAGE: PageId = 0;
pub const FIRST_DIRECTORY_PAGE: PageId = 1;

/// Page kind tags stored in the trailer.
pub const META_KIND: u16 = 0x1F01;
pub const DIRECTORY_KIND: u16 = 0x1F02;
pub const ENTRY_KIND: u16 = 0x1F03;

const META_SIZE: usize = 8;
const LIST_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaPage {
    pub version: u32,
    pub dimensions: usize,
    pub lists: usize,
}

impl MetaPage {
    pub fn new(dimensions: usize, lists: usize) -> Self {
        Self {
            version: FORMAT_VERSION,
            dimensions,
            lists,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(META_SIZE);
        out.put_u32_le(self.version);
        out.put_u16_le(self.dimensions as u16);
        out.put_u16_le(self.lists as u16);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < META_SIZE {
            return Err(IvfError::corrupt(META_PAGE, "meta item too short"));
        }
        let mut buf = bytes;
        Ok(Self {
            version: buf.get_u32_le(),
            dimensions: buf.get_u16_le() as usize,
            lists: buf.get_u16_le() as usize,
        })
    }

    /// Read and validate the meta page of a built index.
    pub fn load(store: &PageStore) -> Result<Self> {
        let page = store.read(META_PAGE, LockMode::Shared)?;
        if page.kind_tag() != META_KIND {
            return Err(IvfError::corrupt(
                META_PAGE,
                format!("expected meta page, found kind {:#06x}", page.kind_tag()),
            ));
        }
        let meta = Self::decode(item(&page, META_PAGE, 0)?)?;
        if meta.version != FORMAT_VERSION {
            return Err(IvfError::corrupt(
                META_PAGE,
                format!("unsupported format version {}", meta.version),
            ));
        }
        Ok(meta)
    }
}

/// Where one [`ListEntry`] lives in the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListAddr {
    pub page: PageId,
    pub slot: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub start_page: PageId,
    pub insert_page: PageId,
    pub center: Vec<f32>,
}

impl ListEntry {
    pub fn unset(center: Vec<f32>) -> Self {
        Self {
            start_page: INVALID_PAGE,
            insert_page: INVALID_PAGE,
            center,
        }
    }

    pub fn encoded_size(vector_type: &dyn VectorType, dimensions: usize) -> usize {
        LIST_HEADER_SIZE + vector_type.item_size(dimensions)
    }

    pub fn encode(&self, vector_type: &dyn VectorType) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_size(vector_type, self.center.len()));
        out.put_u32_le(self.start_page);
        out.put_u32_le(self.insert_page);
        vector_type.encode(&self.center, &mut out);
        out
    }

    pub fn decode(bytes: &[u8], vector_type: &dyn VectorType) -> Result<Self> {
        if bytes.len() < LIST_HEADER_SIZE {
            return Err(IvfError::Encoding(format!(
                "list entry of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let mut buf = bytes;
        let start_page = buf.get_u32_le();
        let insert_page = buf.get_u32_le();
        Ok(Self {
            start_page,
            insert_page,
            center: vector_type.decode(buf)?,
        })
    }

    /// Overwrite the page pointers of an encoded entry in place.
    pub fn write_pages(item: &mut [u8], start_page: PageId, insert_page: PageId) {
        let mut head = &mut item[..LIST_HEADER_SIZE];
        head.put_u32_le(start_page);
        head.put_u32_le(insert_page);
    }

    pub fn read_pages(item: &[u8]) -> Result<(PageId, PageId)> {
        if item.len() < LIST_HEADER_SIZE {
            return Err(IvfError::Encoding(format!(
                "list entry of {} bytes is shorter than its header",
                item.len()
            )));
        }
        let mut head = &item[..LIST_HEADER_SIZE];
        Ok((head.get_u32_le(), head.get_u32_le()))
    }
}

/// One indexed row as stored on an entry page.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub vector: Vec<f32>,
    pub row: RowRef,
}

impl Entry {
    pub fn encoded_size(vector_type: &dyn VectorType, dimensions: usize) -> usize {
        vector_type.item_size(dimensions) + RowRef::SIZE
    }

    pub fn encode(vector: &[f32], row: RowRef, vector_type: &dyn VectorType) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_size(vector_type, vector.len()));
        vector_type.encode(vector, &mut out);
        out.put_slice(&row.to_le_bytes());
        out
    }

    /// The row reference trails the vector, so it can be read without decoding.
    pub fn row_of(bytes: &[u8]) -> Result<RowRef> {
        if bytes.len() < RowRef::SIZE {
            return Err(IvfError::Encoding(format!(
                "entry of {} bytes has no row reference",
                bytes.len()
            )));
        }
        let mut raw = [0u8; RowRef::SIZE];
        raw.copy_from_slice(&bytes[bytes.len() - RowRef::SIZE..]);
        Ok(RowRef::from_le_bytes(raw))
    }

    pub fn decode(bytes: &[u8], vector_type: &dyn VectorType) -> Result<Self> {
        let row = Self::row_of(bytes)?;
        let vector = vector_type.decode(&bytes[..bytes.len() - RowRef::SIZE])?;
        Ok(Self { vector, row })
    }
}

/// Item bytes at `slot`, or a corruption error naming the page.
pub fn item(page: &Page, id: PageId, slot: usize) -> Result<&[u8]> {
    page.item(slot)
        .ok_or_else(|| IvfError::corrupt(id, format!("missing item at slot {slot}")))
}

/// Every directory entry in list order, with its address.
///
/// Directory pages are latched shared one at a time.
pub fn read_directory(
    store: &PageStore,
    vector_type: &dyn VectorType,
) -> Result<Vec<(ListAddr, ListEntry)>> {
    let mut lists = Vec::new();
    let mut next = FIRST_DIRECTORY_PAGE;
    while next != INVALID_PAGE {
        let page = store.read(next, LockMode::Shared)?;
        if page.kind_tag() != DIRECTORY_KIND {
            return Err(IvfError::corrupt(
                next,
                format!("expected directory page, found kind {:#06x}", page.kind_tag()),
            ));
        }
        for slot in 0..page.item_count() {
            let entry = ListEntry::decode(item(&page, next, slot)?, vector_type)?;
            lists.push((ListAddr { page: next, slot }, entry));
        }
        next = page.next_page();
    }
    Ok(lists)
}

/// Advance a list's insert hint without ever moving it backwards.
///
/// When `start_page` is given it is written as well (build only). Returns
/// whether the directory changed.
pub fn update_list(
    store: &PageStore,
    addr: ListAddr,
    start_page: Option<PageId>,
    insert_page: PageId,
) -> Result<bool> {
    let handle = store.read(addr.page, LockMode::Exclusive)?;
    let (current_start, current_insert) = ListEntry::read_pages(item(&handle, addr.page, addr.slot)?)?;

    let new_start = start_page.unwrap_or(current_start);
    let advance = insert_page != INVALID_PAGE
        && insert_page != current_insert
        && (current_insert == INVALID_PAGE || insert_page >= current_insert);
    let new_insert = if advance { insert_page } else { current_insert };
    if new_start == current_start && new_insert == current_insert {
        return Ok(false);
    }

    let mut txn = store.begin_atomic_write();
    let slot = txn.register(handle)?;
    let bytes = txn
        .page_mut(slot)
        .item_mut(addr.slot)
        .ok_or_else(|| IvfError::corrupt(addr.page, format!("missing item at slot {}", addr.slot)))?;
    ListEntry::write_pages(bytes, new_start, new_insert);
    store.commit(txn)?;
    Ok(true)
}
