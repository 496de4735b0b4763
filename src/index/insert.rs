//! Single-row insert: route to the nearest list, then append to its tail.

use tracing::debug;

use super::build::nearest_center;
use super::layout::{self, Entry, ListAddr, ENTRY_KIND};
use crate::error::{IvfError, Result};
use crate::metric::OpClass;
use crate::metrics;
use crate::storage::{LockMode, PageStore};
use crate::types::{PageId, RowRef, INVALID_PAGE};

/// Nearest list over the whole directory, with its current insert page.
fn find_insert_page(
    store: &PageStore,
    opclass: &OpClass,
    value: &[f32],
) -> Result<(ListAddr, PageId)> {
    let lists = layout::read_directory(store, opclass.vector_type())?;
    if lists.is_empty() {
        return Err(IvfError::corrupt(layout::FIRST_DIRECTORY_PAGE, "empty list directory"));
    }
    let centers: Vec<Vec<f32>> = lists.iter().map(|(_, l)| l.center.clone()).collect();
    let (addr, list) = &lists[nearest_center(opclass, &centers, value)];
    Ok((*addr, list.insert_page))
}

/// Add one row to the index.
///
/// Returns `false` without touching the index for a null value, or for a
/// zero vector under a normalizing opclass.
pub fn insert(
    store: &PageStore,
    opclass: &OpClass,
    dimensions: usize,
    value: Option<&[f32]>,
    row: RowRef,
) -> Result<bool> {
    let Some(value) = value else {
        metrics::ROWS_SKIPPED_TOTAL.with_label_values(&["null"]).inc();
        return Ok(false);
    };
    if value.len() != dimensions {
        return Err(IvfError::DimensionMismatch {
            expected: dimensions,
            actual: value.len(),
        });
    }
    let Some(value) = opclass.prepare_row(value) else {
        metrics::ROWS_SKIPPED_TOTAL
            .with_label_values(&["zero_norm"])
            .inc();
        return Ok(false);
    };

    let item = Entry::encode(&value, row, opclass.vector_type());
    let (addr, original) = find_insert_page(store, opclass, &value)?;
    if original == INVALID_PAGE {
        return Err(IvfError::corrupt(
            addr.page,
            format!("list at slot {} has no insert page", addr.slot),
        ));
    }

    let mut target = original;
    loop {
        let handle = store.read(target, LockMode::Exclusive)?;
        if handle.free_space() >= item.len() {
            let mut txn = store.begin_atomic_write();
            let slot = txn.register(handle)?;
            txn.page_mut(slot)
                .add_item(&item)
                .ok_or(IvfError::PageFull {
                    page: target,
                    size: item.len(),
                })?;
            store.commit(txn)?;
            break;
        }

        let next = handle.next_page();
        if next != INVALID_PAGE {
            drop(handle);
            target = next;
            continue;
        }

        // Tail is full: extend the chain. The new page is initialized and
        // linked in one atomic write, then filled in a second.
        let new_page = {
            let ext = store.lock_extension();
            store.allocate_page(&ext)?
        };
        let new_id = new_page.id();
        let mut txn = store.begin_atomic_write();
        let tail = txn.register(handle)?;
        let fresh = txn.register(new_page)?;
        txn.page_mut(fresh).init(ENTRY_KIND);
        txn.page_mut(tail).set_next_page(new_id);
        store.commit(txn)?;
        debug!(from = target, page = new_id, "extended list chain");
        target = new_id;
    }

    if target != original {
        layout::update_list(store, addr, None, target)?;
    }
    metrics::ROWS_INSERTED_TOTAL.inc();
    Ok(true)
}
