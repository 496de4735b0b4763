//! Row sources the index is built from.
//!
//! A source is organized in blocks so the sampler can pick a random subset
//! of blocks before looking at any row.

use crate::error::Result;
use crate::types::RowRef;

/// Callback invoked per row; `None` is a null vector.
pub type RowVisitor<'a> = dyn FnMut(RowRef, Option<&[f32]>) -> Result<()> + 'a;

pub trait RowSource: Send + Sync {
    fn block_count(&self) -> u32;

    /// Visit every row stored in `block`, in row order.
    fn scan_block(&self, block: u32, visit: &mut RowVisitor<'_>) -> Result<()>;

    /// Visit every row of the source once.
    fn scan_all(&self, visit: &mut RowVisitor<'_>) -> Result<()> {
        for block in 0..self.block_count() {
            self.scan_block(block, visit)?;
        }
        Ok(())
    }
}

/// An in-memory table of optional vectors laid out in fixed-size blocks.
///
/// Row references carry `(block, offset)` with offsets starting at 1.
#[derive(Debug, Clone)]
pub struct TableSource {
    rows_per_block: usize,
    blocks: Vec<Vec<Option<Vec<f32>>>>,
}

impl TableSource {
    pub fn new(rows_per_block: usize) -> Self {
        Self {
            rows_per_block: rows_per_block.clamp(1, u16::MAX as usize - 1),
            blocks: Vec::new(),
        }
    }

    pub fn from_vectors<I>(rows_per_block: usize, vectors: I) -> Self
    where
        I: IntoIterator<Item = Vec<f32>>,
    {
        let mut table = Self::new(rows_per_block);
        for v in vectors {
            table.push(Some(v));
        }
        table
    }

    /// Append a row, returning its reference.
    pub fn push(&mut self, vector: Option<Vec<f32>>) -> RowRef {
        let needs_block = self
            .blocks
            .last()
            .map_or(true, |b| b.len() >= self.rows_per_block);
        if needs_block {
            self.blocks.push(Vec::with_capacity(self.rows_per_block));
        }
        let block_no = self.blocks.len() - 1;
        let block = &mut self.blocks[block_no];
        block.push(vector);
        RowRef::new(block_no as u32, block.len() as u16)
    }

    pub fn get(&self, row: RowRef) -> Option<&[f32]> {
        let offset = (row.offset() as usize).checked_sub(1)?;
        self.blocks
            .get(row.block() as usize)?
            .get(offset)?
            .as_deref()
    }

    pub fn len(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every row reference with its vector, in storage order.
    pub fn rows(&self) -> impl Iterator<Item = (RowRef, Option<&[f32]>)> + '_ {
        self.blocks.iter().enumerate().flat_map(|(b, rows)| {
            rows.iter()
                .enumerate()
                .map(move |(i, v)| (RowRef::new(b as u32, (i + 1) as u16), v.as_deref()))
        })
    }
}

impl RowSource for TableSource {
    fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    fn scan_block(&self, block: u32, visit: &mut RowVisitor<'_>) -> Result<()> {
        if let Some(rows) = self.blocks.get(block as usize) {
            for (i, v) in rows.iter().enumerate() {
                visit(RowRef::new(block, (i + 1) as u16), v.as_deref())?;
            }
        }
        Ok(())
    }
}
