//! Stable external sort of `(key, payload)` pairs.
//!
//! Pairs accumulate in memory until their encoded size passes the budget;
//! the buffer is then stably sorted and spilled to an anonymous temp file as
//! a bincode run. `finish` merges the runs with a k-way heap, breaking key
//! ties by run order so the overall sort stays stable.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// f64 distance with a total order, usable as a sort key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderedDistance(pub f64);

impl PartialEq for OrderedDistance {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedDistance {}

impl PartialOrd for OrderedDistance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedDistance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

struct Run {
    file: File,
    len: u64,
}

pub struct ExternalSorter<K, V> {
    buffer: Vec<(K, V)>,
    buffered_bytes: usize,
    budget: usize,
    runs: Vec<Run>,
    total: u64,
}

impl<K, V> ExternalSorter<K, V>
where
    K: Ord + Serialize + DeserializeOwned,
    V: Serialize + DeserializeOwned,
{
    /// `budget` is the in-memory size, in encoded bytes, before a spill.
    pub fn new(budget: usize) -> Self {
        Self {
            buffer: Vec::new(),
            buffered_bytes: 0,
            budget: budget.max(1),
            runs: Vec::new(),
            total: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn spilled_runs(&self) -> usize {
        self.runs.len()
    }

    pub fn push(&mut self, key: K, value: V) -> Result<()> {
        let pair = (key, value);
        self.buffered_bytes += bincode::serialized_size(&pair)? as usize;
        self.buffer.push(pair);
        self.total += 1;
        if self.buffered_bytes > self.budget {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.buffer.sort_by(|a, b| a.0.cmp(&b.0));

        let mut file = tempfile::tempfile()?;
        let len = self.buffer.len() as u64;
        {
            let mut writer = BufWriter::new(&mut file);
            for pair in self.buffer.drain(..) {
                bincode::serialize_into(&mut writer, &pair)?;
            }
            writer.flush()?;
        }
        file.seek(SeekFrom::Start(0))?;

        debug!(
            run = self.runs.len(),
            items = len,
            bytes = self.buffered_bytes,
            "spilled sort run"
        );
        self.runs.push(Run { file, len });
        self.buffered_bytes = 0;
        Ok(())
    }

    /// Sort everything pushed so far and return it in ascending key order.
    pub fn finish(mut self) -> Result<SortedIter<K, V>> {
        if self.runs.is_empty() {
            self.buffer.sort_by(|a, b| a.0.cmp(&b.0));
            return Ok(SortedIter {
                source: Source::Memory(self.buffer.into_iter()),
            });
        }

        self.spill()?;
        let mut readers: Vec<RunReader> = self
            .runs
            .into_iter()
            .map(|run| RunReader {
                reader: BufReader::new(run.file),
                remaining: run.len,
            })
            .collect();

        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (run, reader) in readers.iter_mut().enumerate() {
            if let Some((key, value)) = reader.next_pair()? {
                heap.push(HeapEntry { key, run, value });
            }
        }
        Ok(SortedIter {
            source: Source::Merge { readers, heap },
        })
    }
}

struct RunReader {
    reader: BufReader<File>,
    remaining: u64,
}

impl RunReader {
    fn next_pair<K: DeserializeOwned, V: DeserializeOwned>(&mut self) -> Result<Option<(K, V)>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(bincode::deserialize_from(&mut self.reader)?))
    }
}

struct HeapEntry<K, V> {
    key: K,
    run: usize,
    value: V,
}

impl<K: Ord, V> PartialEq for HeapEntry<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<K: Ord, V> Eq for HeapEntry<K, V> {}

impl<K: Ord, V> PartialOrd for HeapEntry<K, V> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, V> Ord for HeapEntry<K, V> {
    // Reversed: BinaryHeap is a max-heap and we pop the smallest (key, run).
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.run.cmp(&self.run))
    }
}

/// Ascending stream of sorted pairs; read errors from spilled runs surface
/// as `Err` items.
pub struct SortedIter<K, V> {
    source: Source<K, V>,
}

enum Source<K, V> {
    Memory(std::vec::IntoIter<(K, V)>),
    Merge {
        readers: Vec<RunReader>,
        heap: BinaryHeap<HeapEntry<K, V>>,
    },
}

impl<K, V> Iterator for SortedIter<K, V>
where
    K: Ord + DeserializeOwned,
    V: DeserializeOwned,
{
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            Source::Memory(iter) => iter.next().map(Ok),
            Source::Merge { readers, heap } => {
                let HeapEntry { key, run, value } = heap.pop()?;
                match readers[run].next_pair() {
                    Ok(Some((k, v))) => heap.push(HeapEntry {
                        key: k,
                        run,
                        value: v,
                    }),
                    Ok(None) => {}
                    Err(e) => return Some(Err(e)),
                }
                Some(Ok((key, value)))
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_sort_is_stable() {
        let mut sorter = ExternalSorter::new(1 << 20);
        for (i, key) in [3u32, 1, 3, 2, 1].into_iter().enumerate() {
            sorter.push(key, i as u64).unwrap();
        }
        assert_eq!(sorter.spilled_runs(), 0);
        let out: Vec<(u32, u64)> = sorter.finish().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(out, vec![(1, 1), (1, 4), (2, 3), (3, 0), (3, 2)]);
    }

    #[test]
    fn test_spilled_merge_is_stable() {
        // A tiny budget forces a run every couple of pairs.
        let mut sorter = ExternalSorter::new(24);
        let keys: Vec<u32> = (0..200).map(|i| (i * 7919 % 13) as u32).collect();
        for (i, key) in keys.iter().enumerate() {
            sorter.push(*key, i as u64).unwrap();
        }
        assert!(sorter.spilled_runs() > 10);
        assert_eq!(sorter.len(), 200);

        let out: Vec<(u32, u64)> = sorter.finish().unwrap().map(|r| r.unwrap()).collect();
        let mut expected: Vec<(u32, u64)> =
            keys.iter().enumerate().map(|(i, k)| (*k, i as u64)).collect();
        expected.sort_by_key(|(k, _)| *k);
        assert_eq!(out, expected);
    }

    #[test]
    fn test_ordered_distance_total_order() {
        let mut keys = vec![
            OrderedDistance(2.0),
            OrderedDistance(-1.0),
            OrderedDistance(0.5),
        ];
        keys.sort();
        assert_eq!(keys[0].0, -1.0);
        assert_eq!(keys[2].0, 2.0);
    }

    #[test]
    fn test_empty_sorter_yields_nothing() {
        let sorter: ExternalSorter<u32, u32> = ExternalSorter::new(16);
        assert!(sorter.is_empty());
        assert_eq!(sorter.finish().unwrap().count(), 0);
    }
}
