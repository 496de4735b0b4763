//! Training-set sampling.
//!
//! Two stages: Knuth's Algorithm S picks which blocks of the row source to
//! read, then Vitter's reservoir sampling keeps a uniform subset of the
//! admitted rows of those blocks. Both draw from the build's seeded
//! generator, so a fixed seed gives a fixed sample.

use rand::Rng;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::error::{IvfError, Result};
use crate::metric::OpClass;
use crate::source::RowSource;

/// Rows sampled per list, before the floor below applies.
pub const SAMPLES_PER_LIST: usize = 50;
pub const MIN_SAMPLES: usize = 10_000;

/// Sample budget for a build of `lists` clusters.
pub fn sample_target(lists: usize, has_source: bool) -> usize {
    if !has_source {
        return 1;
    }
    (lists * SAMPLES_PER_LIST).max(MIN_SAMPLES)
}

/// Uniform draw from the open interval (0, 1).
fn random_fract<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    loop {
        let x: f64 = rng.gen();
        if x > 0.0 {
            return x;
        }
    }
}

/// Knuth's Algorithm S: choose `n` of `total` block numbers in ascending order.
pub struct BlockSampler {
    total: u32,
    target: usize,
    visited: u32,
    chosen: usize,
}

impl BlockSampler {
    pub fn new(total: u32, target: usize) -> Self {
        Self {
            total,
            target,
            visited: 0,
            chosen: 0,
        }
    }

    pub fn has_more(&self) -> bool {
        self.visited < self.total && self.chosen < self.target
    }

    pub fn next_block<R: Rng + ?Sized>(&mut self, rng: &mut R) -> u32 {
        let remaining_blocks = (self.total - self.visited) as f64;
        let still_needed = (self.target - self.chosen) as f64;

        if still_needed >= remaining_blocks {
            self.chosen += 1;
            let block = self.visited;
            self.visited += 1;
            return block;
        }

        let v = random_fract(rng);
        let mut k = remaining_blocks;
        let mut p = 1.0 - still_needed / k;
        while v < p {
            self.visited += 1;
            k -= 1.0;
            p *= 1.0 - still_needed / k;
        }
        self.chosen += 1;
        let block = self.visited;
        self.visited += 1;
        block
    }
}

/// Fixed-capacity reservoir over a stream of rows.
///
/// Once full, each new row either replaces a random slot or is skipped; skip
/// lengths come from Algorithm X while the stream is short relative to the
/// reservoir and Algorithm Z afterwards.
pub struct Reservoir {
    capacity: usize,
    samples: Vec<Vec<f32>>,
    seen: u64,
    skip: i64,
    w: f64,
}

impl Reservoir {
    pub fn new<R: Rng + ?Sized>(capacity: usize, rng: &mut R) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: Vec::with_capacity(capacity.min(1 << 16)),
            seen: 0,
            skip: -1,
            w: (-random_fract(rng).ln() / capacity as f64).exp(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Rows offered so far.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn offer<R: Rng + ?Sized>(&mut self, row: Vec<f32>, rng: &mut R) {
        if self.samples.len() < self.capacity {
            self.samples.push(row);
        } else {
            if self.skip < 0 {
                self.skip = self.next_skip(rng) as i64;
            }
            if self.skip <= 0 {
                let k = ((self.capacity as f64 * random_fract(rng)) as usize).min(self.capacity - 1);
                self.samples[k] = row;
            }
            self.skip -= 1;
        }
        self.seen += 1;
    }

    /// Number of upcoming rows to pass over before the next replacement.
    fn next_skip<R: Rng + ?Sized>(&mut self, rng: &mut R) -> f64 {
        let n = self.capacity as f64;
        let mut t = self.seen as f64;
        let mut s = 0.0;

        if t <= 22.0 * n {
            // Algorithm X
            let v = random_fract(rng);
            t += 1.0;
            let mut quot = (t - n) / t;
            while quot > v {
                s += 1.0;
                t += 1.0;
                quot *= (t - n) / t;
            }
            return s;
        }

        // Algorithm Z
        let mut w = self.w;
        let term = t - n + 1.0;
        loop {
            let u = random_fract(rng);
            let x = t * (w - 1.0);
            s = x.floor();
            let tmp = (t + 1.0) / term;
            let lhs = ((((u * tmp * tmp) * (term + s)) / (t + x)).ln() / n).exp();
            let rhs = (((t + x) / (term + s)) * term) / t;
            if lhs <= rhs {
                w = rhs / lhs;
                break;
            }
            let mut y = (((u * (t + 1.0)) / term) * (t + s + 1.0)) / (t + x);
            let (mut denom, numer_lim) = if n < s {
                (t, term + s)
            } else {
                (t - n + s, t + 1.0)
            };
            let mut numer = t + s;
            while numer >= numer_lim {
                y *= numer / denom;
                denom -= 1.0;
                numer -= 1.0;
            }
            w = (-random_fract(rng).ln() / n).exp();
            if (y.ln() / n).exp() <= (t + x) / t {
                break;
            }
        }
        self.w = w;
        s
    }

    pub fn into_samples(self) -> Vec<Vec<f32>> {
        self.samples
    }
}

/// Draw the training sample for a build.
///
/// Rows are admitted the way the trainer will see them: nulls are dropped,
/// and under a kmeans-normalize role zero-norm rows are dropped and the rest
/// normalized.
pub fn sample_rows<R: Rng + ?Sized>(
    source: &dyn RowSource,
    opclass: &OpClass,
    dimensions: usize,
    need: usize,
    rng: &mut R,
    cancel: &CancellationToken,
) -> Result<Vec<Vec<f32>>> {
    let mut blocks = BlockSampler::new(source.block_count(), need);
    let mut reservoir = Reservoir::new(need, rng);
    let mut sampled_blocks = 0u32;

    while blocks.has_more() {
        cancel.check()?;
        let block = blocks.next_block(rng);
        sampled_blocks += 1;
        source.scan_block(block, &mut |_row, value| {
            let Some(value) = value else {
                return Ok(());
            };
            if value.len() != dimensions {
                return Err(IvfError::DimensionMismatch {
                    expected: dimensions,
                    actual: value.len(),
                });
            }
            if let Some(sample) = opclass.prepare_sample(value) {
                reservoir.offer(sample, &mut *rng);
            }
            Ok(())
        })?;
    }

    debug!(
        blocks = sampled_blocks,
        total_blocks = source.block_count(),
        rows_seen = reservoir.seen(),
        samples = reservoir.len(),
        "sampled training rows"
    );
    Ok(reservoir.into_samples())
}

/// Warn when there is too little data to give every list a sample.
pub fn warn_if_sparse(samples: usize, lists: usize) {
    if samples < lists {
        warn!(
            samples,
            lists, "ivfflat index created with little data; this will cause low recall"
        );
    }
}
