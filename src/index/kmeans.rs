//! k-means++ seeding and Elkan's accelerated Lloyd iteration for list
//! center training.
//!
//! Elkan keeps, per sample, an upper bound on the distance to its assigned
//! center and a lower bound on the distance to every other center. The
//! triangle inequality lets most distance computations be skipped once the
//! bounds tighten, while producing the same assignments as plain Lloyd.
//!
//! All working state is sized up front and checked against the training
//! memory limit before anything large is allocated.

use std::time::Instant;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::error::{IvfError, Result};
use crate::metric::OpClass;
use crate::metrics;

/// Training knobs taken from [`crate::config::TrainingConfig`].
#[derive(Debug, Clone, Copy)]
pub struct TrainingParams {
    pub max_iterations: usize,
    pub memory_limit: usize,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            memory_limit: 64 * 1024 * 1024,
        }
    }
}

/// Bytes of working state Elkan needs for `n` samples and `k` centers.
pub fn estimate_memory(n: usize, k: usize, dimensions: usize, item_size: usize) -> usize {
    let f = std::mem::size_of::<f32>();
    let i = std::mem::size_of::<i32>();
    let vectors = (n + 2 * k) * item_size; // samples, centers, new centers
    let aggregates = k * dimensions * f;
    let bounds = n * k * f + n * f;
    let center_matrix = k * k * f;
    let per_center = k * (i + 2 * f); // counts, s, shifts
    let per_sample = n * i; // assignments
    vectors + aggregates + bounds + center_matrix + per_center + per_sample
}

/// Produce `k` centers of `dimensions` elements.
///
/// With no samples the centers are random; otherwise they are trained with
/// k-means++ seeding followed by Elkan iteration under the opclass's kmeans
/// roles.
pub fn train_centers<R: Rng + ?Sized>(
    samples: &[Vec<f32>],
    k: usize,
    dimensions: usize,
    opclass: &OpClass,
    params: &TrainingParams,
    rng: &mut R,
    cancel: &CancellationToken,
) -> Result<Vec<Vec<f32>>> {
    if k == 0 {
        return Err(IvfError::InvalidParameter("lists must be > 0".into()));
    }
    if samples.is_empty() {
        debug!(k, dimensions, "no samples, using random centers");
        return Ok(random_centers(k, dimensions, opclass, rng));
    }
    elkan(samples, k, dimensions, opclass, params, rng, cancel)
}

/// Centers with every coordinate drawn uniformly from `[0, 1)`.
pub fn random_centers<R: Rng + ?Sized>(
    k: usize,
    dimensions: usize,
    opclass: &OpClass,
    rng: &mut R,
) -> Vec<Vec<f32>> {
    let normalizer = opclass.kmeans_normalizer().or(opclass.normalizer());
    (0..k)
        .map(|_| {
            let mut center: Vec<f32> = (0..dimensions).map(|_| rng.gen::<f64>() as f32).collect();
            opclass.vector_type().round_center(&mut center);
            match normalizer {
                Some(n) => n.normalize(&center),
                None => center,
            }
        })
        .collect()
}

/// k-means++ seeding.
///
/// Records every sample-to-center distance it computes into `lower`
/// (row-major, `n x k`), which Elkan uses as its initial lower bounds.
fn kmeans_plusplus<R: Rng + ?Sized>(
    samples: &[Vec<f32>],
    k: usize,
    opclass: &OpClass,
    lower: &mut [f32],
    rng: &mut R,
    cancel: &CancellationToken,
) -> Result<Vec<Vec<f32>>> {
    let metric = opclass.kmeans_distance();
    let n = samples.len();
    let mut centers = Vec::with_capacity(k);
    centers.push(samples[rng.gen_range(0..n)].clone());

    let mut weight = vec![f64::from(f32::MAX); n];
    for i in 0..k {
        cancel.check()?;
        let mut sum = 0.0f64;
        for (j, sample) in samples.iter().enumerate() {
            let d = metric.distance(sample, &centers[i]);
            lower[j * k + i] = d as f32;
            let d2 = d * d;
            if d2 < weight[j] {
                weight[j] = d2;
            }
            sum += weight[j];
        }

        if i + 1 == k {
            break;
        }

        // Roulette over squared distances; rounding falls through to the last sample.
        let mut choice = sum * rng.gen::<f64>();
        let mut pick = n - 1;
        for (j, w) in weight.iter().enumerate().take(n - 1) {
            choice -= w;
            if choice <= 0.0 {
                pick = j;
                break;
            }
        }
        centers.push(samples[pick].clone());
    }
    Ok(centers)
}

fn elkan<R: Rng + ?Sized>(
    samples: &[Vec<f32>],
    k: usize,
    dimensions: usize,
    opclass: &OpClass,
    params: &TrainingParams,
    rng: &mut R,
    cancel: &CancellationToken,
) -> Result<Vec<Vec<f32>>> {
    let n = samples.len();
    let item_size = opclass.vector_type().item_size(dimensions);

    if (k as u64) * (k as u64) > i32::MAX as u64 {
        return Err(IvfError::ResourceLimit(format!(
            "{k} lists overflow the center distance matrix"
        )));
    }
    if (n as u64) * (k as u64) > i32::MAX as u64 {
        return Err(IvfError::ResourceLimit(format!(
            "{n} samples x {k} lists overflow the bound matrix"
        )));
    }
    let required = estimate_memory(n, k, dimensions, item_size);
    if required > params.memory_limit {
        return Err(IvfError::MemoryLimitExceeded {
            required_mb: required / (1024 * 1024) + 1,
            limit_mb: params.memory_limit / (1024 * 1024),
        });
    }

    let started = Instant::now();
    info!(n, k, dimensions, required_bytes = required, "starting k-means++ initialization");

    let metric = opclass.kmeans_distance();
    let mut lower = vec![0.0f32; n * k];
    let mut upper = vec![0.0f32; n];
    let mut closest = vec![0usize; n];
    let mut half = vec![0.0f32; k * k];
    let mut s = vec![0.0f32; k];
    let mut new_d = vec![0.0f32; k];

    let mut centers = kmeans_plusplus(samples, k, opclass, &mut lower, rng, cancel)?;

    // Initial assignment straight from the seeding distances.
    for j in 0..n {
        let row = &lower[j * k..(j + 1) * k];
        let mut min = f32::MAX;
        let mut best = 0;
        for (c, &d) in row.iter().enumerate() {
            if d < min {
                min = d;
                best = c;
            }
        }
        upper[j] = min;
        closest[j] = best;
    }

    let mut iterations = 0;
    let mut converged = false;
    for iteration in 0..params.max_iterations {
        cancel.check()?;
        iterations = iteration + 1;
        let mut changes = 0usize;

        // Half distances between centers, and each center's nearest neighbor.
        for a in 0..k {
            for b in a + 1..k {
                let d = (0.5 * metric.distance(&centers[a], &centers[b])) as f32;
                half[a * k + b] = d;
                half[b * k + a] = d;
            }
        }
        for a in 0..k {
            let mut min = f32::MAX;
            for b in 0..k {
                if a != b && half[a * k + b] < min {
                    min = half[a * k + b];
                }
            }
            s[a] = min;
        }

        let reset = iteration != 0;
        for j in 0..n {
            if upper[j] <= s[closest[j]] {
                continue;
            }
            let mut stale = reset;
            for c in 0..k {
                let a = closest[j];
                if c == a
                    || upper[j] <= lower[j * k + c]
                    || upper[j] <= half[a * k + c]
                {
                    continue;
                }

                let dxa = if stale {
                    let d = metric.distance(&samples[j], &centers[a]) as f32;
                    lower[j * k + a] = d;
                    upper[j] = d;
                    stale = false;
                    d
                } else {
                    upper[j]
                };

                if dxa > lower[j * k + c] || dxa > half[a * k + c] {
                    let dxc = metric.distance(&samples[j], &centers[c]) as f32;
                    lower[j * k + c] = dxc;
                    if dxc < dxa {
                        closest[j] = c;
                        upper[j] = dxc;
                        changes += 1;
                    }
                }
            }
        }

        let new_centers = recompute_centers(samples, &closest, k, dimensions, opclass, rng);

        for c in 0..k {
            new_d[c] = metric.distance(&centers[c], &new_centers[c]) as f32;
        }
        for j in 0..n {
            for c in 0..k {
                let d = lower[j * k + c] - new_d[c];
                lower[j * k + c] = d.max(0.0);
            }
            upper[j] += new_d[closest[j]];
        }
        centers = new_centers;

        debug!(iteration, changes, "k-means iteration");
        if changes == 0 && iteration != 0 {
            converged = true;
            break;
        }
    }

    let outcome = if converged { "converged" } else { "max_iterations" };
    metrics::KMEANS_ITERATIONS
        .with_label_values(&[outcome])
        .observe(iterations as f64);
    if !converged {
        warn!(iterations, "k-means stopped before converging");
    }
    info!(
        iterations,
        converged,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "k-means training complete"
    );
    Ok(centers)
}

/// Means of the assigned samples; empty clusters restart at a random point.
fn recompute_centers<R: Rng + ?Sized>(
    samples: &[Vec<f32>],
    closest: &[usize],
    k: usize,
    dimensions: usize,
    opclass: &OpClass,
    rng: &mut R,
) -> Vec<Vec<f32>> {
    let vector_type = opclass.vector_type();
    let mut agg = vec![vec![0.0f32; dimensions]; k];
    let mut counts = vec![0u32; k];
    for (sample, &c) in samples.iter().zip(closest) {
        vector_type.accumulate(&mut agg[c], sample);
        counts[c] += 1;
    }

    for (center, &count) in agg.iter_mut().zip(&counts) {
        if count > 0 {
            for x in center.iter_mut() {
                if x.is_infinite() {
                    *x = if *x > 0.0 { f32::MAX } else { -f32::MAX };
                }
                *x /= count as f32;
            }
        } else {
            for x in center.iter_mut() {
                *x = rng.gen::<f64>() as f32;
            }
        }
        vector_type.round_center(center);
    }

    match opclass.kmeans_normalizer() {
        Some(normalizer) => agg.iter().map(|c| normalizer.normalize(c)).collect(),
        None => agg,
    }
}
