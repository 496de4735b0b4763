//! Scalar distance kernels.
//!
//! Loops run over fixed chunks of 8 lanes so LLVM can emit SIMD code when
//! compiling with `-C target-cpu=native`. Accumulation is in f32; callers
//! widen to f64 at the metric boundary.

const LANES: usize = 8;

/// `sum((a_i - b_i)^2)`.
#[inline]
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector dimensions must match");

    let mut acc = [0.0f32; LANES];
    let mut a_chunks = a.chunks_exact(LANES);
    let mut b_chunks = b.chunks_exact(LANES);
    for (ca, cb) in (&mut a_chunks).zip(&mut b_chunks) {
        for j in 0..LANES {
            let d = ca[j] - cb[j];
            acc[j] += d * d;
        }
    }

    let mut sum: f32 = acc.iter().sum();
    for (x, y) in a_chunks.remainder().iter().zip(b_chunks.remainder()) {
        let d = x - y;
        sum += d * d;
    }
    sum
}

/// `sum(a_i * b_i)`.
#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "vector dimensions must match");

    let mut acc = [0.0f32; LANES];
    let mut a_chunks = a.chunks_exact(LANES);
    let mut b_chunks = b.chunks_exact(LANES);
    for (ca, cb) in (&mut a_chunks).zip(&mut b_chunks) {
        for j in 0..LANES {
            acc[j] += ca[j] * cb[j];
        }
    }

    let mut sum: f32 = acc.iter().sum();
    for (x, y) in a_chunks.remainder().iter().zip(b_chunks.remainder()) {
        sum += x * y;
    }
    sum
}

/// (dot, ||a||^2, ||b||^2) in a single pass.
#[inline]
pub fn cosine_parts(a: &[f32], b: &[f32]) -> (f32, f32, f32) {
    debug_assert_eq!(a.len(), b.len(), "vector dimensions must match");

    let mut d = [0.0f32; LANES];
    let mut na = [0.0f32; LANES];
    let mut nb = [0.0f32; LANES];
    let mut a_chunks = a.chunks_exact(LANES);
    let mut b_chunks = b.chunks_exact(LANES);
    for (ca, cb) in (&mut a_chunks).zip(&mut b_chunks) {
        for j in 0..LANES {
            d[j] += ca[j] * cb[j];
            na[j] += ca[j] * ca[j];
            nb[j] += cb[j] * cb[j];
        }
    }

    let (mut dot, mut norm_a, mut norm_b) = (
        d.iter().sum::<f32>(),
        na.iter().sum::<f32>(),
        nb.iter().sum::<f32>(),
    );
    for (x, y) in a_chunks.remainder().iter().zip(b_chunks.remainder()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    (dot, norm_a, norm_b)
}

/// Squared norm accumulated in f64, used where exact unit length matters.
#[inline]
pub fn squared_norm_f64(v: &[f32]) -> f64 {
    v.iter().map(|&x| (x as f64) * (x as f64)).sum()
}
