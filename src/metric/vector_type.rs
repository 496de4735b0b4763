//! Stored vector encodings.
//!
//! Every encoding is a fixed-size item for a given dimensionality:
//! ```text
//! [dim: u16][unused: u16][element * dim]
//! ```
//! little-endian. Distance math always runs on f32; narrower encodings are
//! promoted on read.

use bytes::{Buf, BufMut};
use half::f16;

use crate::error::{IvfError, Result};

/// Encoding, size and accumulation rules for one element type.
pub trait VectorType: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Largest dimensionality this encoding supports in an index.
    fn max_dimensions(&self) -> usize;

    /// Encoded size in bytes of one vector with `dimensions` elements.
    fn item_size(&self, dimensions: usize) -> usize;

    /// Append the encoding of `v` to `out`; writes exactly `item_size(v.len())` bytes.
    fn encode(&self, v: &[f32], out: &mut Vec<u8>);

    fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>>;

    /// Add `v` into a running per-dimension sum used to compute means.
    fn accumulate(&self, sum: &mut [f32], v: &[f32]) {
        for (s, x) in sum.iter_mut().zip(v) {
            *s += x;
        }
    }

    /// Snap a freshly computed center to what this encoding can represent.
    fn round_center(&self, _center: &mut [f32]) {}
}

const HEADER_SIZE: usize = 4;

fn read_header(buf: &mut &[u8], elem_size: usize) -> Result<usize> {
    if buf.remaining() < HEADER_SIZE {
        return Err(IvfError::Encoding(format!(
            "vector item of {} bytes is shorter than its header",
            buf.remaining()
        )));
    }
    let dim = buf.get_u16_le() as usize;
    let _unused = buf.get_u16_le();
    if buf.remaining() < dim * elem_size {
        return Err(IvfError::Encoding(format!(
            "vector item declares {dim} dimensions but carries {} bytes",
            buf.remaining()
        )));
    }
    Ok(dim)
}

/// Single-precision elements: `4 + 4 * dim` bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct F32Vector;

impl VectorType for F32Vector {
    fn name(&self) -> &'static str {
        "f32"
    }

    fn max_dimensions(&self) -> usize {
        2000
    }

    fn item_size(&self, dimensions: usize) -> usize {
        HEADER_SIZE + 4 * dimensions
    }

    fn encode(&self, v: &[f32], out: &mut Vec<u8>) {
        out.reserve(self.item_size(v.len()));
        out.put_u16_le(v.len() as u16);
        out.put_u16_le(0);
        for &x in v {
            out.put_f32_le(x);
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let mut buf = bytes;
        let dim = read_header(&mut buf, 4)?;
        Ok((0..dim).map(|_| buf.get_f32_le()).collect())
    }
}

/// IEEE half-precision elements: `4 + 2 * dim` bytes.
///
/// Halves page footprint; centers are rounded to f16 so stored centers and
/// trained centers agree exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct HalfVector;

impl VectorType for HalfVector {
    fn name(&self) -> &'static str {
        "f16"
    }

    fn max_dimensions(&self) -> usize {
        4000
    }

    fn item_size(&self, dimensions: usize) -> usize {
        HEADER_SIZE + 2 * dimensions
    }

    fn encode(&self, v: &[f32], out: &mut Vec<u8>) {
        out.reserve(self.item_size(v.len()));
        out.put_u16_le(v.len() as u16);
        out.put_u16_le(0);
        for &x in v {
            out.put_slice(&f16::from_f32(x).to_le_bytes());
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        let mut buf = bytes;
        let dim = read_header(&mut buf, 2)?;
        Ok((0..dim)
            .map(|_| f16::from_bits(buf.get_u16_le()).to_f32())
            .collect())
    }

    fn round_center(&self, center: &mut [f32]) {
        let max = f16::MAX.to_f32();
        for x in center.iter_mut() {
            *x = f16::from_f32(x.clamp(-max, max)).to_f32();
        }
    }
}
