//! Pluggable distance, normalization and encoding roles.
//!
//! An index is parameterized by an [`OpClass`] bundling five roles:
//!
//! | role              | used by                                     |
//! |-------------------|---------------------------------------------|
//! | distance          | assignment, routing, list selection, ranking |
//! | normalize         | build assignment, insert, query operand      |
//! | kmeans distance   | training (falls back to distance)            |
//! | kmeans normalize  | sampling, re-normalizing trained centers     |
//! | vector type       | on-page encoding, center accumulation        |
//!
//! The last four are optional except the vector type; leaving them unset
//! gives the plain distance-only behaviour.

pub mod kernels;
pub mod vector_type;

use std::sync::Arc;

pub use vector_type::{F32Vector, HalfVector, VectorType};

use crate::error::{IvfError, Result};

/// A distance function. Lower is closer.
pub trait Metric: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;
    fn distance(&self, a: &[f32], b: &[f32]) -> f64;
}

/// Projection onto a canonical form (usually the unit sphere).
pub trait Normalizer: Send + Sync + std::fmt::Debug {
    fn norm(&self, v: &[f32]) -> f64;

    fn is_zero_norm(&self, v: &[f32]) -> bool {
        self.norm(v) == 0.0
    }

    /// Zero-norm input is returned unchanged.
    fn normalize(&self, v: &[f32]) -> Vec<f32>;
}

/// Euclidean distance.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2Distance;

impl Metric for L2Distance {
    fn name(&self) -> &'static str {
        "l2"
    }

    #[inline]
    fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        (kernels::squared_l2(a, b) as f64).sqrt()
    }
}

/// `-dot(a, b)` so that larger inner products rank first.
#[derive(Debug, Clone, Copy, Default)]
pub struct NegativeInnerProduct;

impl Metric for NegativeInnerProduct {
    fn name(&self) -> &'static str {
        "inner_product"
    }

    #[inline]
    fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        -(kernels::dot(a, b) as f64)
    }
}

/// `1 - cos(a, b)`; 1.0 when either side has zero magnitude.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineDistance;

impl Metric for CosineDistance {
    fn name(&self) -> &'static str {
        "cosine"
    }

    #[inline]
    fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        let (dot, norm_a, norm_b) = kernels::cosine_parts(a, b);
        let denom = (norm_a as f64 * norm_b as f64).sqrt();
        if denom < f64::EPSILON {
            return 1.0;
        }
        1.0 - (dot as f64 / denom).clamp(-1.0, 1.0)
    }
}

/// Angle between unit vectors scaled to `[0, 1]`.
///
/// Unlike cosine distance this satisfies the triangle inequality, which the
/// trainer's bound pruning depends on. Inputs must already be normalized.
#[derive(Debug, Clone, Copy, Default)]
pub struct SphericalDistance;

impl Metric for SphericalDistance {
    fn name(&self) -> &'static str {
        "spherical"
    }

    #[inline]
    fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        let dot = (kernels::dot(a, b) as f64).clamp(-1.0, 1.0);
        dot.acos() / std::f64::consts::PI
    }
}

/// Scales vectors to unit L2 norm.
#[derive(Debug, Clone, Copy, Default)]
pub struct L2Normalizer;

/// Vectors whose norm is this close to 1 are already normalized.
const UNIT_TOLERANCE: f64 = 1e-6;

impl Normalizer for L2Normalizer {
    fn norm(&self, v: &[f32]) -> f64 {
        kernels::squared_norm_f64(v).sqrt()
    }

    fn normalize(&self, v: &[f32]) -> Vec<f32> {
        let norm = self.norm(v);
        if norm == 0.0 || (norm - 1.0).abs() <= UNIT_TOLERANCE {
            return v.to_vec();
        }
        v.iter().map(|&x| (x as f64 / norm) as f32).collect()
    }
}

/// The five roles an index is built and queried with.
#[derive(Clone)]
pub struct OpClass {
    name: String,
    distance: Arc<dyn Metric>,
    normalizer: Option<Arc<dyn Normalizer>>,
    kmeans_distance: Option<Arc<dyn Metric>>,
    kmeans_normalizer: Option<Arc<dyn Normalizer>>,
    vector_type: Arc<dyn VectorType>,
}

impl std::fmt::Debug for OpClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpClass")
            .field("name", &self.name)
            .field("distance", &self.distance.name())
            .field("normalize", &self.normalizer.is_some())
            .field("kmeans_distance", &self.kmeans_distance().name())
            .field("kmeans_normalize", &self.kmeans_normalizer.is_some())
            .field("vector_type", &self.vector_type.name())
            .finish()
    }
}

impl OpClass {
    /// Distance-only opclass over f32 vectors.
    pub fn new(name: impl Into<String>, distance: Arc<dyn Metric>) -> Self {
        Self {
            name: name.into(),
            distance,
            normalizer: None,
            kmeans_distance: None,
            kmeans_normalizer: None,
            vector_type: Arc::new(F32Vector),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn with_kmeans_distance(mut self, metric: Arc<dyn Metric>) -> Self {
        self.kmeans_distance = Some(metric);
        self
    }

    pub fn with_kmeans_normalizer(mut self, normalizer: Arc<dyn Normalizer>) -> Self {
        self.kmeans_normalizer = Some(normalizer);
        self
    }

    pub fn with_vector_type(mut self, vector_type: Arc<dyn VectorType>) -> Self {
        self.vector_type = vector_type;
        self
    }

    /// Euclidean distance; no normalization anywhere.
    pub fn l2() -> Self {
        Self::new("l2", Arc::new(L2Distance))
    }

    /// Negative inner product; clusters are trained on the unit sphere.
    pub fn inner_product() -> Self {
        Self::new("inner_product", Arc::new(NegativeInnerProduct))
            .with_kmeans_distance(Arc::new(SphericalDistance))
            .with_kmeans_normalizer(Arc::new(L2Normalizer))
    }

    /// Cosine distance; stored rows and queries are normalized.
    pub fn cosine() -> Self {
        Self::new("cosine", Arc::new(CosineDistance))
            .with_normalizer(Arc::new(L2Normalizer))
            .with_kmeans_distance(Arc::new(SphericalDistance))
            .with_kmeans_normalizer(Arc::new(L2Normalizer))
    }

    /// Resolve configuration names such as `("cosine", "f16")`.
    pub fn from_names(opclass: &str, vector_type: &str) -> Result<Self> {
        let base = match opclass {
            "l2" => Self::l2(),
            "inner_product" | "ip" => Self::inner_product(),
            "cosine" => Self::cosine(),
            other => {
                return Err(IvfError::InvalidParameter(format!(
                    "unknown opclass: {other}"
                )))
            }
        };
        match vector_type {
            "f32" => Ok(base),
            "f16" => Ok(base.with_vector_type(Arc::new(HalfVector))),
            other => Err(IvfError::InvalidParameter(format!(
                "unknown vector type: {other}"
            ))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        self.distance.distance(a, b)
    }

    pub fn kmeans_distance(&self) -> &dyn Metric {
        self.kmeans_distance
            .as_deref()
            .unwrap_or(self.distance.as_ref())
    }

    pub fn normalizer(&self) -> Option<&dyn Normalizer> {
        self.normalizer.as_deref()
    }

    pub fn kmeans_normalizer(&self) -> Option<&dyn Normalizer> {
        self.kmeans_normalizer.as_deref()
    }

    pub fn vector_type(&self) -> &dyn VectorType {
        self.vector_type.as_ref()
    }

    /// Apply the normalize role to a row headed for the index.
    ///
    /// `None` means the row has zero norm under a normalizing opclass and is
    /// skipped without error.
    pub fn prepare_row(&self, v: &[f32]) -> Option<Vec<f32>> {
        prepare(self.normalizer(), v)
    }

    /// Apply the kmeans normalize role to a training sample.
    pub fn prepare_sample(&self, v: &[f32]) -> Option<Vec<f32>> {
        prepare(self.kmeans_normalizer(), v)
    }

    /// Normalize a query operand. Zero vectors pass through unchanged.
    pub fn prepare_query(&self, v: &[f32]) -> Vec<f32> {
        match self.normalizer() {
            Some(n) => n.normalize(v),
            None => v.to_vec(),
        }
    }
}

fn prepare(normalizer: Option<&dyn Normalizer>, v: &[f32]) -> Option<Vec<f32>> {
    match normalizer {
        Some(n) if n.is_zero_norm(v) => None,
        Some(n) => Some(n.normalize(v)),
        None => Some(v.to_vec()),
    }
}
