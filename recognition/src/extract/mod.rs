//! Turns a grayscale capture into a [`FeatureSet`].
//!
//! The pipeline is: block segmentation, contrast normalization, gradient
//! orientation field (whose coherence doubles as the ridge clarity
//! measure), local-mean binarization, Zhang-Suen thinning, crossing-number
//! minutiae detection and cluster pruning. Every step is deterministic, so
//! extracting the same sample twice yields identical feature sets.

mod field;
mod skeleton;

use thiserror::Error;
use tracing::debug;

use crate::config::Extraction;
use crate::deadline::{Deadline, Expired};
use crate::error::ErrorKind;
use crate::features::{FeatureSet, Minutia};
use crate::sample::FingerprintSample;

use field::{normalize, BlockGrid, Plane};

/// Resolution of the reference frame feature coordinates are scaled to.
pub const REFERENCE_DPI: f64 = 500.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractError {
    #[error("ridge clarity {quality:.3} is below the minimum of {minimum:.3}")]
    LowQuality { quality: f64, minimum: f64 },
    #[error("no ridge structure detected")]
    EmptyCapture,
    #[error(transparent)]
    Timeout(#[from] Expired),
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::LowQuality { .. } => ErrorKind::LowQuality,
            ExtractError::EmptyCapture => ErrorKind::EmptyCapture,
            ExtractError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

pub trait FeatureExtractor {
    fn extract(
        &self,
        sample: &FingerprintSample,
        deadline: &Deadline,
    ) -> Result<FeatureSet, ExtractError>;
}

/// Minutiae extractor working on the ridge skeleton.
#[derive(Debug, Clone, Default)]
pub struct RidgeExtractor {
    config: Extraction,
}

impl RidgeExtractor {
    pub fn new(config: Extraction) -> Self {
        Self { config }
    }
}

impl FeatureExtractor for RidgeExtractor {
    fn extract(
        &self,
        sample: &FingerprintSample,
        deadline: &Deadline,
    ) -> Result<FeatureSet, ExtractError> {
        let size = self.config.block_size;
        let (w, h) = (sample.width() as usize, sample.height() as usize);
        if w / size < 3 || h / size < 3 {
            return Err(ExtractError::EmptyCapture);
        }
        deadline.check()?;

        let raw = Plane::from_pixels(w, h, sample.pixels());
        let mut grid = BlockGrid::segment(&raw, size, self.config.min_block_variance, deadline)?;
        if grid.foreground_count() == 0 {
            return Err(ExtractError::EmptyCapture);
        }

        let normalized = normalize(&raw, &grid, deadline)?;
        drop(raw);
        grid.estimate_orientation(&normalized, deadline)?;

        let quality = grid.mean_coherence();
        if quality < self.config.min_quality {
            return Err(ExtractError::LowQuality {
                quality,
                minimum: self.config.min_quality,
            });
        }

        let ridges = skeleton::binarize(&normalized, &grid, deadline)?;
        drop(normalized);
        let thinned = skeleton::thin(ridges, w, h, deadline)?;

        let detected = skeleton::detect(&thinned, w, h, &grid, deadline)?;
        let detected_count = detected.len();
        let mut minutiae = skeleton::remove_clusters(detected, size as f64 / 2.0, deadline)?;
        if minutiae.is_empty() {
            return Err(ExtractError::EmptyCapture);
        }

        minutiae.sort_by(|a, b| {
            b.quality
                .total_cmp(&a.quality)
                .then(a.y.total_cmp(&b.y))
                .then(a.x.total_cmp(&b.x))
        });
        minutiae.truncate(self.config.max_points);

        let scale = REFERENCE_DPI / f64::from(sample.dpi().max(1));
        let scaled: Vec<Minutia> = minutiae
            .into_iter()
            .map(|m| Minutia { x: m.x * scale, y: m.y * scale, ..m })
            .collect();

        debug!(
            detected = detected_count,
            kept = scaled.len(),
            quality,
            "extracted minutiae"
        );

        Ok(FeatureSet::from_points(
            scaled,
            grid.dominant_orientation(),
            quality,
        ))
    }
}
