use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinutiaKind {
    Ending,
    Bifurcation,
}

/// A ridge ending or bifurcation.
///
/// `angle` is the local ridge orientation in radians, kept in `[0, π)`:
/// orientation fields do not distinguish a ridge from its reverse, so all
/// angle comparisons are made modulo π. `quality` is the local ridge
/// clarity in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Minutia {
    pub x: f64,
    pub y: f64,
    pub angle: f64,
    pub kind: MinutiaKind,
    pub quality: f64,
}

impl Minutia {
    pub fn new(x: f64, y: f64, angle: f64, kind: MinutiaKind, quality: f64) -> Self {
        Self {
            x,
            y,
            angle: normalize_angle(angle),
            kind,
            quality: quality.clamp(0.0, 1.0),
        }
    }
}

/// Maps any angle onto `[0, π)`.
pub fn normalize_angle(angle: f64) -> f64 {
    let a = angle.rem_euclid(PI);
    // rem_euclid can round up to exactly PI for tiny negative inputs
    if a >= PI {
        0.0
    } else {
        a
    }
}

/// Smallest difference between two orientations, in `[0, π/2]`.
pub fn angle_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(PI);
    d.min(PI - d)
}

/// Comparable representation of one fingerprint.
///
/// Coordinates are expressed in a 500 dpi reference frame and centered on
/// the centroid of the minutiae; points are stored in a canonical order so
/// equal inputs always produce equal sets. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    minutiae: Vec<Minutia>,
    orientation: f64,
    quality: f64,
}

impl FeatureSet {
    pub fn from_points(mut minutiae: Vec<Minutia>, orientation: f64, quality: f64) -> Self {
        if !minutiae.is_empty() {
            let n = minutiae.len() as f64;
            let cx = minutiae.iter().map(|m| m.x).sum::<f64>() / n;
            let cy = minutiae.iter().map(|m| m.y).sum::<f64>() / n;
            for m in &mut minutiae {
                m.x -= cx;
                m.y -= cy;
            }
        }

        minutiae.sort_by(|a, b| {
            a.y.total_cmp(&b.y)
                .then(a.x.total_cmp(&b.x))
                .then(a.angle.total_cmp(&b.angle))
        });

        Self {
            minutiae,
            orientation: normalize_angle(orientation),
            quality: quality.clamp(0.0, 1.0),
        }
    }

    pub fn minutiae(&self) -> &[Minutia] {
        &self.minutiae
    }

    pub fn len(&self) -> usize {
        self.minutiae.len()
    }

    pub fn is_empty(&self) -> bool {
        self.minutiae.is_empty()
    }

    /// Dominant ridge orientation of the capture.
    pub fn orientation(&self) -> f64 {
        self.orientation
    }

    /// Mean ridge clarity of the capture.
    pub fn quality(&self) -> f64 {
        self.quality
    }

    /// Applies a rigid transform (rotation about the origin, then
    /// translation) and re-centers the result.
    pub fn transformed(&self, rotation: f64, dx: f64, dy: f64) -> Self {
        let (sin, cos) = rotation.sin_cos();
        let minutiae = self
            .minutiae
            .iter()
            .map(|m| {
                Minutia::new(
                    cos * m.x - sin * m.y + dx,
                    sin * m.x + cos * m.y + dy,
                    m.angle + rotation,
                    m.kind,
                    m.quality,
                )
            })
            .collect();

        Self::from_points(minutiae, self.orientation + rotation, self.quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn angles_wrap_modulo_pi() {
        assert!((normalize_angle(PI + 0.25) - 0.25).abs() < 1e-12);
        assert!((normalize_angle(-0.25) - (PI - 0.25)).abs() < 1e-12);
        assert_eq!(normalize_angle(-1e-20), 0.0);
        assert!((angle_distance(0.05, PI - 0.05) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn points_are_centered_and_ordered() {
        let set = FeatureSet::from_points(
            vec![
                Minutia::new(30.0, 10.0, 0.1, MinutiaKind::Ending, 1.0),
                Minutia::new(10.0, 10.0, 0.2, MinutiaKind::Bifurcation, 0.5),
                Minutia::new(20.0, 40.0, 0.3, MinutiaKind::Ending, 2.0),
            ],
            0.0,
            0.9,
        );

        let cx: f64 = set.minutiae().iter().map(|m| m.x).sum();
        let cy: f64 = set.minutiae().iter().map(|m| m.y).sum();
        assert!(cx.abs() < 1e-9 && cy.abs() < 1e-9);
        assert_eq!(set.minutiae()[0].kind, MinutiaKind::Bifurcation);
        assert_eq!(set.minutiae()[2].quality, 1.0);
    }

    #[test]
    fn transform_preserves_shape() {
        let set = FeatureSet::from_points(
            vec![
                Minutia::new(0.0, 0.0, 0.0, MinutiaKind::Ending, 1.0),
                Minutia::new(40.0, 0.0, 0.0, MinutiaKind::Ending, 1.0),
            ],
            0.0,
            1.0,
        );
        let moved = set.transformed(PI / 2.0, 100.0, -50.0);
        let [a, b] = [moved.minutiae()[0], moved.minutiae()[1]];
        let distance = ((a.x - b.x).powi(2) + (a.y - b.y).powi(2)).sqrt();
        assert!((distance - 40.0).abs() < 1e-9);
        assert!((a.angle - PI / 2.0).abs() < 1e-9);
    }
}
