//! Alignment-tolerant minutiae matching.
//!
//! A comparison runs in three stages:
//!
//! 1. Every (candidate, template) point pair votes for the rigid transform
//!    that would superimpose the two points, using the orientation
//!    difference as rotation. Votes land in a coarse rotation/translation
//!    accumulator weighted by the pair's quality.
//! 2. The strongest accumulator cells become alignment hypotheses. Each
//!    hypothesis is refined by pairing points under a loose tolerance and
//!    solving the least-squares rigid transform for those pairs.
//! 3. Under each refined transform, points are paired one-to-one within
//!    the distance and angle tolerances, nearest pairs first. The best
//!    hypothesis wins.
//!
//! Both point lists are capped at `max_points` and the number of
//! hypotheses is fixed, so a comparison costs at most
//! `O(max_hypotheses * max_points²)` whatever the input.
//!
//! Orientations are compared modulo π, so rotations are recovered within
//! ±90°.

use std::collections::HashMap;
use std::f64::consts::{FRAC_PI_2, PI};

use serde::Serialize;

use crate::config::Matching;
use crate::deadline::{Deadline, Expired};
use crate::features::{angle_distance, FeatureSet, Minutia};
use crate::store::Template;

/// Translation bins are this many distance tolerances wide.
const TRANSLATION_BIN_FACTOR: f64 = 3.0;
/// Rotation bin width, in radians.
const ROTATION_BIN: f64 = 10.0 * PI / 180.0;
/// Loose pairing radius used while refining a hypothesis.
const REFINE_FACTOR: f64 = 2.0;
/// Votes from pairs of different minutia types count this much.
const KIND_MISMATCH_WEIGHT: f64 = 0.5;

/// Similarity of one candidate against one template.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchScore {
    /// Quality-weighted match ratio in `[0, 1]`.
    pub score: f64,
    pub matched: usize,
    pub candidate_points: usize,
    pub template_points: usize,
    pub rotation: f64,
    pub translation: (f64, f64),
}

impl MatchScore {
    fn none(candidate_points: usize, template_points: usize) -> Self {
        Self {
            score: 0.0,
            matched: 0,
            candidate_points,
            template_points,
            rotation: 0.0,
            translation: (0.0, 0.0),
        }
    }

    /// Fraction of the smaller point set that found a partner.
    pub fn match_ratio(&self) -> f64 {
        let denominator = self.candidate_points.min(self.template_points);
        if denominator == 0 {
            0.0
        } else {
            self.matched as f64 / denominator as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Transform {
    rotation: f64,
    tx: f64,
    ty: f64,
}

impl Transform {
    #[inline]
    fn apply(&self, m: &Minutia) -> (f64, f64, f64) {
        let (sin, cos) = self.rotation.sin_cos();
        (
            cos * m.x - sin * m.y + self.tx,
            sin * m.x + cos * m.y + self.ty,
            m.angle + self.rotation,
        )
    }
}

#[derive(Default)]
struct Cell {
    weight: f64,
    rotation: f64,
    tx: f64,
    ty: f64,
}

struct Pairing {
    pairs: Vec<(usize, usize)>,
    weight: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Matcher {
    config: Matching,
}

impl Matcher {
    pub fn new(config: Matching) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Matching {
        &self.config
    }

    pub fn compare(
        &self,
        candidate: &FeatureSet,
        template: &Template,
        deadline: &Deadline,
    ) -> Result<MatchScore, Expired> {
        self.compare_features(candidate, template.features(), deadline)
    }

    pub fn compare_features(
        &self,
        candidate: &FeatureSet,
        template: &FeatureSet,
        deadline: &Deadline,
    ) -> Result<MatchScore, Expired> {
        let c = strongest(candidate.minutiae(), self.config.max_points);
        let t = strongest(template.minutiae(), self.config.max_points);
        if c.is_empty() || t.is_empty() {
            return Ok(MatchScore::none(c.len(), t.len()));
        }

        let mut best: Option<(Pairing, Transform)> = None;
        for hypothesis in self.hypotheses(&c, &t, deadline)? {
            deadline.check()?;
            let refined = self.refine(&c, &t, hypothesis);
            let pairing = self.pair(&c, &t, &refined, 1.0);
            let better = match &best {
                None => true,
                Some((current, _)) => {
                    pairing.weight > current.weight
                        || (pairing.weight == current.weight
                            && pairing.pairs.len() > current.pairs.len())
                }
            };
            if better {
                best = Some((pairing, refined));
            }
        }

        let Some((pairing, transform)) = best else {
            return Ok(MatchScore::none(c.len(), t.len()));
        };

        let matched = pairing.pairs.len();
        let mut score = pairing.weight / c.len().min(t.len()) as f64;
        let required = self.config.min_matched_points;
        if matched < required {
            score *= matched as f64 / required as f64;
        }

        Ok(MatchScore {
            score: score.clamp(0.0, 1.0),
            matched,
            candidate_points: c.len(),
            template_points: t.len(),
            rotation: transform.rotation,
            translation: (transform.tx, transform.ty),
        })
    }

    /// Stage 1: vote, return the strongest cells' mean transforms.
    fn hypotheses(
        &self,
        c: &[Minutia],
        t: &[Minutia],
        deadline: &Deadline,
    ) -> Result<Vec<Transform>, Expired> {
        let translation_bin = self.config.distance_tolerance * TRANSLATION_BIN_FACTOR;
        let mut cells: HashMap<(i64, i64, i64), Cell> = HashMap::new();

        for cm in c {
            deadline.check()?;
            for tm in t {
                // rotation is only known modulo π; keep it in [-π/2, π/2)
                let rotation = (tm.angle - cm.angle + FRAC_PI_2).rem_euclid(PI) - FRAC_PI_2;
                let (sin, cos) = rotation.sin_cos();
                let tx = tm.x - (cos * cm.x - sin * cm.y);
                let ty = tm.y - (sin * cm.x + cos * cm.y);

                let mut weight = cm.quality * tm.quality;
                if cm.kind != tm.kind {
                    weight *= KIND_MISMATCH_WEIGHT;
                }
                if weight <= 0.0 {
                    // zero-quality points still get a say
                    weight = f64::EPSILON;
                }

                let key = (
                    (rotation / ROTATION_BIN).round() as i64,
                    (tx / translation_bin).round() as i64,
                    (ty / translation_bin).round() as i64,
                );
                let cell = cells.entry(key).or_default();
                cell.weight += weight;
                cell.rotation += weight * rotation;
                cell.tx += weight * tx;
                cell.ty += weight * ty;
            }
        }

        let mut ranked: Vec<_> = cells.into_iter().collect();
        ranked.sort_by(|(ka, a), (kb, b)| b.weight.total_cmp(&a.weight).then(ka.cmp(kb)));

        Ok(ranked
            .into_iter()
            .take(self.config.max_hypotheses)
            .map(|(_, cell)| Transform {
                rotation: cell.rotation / cell.weight,
                tx: cell.tx / cell.weight,
                ty: cell.ty / cell.weight,
            })
            .collect())
    }

    /// Stage 2: two rounds of loose pairing followed by a weighted
    /// least-squares rigid fit.
    fn refine(&self, c: &[Minutia], t: &[Minutia], mut transform: Transform) -> Transform {
        for _ in 0..2 {
            let pairing = self.pair(c, t, &transform, REFINE_FACTOR);
            if pairing.pairs.len() < 2 {
                break;
            }
            transform = fit(c, t, &pairing.pairs);
        }
        transform
    }

    /// Stage 3: greedy one-to-one pairing, nearest first. Ties are broken
    /// by candidate index, then template index.
    fn pair(&self, c: &[Minutia], t: &[Minutia], transform: &Transform, slack: f64) -> Pairing {
        let max_distance = self.config.distance_tolerance * slack;
        let max_angle = (self.config.angle_tolerance_deg * slack).min(89.0).to_radians();
        let limit = max_distance * max_distance;

        let mut options = Vec::new();
        for (i, cm) in c.iter().enumerate() {
            let (x, y, angle) = transform.apply(cm);
            for (j, tm) in t.iter().enumerate() {
                let d2 = (x - tm.x).powi(2) + (y - tm.y).powi(2);
                if d2 <= limit && angle_distance(angle, tm.angle) <= max_angle {
                    options.push((d2, i, j));
                }
            }
        }
        options.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut used_c = vec![false; c.len()];
        let mut used_t = vec![false; t.len()];
        let mut pairs = Vec::new();
        let mut weight = 0.0;
        for (_, i, j) in options {
            if used_c[i] || used_t[j] {
                continue;
            }
            used_c[i] = true;
            used_t[j] = true;
            pairs.push((i, j));
            // unreliable points count for half a match at worst
            weight += 0.5 + 0.5 * (c[i].quality * t[j].quality).sqrt();
        }

        Pairing { pairs, weight }
    }
}

/// Highest-quality `limit` points, in a deterministic order.
fn strongest(points: &[Minutia], limit: usize) -> Vec<Minutia> {
    let mut points = points.to_vec();
    if points.len() > limit {
        points.sort_by(|a, b| {
            b.quality
                .total_cmp(&a.quality)
                .then(a.y.total_cmp(&b.y))
                .then(a.x.total_cmp(&b.x))
        });
        points.truncate(limit);
    }
    points
}

/// Least-squares rotation and translation taking the paired candidate
/// points onto their template partners.
fn fit(c: &[Minutia], t: &[Minutia], pairs: &[(usize, usize)]) -> Transform {
    let n = pairs.len() as f64;
    let (mut pcx, mut pcy, mut qcx, mut qcy) = (0.0, 0.0, 0.0, 0.0);
    for &(i, j) in pairs {
        pcx += c[i].x;
        pcy += c[i].y;
        qcx += t[j].x;
        qcy += t[j].y;
    }
    let (pcx, pcy, qcx, qcy) = (pcx / n, pcy / n, qcx / n, qcy / n);

    let (mut sxx, mut sxy) = (0.0, 0.0);
    for &(i, j) in pairs {
        let (px, py) = (c[i].x - pcx, c[i].y - pcy);
        let (qx, qy) = (t[j].x - qcx, t[j].y - qcy);
        sxx += px * qx + py * qy;
        sxy += px * qy - py * qx;
    }

    let rotation = sxy.atan2(sxx);
    let (sin, cos) = rotation.sin_cos();
    Transform {
        rotation,
        tx: qcx - (cos * pcx - sin * pcy),
        ty: qcy - (sin * pcx + cos * pcy),
    }
}
