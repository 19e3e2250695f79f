//! Block-level analysis: segmentation, contrast normalization and the
//! ridge orientation field.

use std::f64::consts::PI;

use crate::deadline::{Deadline, Expired};
use crate::features::normalize_angle;

/// Row-major grayscale plane.
pub(crate) struct Plane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f64>,
}

impl Plane {
    pub fn from_pixels(width: usize, height: usize, pixels: &[u8]) -> Self {
        Self {
            width,
            height,
            data: pixels.iter().map(|&p| f64::from(p)).collect(),
        }
    }

    #[inline]
    pub fn at(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }

    /// 3x3 box filter with clamped edges.
    pub fn smoothed(&self, deadline: &Deadline) -> Result<Plane, Expired> {
        let (w, h) = (self.width as isize, self.height as isize);
        let mut data = Vec::with_capacity(self.data.len());
        for y in 0..h {
            deadline.check()?;
            for x in 0..w {
                let mut sum = 0.0;
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        let sx = (x + dx).clamp(0, w - 1) as usize;
                        let sy = (y + dy).clamp(0, h - 1) as usize;
                        sum += self.at(sx, sy);
                    }
                }
                data.push(sum / 9.0);
            }
        }
        Ok(Plane {
            width: self.width,
            height: self.height,
            data,
        })
    }
}

/// Per-block segmentation and orientation state.
///
/// Only whole blocks are considered; a partial strip along the right or
/// bottom edge is treated as background.
pub(crate) struct BlockGrid {
    pub size: usize,
    pub cols: usize,
    pub rows: usize,
    pub foreground: Vec<bool>,
    pub orientation: Vec<f64>,
    pub coherence: Vec<f64>,
}

impl BlockGrid {
    /// Marks blocks whose raw intensity variance reaches `min_variance`
    /// as foreground.
    pub fn segment(
        plane: &Plane,
        size: usize,
        min_variance: f64,
        deadline: &Deadline,
    ) -> Result<Self, Expired> {
        let cols = plane.width / size;
        let rows = plane.height / size;
        let mut foreground = Vec::with_capacity(cols * rows);

        for by in 0..rows {
            deadline.check()?;
            for bx in 0..cols {
                let (mut sum, mut sq) = (0.0, 0.0);
                for y in by * size..(by + 1) * size {
                    for x in bx * size..(bx + 1) * size {
                        let p = plane.at(x, y);
                        sum += p;
                        sq += p * p;
                    }
                }
                let n = (size * size) as f64;
                let mean = sum / n;
                foreground.push(sq / n - mean * mean >= min_variance);
            }
        }

        Ok(Self {
            size,
            cols,
            rows,
            foreground,
            orientation: vec![0.0; cols * rows],
            coherence: vec![0.0; cols * rows],
        })
    }

    pub fn foreground_count(&self) -> usize {
        self.foreground.iter().filter(|&&f| f).count()
    }

    /// Block containing pixel `(x, y)`, if it lies on the grid.
    #[inline]
    pub fn block_of(&self, x: usize, y: usize) -> Option<usize> {
        let (bx, by) = (x / self.size, y / self.size);
        (bx < self.cols && by < self.rows).then(|| by * self.cols + bx)
    }

    #[inline]
    pub fn is_foreground_pixel(&self, x: usize, y: usize) -> bool {
        self.block_of(x, y).is_some_and(|b| self.foreground[b])
    }

    /// A block is interior when it and all eight neighbours are foreground.
    /// Minutiae near the print boundary are unreliable and only accepted
    /// from interior blocks.
    pub fn is_interior(&self, block: usize) -> bool {
        let (bx, by) = ((block % self.cols) as isize, (block / self.cols) as isize);
        for dy in -1..=1 {
            for dx in -1..=1 {
                let (nx, ny) = (bx + dx, by + dy);
                if nx < 0 || ny < 0 || nx >= self.cols as isize || ny >= self.rows as isize {
                    return false;
                }
                if !self.foreground[ny as usize * self.cols + nx as usize] {
                    return false;
                }
            }
        }
        true
    }

    /// Gradient-based orientation and coherence for every foreground
    /// block, followed by a 3x3 vector average of the orientations.
    pub fn estimate_orientation(
        &mut self,
        plane: &Plane,
        deadline: &Deadline,
    ) -> Result<(), Expired> {
        let (w, h) = (plane.width, plane.height);

        for block in 0..self.foreground.len() {
            if block % self.cols == 0 {
                deadline.check()?;
            }
            if !self.foreground[block] {
                continue;
            }
            let (bx, by) = (block % self.cols, block / self.cols);
            let (mut vx, mut vy, mut energy) = (0.0, 0.0, 0.0);

            for y in (by * self.size).max(1)..((by + 1) * self.size).min(h - 1) {
                for x in (bx * self.size).max(1)..((bx + 1) * self.size).min(w - 1) {
                    let gx = (plane.at(x + 1, y - 1)
                        + 2.0 * plane.at(x + 1, y)
                        + plane.at(x + 1, y + 1))
                        - (plane.at(x - 1, y - 1)
                            + 2.0 * plane.at(x - 1, y)
                            + plane.at(x - 1, y + 1));
                    let gy = (plane.at(x - 1, y + 1)
                        + 2.0 * plane.at(x, y + 1)
                        + plane.at(x + 1, y + 1))
                        - (plane.at(x - 1, y - 1)
                            + 2.0 * plane.at(x, y - 1)
                            + plane.at(x + 1, y - 1));
                    vx += 2.0 * gx * gy;
                    vy += gx * gx - gy * gy;
                    energy += gx * gx + gy * gy;
                }
            }

            // ridges run perpendicular to the dominant gradient
            self.orientation[block] = normalize_angle(0.5 * vx.atan2(vy) + PI / 2.0);
            self.coherence[block] = if energy > 0.0 {
                (vx * vx + vy * vy).sqrt() / energy
            } else {
                0.0
            };
        }

        let mut smoothed = self.orientation.clone();
        for block in 0..self.foreground.len() {
            if !self.foreground[block] {
                continue;
            }
            let (bx, by) = ((block % self.cols) as isize, (block / self.cols) as isize);
            let (mut sx, mut sy) = (0.0, 0.0);
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let (nx, ny) = (bx + dx, by + dy);
                    if nx < 0 || ny < 0 || nx >= self.cols as isize || ny >= self.rows as isize {
                        continue;
                    }
                    let n = ny as usize * self.cols + nx as usize;
                    if self.foreground[n] {
                        let doubled = 2.0 * self.orientation[n];
                        sx += self.coherence[n] * doubled.cos();
                        sy += self.coherence[n] * doubled.sin();
                    }
                }
            }
            if sx != 0.0 || sy != 0.0 {
                smoothed[block] = normalize_angle(0.5 * sy.atan2(sx));
            }
        }
        self.orientation = smoothed;
        Ok(())
    }

    /// Mean coherence over foreground blocks: the ridge clarity of the
    /// whole capture.
    pub fn mean_coherence(&self) -> f64 {
        let (sum, count) = self
            .foreground
            .iter()
            .zip(&self.coherence)
            .filter(|(fg, _)| **fg)
            .fold((0.0, 0usize), |(s, c), (_, q)| (s + q, c + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    /// Coherence-weighted dominant ridge orientation.
    pub fn dominant_orientation(&self) -> f64 {
        let (mut sx, mut sy) = (0.0, 0.0);
        for block in 0..self.foreground.len() {
            if self.foreground[block] {
                let doubled = 2.0 * self.orientation[block];
                sx += self.coherence[block] * doubled.cos();
                sy += self.coherence[block] * doubled.sin();
            }
        }
        normalize_angle(0.5 * sy.atan2(sx))
    }
}

/// Standardizes foreground pixels to zero mean and unit variance; the
/// background is flattened to zero.
pub(crate) fn normalize(
    plane: &Plane,
    grid: &BlockGrid,
    deadline: &Deadline,
) -> Result<Plane, Expired> {
    let (mut sum, mut sq, mut n) = (0.0, 0.0, 0usize);
    for y in 0..plane.height {
        deadline.check()?;
        for x in 0..plane.width {
            if grid.is_foreground_pixel(x, y) {
                let p = plane.at(x, y);
                sum += p;
                sq += p * p;
                n += 1;
            }
        }
    }

    let mean = if n > 0 { sum / n as f64 } else { 0.0 };
    let variance = if n > 0 { sq / n as f64 - mean * mean } else { 0.0 };
    let scale = if variance > 0.0 { variance.sqrt().recip() } else { 0.0 };

    let mut data = Vec::with_capacity(plane.data.len());
    for y in 0..plane.height {
        deadline.check()?;
        for x in 0..plane.width {
            data.push(if grid.is_foreground_pixel(x, y) {
                (plane.at(x, y) - mean) * scale
            } else {
                0.0
            });
        }
    }

    Ok(Plane {
        width: plane.width,
        height: plane.height,
        data,
    })
}
