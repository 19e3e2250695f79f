//! Binarization, thinning and crossing-number minutiae detection.

use crate::deadline::{Deadline, Expired};
use crate::features::{Minutia, MinutiaKind};

use super::field::{BlockGrid, Plane};

/// Upper bound on thinning passes; ridges are only a few pixels wide, so
/// a skeleton normally settles well before this.
const MAX_THINNING_PASSES: usize = 64;

/// Binary ridge map: `true` where a (dark) ridge pixel lies in the
/// foreground. Each pixel is compared against the mean of its
/// neighbourhood, computed with an integral image.
pub(crate) fn binarize(
    plane: &Plane,
    grid: &BlockGrid,
    deadline: &Deadline,
) -> Result<Vec<bool>, Expired> {
    let smooth = plane.smoothed(deadline)?;
    let (w, h) = (plane.width, plane.height);

    let mut integral = vec![0.0; (w + 1) * (h + 1)];
    for y in 0..h {
        deadline.check()?;
        let mut row = 0.0;
        for x in 0..w {
            row += smooth.at(x, y);
            integral[(y + 1) * (w + 1) + x + 1] = integral[y * (w + 1) + x + 1] + row;
        }
    }

    let radius = grid.size / 2;
    let mut ridges = vec![false; w * h];
    for y in 0..h {
        deadline.check()?;
        for x in 0..w {
            if !grid.is_foreground_pixel(x, y) {
                continue;
            }
            let (x0, y0) = (x.saturating_sub(radius), y.saturating_sub(radius));
            let (x1, y1) = ((x + radius + 1).min(w), (y + radius + 1).min(h));
            let area = ((x1 - x0) * (y1 - y0)) as f64;
            let sum = integral[y1 * (w + 1) + x1] - integral[y0 * (w + 1) + x1]
                - integral[y1 * (w + 1) + x0]
                + integral[y0 * (w + 1) + x0];
            ridges[y * w + x] = smooth.at(x, y) < sum / area;
        }
    }

    Ok(ridges)
}

/// The eight neighbours of `(x, y)` in clockwise order starting north.
#[inline]
fn neighbours(image: &[bool], w: usize, x: usize, y: usize) -> [bool; 8] {
    [
        image[(y - 1) * w + x],
        image[(y - 1) * w + x + 1],
        image[y * w + x + 1],
        image[(y + 1) * w + x + 1],
        image[(y + 1) * w + x],
        image[(y + 1) * w + x - 1],
        image[y * w + x - 1],
        image[(y - 1) * w + x - 1],
    ]
}

/// Zhang-Suen thinning down to one-pixel-wide ridges.
pub(crate) fn thin(
    mut image: Vec<bool>,
    w: usize,
    h: usize,
    deadline: &Deadline,
) -> Result<Vec<bool>, Expired> {
    for x in 0..w {
        image[x] = false;
        image[(h - 1) * w + x] = false;
    }
    for y in 0..h {
        image[y * w] = false;
        image[y * w + w - 1] = false;
    }

    let mut doomed = Vec::new();
    for _ in 0..MAX_THINNING_PASSES {
        deadline.check()?;
        let mut changed = false;

        for step in 0..2 {
            doomed.clear();
            for y in 1..h - 1 {
                deadline.check()?;
                for x in 1..w - 1 {
                    if !image[y * w + x] {
                        continue;
                    }
                    let [p2, p3, p4, p5, p6, p7, p8, p9] = neighbours(&image, w, x, y);
                    let ring = [p2, p3, p4, p5, p6, p7, p8, p9, p2];
                    let count = ring[..8].iter().filter(|&&p| p).count();
                    let transitions = ring.windows(2).filter(|pair| !pair[0] && pair[1]).count();
                    if !(2..=6).contains(&count) || transitions != 1 {
                        continue;
                    }
                    let removable = if step == 0 {
                        !(p2 && p4 && p6) && !(p4 && p6 && p8)
                    } else {
                        !(p2 && p4 && p8) && !(p2 && p6 && p8)
                    };
                    if removable {
                        doomed.push(y * w + x);
                    }
                }
            }
            for &index in &doomed {
                image[index] = false;
            }
            changed |= !doomed.is_empty();
        }

        if !changed {
            break;
        }
    }

    Ok(image)
}

/// Crossing-number detection on the skeleton. Points are only taken from
/// interior blocks and inherit that block's orientation and clarity.
pub(crate) fn detect(
    skeleton: &[bool],
    w: usize,
    h: usize,
    grid: &BlockGrid,
    deadline: &Deadline,
) -> Result<Vec<Minutia>, Expired> {
    let mut found = Vec::new();

    for y in 1..h - 1 {
        deadline.check()?;
        for x in 1..w - 1 {
            if !skeleton[y * w + x] {
                continue;
            }
            let Some(block) = grid.block_of(x, y) else {
                continue;
            };
            if !grid.is_interior(block) {
                continue;
            }

            let ring = neighbours(skeleton, w, x, y);
            let crossings = (0..8).filter(|&i| ring[i] != ring[(i + 1) % 8]).count() / 2;
            let kind = match crossings {
                1 => MinutiaKind::Ending,
                3 => MinutiaKind::Bifurcation,
                _ => continue,
            };

            found.push(Minutia::new(
                x as f64,
                y as f64,
                grid.orientation[block],
                kind,
                grid.coherence[block],
            ));
        }
    }

    Ok(found)
}

/// Drops every minutia that has another one closer than `min_distance`.
/// Such clusters come from broken ridges, spurs and bridges rather than
/// real ridge events.
pub(crate) fn remove_clusters(
    minutiae: Vec<Minutia>,
    min_distance: f64,
    deadline: &Deadline,
) -> Result<Vec<Minutia>, Expired> {
    let limit = min_distance * min_distance;
    let mut crowded = vec![false; minutiae.len()];

    for i in 0..minutiae.len() {
        if i % 64 == 0 {
            deadline.check()?;
        }
        for j in i + 1..minutiae.len() {
            let dx = minutiae[i].x - minutiae[j].x;
            let dy = minutiae[i].y - minutiae[j].y;
            if dx * dx + dy * dy < limit {
                crowded[i] = true;
                crowded[j] = true;
            }
        }
    }

    Ok(minutiae
        .into_iter()
        .zip(crowded)
        .filter_map(|(m, crowded)| (!crowded).then_some(m))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_rows(rows: &[&str]) -> (Vec<bool>, usize, usize) {
        let w = rows[0].len();
        let image = rows
            .iter()
            .flat_map(|r| r.chars().map(|c| c == '#'))
            .collect();
        (image, w, rows.len())
    }

    #[test]
    fn thick_bar_thins_to_single_line() {
        let (image, w, h) = from_rows(&[
            "..............",
            "..............",
            "..##########..",
            "..##########..",
            "..##########..",
            "..............",
            "..............",
        ]);
        let skeleton = thin(image, w, h, &Deadline::unbounded()).unwrap();
        for x in 0..w {
            let column = (0..h).filter(|&y| skeleton[y * w + x]).count();
            assert!(column <= 1, "column {x} has {column} pixels");
        }
        assert!(skeleton.iter().filter(|&&p| p).count() >= 6);
    }

    #[test]
    fn clusters_are_removed_pairwise() {
        let m = |x: f64, y: f64| Minutia::new(x, y, 0.0, MinutiaKind::Ending, 1.0);
        let kept = remove_clusters(
            vec![m(0.0, 0.0), m(3.0, 0.0), m(50.0, 50.0)],
            8.0,
            &Deadline::unbounded(),
        )
        .unwrap();
        assert_eq!(kept, vec![m(50.0, 50.0)]);
    }
}
