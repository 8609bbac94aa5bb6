//! Deterministic k-means over RGB pixels.
//!
//! Pixels are first collapsed to distinct colors with counts, so the cost of
//! each Lloyd iteration scales with the palette of the difference image rather
//! than its area. Seeding is k-means++ driven by a fixed-seed RNG: the same
//! input always yields the same clusters.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub centroid: [u8; 3],
    /// Share of the clustered pixels, 0–100.
    pub percentage: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct KMeans {
    pub max_clusters: usize,
    pub max_iterations: usize,
    pub seed: u64,
}

impl Default for KMeans {
    fn default() -> Self {
        Self {
            max_clusters: 5,
            max_iterations: 50,
            seed: 42,
        }
    }
}

impl KMeans {
    pub fn with_max_clusters(max_clusters: usize) -> Self {
        Self {
            max_clusters,
            ..Self::default()
        }
    }

    /// Cluster `pixels` into at most `max_clusters` groups, largest first.
    /// Returns an empty list for empty input.
    pub fn cluster(&self, pixels: &[[u8; 3]]) -> Vec<Cluster> {
        if pixels.is_empty() || self.max_clusters == 0 {
            return Vec::new();
        }

        let mut counts: BTreeMap<[u8; 3], usize> = BTreeMap::new();
        for p in pixels {
            *counts.entry(*p).or_default() += 1;
        }
        let points: Vec<([f64; 3], f64)> = counts
            .iter()
            .map(|(c, n)| (c.map(f64::from), *n as f64))
            .collect();

        let mut centers = self.seed_centers(&points, self.max_clusters.min(points.len()));
        let k = centers.len();
        let mut assignment = vec![0usize; points.len()];

        for iteration in 0..self.max_iterations {
            let changed = assign(&centers, &points, &mut assignment);
            if iteration > 0 && !changed {
                break;
            }

            let mut sums = vec![[0.0f64; 3]; k];
            let mut weights = vec![0.0f64; k];
            for (i, (p, w)) in points.iter().enumerate() {
                let c = assignment[i];
                for d in 0..3 {
                    sums[c][d] += p[d] * w;
                }
                weights[c] += w;
            }
            for c in 0..k {
                // Empty clusters keep their previous center
                if weights[c] > 0.0 {
                    centers[c] = sums[c].map(|s| s / weights[c]);
                }
            }
        }
        assign(&centers, &points, &mut assignment);

        let total = pixels.len() as f64;
        let mut sizes = vec![0usize; k];
        for (i, (_, w)) in points.iter().enumerate() {
            sizes[assignment[i]] += *w as usize;
        }

        let mut clusters: Vec<Cluster> = centers
            .iter()
            .zip(sizes)
            .filter(|(_, count)| *count > 0)
            .map(|(center, count)| Cluster {
                centroid: center.map(|v| v.round().clamp(0.0, 255.0) as u8),
                percentage: 100.0 * count as f64 / total,
                count,
            })
            .collect();
        clusters.sort_by(|a, b| b.count.cmp(&a.count));
        clusters
    }

    /// k-means++ seeding over weighted distinct points.
    fn seed_centers(&self, points: &[([f64; 3], f64)], k: usize) -> Vec<[f64; 3]> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut centers = Vec::with_capacity(k);

        let total_weight: f64 = points.iter().map(|(_, w)| w).sum();
        let first = pick_weighted(&mut rng, points.iter().map(|(_, w)| *w), total_weight);
        centers.push(points[first].0);

        while centers.len() < k {
            let scores: Vec<f64> = points
                .iter()
                .map(|(p, w)| {
                    let d = centers
                        .iter()
                        .map(|c| distance_sq(c, p))
                        .fold(f64::INFINITY, f64::min);
                    d * w
                })
                .collect();
            let total: f64 = scores.iter().sum();
            if total <= 0.0 {
                // Remaining points coincide with chosen centers
                break;
            }
            let idx = pick_weighted(&mut rng, scores.iter().copied(), total);
            centers.push(points[idx].0);
        }
        centers
    }
}

fn pick_weighted(rng: &mut StdRng, weights: impl Iterator<Item = f64>, total: f64) -> usize {
    let target = rng.gen::<f64>() * total;
    let mut acc = 0.0;
    let mut last = 0;
    for (i, w) in weights.enumerate() {
        if w <= 0.0 {
            continue;
        }
        acc += w;
        last = i;
        if acc > target {
            return i;
        }
    }
    last
}

/// Move every point to its nearest center. Returns whether any point moved.
fn assign(centers: &[[f64; 3]], points: &[([f64; 3], f64)], assignment: &mut [usize]) -> bool {
    let mut changed = false;
    for (slot, (p, _)) in assignment.iter_mut().zip(points) {
        let n = nearest(centers, p);
        if n != *slot {
            *slot = n;
            changed = true;
        }
    }
    changed
}

fn nearest(centers: &[[f64; 3]], p: &[f64; 3]) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (i, c) in centers.iter().enumerate() {
        let d = distance_sq(c, p);
        if d < best_d {
            best_d = d;
            best = i;
        }
    }
    best
}

fn distance_sq(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    (0..3).map(|i| (a[i] - b[i]).powi(2)).sum()
}
