#![forbid(unsafe_code)]

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use wb_types::DataPoint;

/// Hard ceiling on retained points per chart, regardless of pixel width.
pub const MAX_TARGET_POINTS: usize = 2_000;

/// Largest-Triangle-Three-Buckets downsampling.
///
/// Identity when the input already fits the threshold; `threshold < 3`
/// degenerates to the two endpoints. Otherwise the first and last points
/// are always kept and each interior bucket contributes the point whose
/// triangle against (previous selection, next-bucket centroid) has the
/// largest area. Strict `>` comparison keeps the earliest point on ties.
#[must_use]
pub fn lttb(points: &[DataPoint], threshold: usize) -> Vec<DataPoint> {
    let n = points.len();
    if n <= threshold || n <= 2 {
        return points.to_vec();
    }
    if threshold < 3 {
        return vec![points[0], points[n - 1]];
    }

    let bucket = (n - 2) as f64 / (threshold - 2) as f64;
    let mut sampled = Vec::with_capacity(threshold);
    sampled.push(points[0]);
    let mut selected = 0_usize;

    for i in 0..threshold - 2 {
        // Floor-based bucket boundaries, recomputed per iteration; the
        // final bucket may come up short.
        let start = (i as f64 * bucket) as usize + 1;
        let end = ((i as f64 + 1.0) * bucket) as usize + 1;
        let end = end.min(n - 1);

        // Centroid of the following bucket steers the triangle; the
        // last point stands in when that bucket is empty.
        let next_start = end;
        let next_end = (((i as f64 + 2.0) * bucket) as usize + 1).min(n);
        let (centroid_x, centroid_y) = if next_start < next_end {
            let len = (next_end - next_start) as f64;
            let (sum_x, sum_y) = points[next_start..next_end]
                .iter()
                .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
            (sum_x / len, sum_y / len)
        } else {
            (points[n - 1].x, points[n - 1].y)
        };

        let anchor = points[selected];
        let mut best_idx = start;
        let mut best_area = -1.0_f64;
        for (offset, candidate) in points[start..end].iter().enumerate() {
            let area = ((anchor.x - centroid_x) * (candidate.y - anchor.y)
                - (anchor.x - candidate.x) * (centroid_y - anchor.y))
                .abs();
            if area > best_area {
                best_area = area;
                best_idx = start + offset;
            }
        }

        sampled.push(points[best_idx]);
        selected = best_idx;
    }

    sampled.push(points[n - 1]);
    sampled
}

/// A reduced time axis with every series re-projected onto it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecimatedData {
    pub times: Vec<f64>,
    pub series: Vec<Vec<Option<f64>>>,
}

/// Decimate parallel series sharing one time axis down to what a chart
/// of `chart_width` pixels can usefully show.
///
/// The first series containing any non-null value is the reference: only
/// its salient shape decides which instants survive. Every series
/// (reference included) is then re-sampled onto the reduced axis by
/// exact timestamp lookup with no interpolation; a series lacking a sample
/// at a retained instant yields `None`. Series count is always
/// preserved, and the input comes back unchanged when no reduction is
/// needed or no series has data.
#[must_use]
pub fn decimate_series_data(
    times: &[f64],
    series: &[Vec<Option<f64>>],
    chart_width: usize,
) -> DecimatedData {
    let target = times
        .len()
        .min(chart_width.saturating_mul(2).min(MAX_TARGET_POINTS));
    if times.len() <= target {
        return DecimatedData {
            times: times.to_vec(),
            series: series.to_vec(),
        };
    }

    let Some(reference) = series.iter().find(|s| s.iter().any(Option::is_some)) else {
        return DecimatedData {
            times: times.to_vec(),
            series: series.to_vec(),
        };
    };

    let reference_points: Vec<DataPoint> = times
        .iter()
        .zip(reference.iter())
        .filter_map(|(&x, value)| value.map(|y| DataPoint::new(x, y)))
        .collect();
    let reduced = lttb(&reference_points, target);

    // Exact-lookup projection; first occurrence wins if an instant
    // repeats on the axis.
    let mut position_by_time = HashMap::with_capacity(times.len());
    for (idx, &t) in times.iter().enumerate() {
        position_by_time.entry(t.to_bits()).or_insert(idx);
    }

    let reduced_times: Vec<f64> = reduced.iter().map(|p| p.x).collect();
    let reduced_series = series
        .iter()
        .map(|values| {
            reduced_times
                .iter()
                .map(|t| {
                    position_by_time
                        .get(&t.to_bits())
                        .and_then(|&idx| values.get(idx).copied().flatten())
                })
                .collect()
        })
        .collect();

    DecimatedData {
        times: reduced_times,
        series: reduced_series,
    }
}
