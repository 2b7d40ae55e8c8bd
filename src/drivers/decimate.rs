use crate::drivers::buffer::Point;
/// Reduces `points` to at most `max_points` while keeping every bucket's extremes.
///
/// The input is split into `max_points / 2` equal-count buckets; each bucket
/// contributes its minimum and maximum in time order, so a single spike survives
/// any zoom level. Inputs that already fit are returned untouched.
pub fn decimate_min_max(points: &[Point], max_points: usize) -> Vec<Point> {
    if points.len() <= max_points {
        return points.to_vec();
    }
    if max_points == 0 {
        return Vec::new();
    }
    if max_points == 1 {
        return extremes(points)
            .map(|(_, hi)| vec![points[hi]])
            .unwrap_or_default();
    }
    let buckets = max_points / 2;
    let n = points.len();
    let mut result = Vec::with_capacity(buckets * 2);
    for b in 0..buckets {
        let bucket = &points[b * n / buckets..(b + 1) * n / buckets];
        let Some((lo, hi)) = extremes(bucket) else {
            continue;
        };
        if lo == hi {
            result.push(bucket[lo]);
        } else {
            result.push(bucket[lo.min(hi)]);
            result.push(bucket[lo.max(hi)]);
        }
    }
    result
}
/// Indices of the smallest and largest value; ties keep the earliest.
fn extremes(points: &[Point]) -> Option<(usize, usize)> {
    if points.is_empty() {
        return None;
    }
    let (mut lo, mut hi) = (0, 0);
    for (i, p) in points.iter().enumerate().skip(1) {
        if p.value < points[lo].value {
            lo = i;
        }
        if p.value > points[hi].value {
            hi = i;
        }
    }
    Some((lo, hi))
}
