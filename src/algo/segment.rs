use crate::algo::{OrderedFloat, TopK};
use crate::metric::Metric;
use crate::telemetry::SearchTelemetry;
use crate::tree::CoverTree;
use num_traits::Float;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fmt::Debug;

/// Contiguous partition of the search set, one cover tree per segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentLayout {
    pub starts: Vec<usize>,
    pub lens: Vec<usize>,
}

impl SegmentLayout {
    /// Splits `n` points into `requested` segments of size `ceil(n / requested)`. When the last
    /// segment would differ in size it is merged into the one before it.
    pub fn new(n: usize, requested: usize) -> Self {
        if n == 0 {
            return SegmentLayout {
                starts: Vec::new(),
                lens: Vec::new(),
            };
        }
        let requested = requested.clamp(1, n);
        let size = n.div_ceil(requested);
        // never more segments than needed to hold n points of this size
        let mut count = n.div_ceil(size);
        if count == 1 {
            return SegmentLayout {
                starts: vec![0],
                lens: vec![n],
            };
        }
        let last = n - (count - 1) * size;
        let overhead = last != size;
        if overhead {
            count -= 1;
        }
        let starts: Vec<usize> = (0..count).map(|s| s * size).collect();
        let mut lens = vec![size; count];
        if overhead {
            if let Some(tail) = lens.last_mut() {
                *tail += last;
            }
        }
        SegmentLayout { starts, lens }
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }
}

/// Builds one tree per segment in parallel.
pub fn build_trees<T, M>(metric: &M, layout: &SegmentLayout, base: T) -> (Vec<CoverTree<T>>, SearchTelemetry)
where
    T: Float + Debug + Send + Sync,
    M: Metric<T> + ?Sized,
{
    let built: Vec<(CoverTree<T>, SearchTelemetry)> = layout
        .starts
        .par_iter()
        .zip(layout.lens.par_iter())
        .map(|(&start, &len)| {
            let mut telemetry = SearchTelemetry::default();
            let tree = CoverTree::build(metric, start, len, base, &mut telemetry);
            (tree, telemetry)
        })
        .collect();
    let mut telemetry = SearchTelemetry::default();
    let trees = built
        .into_iter()
        .map(|(tree, t)| {
            telemetry.add_from(&t);
            tree
        })
        .collect();
    (trees, telemetry)
}

/// k nearest points below `i` across all segments starting before `i`.
///
/// Segments with more than k points below `i` are queried through their tree, the others are
/// scanned. Per-segment results are merged in order of `(distance, segment, position, index)`.
pub fn query_segments<T, M>(
    trees: &[CoverTree<T>],
    metric: &M,
    i: usize,
    k: usize,
    telemetry: &mut SearchTelemetry,
) -> Vec<(T, usize)>
where
    T: Float + Debug + Send + Sync,
    M: Metric<T> + ?Sized,
{
    let mut per_segment: Vec<Vec<(T, usize)>> = Vec::with_capacity(trees.len());
    let mut dists = Vec::new();
    for tree in trees {
        let start = tree.start();
        if start >= i {
            break;
        }
        if start + k < i {
            per_segment.push(tree.query(metric, i, k, telemetry));
        } else {
            telemetry.brute_force_queries += 1;
            let candidates: Vec<usize> = (start..i).collect();
            metric.distances_into(i, &candidates, &mut dists);
            telemetry.record_distances(candidates.len());
            let mut top = TopK::new((i - start).min(k));
            for (&j, &d) in candidates.iter().zip(dists.iter()) {
                top.offer(d, j);
            }
            per_segment.push(top.into_sorted());
        }
    }
    if per_segment.len() == 1 {
        return per_segment.pop().unwrap_or_default();
    }
    merge_sorted(&per_segment, k)
}

/// k-way merge of ascending per-segment lists.
pub fn merge_sorted<T: Float>(lists: &[Vec<(T, usize)>], k: usize) -> Vec<(T, usize)> {
    let mut heads: BTreeSet<(OrderedFloat<T>, usize, usize, usize)> = lists
        .iter()
        .enumerate()
        .filter_map(|(s, list)| list.first().map(|&(d, j)| (OrderedFloat(d), s, 0, j)))
        .collect();
    let mut merged = Vec::with_capacity(k);
    while merged.len() < k {
        let Some((d, s, pos, j)) = heads.pop_first() else {
            break;
        };
        merged.push((d.0, j));
        if let Some(&(next_d, next_j)) = lists[s].get(pos + 1) {
            heads.insert((OrderedFloat(next_d), s, pos + 1, next_j));
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Euclidean;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn layout_merges_a_short_tail_segment() {
        let layout = SegmentLayout::new(200, 3);
        assert_eq!(layout.starts, vec![0, 67]);
        assert_eq!(layout.lens, vec![67, 133]);

        let even = SegmentLayout::new(120, 4);
        assert_eq!(even.starts, vec![0, 30, 60, 90]);
        assert_eq!(even.lens, vec![30; 4]);
    }

    #[test]
    fn layout_never_produces_empty_segments() {
        for n in 1..40 {
            for requested in 1..12 {
                let layout = SegmentLayout::new(n, requested);
                assert!(layout.lens.iter().all(|&l| l > 0), "n={n} t={requested}");
                assert_eq!(layout.lens.iter().sum::<usize>(), n);
            }
        }
    }

    #[test]
    fn merge_keeps_global_order_and_stops_at_k() {
        let a = vec![(0.1, 4), (0.5, 2)];
        let b = vec![(0.2, 9), (0.3, 7), (0.9, 8)];
        let merged = merge_sorted(&[a, b], 4);
        let idx: Vec<usize> = merged.iter().map(|&(_, j)| j).collect();
        assert_eq!(idx, vec![4, 9, 7, 2]);
        assert!(merge_sorted::<f64>(&[Vec::new(), Vec::new()], 3).is_empty());
    }

    #[test]
    fn segmented_queries_match_exhaustive_search() {
        let n = 200;
        let k = 10;
        let mut rng = StdRng::seed_from_u64(21);
        let coords = Array2::from_shape_fn((n, 2), |_| rng.gen::<f64>());
        let metric = Euclidean::new(coords.view());
        for segments in [1, 2, 3, 7] {
            let layout = SegmentLayout::new(n, segments);
            let (trees, _) = build_trees(&metric, &layout, 2.0);
            let mut telemetry = SearchTelemetry::default();
            for i in (k + 1)..n {
                let found = query_segments(&trees, &metric, i, k, &mut telemetry);
                let mut exact: Vec<(f64, usize)> = (0..i).map(|j| (metric.distance(i, j), j)).collect();
                exact.sort_by(|a, b| a.0.total_cmp(&b.0));
                let mut got: Vec<usize> = found.iter().map(|&(_, j)| j).collect();
                let mut want: Vec<usize> = exact[..k].iter().map(|&(_, j)| j).collect();
                got.sort_unstable();
                want.sort_unstable();
                assert_eq!(got, want, "segments {segments}, query {i}");
            }
        }
    }
}
