use crate::error::VecchiaError;
use crate::metric::Metric;
use crate::telemetry::SearchTelemetry;
use ndarray::{Array1, Array2, ArrayView2};
use num_traits::Float;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::fmt::Debug;

pub mod segment;

use segment::{build_trees, query_segments, SegmentLayout};

/// Two points closer than this are treated as duplicates.
pub const EPSILON_NUMBERS: f64 = 1e-10;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct OrderedFloat<T>(pub T);

impl<T: Float> Eq for OrderedFloat<T> {}

impl<T: Float> PartialOrd for OrderedFloat<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Float> Ord for OrderedFloat<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

/// Fixed-capacity ascending list of the closest candidates seen so far.
///
/// A candidate enters only when strictly closer than the current last slot, so among equal
/// distances the one offered first wins.
pub struct TopK<T> {
    dists: Vec<T>,
    idx: Vec<usize>,
}

impl<T: Float> TopK<T> {
    pub fn new(k: usize) -> Self {
        TopK {
            dists: vec![T::infinity(); k],
            idx: vec![usize::MAX; k],
        }
    }

    #[inline]
    pub fn offer(&mut self, dist: T, j: usize) {
        let k = self.dists.len();
        if k == 0 || !(dist < self.dists[k - 1]) {
            return;
        }
        self.dists[k - 1] = dist;
        self.idx[k - 1] = j;
        let mut pos = k - 1;
        while pos > 0 && self.dists[pos] < self.dists[pos - 1] {
            self.dists.swap(pos, pos - 1);
            self.idx.swap(pos, pos - 1);
            pos -= 1;
        }
    }

    /// `(distance, index)` pairs in ascending order; unfilled slots are dropped.
    pub fn into_sorted(self) -> Vec<(T, usize)> {
        self.dists
            .into_iter()
            .zip(self.idx)
            .filter(|&(_, j)| j != usize::MAX)
            .collect()
    }
}

/// Exhaustive k-nearest search for point `i` over `candidates`.
pub fn brute_force_knn<T, M>(
    metric: &M,
    i: usize,
    candidates: std::ops::Range<usize>,
    k: usize,
    telemetry: &mut SearchTelemetry,
) -> Vec<(T, usize)>
where
    T: Float + Debug + Send + Sync,
    M: Metric<T> + ?Sized,
{
    telemetry.brute_force_queries += 1;
    let mut top = TopK::new(k);
    for j in candidates.clone() {
        top.offer(metric.distance(i, j), j);
    }
    telemetry.record_distances(candidates.len());
    top.into_sorted()
}

/// Parameters of one neighbour search.
#[derive(Clone, Debug, PartialEq)]
pub struct NeighborQuery {
    pub num_neighbors: usize,
    /// First point that receives a neighbour list.
    pub start_at: usize,
    /// Last index that may serve as a neighbour; `None` means every earlier point.
    pub end_search_at: Option<usize>,
    pub prediction: bool,
    pub cond_on_all: bool,
    /// Number of observed points at the front of the coordinate matrix.
    pub num_data_obs: usize,
    pub check_has_duplicates: bool,
    pub save_distances: bool,
    pub base: f64,
    pub num_segments: usize,
}

impl NeighborQuery {
    /// Conditioning on all previous points of an `n`-point training set.
    pub fn training(n: usize, num_neighbors: usize) -> Self {
        NeighborQuery {
            num_neighbors,
            start_at: 0,
            end_search_at: None,
            prediction: false,
            cond_on_all: false,
            num_data_obs: n,
            check_has_duplicates: false,
            save_distances: false,
            base: 2.0,
            num_segments: 1,
        }
    }
}

/// Euclidean distances cached for covariance evaluation, indexed like the neighbour lists.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NeighborDistances<T> {
    /// Distance from each point to each of its neighbours.
    pub obs: Vec<Array1<T>>,
    /// Symmetric distances among the neighbours of each point.
    pub between: Vec<Array2<T>>,
}

#[derive(Clone, Debug)]
pub struct NeighborSet<T> {
    /// Neighbour list of point `start_at + r` at position `r`.
    pub neighbors: Vec<Vec<usize>>,
    pub distances: Option<NeighborDistances<T>>,
    pub has_duplicates: bool,
    /// Neighbour count after capping to the number of candidates.
    pub num_neighbors: usize,
    pub telemetry: SearchTelemetry,
}

/// Finds, for every point `i ≥ start_at`, its nearest earlier points under `metric`.
///
/// Points with at most k predecessors condition on all of them. The following points are
/// searched exhaustively up to a threshold, the rest through segmented cover trees. Distance
/// caches and the duplicate check use Euclidean distances on `coords`.
pub fn find_nearest_neighbors<T, M>(
    metric: &M,
    coords: ArrayView2<'_, T>,
    query: &NeighborQuery,
) -> Result<NeighborSet<T>, VecchiaError>
where
    T: Float + Debug + Send + Sync + std::iter::Sum,
    M: Metric<T> + ?Sized,
{
    let n = coords.nrows();
    if metric.num_points() != n {
        return Err(VecchiaError::DimensionMismatch {
            what: "points addressed by the distance function",
            expected: n,
            found: metric.num_points(),
        });
    }
    if query.start_at > n {
        return Err(VecchiaError::InvalidConfiguration(format!(
            "start_at ({}) exceeds the number of points ({n})",
            query.start_at
        )));
    }
    let base = T::from(query.base).ok_or_else(|| {
        VecchiaError::InvalidConfiguration(format!("invalid cover tree base {}", query.base))
    })?;

    let max_neighbors = query
        .end_search_at
        .map(|e| e + 1)
        .unwrap_or_else(|| n.saturating_sub(1));
    let mut k = query.num_neighbors;
    if k > max_neighbors {
        log::info!(
            "The number of neighbors ({k}) for the Vecchia approximation needs to be smaller than \
             the number of data points ({}). It is set to {max_neighbors}.",
            max_neighbors + 1
        );
        k = max_neighbors;
    }

    let start_at = query.start_at;
    let mut telemetry = SearchTelemetry::default();
    let mut neighbors: Vec<Vec<usize>> = (start_at..n)
        .map(|i| if i > 0 && i <= k { (0..i).collect() } else { Vec::new() })
        .collect();

    if n > k && k > 0 {
        let first_i = if start_at <= k { k + 1 } else { start_at };
        let threshold = if query.prediction {
            n.min((first_i + 500).max(k))
        } else {
            n.min(1000.max(k))
        };
        let max_ind_nn = if query.prediction && !query.cond_on_all {
            query.num_data_obs
        } else {
            n
        };

        if first_i < threshold {
            let found: Vec<(usize, Vec<usize>, SearchTelemetry)> = (first_i..threshold)
                .into_par_iter()
                .map(|i| {
                    let mut t = SearchTelemetry::default();
                    let nn = brute_force_knn(metric, i, 0..i.min(max_ind_nn), k, &mut t);
                    (i, nn.into_iter().map(|(_, j)| j).collect(), t)
                })
                .collect();
            for (i, nn, t) in found {
                neighbors[i - start_at] = nn;
                telemetry.add_from(&t);
            }
        }

        if threshold < n {
            let n_ct = if query.prediction && !query.cond_on_all {
                query.num_data_obs
            } else {
                n
            };
            let layout = SegmentLayout::new(n_ct, query.num_segments);
            let (trees, build_telemetry) = build_trees(metric, &layout, base);
            telemetry.add_from(&build_telemetry);
            let found: Vec<(usize, Vec<usize>, SearchTelemetry)> = (threshold..n)
                .into_par_iter()
                .map(|i| {
                    let mut t = SearchTelemetry::default();
                    let nn = query_segments(&trees, metric, i, k, &mut t);
                    (i, nn.into_iter().map(|(_, j)| j).collect(), t)
                })
                .collect();
            for (i, nn, t) in found {
                neighbors[i - start_at] = nn;
                telemetry.add_from(&t);
            }
        }
    }

    let (distances, has_duplicates) = neighbor_distances(
        coords,
        start_at,
        &neighbors,
        query.save_distances,
        query.check_has_duplicates,
    );
    if has_duplicates {
        telemetry.duplicates_found += 1;
    }
    telemetry.log_summary("nearest neighbor search");

    Ok(NeighborSet {
        neighbors,
        distances,
        has_duplicates,
        num_neighbors: k,
        telemetry,
    })
}

/// Euclidean distances from each point to its neighbours and among the neighbours, and whether
/// any of them fall below [`EPSILON_NUMBERS`].
pub fn neighbor_distances<T>(
    coords: ArrayView2<'_, T>,
    start_at: usize,
    neighbors: &[Vec<usize>],
    save_distances: bool,
    check_duplicates: bool,
) -> (Option<NeighborDistances<T>>, bool)
where
    T: Float + Debug + Send + Sync + std::iter::Sum,
{
    if !save_distances && !check_duplicates {
        return (None, false);
    }
    let eps = T::from(EPSILON_NUMBERS).unwrap_or_else(T::epsilon);
    let dist = |a: usize, b: usize| -> T {
        coords
            .row(a)
            .iter()
            .zip(coords.row(b).iter())
            .map(|(&x, &y)| (x - y) * (x - y))
            .sum::<T>()
            .sqrt()
    };
    let per_point: Vec<(Array1<T>, Array2<T>, bool)> = neighbors
        .par_iter()
        .enumerate()
        .map(|(r, nn)| {
            let i = start_at + r;
            let m = nn.len();
            let obs = Array1::from_shape_fn(m, |a| dist(i, nn[a]));
            let mut between = Array2::<T>::zeros((m, m));
            for a in 0..m {
                for b in (a + 1)..m {
                    let d = dist(nn[a], nn[b]);
                    between[[a, b]] = d;
                    between[[b, a]] = d;
                }
            }
            let dup = check_duplicates
                && (obs.iter().any(|&d| d < eps)
                    || (0..m).any(|a| ((a + 1)..m).any(|b| between[[a, b]] < eps)));
            (obs, between, dup)
        })
        .collect();
    let has_duplicates = per_point.iter().any(|(_, _, dup)| *dup);
    if !save_distances {
        return (None, has_duplicates);
    }
    let mut cache = NeighborDistances {
        obs: Vec::with_capacity(per_point.len()),
        between: Vec::with_capacity(per_point.len()),
    };
    for (obs, between, _) in per_point {
        cache.obs.push(obs);
        cache.between.push(between);
    }
    (Some(cache), has_duplicates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Euclidean;
    use ndarray::array;

    #[test]
    fn top_k_keeps_first_of_equal_distances() {
        let mut top = TopK::new(2);
        top.offer(0.5, 7);
        top.offer(0.2, 3);
        top.offer(0.2, 9);
        top.offer(0.9, 1);
        assert_eq!(top.into_sorted(), vec![(0.2, 3), (0.2, 9)]);

        let mut tied_last = TopK::new(2);
        tied_last.offer(0.2, 3);
        tied_last.offer(0.5, 7);
        tied_last.offer(0.5, 8);
        assert_eq!(tied_last.into_sorted(), vec![(0.2, 3), (0.5, 7)]);

        let mut partial: TopK<f64> = TopK::new(3);
        partial.offer(1.0, 4);
        assert_eq!(partial.into_sorted(), vec![(1.0, 4)]);
    }

    #[test]
    fn small_problems_condition_on_every_predecessor() {
        let coords = array![[0.0], [1.0], [2.5], [2.0], [0.4]];
        let metric = Euclidean::new(coords.view());
        let query = NeighborQuery {
            save_distances: true,
            ..NeighborQuery::training(5, 2)
        };
        let set = find_nearest_neighbors(&metric, coords.view(), &query).expect("search");
        assert_eq!(set.neighbors[0], Vec::<usize>::new());
        assert_eq!(set.neighbors[1], vec![0]);
        assert_eq!(set.neighbors[2], vec![0, 1]);
        assert_eq!(set.neighbors[3], vec![2, 1]);
        assert_eq!(set.neighbors[4], vec![0, 1]);
        let cache = set.distances.expect("distances saved");
        assert!((cache.obs[3][0] - 0.5).abs() < 1e-12);
        assert!((cache.between[3][[0, 1]] - 1.5).abs() < 1e-12);
        assert_eq!(cache.between[3][[1, 0]], cache.between[3][[0, 1]]);
    }

    #[test]
    fn neighbor_count_is_capped_by_the_candidates() {
        let coords = array![[0.0], [1.0], [2.0]];
        let metric = Euclidean::new(coords.view());
        let set = find_nearest_neighbors(&metric, coords.view(), &NeighborQuery::training(3, 10))
            .expect("search");
        assert_eq!(set.num_neighbors, 2);
        assert_eq!(set.neighbors[2], vec![0, 1]);
    }

    #[test]
    fn duplicates_are_reported_between_neighbors() {
        let coords = array![[0.0, 0.0], [1.0, 1.0], [1.0, 1.0], [3.0, 0.0]];
        let metric = Euclidean::new(coords.view());
        let query = NeighborQuery {
            check_has_duplicates: true,
            ..NeighborQuery::training(4, 2)
        };
        let set = find_nearest_neighbors(&metric, coords.view(), &query).expect("search");
        assert!(set.has_duplicates);
        assert!(set.distances.is_none());
    }
}
