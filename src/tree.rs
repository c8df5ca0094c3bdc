use crate::algo::{OrderedFloat, TopK};
use crate::metric::Metric;
use crate::telemetry::SearchTelemetry;
use num_traits::Float;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Level-indexed cover tree over one contiguous segment `[start, start + len)` of the data.
///
/// Every point of the segment owns a node whose child list starts with the point itself,
/// followed by the points it covers one level down in the order they were sampled. Because
/// samples are always the smallest uncovered index, children are larger than their parent and
/// child lists are ascending after the first entry.
pub struct CoverTree<T> {
    start: usize,
    nodes: Vec<Vec<usize>>,
    levels: usize,
    base: T,
}

impl<T> CoverTree<T>
where
    T: Float + Debug + Send + Sync,
{
    /// Builds the tree with radius `base^-l` at level `l`, starting from a root radius of 1.
    pub fn build<M: Metric<T> + ?Sized>(
        metric: &M,
        start: usize,
        len: usize,
        base: T,
        telemetry: &mut SearchTelemetry,
    ) -> Self {
        let mut nodes: Vec<Option<Vec<usize>>> = vec![None; len];
        if len == 0 {
            telemetry.record_tree(0);
            return CoverTree {
                start,
                nodes: Vec::new(),
                levels: 0,
                base,
            };
        }
        // groups of still uncovered points keyed by the local index of their covering node
        let mut covered: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        covered.insert(0, (1..len).collect());
        let mut num_nodes = 0usize;
        let mut level = 0usize;
        let mut dists: Vec<T> = Vec::new();
        let mut candidates: Vec<usize> = Vec::new();

        while num_nodes < len {
            level += 1;
            let radius = T::one() / base.powi(level as i32);
            let mut next: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for (key, mut group) in covered {
                if nodes[key].is_none() {
                    nodes[key] = Some(vec![key + start]);
                    num_nodes += 1;
                }
                while !group.is_empty() {
                    let sample = group[0];
                    if let Some(children) = nodes[key].as_mut() {
                        children.push(sample + start);
                    }
                    candidates.clear();
                    candidates.extend(group[1..].iter().map(|&j| j + start));
                    metric.distances_into(sample + start, &candidates, &mut dists);
                    telemetry.record_distances(candidates.len());
                    let mut inside = Vec::new();
                    let mut outside = Vec::new();
                    for (&j, &d) in group[1..].iter().zip(dists.iter()) {
                        if d <= radius {
                            inside.push(j);
                        } else {
                            outside.push(j);
                        }
                    }
                    next.insert(sample, inside);
                    group = outside;
                }
            }
            covered = next;
        }
        telemetry.record_tree(level);

        CoverTree {
            start,
            nodes: nodes.into_iter().map(|n| n.unwrap_or_default()).collect(),
            levels: level,
            base,
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    /// Child list of a global index (the node itself first).
    pub fn children(&self, node: usize) -> &[usize] {
        self.nodes
            .get(node.wrapping_sub(self.start))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The `k` nearest segment points with index below `i`, ascending by distance.
    ///
    /// The candidate set grows level by level from the root; once the k-th smallest candidate
    /// distance plus the covering radius of the level drops below 1, candidates farther than
    /// that bound are discarded and only the surviving new nodes are expanded further. When
    /// fewer than k candidates remain the segment is scanned directly.
    pub fn query<M: Metric<T> + ?Sized>(
        &self,
        metric: &M,
        i: usize,
        k: usize,
        telemetry: &mut SearchTelemetry,
    ) -> Vec<(T, usize)> {
        telemetry.tree_queries += 1;
        let max_dist = T::one();
        let mut dist_k = max_dist;
        let mut q: Vec<usize> = Vec::new();
        let mut q_dist: Vec<T> = Vec::new();
        let mut frontier: Vec<usize> = Vec::new();
        let mut interim: Vec<usize> = Vec::new();
        let mut dists: Vec<T> = Vec::new();

        if !self.is_empty() && k > 0 {
            let root = self.start;
            for level in 1..self.levels {
                let q_before = q.len();
                interim.clear();
                if level == 1 {
                    q.push(root);
                    interim.push(root);
                    frontier.push(root);
                }
                for &node in &frontier {
                    for &child in self.children(node) {
                        if child >= i {
                            break;
                        }
                        if child != node {
                            q.push(child);
                            interim.push(child);
                        }
                    }
                }
                frontier.clear();
                telemetry.record_frontier(interim.len());
                let early_stop = interim.is_empty() || level + 1 == self.levels;
                if !interim.is_empty() {
                    metric.distances_into(i, &interim, &mut dists);
                    telemetry.record_distances(interim.len());
                    q_dist.extend_from_slice(&dists);
                }
                if level > 1 && !q_dist.is_empty() {
                    dist_k = if q_dist.len() < k {
                        q_dist.iter().copied().fold(T::neg_infinity(), T::max)
                    } else {
                        let mut scratch: Vec<OrderedFloat<T>> =
                            q_dist.iter().copied().map(OrderedFloat).collect();
                        let (_, kth, _) = scratch.select_nth_unstable(k - 1);
                        kth.0
                    };
                    dist_k = dist_k + T::one() / self.base.powi(level as i32 - 1);
                }
                if dist_k >= max_dist {
                    if !early_stop {
                        let skip = usize::from(level == 1);
                        frontier.extend(interim.iter().skip(skip).copied());
                    }
                } else {
                    let mut kept = 0usize;
                    for pos in 0..q.len() {
                        if q_dist[pos] <= dist_k {
                            if pos >= q_before {
                                frontier.push(q[pos]);
                            }
                            q[kept] = q[pos];
                            q_dist[kept] = q_dist[pos];
                            kept += 1;
                        }
                    }
                    q.truncate(kept);
                    q_dist.truncate(kept);
                }
                if early_stop {
                    break;
                }
            }
        }

        if q.len() >= k {
            let mut top = TopK::new(k);
            for (&j, &d) in q.iter().zip(q_dist.iter()) {
                top.offer(d, j);
            }
            return top.into_sorted();
        }
        // too few candidates survived: scan the segment points below i
        telemetry.tree_fallbacks += 1;
        let end = i.min(self.start + self.len());
        let candidates: Vec<usize> = (self.start..end).collect();
        metric.distances_into(i, &candidates, &mut dists);
        telemetry.record_distances(candidates.len());
        let mut top = TopK::new(k.min(candidates.len()));
        for (&j, &d) in candidates.iter().zip(dists.iter()) {
            top.offer(d, j);
        }
        top.into_sorted()
    }
}
