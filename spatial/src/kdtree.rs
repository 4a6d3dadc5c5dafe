//! Balanced k-d tree over fixed-dimension points.

use std::collections::BinaryHeap;

use cloudreg_core::PointSource;

use crate::{squared_distance, NearestNeighborSearch, Neighbor, Ranked};

/// Maximum number of points stored in a leaf bucket.
const LEAF_SIZE: usize = 16;

#[derive(Debug, Clone, Copy)]
enum Node {
    Leaf {
        start: usize,
        end: usize,
    },
    Split {
        axis: usize,
        value: f64,
        left: usize,
        right: usize,
    },
}

/// Exact nearest-neighbor index.
///
/// Built once from a copy of the coordinates by median splits along the axis
/// of largest spread; read-only afterwards.
#[derive(Debug, Clone)]
pub struct KdTree<const D: usize> {
    points: Vec<[f64; D]>,
    /// Permutation of point indices; leaves own contiguous ranges of it.
    order: Vec<usize>,
    nodes: Vec<Node>,
    root: Option<usize>,
}

impl<const D: usize> KdTree<D> {
    pub fn new(points: Vec<[f64; D]>) -> Self {
        let mut tree = Self {
            order: (0..points.len()).collect(),
            points,
            nodes: Vec::new(),
            root: None,
        };
        if !tree.points.is_empty() {
            let n = tree.points.len();
            tree.root = Some(tree.build_recursive(0, n));
        }
        tree
    }

    fn build_recursive(&mut self, start: usize, end: usize) -> usize {
        if end - start <= LEAF_SIZE {
            self.nodes.push(Node::Leaf { start, end });
            return self.nodes.len() - 1;
        }

        let axis = self.widest_axis(start, end);
        let mid = start + (end - start) / 2;
        let points = &self.points;
        self.order[start..end].select_nth_unstable_by(mid - start, |&a, &b| {
            points[a][axis]
                .total_cmp(&points[b][axis])
                .then(a.cmp(&b))
        });
        let value = self.points[self.order[mid]][axis];

        let left = self.build_recursive(start, mid);
        let right = self.build_recursive(mid, end);
        self.nodes.push(Node::Split {
            axis,
            value,
            left,
            right,
        });
        self.nodes.len() - 1
    }

    fn widest_axis(&self, start: usize, end: usize) -> usize {
        let mut min = [f64::INFINITY; D];
        let mut max = [f64::NEG_INFINITY; D];
        for &i in &self.order[start..end] {
            for d in 0..D {
                min[d] = min[d].min(self.points[i][d]);
                max[d] = max[d].max(self.points[i][d]);
            }
        }
        (0..D)
            .max_by(|&a, &b| (max[a] - min[a]).total_cmp(&(max[b] - min[b])))
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[[f64; D]] {
        &self.points
    }

    /// The `k` nearest points sorted ascending by `(sq_dist, index)`.
    pub fn knn_search(&self, query: &[f64; D], k: usize) -> Vec<Neighbor> {
        let Some(root) = self.root else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        let mut heap = BinaryHeap::with_capacity(k + 1);
        self.knn_recursive(root, query, k, &mut heap);

        let mut results: Vec<Neighbor> = heap.into_iter().map(|r| r.0).collect();
        results.sort_by(|a, b| a.rank(b));
        results
    }

    fn knn_recursive(
        &self,
        node: usize,
        query: &[f64; D],
        k: usize,
        heap: &mut BinaryHeap<Ranked>,
    ) {
        match self.nodes[node] {
            Node::Leaf { start, end } => {
                for &i in &self.order[start..end] {
                    let candidate = Ranked(Neighbor::new(i, squared_distance(&self.points[i], query)));
                    if heap.len() < k {
                        heap.push(candidate);
                    } else if heap.peek().is_some_and(|worst| candidate < *worst) {
                        heap.pop();
                        heap.push(candidate);
                    }
                }
            }
            Node::Split {
                axis,
                value,
                left,
                right,
            } => {
                let diff = query[axis] - value;
                let (first, second) = if diff < 0.0 { (left, right) } else { (right, left) };

                self.knn_recursive(first, query, k, heap);

                // Equal distances must still be visited so the lower index wins ties.
                let visit_far = heap.len() < k
                    || heap.peek().is_some_and(|worst| diff * diff <= worst.0.sq_dist);
                if visit_far {
                    self.knn_recursive(second, query, k, heap);
                }
            }
        }
    }

    /// All points with `sq_dist <= radius²`, in no particular order. A
    /// negative or NaN radius finds nothing.
    pub fn radius_search(&self, query: &[f64; D], radius: f64) -> Vec<Neighbor> {
        let mut results = Vec::new();
        if radius.is_nan() || radius < 0.0 {
            return results;
        }
        if let Some(root) = self.root {
            self.radius_recursive(root, query, radius * radius, &mut results);
        }
        results
    }

    fn radius_recursive(
        &self,
        node: usize,
        query: &[f64; D],
        radius_sq: f64,
        results: &mut Vec<Neighbor>,
    ) {
        match self.nodes[node] {
            Node::Leaf { start, end } => {
                for &i in &self.order[start..end] {
                    let dist = squared_distance(&self.points[i], query);
                    if dist <= radius_sq {
                        results.push(Neighbor::new(i, dist));
                    }
                }
            }
            Node::Split {
                axis,
                value,
                left,
                right,
            } => {
                let diff = query[axis] - value;
                let (first, second) = if diff < 0.0 { (left, right) } else { (right, left) };
                self.radius_recursive(first, query, radius_sq, results);
                if diff * diff <= radius_sq {
                    self.radius_recursive(second, query, radius_sq, results);
                }
            }
        }
    }

    pub fn nearest(&self, query: &[f64; D]) -> Option<Neighbor> {
        self.knn_search(query, 1).into_iter().next()
    }
}

impl KdTree<3> {
    /// Index the coordinates of a 3D point source.
    pub fn from_cloud<P: PointSource + ?Sized>(cloud: &P) -> Self {
        let points = (0..cloud.size())
            .map(|i| cloudreg_core::to_array(&cloud.point(i)))
            .collect();
        Self::new(points)
    }
}

impl<const D: usize> NearestNeighborSearch<D> for KdTree<D> {
    fn knn_search(&self, query: &[f64; D], k: usize) -> Vec<Neighbor> {
        KdTree::knn_search(self, query, k)
    }
}

/// Exact linear-scan k-nearest-neighbor search with the same ordering as
/// [`KdTree::knn_search`].
pub fn brute_force_knn<const D: usize>(points: &[[f64; D]], query: &[f64; D], k: usize) -> Vec<Neighbor> {
    let mut all: Vec<Neighbor> = points
        .iter()
        .enumerate()
        .map(|(i, p)| Neighbor::new(i, squared_distance(p, query)))
        .collect();
    all.sort_by(|a, b| a.rank(b));
    all.truncate(k);
    all
}
