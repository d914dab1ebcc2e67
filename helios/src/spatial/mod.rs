//! 2D k-d tree over sample positions.
//!
//! Used for k-nearest queries when interpolating sparse displacement samples
//! onto a grid, and for radius queries during interest-point suppression.


use std::cmp::Ordering;
use std::collections::BinaryHeap;

use glam::DVec2;

/// A point found by a query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Index into the slice the tree was built from.
    pub index: usize,
    pub dist_sq: f64,
}

impl Eq for Neighbor {}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist_sq
            .total_cmp(&other.dist_sq)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy)]
struct Node {
    point: usize,
    left: Option<usize>,
    right: Option<usize>,
    axis: Axis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    X,
    Y,
}

impl Axis {
    #[inline]
    fn of(self, p: DVec2) -> f64 {
        match self {
            Axis::X => p.x,
            Axis::Y => p.y,
        }
    }

    fn next(self) -> Axis {
        match self {
            Axis::X => Axis::Y,
            Axis::Y => Axis::X,
        }
    }
}

/// Balanced k-d tree built once and queried many times.
#[derive(Debug, Clone, Default)]
pub struct KdTree {
    nodes: Vec<Node>,
    points: Vec<DVec2>,
    root: Option<usize>,
}

impl KdTree {
    pub fn build(points: &[DVec2]) -> Self {
        let mut indices: Vec<usize> = (0..points.len()).collect();
        let mut nodes = Vec::with_capacity(points.len());
        let root = Self::build_node(points, &mut indices, Axis::X, &mut nodes);
        Self {
            nodes,
            points: points.to_vec(),
            root,
        }
    }

    fn build_node(
        points: &[DVec2],
        indices: &mut [usize],
        axis: Axis,
        nodes: &mut Vec<Node>,
    ) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }

        let median = indices.len() / 2;
        indices.select_nth_unstable_by(median, |&a, &b| {
            axis.of(points[a]).total_cmp(&axis.of(points[b]))
        });

        let id = nodes.len();
        nodes.push(Node {
            point: indices[median],
            left: None,
            right: None,
            axis,
        });

        let (lower, rest) = indices.split_at_mut(median);
        let upper = &mut rest[1..];
        nodes[id].left = Self::build_node(points, lower, axis.next(), nodes);
        nodes[id].right = Self::build_node(points, upper, axis.next(), nodes);
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, index: usize) -> DVec2 {
        self.points[index]
    }

    /// The `k` nearest points, closest first.
    pub fn k_nearest(&self, query: DVec2, k: usize) -> Vec<Neighbor> {
        let Some(root) = self.root else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }

        let mut heap = BinaryHeap::with_capacity(k + 1);
        self.k_nearest_from(root, query, k, &mut heap);
        heap.into_sorted_vec()
    }

    fn k_nearest_from(
        &self,
        id: usize,
        query: DVec2,
        k: usize,
        heap: &mut BinaryHeap<Neighbor>,
    ) {
        let node = self.nodes[id];
        let point = self.points[node.point];
        let candidate = Neighbor {
            index: node.point,
            dist_sq: query.distance_squared(point),
        };
        if heap.len() < k {
            heap.push(candidate);
        } else if heap.peek().is_some_and(|worst| candidate < *worst) {
            heap.pop();
            heap.push(candidate);
        }

        let diff = node.axis.of(query) - node.axis.of(point);
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(near) = near {
            self.k_nearest_from(near, query, k, heap);
        }
        let worst = heap.peek().map_or(f64::INFINITY, |n| n.dist_sq);
        if let Some(far) = far
            && (heap.len() < k || diff * diff < worst)
        {
            self.k_nearest_from(far, query, k, heap);
        }
    }

    /// All points within `radius`, closest first.
    pub fn radius_search(&self, query: DVec2, radius: f64) -> Vec<Neighbor> {
        let mut found = Vec::new();
        if let Some(root) = self.root {
            self.radius_from(root, query, radius * radius, &mut found);
        }
        found.sort_unstable();
        found
    }

    /// Whether any point lies within `radius`. Stops at the first hit.
    pub fn any_within(&self, query: DVec2, radius: f64) -> bool {
        let radius_sq = radius * radius;
        let mut stack: Vec<usize> = self.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            let node = self.nodes[id];
            let point = self.points[node.point];
            if query.distance_squared(point) <= radius_sq {
                return true;
            }
            let diff = node.axis.of(query) - node.axis.of(point);
            if let Some(left) = node.left
                && (diff <= 0.0 || diff * diff <= radius_sq)
            {
                stack.push(left);
            }
            if let Some(right) = node.right
                && (diff >= 0.0 || diff * diff <= radius_sq)
            {
                stack.push(right);
            }
        }
        false
    }

    fn radius_from(&self, id: usize, query: DVec2, radius_sq: f64, found: &mut Vec<Neighbor>) {
        let node = self.nodes[id];
        let point = self.points[node.point];
        let dist_sq = query.distance_squared(point);
        if dist_sq <= radius_sq {
            found.push(Neighbor {
                index: node.point,
                dist_sq,
            });
        }

        let diff = node.axis.of(query) - node.axis.of(point);
        if let Some(left) = node.left
            && (diff <= 0.0 || diff * diff <= radius_sq)
        {
            self.radius_from(left, query, radius_sq, found);
        }
        if let Some(right) = node.right
            && (diff >= 0.0 || diff * diff <= radius_sq)
        {
            self.radius_from(right, query, radius_sq, found);
        }
    }
}
