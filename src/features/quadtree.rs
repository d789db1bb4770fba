//! Quadtree keypoint distribution.
//!
//! The detection area is split recursively into quadrants until there are
//! as many non-empty nodes as requested keypoints (or nothing can be split
//! any more). The strongest keypoint of each node survives.

use super::keypoint::KeyPoint;

struct Node {
    min_x: f32,
    max_x: f32,
    min_y: f32,
    max_y: f32,
    keys: Vec<KeyPoint>,
}

impl Node {
    fn can_split(&self) -> bool {
        self.keys.len() > 1 && (self.max_x - self.min_x) > 1.0 && (self.max_y - self.min_y) > 1.0
    }

    fn split(self) -> Vec<Node> {
        let half_x = 0.5 * (self.min_x + self.max_x);
        let half_y = 0.5 * (self.min_y + self.max_y);
        let mut children: [Node; 4] = [
            Node { min_x: self.min_x, max_x: half_x, min_y: self.min_y, max_y: half_y, keys: Vec::new() },
            Node { min_x: half_x, max_x: self.max_x, min_y: self.min_y, max_y: half_y, keys: Vec::new() },
            Node { min_x: self.min_x, max_x: half_x, min_y: half_y, max_y: self.max_y, keys: Vec::new() },
            Node { min_x: half_x, max_x: self.max_x, min_y: half_y, max_y: self.max_y, keys: Vec::new() },
        ];
        for kp in self.keys {
            let right = kp.x >= half_x;
            let bottom = kp.y >= half_y;
            let idx = (bottom as usize) * 2 + right as usize;
            children[idx].keys.push(kp);
        }
        children.into_iter().filter(|c| !c.keys.is_empty()).collect()
    }

    fn best(self) -> Option<KeyPoint> {
        self.keys
            .into_iter()
            .max_by(|a, b| a.response.total_cmp(&b.response))
    }
}

/// Keep about `target` keypoints (at most three extra) spread over `[min_x, max_x) × [min_y, max_y)`.
pub fn distribute(
    keys: Vec<KeyPoint>,
    min_x: f32,
    max_x: f32,
    min_y: f32,
    max_y: f32,
    target: usize,
) -> Vec<KeyPoint> {
    if keys.is_empty() || target == 0 {
        return Vec::new();
    }

    let width = (max_x - min_x).max(1.0);
    let height = (max_y - min_y).max(1.0);

    // Initial roots: roughly square nodes along the longer axis.
    let n_roots = ((width / height).round() as usize).max(1);
    let root_w = width / n_roots as f32;
    let mut nodes: Vec<Node> = (0..n_roots)
        .map(|i| Node {
            min_x: min_x + root_w * i as f32,
            max_x: min_x + root_w * (i + 1) as f32,
            min_y,
            max_y: min_y + height,
            keys: Vec::new(),
        })
        .collect();
    for kp in keys {
        let idx = (((kp.x - min_x) / root_w) as usize).min(n_roots - 1);
        nodes[idx].keys.push(kp);
    }
    nodes.retain(|n| !n.keys.is_empty());

    loop {
        if nodes.len() >= target || !nodes.iter().any(Node::can_split) {
            break;
        }

        // Split the most populated nodes first so that the last round does
        // not overshoot the target by more than three nodes.
        nodes.sort_by(|a, b| b.keys.len().cmp(&a.keys.len()));
        let mut next = Vec::with_capacity(nodes.len() * 2);
        let mut count = nodes.len();
        for node in nodes {
            if count < target && node.can_split() {
                let children = node.split();
                count = count + children.len() - 1;
                next.extend(children);
            } else {
                next.push(node);
            }
        }
        nodes = next;
    }

    nodes.into_iter().filter_map(Node::best).collect()
}
