//! Binary search tree of time intervals keyed by start time. Every node keeps
//! the maximum end time of its subtree so overlap queries can prune.
use crate::chunk::Chunk;

#[derive(Debug, Clone)]
struct Node<T> {
    start: i64,
    end: i64,
    subtree_end: i64,
    chunk: Chunk,
    item: T,
    left: Option<usize>,
    right: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct IntervalTree<T> {
    nodes: Vec<Node<T>>,
    root: Option<usize>,
}

impl<T> Default for IntervalTree<T> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
        }
    }
}

impl<T: Copy> IntervalTree<T> {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds the inclusive interval `[start, end]`.
    pub fn insert(&mut self, start: i64, end: i64, chunk: Chunk, item: T) {
        let new = self.nodes.len();
        self.nodes.push(Node {
            start,
            end,
            subtree_end: end,
            chunk,
            item,
            left: None,
            right: None,
        });

        let Some(mut cur) = self.root else {
            self.root = Some(new);
            return;
        };
        loop {
            let node = &mut self.nodes[cur];
            node.subtree_end = node.subtree_end.max(end);
            let next = if start < node.start {
                &mut node.left
            } else {
                &mut node.right
            };
            match *next {
                Some(child) => cur = child,
                None => {
                    *next = Some(new);
                    return;
                }
            }
        }
    }

    /// Chunks whose interval intersects `[start, end]`.
    pub fn query(&self, start: i64, end: i64) -> Vec<(i64, i64, Chunk, T)> {
        let mut out = Vec::new();
        let mut stack: Vec<usize> = self.root.into_iter().collect();
        while let Some(i) = stack.pop() {
            let node = &self.nodes[i];
            if node.subtree_end < start {
                continue;
            }
            if let Some(left) = node.left {
                stack.push(left);
            }
            if node.start <= end {
                if node.end >= start {
                    out.push((node.start, node.end, node.chunk, node.item));
                }
                if let Some(right) = node.right {
                    stack.push(right);
                }
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.root = None;
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, i64, Chunk, T)> + '_ {
        self.nodes
            .iter()
            .map(|n| (n.start, n.end, n.chunk, n.item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queries_overlapping_intervals() {
        let mut tree = IntervalTree::default();
        tree.insert(5, 10, Chunk::new(0, 8), 'a');
        tree.insert(0, 2, Chunk::new(8, 8), 'b');
        tree.insert(7, 7, Chunk::new(16, 8), 'c');
        tree.insert(12, 20, Chunk::new(0, 4), 'd');
        tree.insert(1, 30, Chunk::new(24, 4), 'e');

        let items = |start, end| {
            let mut v: Vec<char> = tree.query(start, end).into_iter().map(|e| e.3).collect();
            v.sort();
            v
        };
        assert_eq!(items(3, 4), vec!['e']);
        assert_eq!(items(2, 5), vec!['a', 'b', 'e']);
        assert_eq!(items(11, 11), vec!['e']);
        assert_eq!(items(21, 40), vec!['e']);
        assert_eq!(items(31, 40), Vec::<char>::new());
        assert_eq!(tree.len(), 5);

        tree.clear();
        assert!(tree.query(0, 100).is_empty());
    }
}
