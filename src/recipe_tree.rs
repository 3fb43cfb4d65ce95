use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt::Write;

use crate::free_list::{LocalFreeList, SharedFreeList};
use crate::interval::Interval;
use crate::recipe::Recipe;

pub type RecipeNodeFreeList<R> = LocalFreeList<Box<RecipeNode<R>>>;

/// One (sub-interval, recipe) pair of a function's recipe tree.
#[derive(Debug)]
pub struct RecipeNode<R> {
    interval: Interval,
    recipe: R,
    left: Option<Box<RecipeNode<R>>>,
    right: Option<Box<RecipeNode<R>>>,
}

impl<R: Recipe> RecipeNode<R> {
    pub(crate) fn leaf(interval: Interval, recipe: R) -> Self {
        Self {
            interval,
            recipe,
            left: None,
            right: None,
        }
    }

    /// Take a node from `free_list`, or allocate one if the free list is dry.
    pub(crate) fn alloc(
        free_list: &mut RecipeNodeFreeList<R>,
        interval: Interval,
        recipe: R,
    ) -> Box<Self> {
        match free_list.pop() {
            Some(mut node) => {
                debug_assert!(node.left.is_none() && node.right.is_none());
                node.interval = interval;
                node.recipe = recipe;
                node
            }
            None => Box::new(Self::leaf(interval, recipe)),
        }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn recipe(&self) -> R {
        self.recipe
    }
}

/// A binary search tree of non-overlapping (sub-interval, recipe) pairs
/// covering one function. Immutable once it has been published on a
/// [`RangeEntry`](crate::RangeEntry).
#[derive(Debug)]
pub struct RecipeTree<R> {
    root: Option<Box<RecipeNode<R>>>,
    len: usize,
}

impl<R: Recipe> RecipeTree<R> {
    /// Build a balanced tree from the linear chain of nodes a decoder emits,
    /// one per run of instructions, in ascending address order. The chain is
    /// drained. O(chain.len()).
    pub fn rebalance(chain: &mut Vec<Box<RecipeNode<R>>>) -> Self {
        let len = chain.len();
        debug_assert!(chain
            .windows(2)
            .all(|w| w[0].interval.end() <= w[1].interval.start()));
        let mut nodes = chain.drain(..);
        let root = build_balanced(len, &mut nodes);
        Self { root, len }
    }

    /// The node whose interval contains `address`.
    pub fn find(&self, address: u64) -> Option<&RecipeNode<R>> {
        let mut cur = self.root.as_deref();
        while let Some(node) = cur {
            cur = match node.interval.locate(address) {
                Ordering::Equal => return Some(node),
                Ordering::Greater => node.left.as_deref(),
                Ordering::Less => node.right.as_deref(),
            };
        }
        None
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn height(&self) -> usize {
        fn height<R>(node: Option<&RecipeNode<R>>) -> usize {
            match node {
                Some(node) => 1 + height(node.left.as_deref()).max(height(node.right.as_deref())),
                None => 0,
            }
        }
        height(self.root.as_deref())
    }

    /// No node has subtrees whose heights differ by more than one.
    pub fn is_balanced(&self) -> bool {
        fn check<R>(node: Option<&RecipeNode<R>>) -> Option<usize> {
            let Some(node) = node else {
                return Some(0);
            };
            let l = check(node.left.as_deref())?;
            let r = check(node.right.as_deref())?;
            if l.abs_diff(r) > 1 {
                return None;
            }
            Some(1 + l.max(r))
        }
        check(self.root.as_deref()).is_some()
    }

    /// Nodes in ascending address order.
    pub fn iter(&self) -> Iter<'_, R> {
        let mut iter = Iter { stack: Vec::new() };
        iter.push_left_spine(self.root.as_deref());
        iter
    }

    /// The interval from the start of the first node to the end of the last.
    pub fn span(&self) -> Option<Interval> {
        let first = self.iter().next()?.interval;
        let mut last = self.root.as_deref()?;
        while let Some(right) = last.right.as_deref() {
            last = right;
        }
        Some(Interval::new(first.start(), last.interval.end()))
    }

    /// Return every node to the calling thread's free list.
    pub fn free(self, free_list: &mut RecipeNodeFreeList<R>) {
        self.flatten(|node| free_list.push(node));
    }

    /// Return every node to the shared free list, for callers without a
    /// thread-local list.
    pub fn free_shared(self, free_list: &SharedFreeList<Box<RecipeNode<R>>>) {
        let mut nodes = Vec::with_capacity(self.len);
        self.flatten(|node| nodes.push(node));
        let n = nodes.len();
        free_list.give_batch(&mut nodes, n);
    }

    fn flatten(mut self, mut sink: impl FnMut(Box<RecipeNode<R>>)) {
        let mut stack: Vec<Box<RecipeNode<R>>> = self.root.take().into_iter().collect();
        while let Some(mut node) = stack.pop() {
            if let Some(left) = node.left.take() {
                stack.push(left);
            }
            if let Some(right) = node.right.take() {
                stack.push(right);
            }
            sink(node);
        }
    }

    /// Render the tree sideways, one node per line, each line starting with `indent`.
    pub fn write_indented(&self, out: &mut impl Write, indent: &str) -> core::fmt::Result {
        fn write_node<R: Recipe>(
            node: Option<&RecipeNode<R>>,
            depth: usize,
            out: &mut impl Write,
            indent: &str,
        ) -> core::fmt::Result {
            let Some(node) = node else {
                return Ok(());
            };
            write_node(node.left.as_deref(), depth + 1, out, indent)?;
            writeln!(
                out,
                "{indent}{:width$}|_ {} {:?}",
                "",
                node.interval,
                node.recipe,
                width = depth * 3
            )?;
            write_node(node.right.as_deref(), depth + 1, out, indent)
        }
        if self.root.is_none() {
            return writeln!(out, "{indent}{{}}");
        }
        write_node(self.root.as_deref(), 0, out, indent)
    }
}

fn build_balanced<R, I>(count: usize, nodes: &mut I) -> Option<Box<RecipeNode<R>>>
where
    I: Iterator<Item = Box<RecipeNode<R>>>,
{
    if count == 0 {
        return None;
    }
    // The midpoint of the run becomes the subtree root.
    let left_count = (count - 1) / 2;
    let left = build_balanced(left_count, nodes);
    let mut root = nodes.next()?;
    root.left = left;
    root.right = build_balanced(count - 1 - left_count, nodes);
    Some(root)
}

pub struct Iter<'a, R> {
    stack: Vec<&'a RecipeNode<R>>,
}

impl<'a, R> Iter<'a, R> {
    fn push_left_spine(&mut self, mut node: Option<&'a RecipeNode<R>>) {
        while let Some(n) = node {
            self.stack.push(n);
            node = n.left.as_deref();
        }
    }
}

impl<'a, R> Iterator for Iter<'a, R> {
    type Item = &'a RecipeNode<R>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.push_left_spine(node.right.as_deref());
        Some(node)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::sync::Arc;
    use proptest::prelude::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct TestRecipe(u32);

    impl Recipe for TestRecipe {
        fn fallback() -> Self {
            TestRecipe(0)
        }
    }

    fn free_list() -> RecipeNodeFreeList<TestRecipe> {
        LocalFreeList::new(Arc::new(SharedFreeList::new()), 4)
    }

    fn chain_of(count: u64, free_list: &mut RecipeNodeFreeList<TestRecipe>) -> Vec<Box<RecipeNode<TestRecipe>>> {
        (0..count)
            .map(|i| {
                RecipeNode::alloc(
                    free_list,
                    Interval::new(0x1000 + i * 4, 0x1000 + i * 4 + 4),
                    TestRecipe(i as u32),
                )
            })
            .collect()
    }

    #[test]
    fn find_in_rebalanced_chain() {
        let mut fl = free_list();
        let mut chain = chain_of(7, &mut fl);
        let tree = RecipeTree::rebalance(&mut chain);
        assert!(chain.is_empty());
        assert_eq!(tree.len(), 7);
        assert_eq!(tree.height(), 3);
        assert!(tree.is_balanced());
        assert_eq!(tree.find(0x1000).map(|n| n.recipe()), Some(TestRecipe(0)));
        assert_eq!(tree.find(0x1013).map(|n| n.recipe()), Some(TestRecipe(4)));
        assert_eq!(tree.find(0x101b).map(|n| n.recipe()), Some(TestRecipe(6)));
        assert!(tree.find(0x101c).is_none());
        assert!(tree.find(0xfff).is_none());
        assert_eq!(tree.span(), Some(Interval::new(0x1000, 0x101c)));
    }

    #[test]
    fn free_returns_all_nodes() {
        let shared = Arc::new(SharedFreeList::new());
        let mut fl = LocalFreeList::new(shared.clone(), 100);
        let mut chain = chain_of(13, &mut fl);
        let tree = RecipeTree::rebalance(&mut chain);
        tree.free(&mut fl);
        assert_eq!(fl.len(), 13);

        // Recycled nodes come back without stale children.
        let mut chain = chain_of(13, &mut fl);
        assert!(fl.is_empty());
        let tree = RecipeTree::rebalance(&mut chain);
        assert_eq!(tree.iter().count(), 13);
        tree.free_shared(&shared);
        assert_eq!(shared.len(), 13);
    }

    #[test]
    fn empty_tree() {
        let mut chain = Vec::new();
        let tree: RecipeTree<TestRecipe> = RecipeTree::rebalance(&mut chain);
        assert!(tree.is_empty());
        assert!(tree.find(0).is_none());
        assert_eq!(tree.span(), None);
        let mut s = String::new();
        tree.write_indented(&mut s, "  ").unwrap();
        assert_eq!(s, "  {}\n");
    }

    #[test]
    fn rendering_lists_nodes_in_order() {
        let mut fl = free_list();
        let mut chain = chain_of(3, &mut fl);
        let tree = RecipeTree::rebalance(&mut chain);
        let mut s = String::new();
        tree.write_indented(&mut s, "").unwrap();
        let lines: Vec<_> = s.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("[1000, 1004) TestRecipe(0)"));
        assert!(lines[1].starts_with("|_ [1004, 1008)"));
    }

    proptest! {
        #[test]
        fn rebalanced_trees_are_balanced_and_complete(count in 0u64..300) {
            let mut fl = free_list();
            let mut chain = chain_of(count, &mut fl);
            let tree = RecipeTree::rebalance(&mut chain);
            prop_assert!(tree.is_balanced());
            prop_assert_eq!(tree.iter().count() as u64, count);
            for i in 0..count {
                let found = tree.find(0x1000 + i * 4 + 2).map(|n| n.recipe());
                prop_assert_eq!(found, Some(TestRecipe(i as u32)));
            }
        }
    }
}
