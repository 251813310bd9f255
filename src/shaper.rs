//! Hierarchical token-bucket admission shaping.
//!
//! A tree of named buckets in the style of HTB traffic shaping: each
//! non-root bucket declares `rate` and `ceil` as fractions of its
//! parent, stored as absolute token counts that are recomputed whenever
//! the root capacity resizes. `get` borrows above `rate` up to `ceil`
//! against ancestor spare capacity; queued work times out through the
//! scheduler.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::ShaperError;
use crate::executor::SchedulerHandle;

type TimeoutHandler<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Node<T> {
    name: String,
    parent: Option<usize>,
    children: Vec<usize>,
    rate_pct: f64,
    ceil_pct: f64,
    rate: usize,
    ceil: usize,
    /// Tokens currently taken through this bucket.
    actual: usize,
    queue: VecDeque<(T, Instant)>,
    queue_timeout: Duration,
    /// Round-robin cursor over `children` for dequeue fairness.
    rr: usize,
}

impl<T> Node<T> {
    fn over(&self) -> usize {
        self.actual.saturating_sub(self.rate)
    }
}

struct Inner<T> {
    nodes: Vec<Node<T>>,
}

impl<T> Inner<T> {
    fn find(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// Recomputes absolute rate/ceil for `index`'s whole subtree.
    fn recompute(&mut self, index: usize) -> Result<(), ShaperError> {
        if let Some(parent) = self.nodes[index].parent {
            let parent_rate = self.nodes[parent].rate;
            let parent_ceil = self.nodes[parent].ceil;
            let node = &mut self.nodes[index];
            let rate = (parent_rate as f64 * node.rate_pct) as usize;
            let ceil = (parent_ceil as f64 * node.ceil_pct) as usize;
            if node.rate_pct > 1.0 {
                return Err(ShaperError::RateLimitOverflow);
            }
            if node.ceil_pct > 1.0 {
                return Err(ShaperError::CeilLimitOverflow);
            }
            node.rate = rate;
            node.ceil = ceil;
        }
        let children = self.nodes[index].children.clone();
        for child in children {
            self.recompute(child)?;
        }
        Ok(())
    }

    /// Σ child rate fractions must stay within the parent.
    fn children_rate_sum(&self, parent: usize, excluding: Option<usize>) -> f64 {
        self.nodes[parent]
            .children
            .iter()
            .filter(|&&c| Some(c) != excluding)
            .map(|&c| self.nodes[c].rate_pct)
            .sum()
    }

    /// Takes up to `n` tokens at `index`, charging every ancestor.
    fn get(&mut self, index: usize, n: usize) -> usize {
        let spare = self.nodes[index].ceil.saturating_sub(self.nodes[index].actual);
        let mut take = n.min(spare);
        if take == 0 {
            return 0;
        }
        if let Some(parent) = self.nodes[index].parent {
            take = self.get(parent, take);
        }
        self.nodes[index].actual += take;
        take
    }

    fn put(&mut self, index: usize, n: usize) {
        let node = &mut self.nodes[index];
        debug_assert!(node.actual >= n);
        node.actual = node.actual.saturating_sub(n);
        if let Some(parent) = node.parent {
            self.put(parent, n);
        }
    }

    /// Whether one token could be taken at `index` right now.
    fn can_take_one(&self, index: usize) -> bool {
        let mut current = Some(index);
        while let Some(i) = current {
            if self.nodes[i].actual >= self.nodes[i].ceil {
                return false;
            }
            current = self.nodes[i].parent;
        }
        true
    }

    /// Round-robin dequeue across the subtree rooted at `index`.
    fn dequeue(&mut self, index: usize) -> Option<T> {
        if !self.nodes[index].queue.is_empty() && self.can_take_one(index) {
            return self.nodes[index].queue.pop_front().map(|(item, _)| item);
        }
        let child_count = self.nodes[index].children.len();
        for step in 0..child_count {
            let cursor = (self.nodes[index].rr + step) % child_count;
            let child = self.nodes[index].children[cursor];
            if let Some(item) = self.dequeue(child) {
                self.nodes[index].rr = (cursor + 1) % child_count;
                return Some(item);
            }
        }
        None
    }

    /// Pops every queue entry whose deadline passed.
    fn collect_timeouts(&mut self, now: Instant) -> Vec<T> {
        let mut expired = Vec::new();
        for node in &mut self.nodes {
            if node.queue_timeout.as_nanos() == 0 {
                continue;
            }
            while let Some((_, enqueued)) = node.queue.front() {
                if now.duration_since(*enqueued) >= node.queue_timeout {
                    let (item, _) = node.queue.pop_front().expect("front checked");
                    expired.push(item);
                } else {
                    break;
                }
            }
        }
        expired
    }
}

/// The shaper itself. Cheap to clone; clones share the tree.
pub struct TokenShaper<T> {
    inner: Arc<Mutex<Inner<T>>>,
    scheduler: SchedulerHandle,
    timeout_handler: TimeoutHandler<T>,
}

impl<T> Clone for TokenShaper<T> {
    fn clone(&self) -> Self {
        TokenShaper {
            inner: Arc::clone(&self.inner),
            scheduler: self.scheduler.clone(),
            timeout_handler: Arc::clone(&self.timeout_handler),
        }
    }
}

impl<T: Send + 'static> TokenShaper<T> {
    pub fn new(
        scheduler: SchedulerHandle,
        capacity: usize,
        timeout_handler: impl Fn(T) + Send + Sync + 'static,
    ) -> TokenShaper<T> {
        let root = Node {
            name: "root".to_owned(),
            parent: None,
            children: Vec::new(),
            rate_pct: 1.0,
            ceil_pct: 1.0,
            rate: capacity,
            ceil: capacity,
            actual: 0,
            queue: VecDeque::new(),
            queue_timeout: Duration::from_secs(0),
            rr: 0,
        };
        TokenShaper {
            inner: Arc::new(Mutex::new(Inner { nodes: vec![root] })),
            scheduler,
            timeout_handler: Arc::new(timeout_handler),
        }
    }

    /// Root capacity in tokens.
    pub fn size(&self) -> usize {
        self.lock().nodes[0].rate
    }

    /// Creates a bucket under `parent` with `rate`/`ceil` fractions of
    /// the parent's allocation. A zero `ceil` inherits `rate`.
    pub fn create_node(
        &self,
        parent: &str,
        name: &str,
        rate: f64,
        ceil: f64,
    ) -> Result<(), ShaperError> {
        let ceil = if ceil == 0.0 { rate } else { ceil };
        let mut inner = self.lock();
        if inner.find(name).is_some() {
            return Err(ShaperError::NameConflict);
        }
        let parent = match inner.find(parent) {
            Some(i) => i,
            None => return Err(ShaperError::InvalidChildNode),
        };
        if !(0.0..=1.0).contains(&rate)
            || inner.children_rate_sum(parent, None) + rate > 1.0 + f64::EPSILON
        {
            return Err(ShaperError::RateLimitOverflow);
        }
        if !(0.0..=1.0).contains(&ceil) || ceil < rate {
            return Err(ShaperError::CeilLimitOverflow);
        }
        let index = inner.nodes.len();
        inner.nodes.push(Node {
            name: name.to_owned(),
            parent: Some(parent),
            children: Vec::new(),
            rate_pct: rate,
            ceil_pct: ceil,
            rate: 0,
            ceil: 0,
            actual: 0,
            queue: VecDeque::new(),
            queue_timeout: Duration::from_secs(0),
            rr: 0,
        });
        inner.nodes[parent].children.push(index);
        inner.recompute(index)
    }

    /// Recomputes the whole tree for a new root capacity.
    pub fn resize(&self, capacity: usize) -> Result<(), ShaperError> {
        let mut inner = self.lock();
        inner.nodes[0].rate = capacity;
        inner.nodes[0].ceil = capacity;
        inner.recompute(0)
    }

    /// Re-declares a node's rate fraction and recomputes its subtree.
    pub fn set_rate(&self, name: &str, rate: f64) -> Result<(), ShaperError> {
        let mut inner = self.lock();
        let index = inner.find(name).ok_or(ShaperError::InvalidChildNode)?;
        let parent = inner.nodes[index]
            .parent
            .ok_or(ShaperError::InvalidChildNode)?;
        if !(0.0..=1.0).contains(&rate)
            || inner.children_rate_sum(parent, Some(index)) + rate > 1.0 + f64::EPSILON
        {
            return Err(ShaperError::RateLimitOverflow);
        }
        inner.nodes[index].rate_pct = rate;
        inner.recompute(index)
    }

    pub fn set_ceil(&self, name: &str, ceil: f64) -> Result<(), ShaperError> {
        let mut inner = self.lock();
        let index = inner.find(name).ok_or(ShaperError::InvalidChildNode)?;
        if inner.nodes[index].parent.is_none() {
            return Err(ShaperError::InvalidChildNode);
        }
        if !(0.0..=1.0).contains(&ceil) || ceil < inner.nodes[index].rate_pct {
            return Err(ShaperError::CeilLimitOverflow);
        }
        inner.nodes[index].ceil_pct = ceil;
        inner.recompute(index)
    }

    pub fn set_queue_timeout(&self, name: &str, timeout: Duration) -> Result<(), ShaperError> {
        let mut inner = self.lock();
        let index = inner.find(name).ok_or(ShaperError::InvalidChildNode)?;
        inner.nodes[index].queue_timeout = timeout;
        Ok(())
    }

    /// Takes up to `n` tokens from `name`, borrowing above rate up to
    /// ceil; returns the count actually taken.
    pub fn get(&self, name: &str, n: usize) -> usize {
        let mut inner = self.lock();
        match inner.find(name) {
            Some(index) => inner.get(index, n),
            None => 0,
        }
    }

    /// Releases tokens back along the ancestor path.
    pub fn put(&self, name: &str, n: usize) {
        let mut inner = self.lock();
        if let Some(index) = inner.find(name) {
            inner.put(index, n);
        }
    }

    /// Queues `item` on the named bucket; it either dequeues later or
    /// expires into the timeout handler.
    pub fn enqueue(&self, name: &str, item: T) -> Result<(), ShaperError> {
        let timeout = {
            let mut inner = self.lock();
            let index = inner.find(name).ok_or(ShaperError::InvalidChildNode)?;
            let timeout = inner.nodes[index].queue_timeout;
            inner.nodes[index].queue.push_back((item, Instant::now()));
            timeout
        };
        if timeout.as_nanos() > 0 {
            let shaper = self.clone();
            self.scheduler.execute_after(timeout, move || {
                shaper.fire_timeouts();
            });
        }
        Ok(())
    }

    /// Pops the next queued item whose whole ancestor chain has spare
    /// tokens, walking the tree round-robin.
    pub fn dequeue(&self) -> Option<T> {
        self.lock().dequeue(0)
    }

    pub fn rate_of(&self, name: &str) -> usize {
        self.node_stat(name, |n| n.rate)
    }

    pub fn ceil_of(&self, name: &str) -> usize {
        self.node_stat(name, |n| n.ceil)
    }

    pub fn actual_rate(&self, name: &str) -> usize {
        self.node_stat(name, |n| n.actual)
    }

    pub fn over_rate(&self, name: &str) -> usize {
        self.node_stat(name, |n| n.over())
    }

    pub fn queued(&self, name: &str) -> usize {
        self.node_stat(name, |n| n.queue.len())
    }

    fn node_stat(&self, name: &str, f: impl Fn(&Node<T>) -> usize) -> usize {
        let inner = self.lock();
        inner.find(name).map(|i| f(&inner.nodes[i])).unwrap_or(0)
    }

    fn fire_timeouts(&self) {
        let expired = self.lock().collect_timeouts(Instant::now());
        for item in expired {
            (self.timeout_handler)(item);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().expect("shaper lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Scheduler;

    fn shaper(capacity: usize) -> TokenShaper<u32> {
        let scheduler = Scheduler::new().unwrap();
        TokenShaper::new(scheduler.handle(), capacity, |_| {})
    }

    fn build_tree(capacity: usize) -> TokenShaper<u32> {
        let shaper = shaper(capacity);
        shaper.create_node("root", "vip", 0.1, 0.3).unwrap();
        shaper.create_node("root", "main", 0.5, 0.7).unwrap();
        shaper.create_node("main", "upload", 0.5, 0.5).unwrap();
        shaper
    }

    #[test]
    fn resize_recomputes_from_percentages() {
        let shaper = build_tree(10);
        assert_eq!(shaper.rate_of("vip"), 1);
        assert_eq!(shaper.ceil_of("vip"), 3);
        shaper.resize(100).unwrap();
        assert_eq!((shaper.rate_of("vip"), shaper.ceil_of("vip")), (10, 30));
        assert_eq!((shaper.rate_of("main"), shaper.ceil_of("main")), (50, 70));
        assert_eq!(
            (shaper.rate_of("upload"), shaper.ceil_of("upload")),
            (25, 35)
        );
    }

    #[test]
    fn get_borrows_up_to_ceil_then_fails() {
        let shaper = build_tree(10);
        // vip: rate 1, ceil 3
        assert_eq!(shaper.get("vip", 1), 1);
        assert_eq!(shaper.get("vip", 1), 1);
        assert_eq!(shaper.get("vip", 1), 1);
        assert_eq!(shaper.get("vip", 1), 0, "ceil reached");
        assert_eq!(shaper.actual_rate("vip"), 3);
        assert_eq!(shaper.over_rate("vip"), 2);
        shaper.put("vip", 1);
        assert_eq!(shaper.get("vip", 1), 1, "put restored a slot");
    }

    #[test]
    fn child_usage_charges_ancestors() {
        let shaper = build_tree(10);
        assert_eq!(shaper.get("upload", 2), 2);
        assert_eq!(shaper.actual_rate("main"), 2);
        assert_eq!(shaper.actual_rate("root"), 2);
        shaper.put("upload", 2);
        assert_eq!(shaper.actual_rate("root"), 0);
    }

    #[test]
    fn get_is_bounded_by_ancestor_ceil() {
        let shaper = shaper(4);
        shaper.create_node("root", "a", 0.5, 1.0).unwrap();
        shaper.create_node("a", "leaf", 0.5, 1.0).unwrap();
        // leaf ceil = 4, but root only has 4 total
        assert_eq!(shaper.get("root", 3), 3);
        assert_eq!(shaper.get("leaf", 4), 1, "only root spare remains");
    }

    #[test]
    fn name_conflicts_and_bad_percentages_fail() {
        let shaper = build_tree(10);
        assert_eq!(
            shaper.create_node("root", "vip", 0.1, 0.2).unwrap_err(),
            ShaperError::NameConflict
        );
        assert_eq!(
            shaper.create_node("root", "greedy", 0.6, 0.7).unwrap_err(),
            ShaperError::RateLimitOverflow,
            "root children already declare 60%"
        );
        assert_eq!(
            shaper.create_node("root", "upside", 0.2, 0.1).unwrap_err(),
            ShaperError::CeilLimitOverflow
        );
        assert_eq!(
            shaper.set_rate("root", 0.5).unwrap_err(),
            ShaperError::InvalidChildNode
        );
    }

    #[test]
    fn dequeue_requires_spare_tokens_at_every_ancestor() {
        let shaper = build_tree(10);
        shaper.enqueue("vip", 7).unwrap();
        // exhaust vip's ceil
        assert_eq!(shaper.get("vip", 3), 3);
        assert!(shaper.dequeue().is_none());
        shaper.put("vip", 1);
        assert_eq!(shaper.dequeue(), Some(7));
    }

    #[test]
    fn dequeue_round_robins_children() {
        let shaper = shaper(10);
        shaper.create_node("root", "a", 0.4, 1.0).unwrap();
        shaper.create_node("root", "b", 0.4, 1.0).unwrap();
        shaper.enqueue("a", 1).unwrap();
        shaper.enqueue("a", 2).unwrap();
        shaper.enqueue("b", 10).unwrap();
        shaper.enqueue("b", 20).unwrap();
        let order: Vec<u32> = (0..4).filter_map(|_| shaper.dequeue()).collect();
        assert_eq!(order, vec![1, 10, 2, 20]);
    }

    #[test]
    fn queue_timeout_fires_handler_with_item() {
        let scheduler = Scheduler::new().unwrap();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let shaper: TokenShaper<u32> =
            TokenShaper::new(scheduler.handle(), 1, move |item| {
                sink.lock().unwrap().push(item);
            });
        shaper.create_node("root", "narrow", 1.0, 1.0).unwrap();
        shaper
            .set_queue_timeout("narrow", Duration::from_millis(100))
            .unwrap();
        // bucket exhausted: the item has to queue
        assert_eq!(shaper.get("narrow", 1), 1);
        let started = Instant::now();
        shaper.enqueue("narrow", 99).unwrap();
        scheduler.run_loop();
        let elapsed = started.elapsed();
        assert_eq!(fired.lock().unwrap().as_slice(), &[99]);
        assert_eq!(shaper.queued("narrow"), 0);
        assert!(elapsed >= Duration::from_millis(95), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(400), "{:?}", elapsed);
    }

    #[test]
    fn unknown_parent_is_invalid() {
        let shaper = build_tree(10);
        assert_eq!(
            shaper.create_node("nowhere", "x", 0.1, 0.1).unwrap_err(),
            ShaperError::InvalidChildNode
        );
    }
}
