use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Recently seen event ids for one resource, bounded by count and age.
///
/// Eviction is oldest-first. An id older than `ttl` or pushed out by
/// `capacity` newer ids is forgotten and would be delivered again.
#[derive(Debug)]
pub struct SeenWindow {
    capacity: usize,
    ttl: Duration,
    order: VecDeque<(String, Instant)>,
    ids: HashSet<String>,
}

impl SeenWindow {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Record `id`; returns false if it was already in the window
    pub fn insert(&mut self, id: &str) -> bool {
        self.expire(Instant::now());
        if self.ids.contains(id) {
            return false;
        }

        self.ids.insert(id.to_string());
        self.order.push_back((id.to_string(), Instant::now()));
        while self.order.len() > self.capacity {
            if let Some((evicted, _)) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&mut self, id: &str) -> bool {
        self.expire(Instant::now());
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((_, seen_at)) = self.order.front() {
            if now.duration_since(*seen_at) < self.ttl {
                break;
            }
            if let Some((expired, _)) = self.order.pop_front() {
                self.ids.remove(&expired);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_is_rejected() {
        let mut window = SeenWindow::new(10, Duration::from_secs(60));
        assert!(window.insert("m-1"));
        assert!(!window.insert("m-1"));
        assert!(window.insert("m-2"));
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let mut window = SeenWindow::new(2, Duration::from_secs(60));
        window.insert("a");
        window.insert("b");
        window.insert("c");
        assert!(!window.contains("a"));
        assert!(window.contains("b"));
        assert!(window.contains("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expires_ids() {
        let mut window = SeenWindow::new(10, Duration::from_secs(5));
        window.insert("a");
        tokio::time::advance(Duration::from_secs(3)).await;
        window.insert("b");
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!window.contains("a"));
        assert!(window.contains("b"));
        assert!(window.insert("a"));
    }
}
