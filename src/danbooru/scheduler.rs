//! Position-tiered group scheduling.
//!
//! The upstream tolerates short bursts of ten concurrent requests while a run is young but degrades
//! under repeated bursts, and sustains three indefinitely. Requests are therefore sent in groups whose
//! size depends on how far into the requested sequence the group starts, and each group has to resolve
//! completely before the next one is admitted.

use std::future::Future;

use futures::future::join_all;
use tracing::trace;

/// One row of the tier table: positions up to `up_to` (inclusive) may run `limit` requests at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier {
    pub up_to: Option<usize>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    tiers: Vec<Tier>,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            tiers: vec![
                Tier { up_to: Some(50), limit: 10 },
                Tier { up_to: Some(100), limit: 5 },
                Tier { up_to: Some(500), limit: 4 },
                Tier { up_to: None, limit: 3 },
            ],
        }
    }
}

impl TierTable {
    /// Concurrency limit at a 1-based position.
    pub fn limit_at(&self, position: usize) -> usize {
        let position = position.max(1);
        self.tiers
            .iter()
            .find(|tier| tier.up_to.is_none_or(|up_to| position <= up_to))
            .or(self.tiers.last())
            .map(|tier| tier.limit.max(1))
            .unwrap_or(1)
    }

    /// Size of the group starting at `start` when `remaining` items are left.
    ///
    /// A group straddling a tier boundary takes the lowest limit of any position it covers.
    pub fn group_len(&self, start: usize, remaining: usize) -> usize {
        if remaining == 0 {
            return 0;
        }

        let mut len = self.limit_at(start).min(remaining);
        loop {
            let tightest = (start..start + len)
                .map(|position| self.limit_at(position))
                .min()
                .unwrap_or(1);
            if tightest >= len {
                return len;
            }
            len = tightest;
        }
    }

    /// The limit that applies to a set of positions dispatched together.
    pub fn limit_for(&self, positions: &[usize]) -> usize {
        positions
            .iter()
            .map(|position| self.limit_at(*position))
            .min()
            .unwrap_or_else(|| self.limit_at(1))
    }
}

/// A group about to be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupPlan {
    /// 1-based position of the first member.
    pub start: usize,
    pub len: usize,
    pub limit: usize,
}

/// Hands out groups in sequence. The position counter is the only state and is owned by the caller.
#[derive(Debug, Clone)]
pub struct Scheduler {
    tiers: TierTable,
    next_position: usize,
}

impl Scheduler {
    pub fn new(tiers: TierTable) -> Self {
        Self {
            tiers,
            next_position: 1,
        }
    }

    pub fn next_position(&self) -> usize {
        self.next_position
    }

    /// How many queued items the next group wants, ignoring how many are actually available.
    pub fn wanted(&self) -> usize {
        self.tiers.limit_at(self.next_position)
    }

    /// Plans the next group over `available` queued items and advances past it.
    pub fn next_group(&mut self, available: usize) -> Option<GroupPlan> {
        let len = self.tiers.group_len(self.next_position, available);
        if len == 0 {
            return None;
        }

        let positions: Vec<usize> = (self.next_position..self.next_position + len).collect();
        let plan = GroupPlan {
            start: self.next_position,
            len,
            limit: self.tiers.limit_for(&positions),
        };
        self.next_position += len;
        trace!(start = plan.start, len = plan.len, limit = plan.limit, "Planned group");
        Some(plan)
    }

    /// Runs every item of a group concurrently and waits for all of them.
    ///
    /// Results come back in item order whatever order the requests finish in. The caller guarantees
    /// `items.len() <= limit`; anything larger is split so the limit is never exceeded.
    pub async fn dispatch<T, F, Fut>(&self, limit: usize, items: Vec<T>, work: F) -> Vec<Fut::Output>
    where
        F: Fn(T) -> Fut,
        Fut: Future,
    {
        let limit = limit.max(1);
        let mut results = Vec::with_capacity(items.len());
        let mut items = items.into_iter().peekable();

        while items.peek().is_some() {
            let chunk: Vec<Fut> = items.by_ref().take(limit).map(&work).collect();
            results.extend(join_all(chunk).await);
        }

        results
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(TierTable::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_tier_limits() {
        let tiers = TierTable::default();
        for position in 1..=50 {
            assert_eq!(tiers.limit_at(position), 10, "position {}", position);
        }
        for position in 51..=100 {
            assert_eq!(tiers.limit_at(position), 5, "position {}", position);
        }
        for position in 101..=500 {
            assert_eq!(tiers.limit_at(position), 4, "position {}", position);
        }
        for position in [501, 502, 1_000, 1_000_000] {
            assert_eq!(tiers.limit_at(position), 3);
        }
    }

    #[test]
    fn test_straddling_group_uses_lowest_limit() {
        let tiers = TierTable::default();
        assert_eq!(tiers.group_len(48, 100), 5);
        assert_eq!(tiers.group_len(99, 100), 4);
        assert_eq!(tiers.group_len(1, 3), 3);
        assert_eq!(tiers.group_len(1, 0), 0);
        assert_eq!(tiers.limit_for(&[49, 50, 51]), 5);
    }

    #[test]
    fn test_groups_follow_tiers_from_start() {
        let mut scheduler = Scheduler::default();
        let mut remaining = 1_000;
        let mut sizes = Vec::new();
        while let Some(plan) = scheduler.next_group(remaining) {
            remaining -= plan.len;
            sizes.push(plan.len);
        }

        assert_eq!(sizes.len(), 5 + 10 + 100 + 167);
        assert!(sizes[..5].iter().all(|len| *len == 10));
        assert!(sizes[5..15].iter().all(|len| *len == 5));
        assert!(sizes[15..115].iter().all(|len| *len == 4));
        assert!(sizes[115..281].iter().all(|len| *len == 3));
        assert_eq!(sizes[281], 2);
        assert_eq!(scheduler.next_position(), 1_001);
    }

    #[tokio::test]
    async fn test_dispatch_never_exceeds_limit_and_keeps_order() {
        let scheduler = Scheduler::default();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let items: Vec<u64> = (0..7).collect();
        let results = scheduler
            .dispatch(3, items, |item| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    // Later items finish first.
                    tokio::time::sleep(Duration::from_millis(30 - item * 4)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    item * 10
                }
            })
            .await;

        assert_eq!(results, vec![0, 10, 20, 30, 40, 50, 60]);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
