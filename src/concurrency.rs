//! Concurrency component: per-user streaming slot ledger.
//!
//! In-process only (the gateway is assumed to run as a single instance per
//! spec.md's Non-goals around cross-region/multi-instance coordination), so
//! a plain mutex-guarded map is sufficient — grounded in `cfx/concurrency.py`'s
//! `asyncio.Lock`-guarded dict, with the guaranteed release modeled as a
//! `Drop` guard instead of a `finally:` block.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct ConcurrencyLedger {
    slots: Arc<Mutex<HashMap<Uuid, u32>>>,
}

/// Releases the held slot when dropped, even if the caller's task panics or
/// the streaming response is dropped early (client disconnect).
pub struct StreamSlotGuard {
    ledger: ConcurrencyLedger,
    user_id: Uuid,
    released: bool,
}

impl ConcurrencyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to acquire one streaming slot for `user_id`. Returns `None`
    /// if the user is already at `cap` concurrent streams.
    pub async fn try_acquire(&self, user_id: Uuid, cap: u32) -> Option<StreamSlotGuard> {
        let mut slots = self.slots.lock().await;
        let current = slots.get(&user_id).copied().unwrap_or(0);
        if current >= cap {
            return None;
        }
        slots.insert(user_id, current + 1);
        Some(StreamSlotGuard { ledger: self.clone(), user_id, released: false })
    }

    pub async fn current(&self, user_id: Uuid) -> u32 {
        self.slots.lock().await.get(&user_id).copied().unwrap_or(0)
    }

    /// Sum of active streaming slots across every user — used by the
    /// `/metrics` endpoint, never by a per-request decision.
    pub async fn total_active_streams(&self) -> u32 {
        self.slots.lock().await.values().sum()
    }

    async fn release(&self, user_id: Uuid) {
        let mut slots = self.slots.lock().await;
        if let Some(count) = slots.get_mut(&user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                slots.remove(&user_id);
            }
        }
    }
}

impl Drop for StreamSlotGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let ledger = self.ledger.clone();
        let user_id = self.user_id;
        tokio::spawn(async move {
            ledger.release(user_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_up_to_cap_then_denies() {
        let ledger = ConcurrencyLedger::new();
        let user_id = Uuid::new_v4();

        let _g1 = ledger.try_acquire(user_id, 2).await.expect("first slot");
        let _g2 = ledger.try_acquire(user_id, 2).await.expect("second slot");
        assert!(ledger.try_acquire(user_id, 2).await.is_none());
    }

    #[tokio::test]
    async fn dropping_guard_releases_slot() {
        let ledger = ConcurrencyLedger::new();
        let user_id = Uuid::new_v4();

        {
            let _guard = ledger.try_acquire(user_id, 1).await.unwrap();
            assert!(ledger.try_acquire(user_id, 1).await.is_none());
        }
        // Drop runs a detached task to release — give it a tick to land.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(ledger.try_acquire(user_id, 1).await.is_some());
    }

    #[tokio::test]
    async fn release_never_goes_below_zero() {
        let ledger = ConcurrencyLedger::new();
        let user_id = Uuid::new_v4();
        ledger.release(user_id).await;
        assert_eq!(ledger.current(user_id).await, 0);
    }
}
